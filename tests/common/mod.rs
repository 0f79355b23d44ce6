//! Shared harness: a full engine wired to in-memory collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use temenos::core::domain::INITIAL_PREVIOUS_FAILOVER_VERSION;
use temenos::prelude::*;
use temenos::queues::{MatchingClient, QueueProcessor};
use uuid::Uuid;

pub const CURRENT_CLUSTER: &str = "active";
pub const STANDBY_CLUSTER: &str = "standby";
pub const TEST_DOMAIN: &str = "test-domain";

pub struct TestHarness {
    pub engine: Arc<ShardEngine>,
    pub shard: Arc<Shard>,
    pub domain_cache: Arc<DomainCache>,
    pub domain_id: Uuid,
    pub store: Arc<InMemoryStore>,
    pub transfer: Arc<InMemoryQueueProcessor>,
    pub timer: Arc<InMemoryQueueProcessor>,
    pub matching: Arc<InMemoryMatchingClient>,
    pub raw_matching: Arc<InMemoryMatchingClient>,
    pub replication_queue: Arc<InMemoryReplicationQueue>,
    pub replication_store: Arc<InMemoryReplicationStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let mut initial_versions = HashMap::new();
        initial_versions.insert(CURRENT_CLUSTER.to_string(), 0);
        initial_versions.insert(STANDBY_CLUSTER.to_string(), 1);
        let cluster_metadata = Arc::new(ClusterMetadata::new(
            CURRENT_CLUSTER,
            10,
            initial_versions,
        ));

        let store = Arc::new(InMemoryStore::new());
        let transfer = Arc::new(InMemoryQueueProcessor::new("transfer"));
        let timer = Arc::new(InMemoryQueueProcessor::new("timer"));
        let matching = Arc::new(InMemoryMatchingClient::answering(b"answer".to_vec()));
        let raw_matching = Arc::new(InMemoryMatchingClient::answering(b"sticky-answer".to_vec()));
        let replication_queue = Arc::new(InMemoryReplicationQueue::new());
        let replication_store = Arc::new(InMemoryReplicationStore::new());
        let replicator = Arc::new(InMemoryReplicator::new());
        let domain_cache = Arc::new(DomainCache::new());

        let shard = Arc::new(Shard::new(
            1,
            Arc::clone(&cluster_metadata),
            replication_queue.clone() as Arc<dyn temenos::queues::ReplicationQueue>,
            0,
        ));

        let engine = ShardEngine::new(EngineComponents {
            shard: Arc::clone(&shard),
            config,
            domain_cache: Arc::clone(&domain_cache),
            execution_store: store.clone(),
            history_store: store.clone(),
            notifier: Arc::new(HistoryEventNotifier::new()),
            transfer_processor: transfer.clone() as Arc<dyn QueueProcessor>,
            timer_processor: timer.clone() as Arc<dyn QueueProcessor>,
            matching_client: matching.clone() as Arc<dyn MatchingClient>,
            raw_matching_client: raw_matching.clone() as Arc<dyn MatchingClient>,
            history_replicator: replicator.clone(),
            activity_replicator: replicator,
            replication_ack_manager: replication_store.clone(),
            replication_dlq: replication_store.clone(),
        });
        engine.start();

        let domain_id = Uuid::new_v4();
        domain_cache.refresh_domains(vec![DomainEntry {
            id: domain_id,
            name: TEST_DOMAIN.to_string(),
            status: DomainStatus::Registered,
            is_global: false,
            active_cluster_name: CURRENT_CLUSTER.to_string(),
            clusters: vec![CURRENT_CLUSTER.to_string()],
            failover_version: 0,
            failover_notification_version: 0,
            previous_failover_version: INITIAL_PREVIOUS_FAILOVER_VERSION,
            notification_version: 1,
        }]);

        Self {
            engine,
            shard,
            domain_cache,
            domain_id,
            store,
            transfer,
            timer,
            matching,
            raw_matching,
            replication_queue,
            replication_store,
        }
    }

    pub fn start_request(&self, workflow_id: &str, request_id: &str) -> StartWorkflowRequest {
        StartWorkflowRequest {
            domain_id: self.domain_id,
            workflow_id: workflow_id.to_string(),
            workflow_type: "order-workflow".to_string(),
            task_list: "orders".to_string(),
            input: b"{}".to_vec(),
            execution_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(10),
            identity: "test-client".to_string(),
            request_id: request_id.to_string(),
            id_reuse_policy: IdReusePolicy::AllowDuplicate,
            retry_policy: None,
            cron_schedule: None,
            first_decision_backoff: None,
            parent: None,
            deadline: None,
        }
    }

    pub async fn start_workflow(&self, workflow_id: &str) -> Uuid {
        self.engine
            .start_workflow_execution(self.start_request(workflow_id, &format!("req-{}", workflow_id)))
            .await
            .expect("start workflow")
            .run_id
    }

    pub async fn mutable_state(&self, workflow_id: &str, run_id: Uuid) -> GetMutableStateResponse {
        self.engine
            .get_mutable_state(GetMutableStateRequest {
                domain_id: self.domain_id,
                workflow_id: workflow_id.to_string(),
                run_id: Some(run_id),
                expected_next_event_id: 0,
                current_branch_token: None,
            })
            .await
            .expect("get mutable state")
    }

    pub async fn current_run_id(&self, workflow_id: &str) -> Uuid {
        use temenos::core::CurrentRunKey;
        use temenos::store::ExecutionStore;
        self.store
            .get_current_execution(&CurrentRunKey::new(self.domain_id, workflow_id))
            .await
            .expect("current execution")
            .run_id
    }

    pub async fn history(&self, workflow_id: &str, run_id: Uuid) -> Vec<temenos::state::HistoryEvent> {
        use temenos::store::HistoryStore;
        let state = self.mutable_state(workflow_id, run_id).await;
        self.store
            .read_events(&state.current_branch_token, 0, i64::MAX)
            .await
            .expect("read history")
    }

    /// Drive the first decision task to completion: started then completed
    /// with the given decider commands.
    pub async fn complete_decision(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        decisions: Vec<Decision>,
    ) -> RecordDecisionTaskStartedResponse {
        self.complete_decision_with(workflow_id, run_id, decisions, HashMap::new())
            .await
    }

    pub async fn complete_decision_with(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        decisions: Vec<Decision>,
        query_results: HashMap<Uuid, QueryResult>,
    ) -> RecordDecisionTaskStartedResponse {
        let schedule_id = self
            .pending_decision_schedule_id(workflow_id, run_id)
            .await
            .expect("a decision task should be pending");
        let started = self
            .engine
            .record_decision_task_started(RecordDecisionTaskStartedRequest {
                domain_id: self.domain_id,
                workflow_id: workflow_id.to_string(),
                run_id,
                schedule_id,
                request_id: format!("poll-{}", Uuid::new_v4()),
                identity: "decider".to_string(),
            })
            .await
            .expect("record decision started");
        self.engine
            .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
                domain_id: self.domain_id,
                workflow_id: workflow_id.to_string(),
                run_id,
                schedule_id,
                started_id: started.started_event_id,
                identity: "decider".to_string(),
                decisions,
                query_results,
                sticky_task_list: None,
                sticky_schedule_to_start_timeout: None,
            })
            .await
            .expect("respond decision completed");
        started
    }

    /// Schedule id of the pending decision, read from the store.
    pub async fn pending_decision_schedule_id(
        &self,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Option<i64> {
        use temenos::store::ExecutionStore;
        let key = ExecutionKey::new(self.domain_id, workflow_id.to_string(), run_id);
        let (state, _) = self.store.get_workflow_execution(&key).await.ok()?;
        state.pending_decision.map(|d| d.schedule_id)
    }

    /// Schedule an activity through a decision and return its schedule id.
    pub async fn schedule_activity(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        activity_id: &str,
        retry_policy: Option<temenos::state::RetryPolicy>,
    ) -> i64 {
        self.complete_decision(
            workflow_id,
            run_id,
            vec![Decision::ScheduleActivityTask {
                activity_id: activity_id.to_string(),
                activity_type: "charge".to_string(),
                task_list: "orders".to_string(),
                input: b"{}".to_vec(),
                schedule_to_start_timeout: Duration::from_secs(10),
                schedule_to_close_timeout: Duration::from_secs(60),
                start_to_close_timeout: Duration::from_secs(30),
                heartbeat_timeout: Some(Duration::from_secs(5)),
                retry_policy,
            }],
        )
        .await;

        use temenos::store::ExecutionStore;
        let key = ExecutionKey::new(self.domain_id, workflow_id.to_string(), run_id);
        let (state, _) = self.store.get_workflow_execution(&key).await.unwrap();
        state
            .pending_activities
            .values()
            .find(|ai| ai.activity_id == activity_id)
            .map(|ai| ai.schedule_id)
            .expect("activity scheduled")
    }

    pub fn activity_token(
        &self,
        workflow_id: &str,
        run_id: Uuid,
        schedule_id: i64,
        attempt: i64,
    ) -> Vec<u8> {
        TaskToken {
            workflow_id: workflow_id.to_string(),
            run_id,
            schedule_id,
            schedule_attempt: attempt,
            activity_id: String::new(),
            workflow_type: "order-workflow".to_string(),
            activity_type: "charge".to_string(),
        }
        .serialize()
        .expect("serialize token")
    }
}
