//! Collaborator seams: queue processors, the matching service, and the
//! replication surfaces.
//!
//! The engine drives these traits and never looks behind them. The
//! in-memory doubles here record what the engine handed them so embeddings
//! and tests can assert on notification and failover behavior, in the same
//! spirit as the in-memory store.

use crate::core::{EngineError, Result};
use crate::state::{ExecutionInfo, FailoverMarkerTask, HistoryEvent, Task};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

// ---------------------------------------------------------------------
// Queue processors (transfer / timer)
// ---------------------------------------------------------------------

/// Admin action against a queue processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    Reset,
    GetState,
}

/// Result of a [`QueueAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueActionResult {
    Reset,
    State(Vec<String>),
}

/// Background processor scanning one task queue (transfer or timer).
///
/// `notify_new_task` is fire-and-forget and may reorder with subsequent
/// mutations; processors re-scan by cursor and never depend on
/// notification order.
pub trait QueueProcessor: Send + Sync {
    fn start(&self);
    fn stop(&self);

    /// Nudge the processor to scan for tasks on `cluster`'s cursor. Empty
    /// task slices are honored as a pure cursor kick.
    fn notify_new_task(&self, cluster: &str, execution: Option<&ExecutionInfo>, tasks: Vec<Task>);

    /// Quiesce cursor advancement until unlocked. Used by the domain
    /// failover callback.
    fn lock_task_processing(&self);
    fn unlock_task_processing(&self);

    /// Reclassify tasks for the given domains after a failover.
    fn failover_domain(&self, domain_ids: &HashSet<Uuid>);

    fn handle_action(&self, cluster: &str, action: QueueAction) -> Result<QueueActionResult>;
}

/// Recording double for a queue processor.
pub struct InMemoryQueueProcessor {
    name: &'static str,
    running: AtomicBool,
    locked: AtomicBool,
    notifications: Mutex<Vec<(String, Vec<Task>)>>,
    failovers: Mutex<Vec<HashSet<Uuid>>>,
    resets: Mutex<Vec<String>>,
}

impl InMemoryQueueProcessor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: AtomicBool::new(false),
            locked: AtomicBool::new(false),
            notifications: Mutex::new(Vec::new()),
            failovers: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// All `(cluster, tasks)` notifications seen so far.
    pub fn notifications(&self) -> Vec<(String, Vec<Task>)> {
        self.notifications.lock().expect("poisoned").clone()
    }

    /// Domain-id sets passed to `failover_domain`.
    pub fn failovers(&self) -> Vec<HashSet<Uuid>> {
        self.failovers.lock().expect("poisoned").clone()
    }
}

impl QueueProcessor for InMemoryQueueProcessor {
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn notify_new_task(&self, cluster: &str, _execution: Option<&ExecutionInfo>, tasks: Vec<Task>) {
        debug!(processor = self.name, cluster, count = tasks.len(), "task notification");
        self.notifications
            .lock()
            .expect("poisoned")
            .push((cluster.to_string(), tasks));
    }

    fn lock_task_processing(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    fn unlock_task_processing(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    fn failover_domain(&self, domain_ids: &HashSet<Uuid>) {
        self.failovers
            .lock()
            .expect("poisoned")
            .push(domain_ids.clone());
    }

    fn handle_action(&self, cluster: &str, action: QueueAction) -> Result<QueueActionResult> {
        match action {
            QueueAction::Reset => {
                self.resets.lock().expect("poisoned").push(cluster.to_string());
                Ok(QueueActionResult::Reset)
            }
            QueueAction::GetState => Ok(QueueActionResult::State(vec![format!(
                "{}:{}:notified={}",
                self.name,
                cluster,
                self.notifications.lock().expect("poisoned").len()
            )])),
        }
    }
}

// ---------------------------------------------------------------------
// Matching service
// ---------------------------------------------------------------------

/// Query dispatched to a decider through matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingQueryRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub task_list: String,
    pub is_sticky: bool,
    pub query_type: String,
    pub query_args: Vec<u8>,
}

/// Answer returned by the decider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchingQueryResponse {
    pub answer: Vec<u8>,
}

/// Task-dispatch service client, used here only for query routing.
#[async_trait]
pub trait MatchingClient: Send + Sync {
    async fn query_workflow(
        &self,
        request: MatchingQueryRequest,
    ) -> Result<MatchingQueryResponse>;
}

/// Canned-response matching double; records the requests it served.
pub struct InMemoryMatchingClient {
    response: Mutex<Result<MatchingQueryResponse>>,
    requests: Mutex<Vec<MatchingQueryRequest>>,
}

impl InMemoryMatchingClient {
    pub fn answering(answer: impl Into<Vec<u8>>) -> Self {
        Self {
            response: Mutex::new(Ok(MatchingQueryResponse {
                answer: answer.into(),
            })),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(error: EngineError) -> Self {
        Self {
            response: Mutex::new(Err(error)),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_response(&self, response: Result<MatchingQueryResponse>) {
        *self.response.lock().expect("poisoned") = response;
    }

    pub fn requests(&self) -> Vec<MatchingQueryRequest> {
        self.requests.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl MatchingClient for InMemoryMatchingClient {
    async fn query_workflow(
        &self,
        request: MatchingQueryRequest,
    ) -> Result<MatchingQueryResponse> {
        self.requests.lock().expect("poisoned").push(request);
        self.response.lock().expect("poisoned").clone()
    }
}

// ---------------------------------------------------------------------
// Replication surfaces
// ---------------------------------------------------------------------

/// One replication task as shipped between clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationTask {
    pub task_id: i64,
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub events: Vec<HistoryEvent>,
    pub version: i64,
}

/// Pointer to a replication task, used by DLQ re-reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationTaskInfo {
    pub task_id: i64,
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// A page of replication tasks plus the shard's clock for sync-shard.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationMessages {
    pub tasks: Vec<ReplicationTask>,
    pub last_retrieved_id: i64,
    pub sync_shard_timestamp: DateTime<Utc>,
}

/// Read side of the shard's replication queue.
#[async_trait]
pub trait ReplicationAckManager: Send + Sync {
    async fn get_tasks(
        &self,
        polling_cluster: &str,
        last_read_id: i64,
    ) -> Result<(Vec<ReplicationTask>, i64)>;

    async fn get_task(&self, info: &ReplicationTaskInfo) -> Result<Option<ReplicationTask>>;
}

/// Dead-letter queue of replication tasks that failed to apply.
#[async_trait]
pub trait ReplicationDlqHandler: Send + Sync {
    async fn read_messages(
        &self,
        source_cluster: &str,
        last_message_id: i64,
        page_size: usize,
    ) -> Result<Vec<ReplicationTask>>;

    async fn purge_messages(&self, source_cluster: &str, last_message_id: i64) -> Result<()>;

    /// Re-apply DLQ messages up to `last_message_id`; returns how many
    /// merged cleanly.
    async fn merge_messages(&self, source_cluster: &str, last_message_id: i64) -> Result<usize>;
}

/// Write side of the shard's replication queue, used for failover markers.
///
/// Synchronous because it is driven from domain-change callbacks; a real
/// implementation enqueues and flushes in the background.
pub trait ReplicationQueue: Send + Sync {
    fn publish_failover_markers(&self, markers: Vec<FailoverMarkerTask>) -> Result<()>;
}

/// In-memory replication queue double.
pub struct InMemoryReplicationQueue {
    markers: Mutex<Vec<FailoverMarkerTask>>,
    fail_next: AtomicBool,
}

impl InMemoryReplicationQueue {
    pub fn new() -> Self {
        Self {
            markers: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn markers(&self) -> Vec<FailoverMarkerTask> {
        self.markers.lock().expect("poisoned").clone()
    }

    /// Make the next publish fail, to exercise the callback's retry path.
    pub fn fail_next_publish(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl Default for InMemoryReplicationQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicationQueue for InMemoryReplicationQueue {
    fn publish_failover_markers(&self, markers: Vec<FailoverMarkerTask>) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::ServiceBusy(
                "replication queue unavailable".to_string(),
            ));
        }
        self.markers.lock().expect("poisoned").extend(markers);
        Ok(())
    }
}

/// Applies batches of remote history events shipped by the cross-cluster
/// replicator. Opaque to the engine.
#[async_trait]
pub trait HistoryReplicator: Send + Sync {
    async fn apply_events(&self, task: ReplicationTask) -> Result<()>;
}

/// Applies remote activity state (heartbeats, attempts). Opaque to the
/// engine.
#[async_trait]
pub trait ActivityReplicator: Send + Sync {
    async fn sync_activity(&self, request: SyncActivityRequest) -> Result<()>;
}

/// Remote activity state carried by `SyncActivity`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncActivityRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub scheduled_id: i64,
    pub version: i64,
    pub attempt: i64,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub details: Vec<u8>,
}

/// Recording no-op double for both replicator seams.
#[derive(Default)]
pub struct InMemoryReplicator {
    applied: Mutex<Vec<ReplicationTask>>,
    synced: Mutex<Vec<SyncActivityRequest>>,
}

impl InMemoryReplicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Vec<ReplicationTask> {
        self.applied.lock().expect("poisoned").clone()
    }

    pub fn synced(&self) -> Vec<SyncActivityRequest> {
        self.synced.lock().expect("poisoned").clone()
    }
}

#[async_trait]
impl HistoryReplicator for InMemoryReplicator {
    async fn apply_events(&self, task: ReplicationTask) -> Result<()> {
        self.applied.lock().expect("poisoned").push(task);
        Ok(())
    }
}

#[async_trait]
impl ActivityReplicator for InMemoryReplicator {
    async fn sync_activity(&self, request: SyncActivityRequest) -> Result<()> {
        self.synced.lock().expect("poisoned").push(request);
        Ok(())
    }
}

/// In-memory ack manager / DLQ pair backing the replication read surface.
#[derive(Default)]
pub struct InMemoryReplicationStore {
    tasks: Mutex<Vec<ReplicationTask>>,
    dlq: Mutex<Vec<ReplicationTask>>,
}

impl InMemoryReplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_task(&self, task: ReplicationTask) {
        self.tasks.lock().expect("poisoned").push(task);
    }

    pub fn push_dlq(&self, task: ReplicationTask) {
        self.dlq.lock().expect("poisoned").push(task);
    }

    pub fn dlq_len(&self) -> usize {
        self.dlq.lock().expect("poisoned").len()
    }
}

#[async_trait]
impl ReplicationAckManager for InMemoryReplicationStore {
    async fn get_tasks(
        &self,
        _polling_cluster: &str,
        last_read_id: i64,
    ) -> Result<(Vec<ReplicationTask>, i64)> {
        let tasks: Vec<ReplicationTask> = self
            .tasks
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|t| t.task_id > last_read_id)
            .cloned()
            .collect();
        let last = tasks.iter().map(|t| t.task_id).max().unwrap_or(last_read_id);
        Ok((tasks, last))
    }

    async fn get_task(&self, info: &ReplicationTaskInfo) -> Result<Option<ReplicationTask>> {
        Ok(self
            .tasks
            .lock()
            .expect("poisoned")
            .iter()
            .find(|t| t.task_id == info.task_id)
            .cloned())
    }
}

#[async_trait]
impl ReplicationDlqHandler for InMemoryReplicationStore {
    async fn read_messages(
        &self,
        _source_cluster: &str,
        last_message_id: i64,
        page_size: usize,
    ) -> Result<Vec<ReplicationTask>> {
        Ok(self
            .dlq
            .lock()
            .expect("poisoned")
            .iter()
            .filter(|t| t.task_id <= last_message_id)
            .take(page_size)
            .cloned()
            .collect())
    }

    async fn purge_messages(&self, _source_cluster: &str, last_message_id: i64) -> Result<()> {
        self.dlq
            .lock()
            .expect("poisoned")
            .retain(|t| t.task_id > last_message_id);
        Ok(())
    }

    async fn merge_messages(&self, source_cluster: &str, last_message_id: i64) -> Result<usize> {
        let merged: Vec<ReplicationTask> = {
            let mut dlq = self.dlq.lock().expect("poisoned");
            let (merge, keep): (Vec<_>, Vec<_>) = dlq
                .drain(..)
                .partition(|t| t.task_id <= last_message_id);
            *dlq = keep;
            merge
        };
        let count = merged.len();
        self.tasks.lock().expect("poisoned").extend(merged);
        debug!(source_cluster, count, "merged DLQ replication messages");
        Ok(count)
    }
}
