//! Long-poll mutable state and query dispatch.

mod common;

use common::TestHarness;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use temenos::core::domain::INITIAL_PREVIOUS_FAILOVER_VERSION;
use temenos::prelude::*;

fn query_request(h: &TestHarness, workflow_id: &str) -> QueryWorkflowRequest {
    QueryWorkflowRequest {
        domain_id: h.domain_id,
        workflow_id: workflow_id.to_string(),
        run_id: None,
        query_type: "status".to_string(),
        query_args: b"{}".to_vec(),
        consistency_level: QueryConsistencyLevel::Strong,
        reject_condition: None,
        deadline: None,
    }
}

/// Fail the domain over to the standby cluster, making it passive here.
fn make_domain_passive(h: &TestHarness) {
    h.domain_cache.refresh_domains(vec![DomainEntry {
        id: h.domain_id,
        name: common::TEST_DOMAIN.to_string(),
        status: DomainStatus::Registered,
        is_global: true,
        active_cluster_name: common::STANDBY_CLUSTER.to_string(),
        clusters: vec![
            common::CURRENT_CLUSTER.to_string(),
            common::STANDBY_CLUSTER.to_string(),
        ],
        failover_version: 11,
        failover_notification_version: 2,
        previous_failover_version: INITIAL_PREVIOUS_FAILOVER_VERSION,
        notification_version: 2,
    }]);
}

#[tokio::test]
async fn long_poll_returns_on_new_events_not_on_timer() {
    let mut config = EngineConfig::default();
    config.long_poll_expiration_interval = Duration::from_secs(10);
    let h = TestHarness::with_config(config);
    let run_id = h.start_workflow("wf-poll").await;
    let snapshot = h.mutable_state("wf-poll", run_id).await;

    let engine = h.engine.clone();
    let domain_id = h.domain_id;
    let signal_task = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine
            .signal_workflow_execution(SignalWorkflowRequest {
                domain_id,
                workflow_id: "wf-poll".to_string(),
                run_id: Some(run_id),
                signal_name: "wake".to_string(),
                input: vec![],
                identity: "signaler".to_string(),
                request_id: None,
                child_workflow_only: false,
                external_execution: None,
            })
            .await
            .unwrap();
    });

    let started_at = Instant::now();
    let response = h
        .engine
        .get_mutable_state(GetMutableStateRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-poll".to_string(),
            run_id: Some(run_id),
            expected_next_event_id: snapshot.next_event_id,
            current_branch_token: None,
        })
        .await
        .unwrap();
    signal_task.await.unwrap();

    assert!(response.next_event_id > snapshot.next_event_id);
    // Released by the commit notification, well before the 10s timer.
    assert!(started_at.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn long_poll_times_out_with_latest_snapshot() {
    let mut config = EngineConfig::default();
    config.long_poll_expiration_interval = Duration::from_millis(150);
    let h = TestHarness::with_config(config);
    let run_id = h.start_workflow("wf-poll-timeout").await;
    let snapshot = h.mutable_state("wf-poll-timeout", run_id).await;

    let response = h
        .engine
        .get_mutable_state(GetMutableStateRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-poll-timeout".to_string(),
            run_id: Some(run_id),
            expected_next_event_id: snapshot.next_event_id + 5,
            current_branch_token: None,
        })
        .await
        .unwrap();
    assert_eq!(response.next_event_id, snapshot.next_event_id);
}

#[tokio::test]
async fn mismatched_branch_token_is_rejected() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-branch").await;

    let err = h
        .engine
        .get_mutable_state(GetMutableStateRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-branch".to_string(),
            run_id: Some(run_id),
            expected_next_event_id: 0,
            current_branch_token: Some(b"some other branch".to_vec()),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CurrentBranchChanged { .. }));
}

#[tokio::test]
async fn poll_missing_execution_on_passive_cluster_names_active_cluster() {
    let h = TestHarness::new();
    make_domain_passive(&h);

    let err = h
        .engine
        .poll_mutable_state(GetMutableStateRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-missing".to_string(),
            run_id: None,
            expected_next_event_id: 0,
            current_branch_token: None,
        })
        .await
        .unwrap_err();
    match err {
        EngineError::EntityNotExists {
            active_cluster,
            current_cluster,
            ..
        } => {
            assert_eq!(active_cluster.as_deref(), Some(common::STANDBY_CLUSTER));
            assert_eq!(current_cluster.as_deref(), Some(common::CURRENT_CLUSTER));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn query_on_passive_domain_dispatches_directly() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-query-passive").await;
    h.complete_decision("wf-query-passive", run_id, vec![]).await;
    make_domain_passive(&h);

    let response = h
        .engine
        .query_workflow(query_request(&h, "wf-query-passive"))
        .await
        .unwrap();
    assert_eq!(response, QueryWorkflowResponse::Answered(b"answer".to_vec()));

    let requests = h.matching.requests();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].is_sticky);
    assert_eq!(requests[0].task_list, "orders");
}

#[tokio::test]
async fn query_before_first_decision_is_rejected() {
    let mut config = EngineConfig::default();
    config.query_first_decision_task_wait = Duration::from_millis(100);
    config.query_first_decision_task_check_interval = Duration::from_millis(20);
    let h = TestHarness::with_config(config);
    h.start_workflow("wf-query-early").await;

    let err = h
        .engine
        .query_workflow(query_request(&h, "wf-query-early"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::QueryBeforeFirstDecision);
}

#[tokio::test]
async fn strong_query_waits_for_decision_response() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-query-buffered").await;
    h.complete_decision("wf-query-buffered", run_id, vec![]).await;

    // Put a decision in flight so the query must buffer.
    h.engine
        .signal_workflow_execution(SignalWorkflowRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-query-buffered".to_string(),
            run_id: Some(run_id),
            signal_name: "work".to_string(),
            input: vec![],
            identity: "signaler".to_string(),
            request_id: None,
            child_workflow_only: false,
            external_execution: None,
        })
        .await
        .unwrap();

    let engine = h.engine.clone();
    let request = query_request(&h, "wf-query-buffered");
    let query_task = tokio::spawn(async move { engine.query_workflow(request).await });

    // Let the query buffer, then drain the pending decision. Its
    // completion leaves the query parked; the follow-up decision task
    // carries it and answers it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.complete_decision("wf-query-buffered", run_id, vec![]).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let schedule_id = h
        .pending_decision_schedule_id("wf-query-buffered", run_id)
        .await
        .expect("buffered query keeps the decision loop hot");
    let started = h
        .engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-query-buffered".to_string(),
            run_id,
            schedule_id,
            request_id: "poll-q".to_string(),
            identity: "decider".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(started.queries.len(), 1, "query rides the decision task");
    let (query_id, query_type, _args) = started.queries[0].clone();
    assert_eq!(query_type, "status");

    let mut query_results = HashMap::new();
    query_results.insert(query_id, QueryResult::Answered(b"buffered-answer".to_vec()));
    h.engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-query-buffered".to_string(),
            run_id,
            schedule_id,
            started_id: started.started_event_id,
            identity: "decider".to_string(),
            decisions: vec![],
            query_results,
            sticky_task_list: None,
            sticky_schedule_to_start_timeout: None,
        })
        .await
        .unwrap();

    let response = query_task.await.unwrap().unwrap();
    assert_eq!(
        response,
        QueryWorkflowResponse::Answered(b"buffered-answer".to_vec())
    );
    // The buffered path never touched matching.
    assert!(h.matching.requests().is_empty());
    assert!(h.raw_matching.requests().is_empty());
}

#[tokio::test]
async fn query_buffer_ceiling_is_enforced() {
    let mut config = EngineConfig::default();
    config.max_buffered_query_count = 1;
    let h = TestHarness::with_config(config);
    let run_id = h.start_workflow("wf-query-full").await;
    h.complete_decision("wf-query-full", run_id, vec![]).await;

    // In-flight decision forces buffering.
    h.engine
        .signal_workflow_execution(SignalWorkflowRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-query-full".to_string(),
            run_id: Some(run_id),
            signal_name: "work".to_string(),
            input: vec![],
            identity: "signaler".to_string(),
            request_id: None,
            child_workflow_only: false,
            external_execution: None,
        })
        .await
        .unwrap();

    let engine = h.engine.clone();
    let first = query_request(&h, "wf-query-full");
    let _first_task = tokio::spawn(async move { engine.query_workflow(first).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = h
        .engine
        .query_workflow(query_request(&h, "wf-query-full"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::QueryBufferExceeded);
}

#[tokio::test]
async fn closed_run_with_reject_condition_returns_rejection() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-query-closed").await;
    h.complete_decision(
        "wf-query-closed",
        run_id,
        vec![Decision::FailWorkflowExecution {
            reason: "boom".to_string(),
            details: vec![],
        }],
    )
    .await;

    let mut request = query_request(&h, "wf-query-closed");
    request.reject_condition = Some(QueryRejectCondition::NotCompletedCleanly);
    let response = h.engine.query_workflow(request).await.unwrap();
    assert_eq!(
        response,
        QueryWorkflowResponse::Rejected {
            close_status: CloseStatus::Failed
        }
    );
}

#[tokio::test]
async fn sticky_query_goes_through_raw_matching_first() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-query-sticky").await;

    // Completing the decision with a sticky task list arms stickiness.
    let schedule_id = h
        .pending_decision_schedule_id("wf-query-sticky", run_id)
        .await
        .unwrap();
    let started = h
        .engine
        .record_decision_task_started(RecordDecisionTaskStartedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-query-sticky".to_string(),
            run_id,
            schedule_id,
            request_id: "poll-1".to_string(),
            identity: "decider".to_string(),
        })
        .await
        .unwrap();
    h.engine
        .respond_decision_task_completed(RespondDecisionTaskCompletedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-query-sticky".to_string(),
            run_id,
            schedule_id,
            started_id: started.started_event_id,
            identity: "decider".to_string(),
            decisions: vec![],
            query_results: HashMap::new(),
            sticky_task_list: Some("sticky-orders".to_string()),
            sticky_schedule_to_start_timeout: Some(Duration::from_secs(5)),
        })
        .await
        .unwrap();

    let mut request = query_request(&h, "wf-query-sticky");
    request.consistency_level = QueryConsistencyLevel::Eventual;
    let response = h.engine.query_workflow(request).await.unwrap();
    assert_eq!(
        response,
        QueryWorkflowResponse::Answered(b"sticky-answer".to_vec())
    );

    let sticky_requests = h.raw_matching.requests();
    assert_eq!(sticky_requests.len(), 1);
    assert!(sticky_requests[0].is_sticky);
    assert_eq!(sticky_requests[0].task_list, "sticky-orders");
    assert!(h.matching.requests().is_empty());
}

#[tokio::test]
async fn strong_query_requires_feature_enabled() {
    let mut config = EngineConfig::default();
    config.enable_consistent_query = false;
    let h = TestHarness::with_config(config);
    h.start_workflow("wf-query-disabled").await;

    let err = h
        .engine
        .query_workflow(query_request(&h, "wf-query-disabled"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ConsistentQueryNotEnabled);
}
