//! Start-workflow semantics: idempotency, reuse policies, concurrent
//! starts, and terminate-and-start.

mod common;

use common::TestHarness;
use temenos::prelude::*;
use temenos::state::EventAttributes;
use uuid::Uuid;

#[tokio::test]
async fn start_creates_run_with_history() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-basic").await;

    let state = h.mutable_state("wf-basic", run_id).await;
    assert_eq!(state.run_id, run_id);
    assert!(state.next_event_id > 1);
    assert!(state.is_workflow_running);
    assert_eq!(state.workflow_type, "order-workflow");

    // Start event plus the first decision task, with matching task
    // notifications.
    let history = h.history("wf-basic", run_id).await;
    assert_eq!(history[0].event_id, 1);
    assert!(matches!(
        history[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
    assert!(matches!(
        history[1].attributes,
        EventAttributes::DecisionTaskScheduled { .. }
    ));
    assert!(h
        .transfer
        .notifications()
        .iter()
        .any(|(cluster, tasks)| cluster == common::CURRENT_CLUSTER && !tasks.is_empty()));
}

#[tokio::test]
async fn start_is_idempotent_by_request_id() {
    let h = TestHarness::new();
    let first = h
        .engine
        .start_workflow_execution(h.start_request("wf-idem", "req-1"))
        .await
        .unwrap();
    let events_before = h.history("wf-idem", first.run_id).await.len();

    let second = h
        .engine
        .start_workflow_execution(h.start_request("wf-idem", "req-1"))
        .await
        .unwrap();
    assert_eq!(second.run_id, first.run_id);
    assert_eq!(h.history("wf-idem", first.run_id).await.len(), events_before);
}

#[tokio::test]
async fn concurrent_starts_agree_on_one_run() {
    let h = TestHarness::new();
    let mut request_a = h.start_request("wf-race", "req-a");
    request_a.id_reuse_policy = IdReusePolicy::RejectDuplicate;
    let mut request_b = h.start_request("wf-race", "req-b");
    request_b.id_reuse_policy = IdReusePolicy::RejectDuplicate;

    let engine_a = h.engine.clone();
    let engine_b = h.engine.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { engine_a.start_workflow_execution(request_a).await }),
        tokio::spawn(async move { engine_b.start_workflow_execution(request_b).await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    let winners: Vec<Uuid> = results
        .iter()
        .filter_map(|r| r.as_ref().ok().map(|resp| resp.run_id))
        .collect();
    assert_eq!(winners.len(), 1, "exactly one start wins: {:?}", results);
    let winner = winners[0];

    for result in &results {
        match result {
            Ok(resp) => assert_eq!(resp.run_id, winner),
            Err(EngineError::WorkflowAlreadyStarted { run_id, .. }) => {
                assert_eq!(*run_id, winner)
            }
            Err(EngineError::ConcurrentStartRequest) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(h.current_run_id("wf-race").await, winner);
}

#[tokio::test]
async fn reject_duplicate_refuses_second_start() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-reject").await;
    h.complete_decision(
        "wf-reject",
        run_id,
        vec![Decision::CompleteWorkflowExecution { result: vec![] }],
    )
    .await;

    let mut request = h.start_request("wf-reject", "req-2");
    request.id_reuse_policy = IdReusePolicy::RejectDuplicate;
    let err = h.engine.start_workflow_execution(request).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowAlreadyStarted { .. }));
}

#[tokio::test]
async fn allow_duplicate_failed_only_requires_failed_close() {
    let h = TestHarness::new();

    // Cleanly completed: refused.
    let run_id = h.start_workflow("wf-failed-only").await;
    h.complete_decision(
        "wf-failed-only",
        run_id,
        vec![Decision::CompleteWorkflowExecution { result: vec![] }],
    )
    .await;
    let mut request = h.start_request("wf-failed-only", "req-2");
    request.id_reuse_policy = IdReusePolicy::AllowDuplicateFailedOnly;
    let err = h.engine.start_workflow_execution(request).await.unwrap_err();
    assert!(matches!(err, EngineError::WorkflowAlreadyStarted { .. }));

    // Failed: accepted.
    let run_id = h.start_workflow("wf-failed-only-2").await;
    h.complete_decision(
        "wf-failed-only-2",
        run_id,
        vec![Decision::FailWorkflowExecution {
            reason: "boom".to_string(),
            details: vec![],
        }],
    )
    .await;
    let mut request = h.start_request("wf-failed-only-2", "req-2");
    request.id_reuse_policy = IdReusePolicy::AllowDuplicateFailedOnly;
    let second = h.engine.start_workflow_execution(request).await.unwrap();
    assert_ne!(second.run_id, run_id);
    assert_eq!(h.current_run_id("wf-failed-only-2").await, second.run_id);
}

#[tokio::test]
async fn terminate_if_running_supersedes_running_run() {
    let h = TestHarness::new();
    let first_run = h.start_workflow("wf-tir").await;

    let mut request = h.start_request("wf-tir", "req-2");
    request.id_reuse_policy = IdReusePolicy::TerminateIfRunning;
    let second = h.engine.start_workflow_execution(request).await.unwrap();
    assert_ne!(second.run_id, first_run);

    // Prior run closed as terminated, details naming the new run.
    let prior = h.mutable_state("wf-tir", first_run).await;
    assert!(!prior.is_workflow_running);
    assert_eq!(prior.close_status, CloseStatus::Terminated);
    let history = h.history("wf-tir", first_run).await;
    let terminate = history
        .iter()
        .find_map(|e| match &e.attributes {
            EventAttributes::WorkflowExecutionTerminated {
                reason, details, ..
            } => Some((reason.clone(), details.clone())),
            _ => None,
        })
        .expect("terminate event recorded");
    assert_eq!(terminate.0, "TerminateIfRunning Policy");
    assert_eq!(
        String::from_utf8(terminate.1).unwrap(),
        format!("New runID: {}", second.run_id)
    );

    assert_eq!(h.current_run_id("wf-tir").await, second.run_id);
    let new_state = h.mutable_state("wf-tir", second.run_id).await;
    assert!(new_state.is_workflow_running);
}

#[tokio::test]
async fn start_validates_request_fields() {
    let h = TestHarness::new();

    let mut missing_request_id = h.start_request("wf-valid", "");
    missing_request_id.request_id = String::new();
    let err = h
        .engine
        .start_workflow_execution(missing_request_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let mut zero_timeout = h.start_request("wf-valid", "req-1");
    zero_timeout.execution_timeout = std::time::Duration::ZERO;
    let err = h
        .engine
        .start_workflow_execution(zero_timeout)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));

    let mut no_task_list = h.start_request("wf-valid", "req-1");
    no_task_list.task_list = String::new();
    let err = h
        .engine
        .start_workflow_execution(no_task_list)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadRequest(_)));
}

#[tokio::test]
async fn deprecated_domain_refuses_starts() {
    let h = TestHarness::new();
    h.domain_cache.refresh_domains(vec![DomainEntry {
        id: h.domain_id,
        name: common::TEST_DOMAIN.to_string(),
        status: DomainStatus::Deprecated,
        is_global: false,
        active_cluster_name: common::CURRENT_CLUSTER.to_string(),
        clusters: vec![common::CURRENT_CLUSTER.to_string()],
        failover_version: 0,
        failover_notification_version: 0,
        previous_failover_version: -1,
        notification_version: 2,
    }]);

    let err = h
        .engine
        .start_workflow_execution(h.start_request("wf-deprecated", "req-1"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::DomainDeprecated);
}
