//! Signals, cancellation, termination, and the activity RPC surface.

mod common;

use common::TestHarness;
use temenos::prelude::*;
use temenos::state::{EventAttributes, RetryPolicy};
use std::time::Duration;
use uuid::Uuid;

fn signal_request(h: &TestHarness, workflow_id: &str, name: &str) -> SignalWorkflowRequest {
    SignalWorkflowRequest {
        domain_id: h.domain_id,
        workflow_id: workflow_id.to_string(),
        run_id: None,
        signal_name: name.to_string(),
        input: b"payload".to_vec(),
        identity: "signaler".to_string(),
        request_id: None,
        child_workflow_only: false,
        external_execution: None,
    }
}

#[tokio::test]
async fn signal_appends_event_and_schedules_decision() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-signal").await;
    h.complete_decision("wf-signal", run_id, vec![]).await;

    let before = h.mutable_state("wf-signal", run_id).await.next_event_id;
    h.engine
        .signal_workflow_execution(signal_request(&h, "wf-signal", "go"))
        .await
        .unwrap();

    let after = h.mutable_state("wf-signal", run_id).await;
    assert!(after.next_event_id > before);
    assert!(h
        .history("wf-signal", run_id)
        .await
        .iter()
        .any(|e| matches!(
            &e.attributes,
            EventAttributes::WorkflowExecutionSignaled { signal_name, .. }
                if signal_name == "go"
        )));
    // A fresh decision task was scheduled for the signal.
    assert!(h
        .pending_decision_schedule_id("wf-signal", run_id)
        .await
        .is_some());
}

#[tokio::test]
async fn signal_dedupes_by_request_id() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-signal-dedupe").await;

    let mut request = signal_request(&h, "wf-signal-dedupe", "once");
    request.request_id = Some("sig-req-1".to_string());
    h.engine
        .signal_workflow_execution(request.clone())
        .await
        .unwrap();
    h.engine.signal_workflow_execution(request).await.unwrap();

    let signals = h
        .history("wf-signal-dedupe", run_id)
        .await
        .iter()
        .filter(|e| matches!(e.attributes, EventAttributes::WorkflowExecutionSignaled { .. }))
        .count();
    assert_eq!(signals, 1);
}

#[tokio::test]
async fn signal_ceiling_yields_limit_error() {
    let mut config = EngineConfig::default();
    config.maximum_signals_per_execution = 2;
    let h = TestHarness::with_config(config);
    h.start_workflow("wf-signal-limit").await;

    h.engine
        .signal_workflow_execution(signal_request(&h, "wf-signal-limit", "s1"))
        .await
        .unwrap();
    h.engine
        .signal_workflow_execution(signal_request(&h, "wf-signal-limit", "s2"))
        .await
        .unwrap();
    let err = h
        .engine
        .signal_workflow_execution(signal_request(&h, "wf-signal-limit", "s3"))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::SignalsLimitExceeded);
}

#[tokio::test]
async fn signal_with_start_signals_running_run() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-sws").await;

    let response = h
        .engine
        .signal_with_start_workflow_execution(SignalWithStartRequest {
            start: h.start_request("wf-sws", "req-sws"),
            signal_name: "nudge".to_string(),
            signal_input: b"x".to_vec(),
        })
        .await
        .unwrap();
    assert_eq!(response.run_id, run_id);

    assert!(h
        .history("wf-sws", run_id)
        .await
        .iter()
        .any(|e| matches!(
            &e.attributes,
            EventAttributes::WorkflowExecutionSignaled { signal_name, .. }
                if signal_name == "nudge"
        )));
}

#[tokio::test]
async fn signal_with_start_creates_run_when_missing() {
    let h = TestHarness::new();
    let response = h
        .engine
        .signal_with_start_workflow_execution(SignalWithStartRequest {
            start: h.start_request("wf-sws-new", "req-sws-new"),
            signal_name: "kick".to_string(),
            signal_input: vec![],
        })
        .await
        .unwrap();

    let history = h.history("wf-sws-new", response.run_id).await;
    assert!(matches!(
        history[0].attributes,
        EventAttributes::WorkflowExecutionStarted { .. }
    ));
    assert!(matches!(
        history[1].attributes,
        EventAttributes::WorkflowExecutionSignaled { .. }
    ));
}

#[tokio::test]
async fn signal_with_start_terminate_if_running_replaces_run() {
    let h = TestHarness::new();
    let first_run = h.start_workflow("wf-sws-tir").await;

    let mut start = h.start_request("wf-sws-tir", "req-sws-tir");
    start.id_reuse_policy = IdReusePolicy::TerminateIfRunning;
    let response = h
        .engine
        .signal_with_start_workflow_execution(SignalWithStartRequest {
            start,
            signal_name: "restart".to_string(),
            signal_input: vec![],
        })
        .await
        .unwrap();
    assert_ne!(response.run_id, first_run);

    let prior = h.mutable_state("wf-sws-tir", first_run).await;
    assert_eq!(prior.close_status, CloseStatus::Terminated);
    assert_eq!(h.current_run_id("wf-sws-tir").await, response.run_id);
}

#[tokio::test]
async fn cancel_is_idempotent_per_request_id() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-cancel").await;

    let request = RequestCancelRequest {
        domain_id: h.domain_id,
        workflow_id: "wf-cancel".to_string(),
        run_id: None,
        cause: "operator".to_string(),
        request_id: "cancel-1".to_string(),
        identity: "tester".to_string(),
        child_workflow_only: false,
        external_execution: None,
    };
    h.engine
        .request_cancel_workflow_execution(request.clone())
        .await
        .unwrap();

    // Same request id: clean no-op.
    h.engine
        .request_cancel_workflow_execution(request.clone())
        .await
        .unwrap();

    // Different request id: already requested.
    let mut other = request;
    other.request_id = "cancel-2".to_string();
    let err = h
        .engine
        .request_cancel_workflow_execution(other)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::CancellationAlreadyRequested);

    let cancels = h
        .history("wf-cancel", run_id)
        .await
        .iter()
        .filter(|e| {
            matches!(
                e.attributes,
                EventAttributes::WorkflowExecutionCancelRequested { .. }
            )
        })
        .count();
    assert_eq!(cancels, 1);
}

#[tokio::test]
async fn terminate_closes_current_run() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-term").await;

    h.engine
        .terminate_workflow_execution(TerminateWorkflowRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-term".to_string(),
            run_id: None,
            reason: "operator request".to_string(),
            details: b"bye".to_vec(),
            identity: "tester".to_string(),
        })
        .await
        .unwrap();

    let state = h.mutable_state("wf-term", run_id).await;
    assert_eq!(state.close_status, CloseStatus::Terminated);

    // Terminating a closed run reports already-completed.
    let err = h
        .engine
        .terminate_workflow_execution(TerminateWorkflowRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-term".to_string(),
            run_id: None,
            reason: "again".to_string(),
            details: vec![],
            identity: "tester".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::AlreadyCompleted);
}

#[tokio::test]
async fn activity_lifecycle_start_heartbeat_complete() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-act").await;
    let schedule_id = h.schedule_activity("wf-act", run_id, "a1", None).await;

    let started = h
        .engine
        .record_activity_task_started(RecordActivityTaskStartedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-act".to_string(),
            run_id,
            schedule_id,
            request_id: "poll-1".to_string(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(started.attempt, 0);
    assert_eq!(started.workflow_domain, common::TEST_DOMAIN);
    assert!(matches!(
        started.scheduled_event.attributes,
        EventAttributes::ActivityTaskScheduled { .. }
    ));

    let token = h.activity_token("wf-act", run_id, schedule_id, 0);
    let heartbeat = h
        .engine
        .record_activity_task_heartbeat(RecordActivityTaskHeartbeatRequest {
            domain_id: h.domain_id,
            task_token: token.clone(),
            details: b"50%".to_vec(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap();
    assert!(!heartbeat.cancel_requested);

    h.engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: h.domain_id,
            task_token: token,
            result: b"done".to_vec(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap();

    let history = h.history("wf-act", run_id).await;
    assert!(history
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::ActivityTaskCompleted { .. })));
    // Completion wakes the decider.
    assert!(h
        .pending_decision_schedule_id("wf-act", run_id)
        .await
        .is_some());
}

#[tokio::test]
async fn activity_attempt_mismatch_is_not_found_and_state_unchanged() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-act-mismatch").await;
    let schedule_id = h
        .schedule_activity("wf-act-mismatch", run_id, "a1", None)
        .await;
    h.engine
        .record_activity_task_started(RecordActivityTaskStartedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-act-mismatch".to_string(),
            run_id,
            schedule_id,
            request_id: "poll-1".to_string(),
            identity: "worker".to_string(),
        })
        .await
        .unwrap();

    let before = h.mutable_state("wf-act-mismatch", run_id).await;
    let stale_token = h.activity_token("wf-act-mismatch", run_id, schedule_id, 7);
    let err = h
        .engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: h.domain_id,
            task_token: stale_token,
            result: vec![],
            identity: "worker".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ActivityTaskNotFound);

    let after = h.mutable_state("wf-act-mismatch", run_id).await;
    assert_eq!(after.next_event_id, before.next_event_id);
}

#[tokio::test]
async fn activity_failure_consults_retry_policy() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-act-retry").await;
    let schedule_id = h
        .schedule_activity(
            "wf-act-retry",
            run_id,
            "a1",
            Some(RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
                expiration: None,
                non_retryable_reasons: vec![],
            }),
        )
        .await;

    let start = |attempt: i64| RecordActivityTaskStartedRequest {
        domain_id: h.domain_id,
        workflow_id: "wf-act-retry".to_string(),
        run_id,
        schedule_id,
        request_id: format!("poll-{}", attempt),
        identity: "worker".to_string(),
    };
    h.engine.record_activity_task_started(start(0)).await.unwrap();

    // First failure: retried, no failure event.
    h.engine
        .respond_activity_task_failed(RespondActivityTaskFailedRequest {
            domain_id: h.domain_id,
            task_token: h.activity_token("wf-act-retry", run_id, schedule_id, 0),
            reason: "transient".to_string(),
            details: vec![],
            identity: "worker".to_string(),
        })
        .await
        .unwrap();
    let history = h.history("wf-act-retry", run_id).await;
    assert!(!history
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::ActivityTaskFailed { .. })));

    // Second attempt fails for good: failure event plus a fresh decision.
    let started = h.engine.record_activity_task_started(start(1)).await.unwrap();
    assert_eq!(started.attempt, 1);
    h.engine
        .respond_activity_task_failed(RespondActivityTaskFailedRequest {
            domain_id: h.domain_id,
            task_token: h.activity_token("wf-act-retry", run_id, schedule_id, 1),
            reason: "transient".to_string(),
            details: vec![],
            identity: "worker".to_string(),
        })
        .await
        .unwrap();
    let history = h.history("wf-act-retry", run_id).await;
    assert!(history
        .iter()
        .any(|e| matches!(e.attributes, EventAttributes::ActivityTaskFailed { .. })));
    assert!(h
        .pending_decision_schedule_id("wf-act-retry", run_id)
        .await
        .is_some());
}

#[tokio::test]
async fn garbled_task_token_is_rejected() {
    let h = TestHarness::new();
    h.start_workflow("wf-token").await;
    let err = h
        .engine
        .respond_activity_task_completed(RespondActivityTaskCompletedRequest {
            domain_id: h.domain_id,
            task_token: b"not json".to_vec(),
            result: vec![],
            identity: "worker".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::DeserializingToken);
}

#[tokio::test]
async fn child_completion_without_pending_child_is_not_found() {
    let h = TestHarness::new();
    let run_id = h.start_workflow("wf-child").await;
    let err = h
        .engine
        .record_child_execution_completed(RecordChildExecutionCompletedRequest {
            domain_id: h.domain_id,
            workflow_id: "wf-child".to_string(),
            run_id,
            initiated_id: 42,
            completed_workflow_id: "child-wf".to_string(),
            completed_run_id: Uuid::new_v4(),
            workflow_type: "child-type".to_string(),
            completion: temenos::state::ChildCloseKind::Completed { result: vec![] },
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::EntityNotExists { .. }));
}
