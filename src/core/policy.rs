use crate::core::error::{EngineError, Result};
use crate::state::{CloseStatus, WorkflowState};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow-id reuse policy carried on start requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdReusePolicy {
    /// Allow a new run whenever the previous run is closed.
    AllowDuplicate,
    /// Allow a new run only when the previous run closed unsuccessfully.
    AllowDuplicateFailedOnly,
    /// Never reuse a workflow id that has history.
    RejectDuplicate,
    /// Terminate a running prior run and start fresh; otherwise behaves as
    /// `AllowDuplicate`.
    TerminateIfRunning,
}

impl Default for IdReusePolicy {
    fn default() -> Self {
        IdReusePolicy::AllowDuplicate
    }
}

/// Close statuses counted as "failed" for `AllowDuplicateFailedOnly`.
pub fn is_failed_close_status(status: CloseStatus) -> bool {
    matches!(
        status,
        CloseStatus::Failed
            | CloseStatus::Canceled
            | CloseStatus::Terminated
            | CloseStatus::TimedOut
    )
}

fn already_started(
    message: String,
    prev_start_request_id: &str,
    prev_run_id: Uuid,
) -> EngineError {
    EngineError::WorkflowAlreadyStarted {
        message,
        start_request_id: prev_start_request_id.to_string(),
        run_id: prev_run_id,
    }
}

/// Decide whether a new run may be created over the prior run's remains.
///
/// Returns `Ok(())` to proceed with a workflow-id-reuse create, or the
/// caller-visible rejection. A running prior run always rejects here; the
/// `TerminateIfRunning` running-state branch is handled before this point by
/// terminate-and-start.
pub fn apply_id_reuse_policy(
    prev_start_request_id: &str,
    prev_run_id: Uuid,
    prev_state: WorkflowState,
    prev_close_status: CloseStatus,
    workflow_id: &str,
    policy: IdReusePolicy,
) -> Result<()> {
    match prev_state {
        WorkflowState::Created | WorkflowState::Running => {
            return Err(already_started(
                format!(
                    "Workflow execution is already running. WorkflowId: {}, RunId: {}.",
                    workflow_id, prev_run_id
                ),
                prev_start_request_id,
                prev_run_id,
            ));
        }
        WorkflowState::Completed => {}
        WorkflowState::Zombie => {
            return Err(EngineError::InternalService(format!(
                "Failed to process workflow, workflow has invalid state: {:?}.",
                prev_state
            )));
        }
    }

    match policy {
        IdReusePolicy::AllowDuplicateFailedOnly => {
            if !is_failed_close_status(prev_close_status) {
                return Err(already_started(
                    format!(
                        "Workflow execution already finished successfully. \
                         WorkflowId: {}, RunId: {}. Workflow ID reuse policy: \
                         allow duplicate workflow ID if last run failed.",
                        workflow_id, prev_run_id
                    ),
                    prev_start_request_id,
                    prev_run_id,
                ));
            }
        }
        IdReusePolicy::AllowDuplicate | IdReusePolicy::TerminateIfRunning => {}
        IdReusePolicy::RejectDuplicate => {
            return Err(already_started(
                format!(
                    "Workflow execution already finished. WorkflowId: {}, \
                     RunId: {}. Workflow ID reuse policy: reject duplicate \
                     workflow ID.",
                    workflow_id, prev_run_id
                ),
                prev_start_request_id,
                prev_run_id,
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WF: &str = "wf-policy";

    fn apply(
        state: WorkflowState,
        close: CloseStatus,
        policy: IdReusePolicy,
    ) -> Result<()> {
        apply_id_reuse_policy("req-1", Uuid::new_v4(), state, close, WF, policy)
    }

    #[test]
    fn running_prior_always_rejects() {
        for policy in [
            IdReusePolicy::AllowDuplicate,
            IdReusePolicy::AllowDuplicateFailedOnly,
            IdReusePolicy::RejectDuplicate,
        ] {
            let err = apply(WorkflowState::Running, CloseStatus::None, policy).unwrap_err();
            assert!(matches!(err, EngineError::WorkflowAlreadyStarted { .. }));
        }
    }

    #[test]
    fn allow_duplicate_accepts_any_closed_run() {
        apply(
            WorkflowState::Completed,
            CloseStatus::Completed,
            IdReusePolicy::AllowDuplicate,
        )
        .unwrap();
        apply(
            WorkflowState::Completed,
            CloseStatus::Failed,
            IdReusePolicy::AllowDuplicate,
        )
        .unwrap();
    }

    #[test]
    fn failed_only_rejects_clean_completion() {
        let err = apply(
            WorkflowState::Completed,
            CloseStatus::Completed,
            IdReusePolicy::AllowDuplicateFailedOnly,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowAlreadyStarted { .. }));

        for close in [
            CloseStatus::Failed,
            CloseStatus::Canceled,
            CloseStatus::Terminated,
            CloseStatus::TimedOut,
        ] {
            apply(
                WorkflowState::Completed,
                close,
                IdReusePolicy::AllowDuplicateFailedOnly,
            )
            .unwrap();
        }
    }

    #[test]
    fn reject_duplicate_rejects_everything() {
        let err = apply(
            WorkflowState::Completed,
            CloseStatus::Completed,
            IdReusePolicy::RejectDuplicate,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowAlreadyStarted { .. }));
    }

    #[test]
    fn zombie_prior_is_internal_error() {
        let err = apply(
            WorkflowState::Zombie,
            CloseStatus::None,
            IdReusePolicy::AllowDuplicate,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InternalService(_)));
    }
}
