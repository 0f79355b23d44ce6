//! Signal, cancel, terminate, and child-completion handlers.
//!
//! These all target "whatever run is current" unless the caller pins a
//! run id, and they all ride the mutation driver.

use super::types::{
    RecordChildExecutionCompletedRequest, RemoveSignalMutableStateRequest, RequestCancelRequest,
    SignalWorkflowRequest, TerminateWorkflowRequest,
};
use super::update::UpdateAction;
use super::ShardEngine;
use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result};
use tracing::info;

impl ShardEngine {
    pub async fn signal_workflow_execution(&self, request: SignalWorkflowRequest) -> Result<()> {
        let domain_entry = self.active_domain_entry(request.domain_id)?;
        if domain_entry.status != crate::core::DomainStatus::Registered {
            return Err(EngineError::DomainDeprecated);
        }
        let max_signals = self.config.maximum_signals_per_execution;
        let domain_name = domain_entry.name.clone();
        let request = &request;

        let action = move |ms: &mut crate::state::MutableState| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }

            // Cron runs that have not started their first decision yet do
            // not get one scheduled by a signal.
            let create_decision = !(ms.execution_info.cron_schedule.is_some()
                && !ms.has_processed_or_pending_decision());
            let post_action = UpdateAction {
                noop: false,
                create_decision,
            };

            if max_signals > 0 && ms.execution_info.signal_count >= max_signals {
                info!(
                    workflow_id = %request.workflow_id,
                    domain = %domain_name,
                    signal_count = ms.execution_info.signal_count,
                    "signal ceiling reached"
                );
                return Err(EngineError::SignalsLimitExceeded);
            }

            if request.child_workflow_only {
                let parent = ms.execution_info.parent.as_ref();
                let matches = match (&request.external_execution, parent) {
                    (Some(external), Some(parent)) => {
                        external.workflow_id == parent.workflow_id
                            && external.run_id == parent.run_id
                    }
                    _ => false,
                };
                if !matches {
                    return Err(EngineError::ParentMismatch);
                }
            }

            // Dedupe by signal request id.
            if let Some(request_id) = &request.request_id {
                if !request_id.is_empty() {
                    if ms.is_signal_requested(request_id) {
                        return Ok(post_action);
                    }
                    ms.add_signal_requested(request_id.clone());
                }
            }

            ms.add_workflow_execution_signaled(
                request.signal_name.clone(),
                request.input.clone(),
                request.identity.clone(),
            )?;
            Ok(post_action)
        };

        match request.run_id {
            Some(run_id) => {
                let key =
                    ExecutionKey::new(request.domain_id, request.workflow_id.clone(), run_id);
                self.update_with_action_fn(key, action).await
            }
            None => {
                self.update_current_with_action_fn(
                    request.domain_id,
                    &request.workflow_id,
                    action,
                )
                .await
            }
        }
    }

    /// Remove a signal request id from the dedupe set.
    pub async fn remove_signal_mutable_state(
        &self,
        request: RemoveSignalMutableStateRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let request_id = request.request_id.clone();
        self.update_with_action(key, false, move |ms| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            ms.delete_signal_requested(&request_id);
            Ok(())
        })
        .await
    }

    pub async fn request_cancel_workflow_execution(
        &self,
        request: RequestCancelRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let request = &request;

        let action = move |ms: &mut crate::state::MutableState| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }

            if request.child_workflow_only {
                let parent = ms.execution_info.parent.as_ref();
                let matches = match (&request.external_execution, parent) {
                    (Some(external), Some(parent)) => {
                        external.workflow_id == parent.workflow_id
                            && external.run_id == parent.run_id
                    }
                    _ => false,
                };
                if !matches {
                    return Err(EngineError::ParentMismatch);
                }
            }

            let (cancel_requested, prior_request_id) = ms.is_cancel_requested();
            if cancel_requested {
                if !request.request_id.is_empty() && request.request_id == prior_request_id {
                    // Idempotent repeat of the same cancel request.
                    return Ok(UpdateAction::with_new_decision());
                }
                return Err(EngineError::CancellationAlreadyRequested);
            }

            ms.add_workflow_execution_cancel_requested_event(
                request.cause.clone(),
                request.request_id.clone(),
                request.identity.clone(),
                request.external_execution.clone(),
            )?;
            Ok(UpdateAction::with_new_decision())
        };

        match request.run_id {
            Some(run_id) => {
                let key =
                    ExecutionKey::new(request.domain_id, request.workflow_id.clone(), run_id);
                self.update_with_action_fn(key, action).await
            }
            None => {
                self.update_current_with_action_fn(
                    request.domain_id,
                    &request.workflow_id,
                    action,
                )
                .await
            }
        }
    }

    pub async fn terminate_workflow_execution(
        &self,
        request: TerminateWorkflowRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let request = &request;

        let action = move |ms: &mut crate::state::MutableState| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            let first_event_id = ms.next_event_id;
            ms.add_workflow_execution_terminated_event(
                first_event_id,
                request.reason.clone(),
                request.details.clone(),
                request.identity.clone(),
            )?;
            Ok(UpdateAction::without_decision())
        };

        match request.run_id {
            Some(run_id) => {
                let key =
                    ExecutionKey::new(request.domain_id, request.workflow_id.clone(), run_id);
                self.update_with_action_fn(key, action).await
            }
            None => {
                self.update_current_with_action_fn(
                    request.domain_id,
                    &request.workflow_id,
                    action,
                )
                .await
            }
        }
    }

    /// Record the completion of a child execution into the parent's
    /// history.
    pub async fn record_child_execution_completed(
        &self,
        request: RecordChildExecutionCompletedRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let request = &request;

        self.update_with_action(key, true, move |ms| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }

            let child = ms
                .get_child_execution_info(request.initiated_id)
                .ok_or_else(|| {
                    EngineError::entity_not_exists("Pending child execution not found.")
                })?;
            if child.started_id == crate::core::EMPTY_EVENT_ID
                || child.started_workflow_id != request.completed_workflow_id
            {
                return Err(EngineError::entity_not_exists(
                    "Pending child execution not found.",
                ));
            }

            ms.add_child_execution_closed_event(
                request.initiated_id,
                request.completed_workflow_id.clone(),
                request.completed_run_id,
                request.workflow_type.clone(),
                request.completion.clone(),
            )?;
            Ok(())
        })
        .await
    }
}
