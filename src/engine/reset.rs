//! Reset-workflow and cross-cluster event reapply.
//!
//! Reset forks a new run from the base run's history at a decision
//! boundary, reapplies post-cut signals, and atomically supersedes the
//! current run. Reapply routes remote events onto the current run,
//! resetting first when the run already closed.

use super::types::{ResetWorkflowRequest, ResetWorkflowResponse};
use super::ShardEngine;
use crate::cache::ExecutionLease;
use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::core::{EngineError, Result, EMPTY_EVENT_ID, FIRST_EVENT_ID};
use crate::engine::start::IDENTITY_HISTORY_SERVICE;
use crate::state::{EventAttributes, HistoryEvent, MutableState};
use crate::store::CreateWorkflowMode;
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded when reset force-closes the current run.
const WORKFLOW_RESET_REASON: &str = "force terminated to allow reset";

/// Cause recorded on the decision failed event a reset emits.
const DECISION_FAILED_CAUSE_RESET: &str = "reset workflow";

fn reapply_dedupe_key(run_id: Uuid, event_id: i64, version: i64) -> String {
    format!("{}:{}:{}", run_id, event_id, version)
}

impl ShardEngine {
    pub async fn reset_workflow_execution(
        &self,
        request: ResetWorkflowRequest,
    ) -> Result<ResetWorkflowResponse> {
        let base_key = ExecutionKey::new(
            request.domain_id,
            request.workflow_id.clone(),
            request.run_id,
        );
        let mut base_lease = self.execution_cache.get_or_create(&base_key).await?;
        let result = self.reset_with_base_lock(&request, &mut base_lease).await;
        base_lease.release_with(&result);
        result
    }

    async fn reset_with_base_lock(
        &self,
        request: &ResetWorkflowRequest,
        base_lease: &mut ExecutionLease,
    ) -> Result<ResetWorkflowResponse> {
        let base_state = base_lease.load_mutable_state().await?;
        if !base_state.has_processed_or_pending_decision() {
            return Err(EngineError::BadRequest(
                "Cannot reset workflow without a decision task schedule.".to_string(),
            ));
        }
        if request.decision_finish_event_id <= FIRST_EVENT_ID
            || request.decision_finish_event_id > base_state.next_event_id
        {
            return Err(EngineError::BadRequest(
                "Decision finish ID must be > 1 && <= workflow next event ID.".to_string(),
            ));
        }
        let base_branch = base_state.current_branch_token();
        let base_next_event_id = base_state.next_event_id;
        let base_run_id = base_state.execution_info.run_id;

        // The current run may differ from the base the caller forked.
        let current_key = CurrentRunKey::new(request.domain_id, &request.workflow_id);
        let current = self
            .execution_store
            .get_current_execution(&current_key)
            .await
            .map_err(EngineError::from)?;

        let reset_run_id = Uuid::new_v4();
        let outcome = if current.run_id == base_run_id {
            let result = self
                .perform_reset(
                    request,
                    base_branch,
                    base_next_event_id,
                    reset_run_id,
                    base_lease,
                    &[],
                )
                .await;
            Self::surface_reset_conflict(result)?
        } else {
            let mut current_lease = self
                .execution_cache
                .get_or_create(&current_key.with_run(current.run_id))
                .await?;
            let result = self
                .perform_reset(
                    request,
                    base_branch,
                    base_next_event_id,
                    reset_run_id,
                    &mut current_lease,
                    &[],
                )
                .await;
            current_lease.release_with(&result);
            Self::surface_reset_conflict(result)?
        };

        match outcome {
            ResetOutcome::Deduped(run_id) => Ok(ResetWorkflowResponse { run_id }),
            ResetOutcome::Reset => Ok(ResetWorkflowResponse { run_id: reset_run_id }),
        }
    }

    /// Fork, rebuild, reapply, and atomically supersede the current run.
    /// The caller holds the current run's lease with state loadable.
    async fn perform_reset(
        &self,
        request: &ResetWorkflowRequest,
        base_branch: Vec<u8>,
        base_next_event_id: i64,
        reset_run_id: Uuid,
        current_lease: &mut ExecutionLease,
        extra_reapply: &[(String, HistoryEvent)],
    ) -> Result<ResetOutcome> {
        let current_state = current_lease.load_mutable_state().await?;

        // Dedupe by caller request id.
        if current_state.execution_info.create_request_id == request.request_id {
            info!(
                workflow_id = %request.workflow_id,
                run_id = %current_state.execution_info.run_id,
                "duplicated reset request"
            );
            return Ok(ResetOutcome::Deduped(current_state.execution_info.run_id));
        }
        let current_running = current_state.is_workflow_execution_running();
        let current_run_id = current_state.execution_info.run_id;
        let current_last_write_version = current_state.last_write_version;

        // Fork the base branch below the boundary and replay it into the
        // new run's projection.
        let new_branch = format!("branch:{}", reset_run_id).into_bytes();
        self.history_store
            .fork_branch(&base_branch, request.decision_finish_event_id, &new_branch)
            .await
            .map_err(EngineError::from)?;
        let forked_events = self
            .history_store
            .read_events(&new_branch, 0, request.decision_finish_event_id)
            .await
            .map_err(EngineError::from)?;
        let mut new_state = MutableState::rebuild_from_events(
            request.domain_id,
            request.workflow_id.clone(),
            reset_run_id,
            new_branch,
            &forked_events,
        )?;
        new_state.execution_info.create_request_id = request.request_id.clone();
        new_state.clear_stickiness();

        // An in-flight decision at the cut fails with a reset cause.
        if let Some(decision) = new_state.pending_decision.clone() {
            if decision.started_id != EMPTY_EVENT_ID {
                new_state.add_decision_task_failed_event(
                    decision.schedule_id,
                    decision.started_id,
                    DECISION_FAILED_CAUSE_RESET,
                    IDENTITY_HISTORY_SERVICE,
                )?;
            }
        }

        // Reapply signals recorded on the base branch after the cut.
        if !request.skip_signal_reapply {
            let tail = self
                .history_store
                .read_events(&base_branch, request.decision_finish_event_id, base_next_event_id)
                .await
                .map_err(EngineError::from)?;
            for event in tail {
                if let EventAttributes::WorkflowExecutionSignaled {
                    signal_name,
                    input,
                    identity,
                } = &event.attributes
                {
                    let dedupe = reapply_dedupe_key(
                        request.run_id,
                        event.event_id,
                        event.version,
                    );
                    if new_state.is_resource_duplicated(&dedupe) {
                        continue;
                    }
                    new_state.add_workflow_execution_signaled(
                        signal_name.clone(),
                        input.clone(),
                        identity.clone(),
                    )?;
                    new_state.add_duplicated_resource(dedupe);
                }
            }
        }

        // Events carried by cross-cluster reapply ride the same path.
        for (dedupe, event) in extra_reapply {
            if new_state.is_resource_duplicated(dedupe) {
                continue;
            }
            if let EventAttributes::WorkflowExecutionSignaled {
                signal_name,
                input,
                identity,
            } = &event.attributes
            {
                new_state.add_workflow_execution_signaled(
                    signal_name.clone(),
                    input.clone(),
                    identity.clone(),
                )?;
                new_state.add_duplicated_resource(dedupe.clone());
            }
        }

        if !new_state.has_pending_decision() {
            new_state.add_decision_task_scheduled_event()?;
        }
        let new_snapshot = new_state.close_transaction_as_snapshot();

        if current_running {
            // Close the current run and create the reset run in one
            // transaction.
            let first_event_id = current_state.next_event_id;
            current_state.add_workflow_execution_terminated_event(
                first_event_id,
                WORKFLOW_RESET_REASON,
                format!("New runID: {}", reset_run_id).into_bytes(),
                IDENTITY_HISTORY_SERVICE,
            )?;
            current_lease
                .update_workflow_execution_with_new_as_active(&new_snapshot)
                .await?;
        } else {
            let mut context = self.execution_cache.standalone_context(ExecutionKey::new(
                request.domain_id,
                request.workflow_id.clone(),
                reset_run_id,
            ));
            context.persist_first_events(&new_snapshot).await?;
            context
                .create_workflow_execution(
                    &new_snapshot,
                    CreateWorkflowMode::WorkflowIdReuse {
                        prev_run_id: current_run_id,
                        prev_last_write_version: current_last_write_version,
                    },
                )
                .await
                .map_err(EngineError::from)?;
        }

        info!(
            workflow_id = %request.workflow_id,
            base_run_id = %request.run_id,
            reset_run_id = %reset_run_id,
            decision_finish_event_id = request.decision_finish_event_id,
            "workflow reset"
        );
        Ok(ResetOutcome::Reset)
    }

    /// Apply events replicated from another cluster onto the current run
    /// of the workflow, resetting first when the run already closed.
    pub async fn reapply_events(
        &self,
        domain_id: Uuid,
        workflow_id: &str,
        origin_run_id: Uuid,
        events: Vec<HistoryEvent>,
    ) -> Result<()> {
        self.active_domain_entry(domain_id)?;
        let current_key = CurrentRunKey::new(domain_id, workflow_id);

        for _attempt in 0..self.config.conditional_retry_count {
            let current = self
                .execution_store
                .get_current_execution(&current_key)
                .await
                .map_err(EngineError::from)?;
            let key = current_key.with_run(current.run_id);
            let mut lease = self.execution_cache.get_or_create(&key).await?;
            let result = self
                .reapply_events_locked(&mut lease, domain_id, workflow_id, origin_run_id, &events)
                .await;
            lease.release_with(&result);
            match result {
                Err(EngineError::Conflict) => continue,
                other => return other,
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    async fn reapply_events_locked(
        &self,
        lease: &mut ExecutionLease,
        domain_id: Uuid,
        workflow_id: &str,
        origin_run_id: Uuid,
        events: &[HistoryEvent],
    ) -> Result<()> {
        let ms = lease.load_mutable_state().await?;

        // Drop same-cluster events and anything already applied.
        let to_reapply: Vec<(String, HistoryEvent)> = events
            .iter()
            .filter(|e| e.version != ms.last_write_version)
            .map(|e| {
                (
                    reapply_dedupe_key(origin_run_id, e.event_id, e.version),
                    e.clone(),
                )
            })
            .filter(|(key, _)| !ms.is_resource_duplicated(key))
            .collect();
        if to_reapply.is_empty() {
            return Ok(());
        }

        if !ms.is_workflow_execution_running() {
            if ms.previous_started_event_id == EMPTY_EVENT_ID {
                // A closed run with no started decisions has nowhere to
                // carry the events.
                warn!(
                    domain_id = %domain_id,
                    workflow_id = %workflow_id,
                    "cannot reapply events to a finished workflow with no decisions"
                );
                return Ok(());
            }
            let reset_request = ResetWorkflowRequest {
                domain_id,
                workflow_id: workflow_id.to_string(),
                run_id: ms.execution_info.run_id,
                reason: "events reapplication".to_string(),
                decision_finish_event_id: ms.previous_started_event_id + 1,
                request_id: Uuid::new_v4().to_string(),
                skip_signal_reapply: false,
            };
            let base_branch = ms.current_branch_token();
            let base_next_event_id = ms.next_event_id;
            let reset_run_id = Uuid::new_v4();
            self.perform_reset(
                &reset_request,
                base_branch,
                base_next_event_id,
                reset_run_id,
                lease,
                &to_reapply,
            )
            .await?;
            return Ok(());
        }

        let create_decision = !(ms.execution_info.cron_schedule.is_some()
            && !ms.has_processed_or_pending_decision());
        let mut applied = 0usize;
        for (dedupe, event) in &to_reapply {
            if let EventAttributes::WorkflowExecutionSignaled {
                signal_name,
                input,
                identity,
            } = &event.attributes
            {
                ms.add_workflow_execution_signaled(
                    signal_name.clone(),
                    input.clone(),
                    identity.clone(),
                )?;
                ms.add_duplicated_resource(dedupe.clone());
                applied += 1;
            }
        }
        if applied == 0 {
            return Ok(());
        }
        if create_decision && !ms.has_pending_decision() {
            ms.add_decision_task_scheduled_event()?;
        }
        lease.update_workflow_execution_as_active().await
    }
}

enum ResetOutcome {
    Reset,
    Deduped(Uuid),
}

impl ShardEngine {
    /// A conflict during the supersede commit means the current run moved
    /// under the reset; the caller retries the whole operation.
    fn surface_reset_conflict(result: Result<ResetOutcome>) -> Result<ResetOutcome> {
        match result {
            Err(EngineError::Conflict) => Err(EngineError::ServiceBusy(
                "current run updated concurrently during reset".to_string(),
            )),
            other => other,
        }
    }
}
