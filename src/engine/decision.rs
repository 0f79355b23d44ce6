//! Decision task RPCs.
//!
//! Only the engine-facing slice of decision handling lives here: stale
//! detection, event bookkeeping, the decider commands the engine itself
//! must interpret, and termination of buffered queries riding on the
//! decision task. The query registry comes from the workflow context, not
//! the state snapshot, so it is the same registry the buffered callers
//! wait on even across conflict-driven reloads.

use super::types::{
    Decision, RecordDecisionTaskStartedRequest, RecordDecisionTaskStartedResponse,
    RespondDecisionTaskCompletedRequest, RespondDecisionTaskFailedRequest,
    ScheduleDecisionTaskRequest,
};
use super::update::UpdateAction;
use super::ShardEngine;
use crate::cache::ExecutionLease;
use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result};
use tracing::warn;

impl ShardEngine {
    /// Schedule a decision task if none is outstanding.
    pub async fn schedule_decision_task(&self, request: ScheduleDecisionTaskRequest) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        self.update_with_action_fn(key, |ms| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            if ms.has_pending_decision() {
                return Ok(UpdateAction::noop());
            }
            ms.add_decision_task_scheduled_event()?;
            Ok(UpdateAction::without_decision())
        })
        .await
    }

    pub async fn record_decision_task_started(
        &self,
        request: RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        self.active_domain_entry(request.domain_id)?;
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let result = self.record_decision_started_locked(&mut lease, &request).await;
        lease.release_with(&result);
        result
    }

    async fn record_decision_started_locked(
        &self,
        lease: &mut ExecutionLease,
        request: &RecordDecisionTaskStartedRequest,
    ) -> Result<RecordDecisionTaskStartedResponse> {
        for attempt in 0..self.config.conditional_retry_count {
            // Buffered consistent queries ride out to the decider with the
            // task.
            let queries = lease.query_registry().buffered_queries();

            let ms = lease.load_mutable_state().await?;
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            let schedule_id = request.schedule_id;
            if !ms.has_pending_decision() && schedule_id >= ms.next_event_id {
                warn!(
                    workflow_id = %ms.execution_info.workflow_id,
                    run_id = %ms.execution_info.run_id,
                    schedule_id,
                    next_event_id = ms.next_event_id,
                    attempt,
                    "stale mutable state in RecordDecisionTaskStarted"
                );
                lease.clear();
                continue;
            }

            let started_event_id = ms.add_decision_task_started_event(
                schedule_id,
                request.request_id.clone(),
                request.identity.clone(),
            )?;
            let decision = ms.pending_decision.as_ref().expect("just started");
            let response = RecordDecisionTaskStartedResponse {
                workflow_type: ms.execution_info.workflow_type.clone(),
                previous_started_event_id: ms.previous_started_event_id,
                scheduled_event_id: schedule_id,
                started_event_id,
                attempt: decision.attempt,
                queries,
            };

            match lease.update_workflow_execution_as_active().await {
                Ok(()) => return Ok(response),
                Err(EngineError::Conflict) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    /// Complete a decision task: append the completion, apply the decider's
    /// commands, answer the queries that rode along, and keep the decision
    /// loop alive while work remains.
    pub async fn respond_decision_task_completed(
        &self,
        request: RespondDecisionTaskCompletedRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let registry = lease.query_registry();
        let result = self
            .respond_decision_completed_locked(&mut lease, &request)
            .await;
        lease.release_with(&result);
        let still_running = result?;

        // Deliver query outcomes only after the commit: an answer must
        // never be observable for a decision that failed to land.
        for (query_id, query_result) in &request.query_results {
            if let Err(e) = registry.complete_query(*query_id, query_result.clone()) {
                warn!(query_id = %query_id, error = %e, "failed to complete buffered query");
            }
        }
        if !still_running {
            // The run closed; direct dispatch is now consistent for
            // whatever is still parked.
            for query_id in registry.buffered_ids() {
                let _ = registry.unblock_query(query_id);
            }
        }
        Ok(())
    }

    /// Returns whether the run is still running after the commit.
    async fn respond_decision_completed_locked(
        &self,
        lease: &mut ExecutionLease,
        request: &RespondDecisionTaskCompletedRequest,
    ) -> Result<bool> {
        for _attempt in 0..self.config.conditional_retry_count {
            let registry = lease.query_registry();
            let ms = lease.load_mutable_state().await?;
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            match ms.pending_decision.as_ref() {
                Some(d)
                    if d.schedule_id == request.schedule_id
                        && d.started_id == request.started_id => {}
                _ => {
                    return Err(EngineError::entity_not_exists("decision task not found"));
                }
            }

            let completed_event_id = ms.add_decision_task_completed_event(
                request.schedule_id,
                request.started_id,
                request.identity.clone(),
            )?;

            if let Some(sticky) = &request.sticky_task_list {
                ms.execution_info.sticky_task_list = Some(sticky.clone());
                ms.execution_info.sticky_schedule_to_start_timeout = request
                    .sticky_schedule_to_start_timeout
                    .unwrap_or_default();
                ms.execution_info.client_supports_sticky_query = true;
            }

            for decision in &request.decisions {
                apply_decision(ms, completed_event_id, decision)?;
            }

            let still_running = ms.is_workflow_execution_running();

            // Keep the loop hot if buffered queries remain on a live run;
            // they need a decision task to be delivered on.
            let create_decision = still_running && registry.has_buffered();
            if create_decision && !ms.has_pending_decision() {
                ms.add_decision_task_scheduled_event()?;
            }

            match lease.update_workflow_execution_as_active().await {
                Ok(()) => return Ok(still_running),
                Err(EngineError::Conflict) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    pub async fn respond_decision_task_failed(
        &self,
        request: RespondDecisionTaskFailedRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);
        let request = &request;
        self.update_with_action_fn(key, move |ms| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            match ms.pending_decision.as_ref() {
                Some(d) if d.schedule_id == request.schedule_id => {}
                _ => return Err(EngineError::entity_not_exists("decision task not found")),
            }
            ms.add_decision_task_failed_event(
                request.schedule_id,
                request.started_id,
                request.cause.clone(),
                request.identity.clone(),
            )?;
            // The decider gets another chance immediately.
            Ok(UpdateAction::with_new_decision())
        })
        .await
    }
}

fn apply_decision(
    ms: &mut crate::state::MutableState,
    completed_event_id: i64,
    decision: &Decision,
) -> Result<()> {
    match decision {
        Decision::ScheduleActivityTask {
            activity_id,
            activity_type,
            task_list,
            input,
            schedule_to_start_timeout,
            schedule_to_close_timeout,
            start_to_close_timeout,
            heartbeat_timeout,
            retry_policy,
        } => {
            ms.add_activity_task_scheduled_event(
                activity_id.clone(),
                activity_type.clone(),
                task_list.clone(),
                input.clone(),
                *schedule_to_start_timeout,
                *schedule_to_close_timeout,
                *start_to_close_timeout,
                *heartbeat_timeout,
                retry_policy.clone(),
            )?;
        }
        Decision::RequestCancelActivityTask { schedule_id } => {
            if ms.get_activity_info(*schedule_id).is_none() {
                return Err(EngineError::BadRequest(format!(
                    "RequestCancelActivityTask references unknown schedule id {}",
                    schedule_id
                )));
            }
            ms.request_activity_cancellation(*schedule_id, completed_event_id)?;
        }
        Decision::CompleteWorkflowExecution { result } => {
            ms.add_workflow_execution_completed_event(completed_event_id, result.clone())?;
        }
        Decision::FailWorkflowExecution { reason, details } => {
            ms.add_workflow_execution_failed_event(
                completed_event_id,
                reason.clone(),
                details.clone(),
            )?;
        }
        Decision::CancelWorkflowExecution { details } => {
            ms.add_workflow_execution_canceled_event(details.clone())?;
        }
    }
    Ok(())
}
