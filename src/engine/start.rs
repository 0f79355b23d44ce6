//! Start, signal-with-start, and terminate-and-start.
//!
//! Start serializes competing creates through the current-run lock, then
//! runs the create / already-started / reuse-policy state machine. The
//! second create attempt tracks its own error; it never re-reads the
//! first attempt's.

use super::types::{SignalWithStartRequest, StartWorkflowRequest, StartWorkflowResponse};
use super::ShardEngine;
use crate::cache::ExecutionLease;
use crate::core::domain::DomainEntry;
use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::core::policy::apply_id_reuse_policy;
use crate::core::{EngineError, IdReusePolicy, Result};
use crate::state::{MutableState, WorkflowState};
use crate::store::{CreateWorkflowMode, StoreError};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Reason recorded on the terminate event emitted by `TerminateIfRunning`.
pub const TERMINATE_IF_RUNNING_REASON: &str = "TerminateIfRunning Policy";

/// Identity stamped on events the engine emits on its own behalf.
pub const IDENTITY_HISTORY_SERVICE: &str = "history-service";

fn terminate_if_running_details(new_run_id: Uuid) -> Vec<u8> {
    format!("New runID: {}", new_run_id).into_bytes()
}

/// Signal payload threaded through start when the request is
/// signal-with-start.
pub(crate) struct SignalWithStartArg {
    pub signal_name: String,
    pub signal_input: Vec<u8>,
    pub identity: String,
    pub prev_mutable_state: Option<MutableState>,
}

impl ShardEngine {
    pub async fn start_workflow_execution(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<StartWorkflowResponse> {
        let domain_entry = self.active_domain_entry(request.domain_id)?;
        self.start_workflow_helper(request, domain_entry, None).await
    }

    pub(crate) async fn start_workflow_helper(
        &self,
        mut request: StartWorkflowRequest,
        domain_entry: Arc<DomainEntry>,
        signal_with_start: Option<SignalWithStartArg>,
    ) -> Result<StartWorkflowResponse> {
        if domain_entry.status != crate::core::DomainStatus::Registered {
            return Err(EngineError::DomainDeprecated);
        }
        validate_start_request(&request, self.config.max_id_length)?;
        self.override_start_request(&domain_entry, &mut request);

        // The current-run slot is the lock, nothing more; acquisition is
        // bounded by a child deadline so a stuck start fails fast.
        let current_key = CurrentRunKey::new(request.domain_id, &request.workflow_id);
        let lock_timeout = self.lock_acquire_timeout(request.deadline);
        let current_lease = self
            .execution_cache
            .get_or_create_current(&current_key, lock_timeout)
            .await?;

        let result = self
            .start_workflow_locked(&request, &domain_entry, signal_with_start)
            .await;
        current_lease.release_with(&result);
        result
    }

    async fn start_workflow_locked(
        &self,
        request: &StartWorkflowRequest,
        domain_entry: &DomainEntry,
        signal_with_start: Option<SignalWithStartArg>,
    ) -> Result<StartWorkflowResponse> {
        let run_id = Uuid::new_v4();
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), run_id);
        let mut mutable_state = MutableState::new(
            request.domain_id,
            request.workflow_id.clone(),
            run_id,
            domain_entry.failover_version,
        );

        let is_signal_with_start = signal_with_start.is_some();
        let signal = signal_with_start.as_ref().map(|arg| {
            (
                arg.signal_name.as_str(),
                arg.signal_input.as_slice(),
                arg.identity.as_str(),
            )
        });
        let prev_state = signal_with_start
            .as_ref()
            .and_then(|arg| arg.prev_mutable_state.as_ref());

        // Signal-with-start over a closed prior run re-applies the reuse
        // policy here, before anything is persisted.
        if let Some(prev) = prev_state {
            if prev.last_write_version > mutable_state.current_version {
                return Err(
                    self.domain_not_active_error(&domain_entry.name, prev.last_write_version)
                );
            }
            let (state, close_status) = prev.workflow_state_close_status();
            apply_id_reuse_policy(
                &prev.execution_info.create_request_id,
                prev.execution_info.run_id,
                state,
                close_status,
                &request.workflow_id,
                request.id_reuse_policy,
            )?;
        }

        add_start_events_and_tasks(&mut mutable_state, request, signal, None)?;
        let snapshot = mutable_state.close_transaction_as_snapshot();

        let mut context = self.execution_cache.standalone_context(key.clone());

        // First events land before the create; a create that loses the
        // race leaves the batch behind as an unreferenced branch.
        context.persist_first_events(&snapshot).await?;

        let mode = match prev_state {
            Some(prev) => CreateWorkflowMode::WorkflowIdReuse {
                prev_run_id: prev.execution_info.run_id,
                prev_last_write_version: prev.last_write_version,
            },
            None => CreateWorkflowMode::BrandNew,
        };

        let create_error = match context.create_workflow_execution(&snapshot, mode).await {
            Ok(()) => {
                info!(
                    workflow_id = %request.workflow_id,
                    run_id = %run_id,
                    domain = %domain_entry.name,
                    "started workflow execution"
                );
                return Ok(StartWorkflowResponse { run_id });
            }
            Err(e) => e,
        };

        let prior = match create_error {
            StoreError::AlreadyStarted {
                start_request_id,
                run_id: prior_run_id,
                state,
                close_status,
                last_write_version,
            } => {
                // Same request id: the earlier create was ours.
                if start_request_id == request.request_id {
                    return Ok(StartWorkflowResponse {
                        run_id: prior_run_id,
                    });
                }
                if is_signal_with_start {
                    return Err(StoreError::AlreadyStarted {
                        start_request_id,
                        run_id: prior_run_id,
                        state,
                        close_status,
                        last_write_version,
                    }
                    .into());
                }
                if mutable_state.current_version < last_write_version {
                    return Err(
                        self.domain_not_active_error(&domain_entry.name, last_write_version)
                    );
                }
                (
                    start_request_id,
                    prior_run_id,
                    state,
                    close_status,
                    last_write_version,
                )
            }
            other => return Err(other.into()),
        };
        let (prior_request_id, prior_run_id, prior_state, prior_close, prior_version) = prior;

        if request.id_reuse_policy == IdReusePolicy::TerminateIfRunning
            && matches!(
                prior_state,
                WorkflowState::Created | WorkflowState::Running
            )
        {
            let prior_key =
                ExecutionKey::new(request.domain_id, request.workflow_id.clone(), prior_run_id);
            let mut prior_lease = self.execution_cache.get_or_create(&prior_key).await?;
            let result = self
                .terminate_and_start_workflow(&mut prior_lease, run_id, request, None)
                .await;
            prior_lease.release_with(&result);
            return result;
        }

        apply_id_reuse_policy(
            &prior_request_id,
            prior_run_id,
            prior_state,
            prior_close,
            &request.workflow_id,
            request.id_reuse_policy,
        )?;

        // Second create attempt: its error is tracked on its own, never
        // conflated with the first attempt's.
        context
            .create_workflow_execution(
                &snapshot,
                CreateWorkflowMode::WorkflowIdReuse {
                    prev_run_id: prior_run_id,
                    prev_last_write_version: prior_version,
                },
            )
            .await
            .map_err(EngineError::from)?;

        info!(
            workflow_id = %request.workflow_id,
            run_id = %run_id,
            prior_run_id = %prior_run_id,
            "started workflow execution reusing workflow id"
        );
        Ok(StartWorkflowResponse { run_id })
    }

    /// Terminate the running prior run and start the new one in a single
    /// atomic commit. The caller holds the prior run's lease.
    pub(crate) async fn terminate_and_start_workflow(
        &self,
        prior_lease: &mut ExecutionLease,
        new_run_id: Uuid,
        request: &StartWorkflowRequest,
        signal: Option<(&str, &[u8], &str)>,
    ) -> Result<StartWorkflowResponse> {
        for attempt in 0..self.config.conditional_retry_count {
            let prior_state = prior_lease.load_mutable_state().await?;
            if !prior_state.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }

            let first_event_id = prior_state.next_event_id;
            match prior_state.add_workflow_execution_terminated_event(
                first_event_id,
                TERMINATE_IF_RUNNING_REASON,
                terminate_if_running_details(new_run_id),
                IDENTITY_HISTORY_SERVICE,
            ) {
                Ok(_) => {}
                Err(EngineError::StaleState) => {
                    // Cached state may trail the store; reload and retry,
                    // except on the final attempt.
                    prior_lease.clear();
                    if attempt != self.config.conditional_retry_count - 1 {
                        prior_lease.reload_mutable_state().await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
            let prior_run_id = prior_state.execution_info.run_id;

            let mut new_state = MutableState::new(
                request.domain_id,
                request.workflow_id.clone(),
                new_run_id,
                prior_state.current_version,
            );
            add_start_events_and_tasks(&mut new_state, request, signal, Some(prior_run_id))?;
            let new_snapshot = new_state.close_transaction_as_snapshot();

            match prior_lease
                .update_workflow_execution_with_new_as_active(&new_snapshot)
                .await
            {
                Ok(()) => {
                    info!(
                        workflow_id = %request.workflow_id,
                        prior_run_id = %prior_run_id,
                        run_id = %new_run_id,
                        "terminated prior run and started new run"
                    );
                    return Ok(StartWorkflowResponse { run_id: new_run_id });
                }
                Err(EngineError::Conflict) => {
                    debug!(
                        workflow_id = %request.workflow_id,
                        attempt,
                        "terminate-and-start hit a version conflict, retrying"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }

    pub async fn signal_with_start_workflow_execution(
        &self,
        request: SignalWithStartRequest,
    ) -> Result<StartWorkflowResponse> {
        let domain_entry = self.active_domain_entry(request.start.domain_id)?;
        if domain_entry.status != crate::core::DomainStatus::Registered {
            return Err(EngineError::DomainDeprecated);
        }
        let SignalWithStartRequest {
            start: start_request,
            signal_name,
            signal_input,
        } = request;

        let current_key =
            CurrentRunKey::new(start_request.domain_id, &start_request.workflow_id);
        let mut prev_mutable_state: Option<MutableState> = None;

        let current = match self.execution_store.get_current_execution(&current_key).await {
            Ok(current) => Some(current),
            Err(crate::store::StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(current) = current {
            let key = current_key.with_run(current.run_id);
            let mut lease = self.execution_cache.get_or_create(&key).await?;
            let result = self
                .signal_running_workflow(
                    &mut lease,
                    &start_request,
                    &domain_entry,
                    &signal_name,
                    &signal_input,
                )
                .await;
            match result {
                SignalOutcome::Signaled(run_id) => {
                    let ok = Ok(StartWorkflowResponse { run_id });
                    lease.release_with(&ok);
                    return ok;
                }
                SignalOutcome::TerminateAndStart => {
                    let new_run_id = Uuid::new_v4();
                    let result = self
                        .terminate_and_start_workflow(
                            &mut lease,
                            new_run_id,
                            &start_request,
                            Some((
                                signal_name.as_str(),
                                signal_input.as_slice(),
                                start_request.identity.as_str(),
                            )),
                        )
                        .await;
                    lease.release_with(&result);
                    return result;
                }
                SignalOutcome::FallThroughToStart(prev) => {
                    prev_mutable_state = prev;
                    lease.release(None);
                }
                SignalOutcome::Err(e) => {
                    let err: Result<()> = Err(e.clone());
                    lease.release_with(&err);
                    return Err(e);
                }
            }
        }

        let identity = start_request.identity.clone();
        self.start_workflow_helper(
            start_request,
            domain_entry,
            Some(SignalWithStartArg {
                signal_name,
                signal_input,
                identity,
                prev_mutable_state,
            }),
        )
        .await
    }

    /// Signal branch of signal-with-start against an existing run.
    async fn signal_running_workflow(
        &self,
        lease: &mut ExecutionLease,
        start_request: &StartWorkflowRequest,
        domain_entry: &DomainEntry,
        signal_name: &str,
        signal_input: &[u8],
    ) -> SignalOutcome {
        for _attempt in 0..self.config.conditional_retry_count {
            let ms = match lease.load_mutable_state().await {
                Ok(ms) => ms,
                Err(EngineError::EntityNotExists { .. }) => {
                    return SignalOutcome::FallThroughToStart(None)
                }
                Err(e) => return SignalOutcome::Err(e),
            };

            if !ms.is_workflow_execution_running() {
                return SignalOutcome::FallThroughToStart(Some(ms.clone()));
            }

            if start_request.id_reuse_policy == IdReusePolicy::TerminateIfRunning {
                return SignalOutcome::TerminateAndStart;
            }

            let max_signals = self.config.maximum_signals_per_execution;
            if max_signals > 0 && ms.execution_info.signal_count >= max_signals {
                info!(
                    workflow_id = %start_request.workflow_id,
                    domain = %domain_entry.name,
                    signal_count = ms.execution_info.signal_count,
                    "signal ceiling reached"
                );
                return SignalOutcome::Err(EngineError::SignalsLimitExceeded);
            }

            if let Err(e) = ms.add_workflow_execution_signaled(
                signal_name,
                signal_input.to_vec(),
                start_request.identity.clone(),
            ) {
                return SignalOutcome::Err(e);
            }
            if !ms.has_pending_decision() {
                if let Err(e) = ms.add_decision_task_scheduled_event() {
                    return SignalOutcome::Err(e);
                }
            }
            let run_id = ms.execution_info.run_id;

            match lease.update_workflow_execution_as_active().await {
                Ok(()) => return SignalOutcome::Signaled(run_id),
                Err(EngineError::Conflict) => continue,
                Err(e) => return SignalOutcome::Err(e),
            }
        }
        SignalOutcome::Err(EngineError::MaxAttemptsExceeded)
    }

    fn override_start_request(&self, domain_entry: &DomainEntry, request: &mut StartWorkflowRequest) {
        let clamp = self
            .config
            .max_decision_start_to_close_timeout
            .min(request.execution_timeout);
        if request.task_timeout > clamp {
            debug!(
                domain = %domain_entry.name,
                workflow_id = %request.workflow_id,
                requested = ?request.task_timeout,
                clamped = ?clamp,
                "overriding decision start-to-close timeout"
            );
            request.task_timeout = clamp;
        }
    }
}

enum SignalOutcome {
    Signaled(Uuid),
    TerminateAndStart,
    FallThroughToStart(Option<MutableState>),
    Err(EngineError),
}

/// Record the start event (plus the signal event for signal-with-start)
/// and schedule the first decision task when eligible.
pub(crate) fn add_start_events_and_tasks(
    mutable_state: &mut MutableState,
    request: &StartWorkflowRequest,
    signal: Option<(&str, &[u8], &str)>,
    continued_from_run_id: Option<Uuid>,
) -> Result<()> {
    mutable_state.add_workflow_execution_started_event(
        request.workflow_type.clone(),
        request.task_list.clone(),
        request.input.clone(),
        request.execution_timeout,
        request.task_timeout,
        request.request_id.clone(),
        request.identity.clone(),
        request.parent.clone(),
        request.first_decision_backoff,
        request.cron_schedule.clone(),
        request.retry_policy.clone(),
        continued_from_run_id,
    )?;

    if let Some((signal_name, input, identity)) = signal {
        mutable_state.add_workflow_execution_signaled(
            signal_name,
            input.to_vec(),
            identity,
        )?;
    }

    mutable_state.add_first_decision_task_scheduled()?;
    Ok(())
}

fn validate_start_request(request: &StartWorkflowRequest, max_id_length: usize) -> Result<()> {
    if request.request_id.is_empty() {
        return Err(EngineError::BadRequest("Missing request ID.".to_string()));
    }
    if request.execution_timeout.is_zero() {
        return Err(EngineError::BadRequest(
            "Missing or invalid ExecutionStartToCloseTimeoutSeconds.".to_string(),
        ));
    }
    if request.task_timeout.is_zero() {
        return Err(EngineError::BadRequest(
            "Missing or invalid TaskStartToCloseTimeoutSeconds.".to_string(),
        ));
    }
    if request.task_list.is_empty() {
        return Err(EngineError::BadRequest("Missing Tasklist.".to_string()));
    }
    if request.workflow_type.is_empty() {
        return Err(EngineError::BadRequest("Missing WorkflowType.".to_string()));
    }
    if request.workflow_id.is_empty() {
        return Err(EngineError::BadRequest("Missing WorkflowId.".to_string()));
    }
    if request.workflow_id.len() > max_id_length {
        return Err(EngineError::BadRequest(
            "WorkflowId exceeds length limit.".to_string(),
        ));
    }
    if request.task_list.len() > max_id_length {
        return Err(EngineError::BadRequest(
            "TaskList exceeds length limit.".to_string(),
        ));
    }
    if request.workflow_type.len() > max_id_length {
        return Err(EngineError::BadRequest(
            "WorkflowType exceeds length limit.".to_string(),
        ));
    }
    if let Some(policy) = &request.retry_policy {
        policy.validate().map_err(EngineError::BadRequest)?;
    }
    Ok(())
}
