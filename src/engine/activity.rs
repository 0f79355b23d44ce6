//! Activity task RPCs.
//!
//! Every handler re-validates the worker's task token against live
//! mutable state. A missing activity whose schedule id is at or past the
//! next event id means the cache trails the store; the driver clears and
//! reloads. Anything else missing is a benign duplicate and the task is
//! dropped.

use super::types::{
    RecordActivityTaskHeartbeatRequest, RecordActivityTaskHeartbeatResponse,
    RecordActivityTaskStartedRequest, RecordActivityTaskStartedResponse,
    RespondActivityTaskCanceledRequest, RespondActivityTaskCompletedRequest,
    RespondActivityTaskFailedRequest,
};
use super::update::UpdateAction;
use super::ShardEngine;
use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result, TaskToken, EMPTY_EVENT_ID};
use crate::state::MutableState;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Resolve the schedule id a token addresses, falling back to the
/// activity-id index for by-id reports.
fn resolve_schedule_id(token: &TaskToken, ms: &MutableState) -> Result<i64> {
    if token.schedule_id != EMPTY_EVENT_ID {
        return Ok(token.schedule_id);
    }
    if token.activity_id.is_empty() {
        return Err(EngineError::BadRequest(
            "Neither ActivityID nor ScheduleID is provided".to_string(),
        ));
    }
    ms.get_activity_by_activity_id(&token.activity_id)
        .map(|ai| ai.schedule_id)
        .ok_or_else(|| {
            EngineError::BadRequest("Cannot locate Activity ScheduleID".to_string())
        })
}

/// Stale-cache check shared by every activity handler: the activity is
/// gone but its schedule id has not been consumed yet.
fn check_stale(ms: &MutableState, schedule_id: i64, operation: &'static str) -> Result<()> {
    if ms.get_activity_info(schedule_id).is_none() && schedule_id >= ms.next_event_id {
        warn!(
            workflow_id = %ms.execution_info.workflow_id,
            run_id = %ms.execution_info.run_id,
            schedule_id,
            next_event_id = ms.next_event_id,
            operation,
            "stale mutable state detected"
        );
        return Err(EngineError::StaleState);
    }
    Ok(())
}

/// Validate token attempt and started state; anything off means the task
/// is a duplicate to drop.
fn validate_started_activity(
    ms: &MutableState,
    token: &TaskToken,
    schedule_id: i64,
) -> Result<()> {
    let ai = match ms.get_activity_info(schedule_id) {
        Some(ai) => ai,
        None => return Err(EngineError::ActivityTaskNotFound),
    };
    if ai.started_id == EMPTY_EVENT_ID {
        return Err(EngineError::ActivityTaskNotFound);
    }
    if token.schedule_id != EMPTY_EVENT_ID && token.schedule_attempt != ai.attempt {
        return Err(EngineError::ActivityTaskNotFound);
    }
    Ok(())
}

impl ShardEngine {
    pub async fn record_activity_task_started(
        &self,
        request: RecordActivityTaskStartedRequest,
    ) -> Result<RecordActivityTaskStartedResponse> {
        let domain_entry = self.active_domain_entry(request.domain_id)?;
        let domain_name = domain_entry.name.clone();
        let key = ExecutionKey::new(request.domain_id, request.workflow_id.clone(), request.run_id);

        struct Started {
            branch_token: Vec<u8>,
            schedule_id: i64,
            started_timestamp: DateTime<Utc>,
            scheduled_timestamp_of_this_attempt: DateTime<Utc>,
            attempt: i64,
            heartbeat_details: Vec<u8>,
            workflow_type: String,
        }
        let mut started: Option<Started> = None;
        {
            let request = &request;
            let started = &mut started;
            self.update_with_action(key, false, move |ms| {
                if !ms.is_workflow_execution_running() {
                    return Err(EngineError::AlreadyCompleted);
                }
                let schedule_id = request.schedule_id;
                check_stale(ms, schedule_id, "RecordActivityTaskStarted")?;

                let ai = match ms.get_activity_info(schedule_id) {
                    Some(ai) => ai,
                    None => {
                        debug!(schedule_id, "duplicate activity task dropped");
                        return Err(EngineError::ActivityTaskNotFound);
                    }
                };

                if ai.started_id != EMPTY_EVENT_ID && ai.request_id != request.request_id {
                    debug!(schedule_id, "activity already started by another call");
                    return Err(EngineError::EventAlreadyStarted(
                        "Activity task already started.".to_string(),
                    ));
                }
                if ai.started_id == EMPTY_EVENT_ID {
                    ms.add_activity_task_started_event(
                        schedule_id,
                        request.request_id.clone(),
                        request.identity.clone(),
                    )?;
                }

                let ai = ms.get_activity_info(schedule_id).expect("validated");
                *started = Some(Started {
                    branch_token: ms.current_branch_token(),
                    schedule_id,
                    started_timestamp: ai.started_time.unwrap_or_else(Utc::now),
                    scheduled_timestamp_of_this_attempt: ai.scheduled_time,
                    attempt: ai.attempt,
                    heartbeat_details: ai.heartbeat_details.clone(),
                    workflow_type: ms.execution_info.workflow_type.clone(),
                });
                Ok(())
            })
            .await?;
        }
        let started = started.ok_or_else(|| {
            EngineError::InternalService("activity start produced no response".to_string())
        })?;

        // The schedule event is committed history by the time the task is
        // dispatched; hand the worker the real thing.
        let scheduled_event = self
            .history_store
            .read_events(
                &started.branch_token,
                started.schedule_id,
                started.schedule_id + 1,
            )
            .await
            .map_err(EngineError::from)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                EngineError::InternalService("activity scheduled event missing".to_string())
            })?;

        Ok(RecordActivityTaskStartedResponse {
            scheduled_event,
            started_timestamp: started.started_timestamp,
            scheduled_timestamp_of_this_attempt: started.scheduled_timestamp_of_this_attempt,
            attempt: started.attempt,
            heartbeat_details: started.heartbeat_details,
            workflow_type: started.workflow_type,
            workflow_domain: domain_name,
        })
    }

    pub async fn respond_activity_task_completed(
        &self,
        request: RespondActivityTaskCompletedRequest,
    ) -> Result<()> {
        let domain_entry = self.active_domain_entry(request.domain_id)?;
        let token = TaskToken::deserialize(&request.task_token)?;
        let key = ExecutionKey::new(
            request.domain_id,
            token.workflow_id.clone(),
            token.run_id,
        );

        let mut started_time: Option<DateTime<Utc>> = None;
        let mut task_list = String::new();
        {
            let request = &request;
            let token = &token;
            let started_time = &mut started_time;
            let task_list = &mut task_list;
            self.update_with_action(key, true, move |ms| {
                if !ms.is_workflow_execution_running() {
                    return Err(EngineError::AlreadyCompleted);
                }
                let schedule_id = resolve_schedule_id(token, ms)?;
                check_stale(ms, schedule_id, "RespondActivityTaskCompleted")?;
                validate_started_activity(ms, token, schedule_id)?;

                let ai = ms.get_activity_info(schedule_id).expect("validated");
                *started_time = ai.started_time;
                *task_list = ai.task_list.clone();
                let started_id = ai.started_id;
                ms.add_activity_task_completed_event(
                    schedule_id,
                    started_id,
                    request.result.clone(),
                    request.identity.clone(),
                )?;
                Ok(())
            })
            .await?;
        }

        if let Some(started) = started_time {
            // End-to-end latency, keyed the way dashboards slice it.
            info!(
                domain = %domain_entry.name,
                workflow_type = %token.workflow_type,
                activity_type = %token.activity_type,
                task_list = %task_list,
                latency_ms = (Utc::now() - started).num_milliseconds(),
                "activity completed"
            );
        }
        Ok(())
    }

    pub async fn respond_activity_task_failed(
        &self,
        request: RespondActivityTaskFailedRequest,
    ) -> Result<()> {
        let domain_entry = self.active_domain_entry(request.domain_id)?;
        let token = TaskToken::deserialize(&request.task_token)?;
        let key = ExecutionKey::new(
            request.domain_id,
            token.workflow_id.clone(),
            token.run_id,
        );

        let mut started_time: Option<DateTime<Utc>> = None;
        let mut task_list = String::new();
        {
            let request = &request;
            let token = &token;
            let started_time = &mut started_time;
            let task_list = &mut task_list;
            self.update_with_action_fn(key, move |ms| {
                if !ms.is_workflow_execution_running() {
                    return Err(EngineError::AlreadyCompleted);
                }
                let schedule_id = resolve_schedule_id(token, ms)?;
                check_stale(ms, schedule_id, "RespondActivityTaskFailed")?;
                validate_started_activity(ms, token, schedule_id)?;

                let ai = ms.get_activity_info(schedule_id).expect("validated");
                *started_time = ai.started_time;
                *task_list = ai.task_list.clone();
                let started_id = ai.started_id;

                let mut post_action = UpdateAction::without_decision();
                let retrying =
                    ms.retry_activity(schedule_id, &request.reason, &request.details)?;
                if !retrying {
                    // Retries exhausted: record the failure and wake the
                    // decider.
                    ms.add_activity_task_failed_event(
                        schedule_id,
                        started_id,
                        request.reason.clone(),
                        request.details.clone(),
                        request.identity.clone(),
                    )?;
                    post_action.create_decision = true;
                }
                Ok(post_action)
            })
            .await?;
        }

        if let Some(started) = started_time {
            info!(
                domain = %domain_entry.name,
                workflow_type = %token.workflow_type,
                activity_type = %token.activity_type,
                task_list = %task_list,
                latency_ms = (Utc::now() - started).num_milliseconds(),
                "activity failed"
            );
        }
        Ok(())
    }

    pub async fn respond_activity_task_canceled(
        &self,
        request: RespondActivityTaskCanceledRequest,
    ) -> Result<()> {
        self.active_domain_entry(request.domain_id)?;
        let token = TaskToken::deserialize(&request.task_token)?;
        let key = ExecutionKey::new(
            request.domain_id,
            token.workflow_id.clone(),
            token.run_id,
        );

        let request = &request;
        let token = &token;
        self.update_with_action(key, true, move |ms| {
            if !ms.is_workflow_execution_running() {
                return Err(EngineError::AlreadyCompleted);
            }
            let schedule_id = resolve_schedule_id(token, ms)?;
            check_stale(ms, schedule_id, "RespondActivityTaskCanceled")?;
            validate_started_activity(ms, token, schedule_id)?;

            let ai = ms.get_activity_info(schedule_id).expect("validated");
            let started_id = ai.started_id;
            let cancel_requested_event_id = ai.cancel_requested_event_id;
            ms.add_activity_task_canceled_event(
                schedule_id,
                started_id,
                cancel_requested_event_id,
                request.details.clone(),
                request.identity.clone(),
            )?;
            Ok(())
        })
        .await
    }

    /// Liveness and progress reporting. Never transitions state; returns
    /// whether cancellation was requested for the activity.
    pub async fn record_activity_task_heartbeat(
        &self,
        request: RecordActivityTaskHeartbeatRequest,
    ) -> Result<RecordActivityTaskHeartbeatResponse> {
        self.active_domain_entry(request.domain_id)?;
        let token = TaskToken::deserialize(&request.task_token)?;
        let key = ExecutionKey::new(
            request.domain_id,
            token.workflow_id.clone(),
            token.run_id,
        );

        let mut cancel_requested = false;
        {
            let request = &request;
            let token = &token;
            let cancel_requested = &mut cancel_requested;
            self.update_with_action(key, false, move |ms| {
                if !ms.is_workflow_execution_running() {
                    debug!("heartbeat against a closed run");
                    return Err(EngineError::AlreadyCompleted);
                }
                let schedule_id = resolve_schedule_id(token, ms)?;
                check_stale(ms, schedule_id, "RecordActivityTaskHeartbeat")?;
                validate_started_activity(ms, token, schedule_id)?;

                *cancel_requested = ms
                    .get_activity_info(schedule_id)
                    .expect("validated")
                    .cancel_requested;
                ms.update_activity_progress(schedule_id, request.details.clone())?;
                Ok(())
            })
            .await?;
        }

        Ok(RecordActivityTaskHeartbeatResponse { cancel_requested })
    }
}

