//! In-memory projection of one run of a workflow.
//!
//! Mutable state is loaded under the execution lock, mutated by exactly one
//! request at a time, and committed back through a conditional update.
//! Every mutation appends the history events that justify it; the
//! uncommitted batch and the follow-up tasks it produced are drained when
//! the transaction closes.

use crate::core::{EngineError, Result, EMPTY_EVENT_ID, FIRST_EVENT_ID};
use crate::state::event::{
    ChildCloseKind, EventAttributes, HistoryEvent, ParentExecutionInfo, RetryPolicy,
};
use crate::state::task::Task;
use crate::state::version_history::{VersionHistories, VersionHistory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Created,
    Running,
    Completed,
    Zombie,
}

/// How a run closed. `None` iff the run is still in `Created`/`Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseStatus {
    None,
    Completed,
    Failed,
    Canceled,
    Terminated,
    TimedOut,
    ContinuedAsNew,
}

/// A pending activity, keyed by its schedule event id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInfo {
    pub schedule_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub started_id: i64,
    pub started_time: Option<DateTime<Utc>>,
    pub activity_id: String,
    pub activity_type: String,
    pub task_list: String,
    /// Request id of the poll that started this attempt; used to make
    /// duplicate start reports idempotent.
    pub request_id: String,
    pub attempt: i64,
    pub cancel_requested: bool,
    pub cancel_requested_event_id: i64,
    pub last_heartbeat_time: Option<DateTime<Utc>>,
    pub heartbeat_details: Vec<u8>,
    pub schedule_to_start_timeout: Duration,
    pub schedule_to_close_timeout: Duration,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub retry_expiration: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub last_failure_details: Vec<u8>,
}

/// A pending child execution, keyed by its initiated event id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildExecutionInfo {
    pub initiated_event_id: i64,
    pub started_id: i64,
    pub started_workflow_id: String,
    pub started_run_id: Uuid,
    pub workflow_type: String,
    pub create_request_id: String,
}

/// The outstanding decision task, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionInfo {
    pub schedule_id: i64,
    pub started_id: i64,
    pub scheduled_time: DateTime<Utc>,
    pub started_time: Option<DateTime<Utc>>,
    pub attempt: i64,
    pub request_id: String,
    pub task_list: String,
}

/// Static-ish execution attributes plus the run's lifecycle flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_list: String,
    pub execution_timeout: Duration,
    pub task_timeout: Duration,
    pub create_request_id: String,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub start_time: DateTime<Utc>,
    pub parent: Option<ParentExecutionInfo>,
    pub cron_schedule: Option<String>,
    pub first_decision_backoff: Option<Duration>,
    pub signal_count: usize,
    pub cancel_requested: bool,
    pub cancel_request_id: String,
    pub sticky_task_list: Option<String>,
    pub sticky_schedule_to_start_timeout: Duration,
    /// Whether the connected worker's client can answer queries on the
    /// sticky task list.
    pub client_supports_sticky_query: bool,
}

/// The mutable state of one run.
///
/// Invariants:
/// - `next_event_id` strictly increases and is never reused.
/// - `close_status == None` iff `state` is `Created` or `Running`.
/// - The current branch token changes only through reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutableState {
    pub execution_info: ExecutionInfo,
    pub next_event_id: i64,
    /// First event id of the most recently committed batch.
    pub last_first_event_id: i64,
    /// Started event id of the last completed decision; `EMPTY_EVENT_ID`
    /// until the first decision completes.
    pub previous_started_event_id: i64,
    pub current_version: i64,
    pub last_write_version: i64,
    pub version_histories: VersionHistories,
    pub pending_activities: HashMap<i64, ActivityInfo>,
    activity_id_index: HashMap<String, i64>,
    pub pending_children: HashMap<i64, ChildExecutionInfo>,
    pub pending_decision: Option<DecisionInfo>,
    pub signal_requested: HashSet<String>,
    /// Dedupe keys for cross-cluster reapplied events.
    applied_resources: HashSet<String>,

    #[serde(skip, default)]
    uncommitted_events: Vec<HistoryEvent>,
    #[serde(skip, default)]
    transfer_tasks: Vec<Task>,
    #[serde(skip, default)]
    timer_tasks: Vec<Task>,
}

/// Everything a closed transaction hands to the store: the committed state
/// image, the event batch, and the follow-up tasks.
#[derive(Debug, Clone)]
pub struct WorkflowSnapshot {
    pub state: MutableState,
    pub events: Vec<HistoryEvent>,
    pub transfer_tasks: Vec<Task>,
    pub timer_tasks: Vec<Task>,
}

impl MutableState {
    /// Fresh mutable state for a brand-new or forked run.
    pub fn new(
        domain_id: Uuid,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        version: i64,
    ) -> Self {
        let branch_token = format!("branch:{}", run_id).into_bytes();
        Self {
            execution_info: ExecutionInfo {
                domain_id,
                workflow_id: workflow_id.into(),
                run_id,
                workflow_type: String::new(),
                task_list: String::new(),
                execution_timeout: Duration::ZERO,
                task_timeout: Duration::ZERO,
                create_request_id: String::new(),
                state: WorkflowState::Created,
                close_status: CloseStatus::None,
                start_time: Utc::now(),
                parent: None,
                cron_schedule: None,
                first_decision_backoff: None,
                signal_count: 0,
                cancel_requested: false,
                cancel_request_id: String::new(),
                sticky_task_list: None,
                sticky_schedule_to_start_timeout: Duration::ZERO,
                client_supports_sticky_query: false,
            },
            next_event_id: FIRST_EVENT_ID,
            last_first_event_id: EMPTY_EVENT_ID,
            previous_started_event_id: EMPTY_EVENT_ID,
            current_version: version,
            last_write_version: version,
            version_histories: VersionHistories::new(VersionHistory::new(branch_token)),
            pending_activities: HashMap::new(),
            activity_id_index: HashMap::new(),
            pending_children: HashMap::new(),
            pending_decision: None,
            signal_requested: HashSet::new(),
            applied_resources: HashSet::new(),
            uncommitted_events: Vec::new(),
            transfer_tasks: Vec::new(),
            timer_tasks: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn is_workflow_execution_running(&self) -> bool {
        matches!(
            self.execution_info.state,
            WorkflowState::Created | WorkflowState::Running
        )
    }

    pub fn workflow_state_close_status(&self) -> (WorkflowState, CloseStatus) {
        (self.execution_info.state, self.execution_info.close_status)
    }

    pub fn current_branch_token(&self) -> Vec<u8> {
        self.version_histories.current().branch_token.clone()
    }

    pub fn has_pending_decision(&self) -> bool {
        self.pending_decision.is_some()
    }

    pub fn has_in_flight_decision(&self) -> bool {
        self.pending_decision
            .as_ref()
            .map(|d| d.started_id != EMPTY_EVENT_ID)
            .unwrap_or(false)
    }

    pub fn has_processed_or_pending_decision(&self) -> bool {
        self.previous_started_event_id != EMPTY_EVENT_ID || self.has_pending_decision()
    }

    pub fn is_sticky_task_list_enabled(&self) -> bool {
        self.execution_info
            .sticky_task_list
            .as_deref()
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    pub fn clear_stickiness(&mut self) {
        self.execution_info.sticky_task_list = None;
        self.execution_info.sticky_schedule_to_start_timeout = Duration::ZERO;
        self.execution_info.client_supports_sticky_query = false;
    }

    pub fn get_activity_info(&self, schedule_id: i64) -> Option<&ActivityInfo> {
        self.pending_activities.get(&schedule_id)
    }

    pub fn get_activity_by_activity_id(&self, activity_id: &str) -> Option<&ActivityInfo> {
        self.activity_id_index
            .get(activity_id)
            .and_then(|schedule_id| self.pending_activities.get(schedule_id))
    }

    pub fn get_child_execution_info(&self, initiated_id: i64) -> Option<&ChildExecutionInfo> {
        self.pending_children.get(&initiated_id)
    }

    pub fn is_signal_requested(&self, request_id: &str) -> bool {
        self.signal_requested.contains(request_id)
    }

    pub fn add_signal_requested(&mut self, request_id: impl Into<String>) {
        self.signal_requested.insert(request_id.into());
    }

    pub fn delete_signal_requested(&mut self, request_id: &str) {
        self.signal_requested.remove(request_id);
    }

    pub fn is_cancel_requested(&self) -> (bool, &str) {
        (
            self.execution_info.cancel_requested,
            &self.execution_info.cancel_request_id,
        )
    }

    /// Dedupe key membership for cross-cluster reapplied events.
    pub fn is_resource_duplicated(&self, key: &str) -> bool {
        self.applied_resources.contains(key)
    }

    pub fn add_duplicated_resource(&mut self, key: impl Into<String>) {
        self.applied_resources.insert(key.into());
    }

    // ------------------------------------------------------------------
    // Event appends
    // ------------------------------------------------------------------

    fn append_event(&mut self, attributes: EventAttributes) -> i64 {
        let event_id = self.next_event_id;
        self.next_event_id += 1;
        let event = HistoryEvent {
            event_id,
            timestamp: Utc::now(),
            version: self.current_version,
            attributes,
        };
        // Branch bookkeeping cannot fail here: versions only move forward
        // within one transaction.
        self.version_histories
            .current_mut()
            .add_or_update_item(event_id, self.current_version)
            .expect("version history regression within a transaction");
        self.uncommitted_events.push(event);
        event_id
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.is_workflow_execution_running() {
            return Err(EngineError::AlreadyCompleted);
        }
        Ok(())
    }

    fn close_workflow(&mut self, close_status: CloseStatus) {
        self.execution_info.state = WorkflowState::Completed;
        self.execution_info.close_status = close_status;
        self.pending_decision = None;
        self.transfer_tasks.push(Task::CloseExecution {
            domain_id: self.execution_info.domain_id,
            workflow_id: self.execution_info.workflow_id.clone(),
            run_id: self.execution_info.run_id,
            version: self.current_version,
        });
    }

    /// Record the start event. Must be the first event of the run.
    #[allow(clippy::too_many_arguments)]
    pub fn add_workflow_execution_started_event(
        &mut self,
        workflow_type: impl Into<String>,
        task_list: impl Into<String>,
        input: Vec<u8>,
        execution_timeout: Duration,
        task_timeout: Duration,
        request_id: impl Into<String>,
        identity: impl Into<String>,
        parent: Option<ParentExecutionInfo>,
        first_decision_backoff: Option<Duration>,
        cron_schedule: Option<String>,
        retry_policy: Option<RetryPolicy>,
        continued_from_run_id: Option<Uuid>,
    ) -> Result<i64> {
        if self.next_event_id != FIRST_EVENT_ID {
            return Err(EngineError::InternalService(
                "workflow execution started event must be first".to_string(),
            ));
        }
        let workflow_type = workflow_type.into();
        let task_list = task_list.into();
        let request_id = request_id.into();

        let info = &mut self.execution_info;
        info.workflow_type = workflow_type.clone();
        info.task_list = task_list.clone();
        info.execution_timeout = execution_timeout;
        info.task_timeout = task_timeout;
        info.create_request_id = request_id.clone();
        info.parent = parent.clone();
        info.cron_schedule = cron_schedule.clone();
        info.first_decision_backoff = first_decision_backoff;
        info.state = WorkflowState::Running;
        info.start_time = Utc::now();

        let event_id = self.append_event(EventAttributes::WorkflowExecutionStarted {
            workflow_type,
            task_list,
            input,
            execution_timeout,
            task_timeout,
            request_id,
            identity: identity.into(),
            parent,
            first_decision_backoff,
            cron_schedule,
            retry_policy,
            continued_from_run_id,
        });
        self.timer_tasks.push(Task::WorkflowTimeout {
            version: self.current_version,
            visibility_time: Utc::now() + chrono::Duration::from_std(execution_timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        });
        Ok(event_id)
    }

    /// Schedule the first decision task, unless the run is a child workflow
    /// or starts with a backoff.
    pub fn add_first_decision_task_scheduled(&mut self) -> Result<Option<i64>> {
        if self.execution_info.parent.is_some()
            || self.execution_info.first_decision_backoff.is_some()
        {
            return Ok(None);
        }
        self.add_decision_task_scheduled_event().map(Some)
    }

    pub fn add_decision_task_scheduled_event(&mut self) -> Result<i64> {
        self.ensure_running()?;
        if self.pending_decision.is_some() {
            return Err(EngineError::InternalService(
                "decision task already scheduled".to_string(),
            ));
        }
        let task_list = self
            .execution_info
            .sticky_task_list
            .clone()
            .unwrap_or_else(|| self.execution_info.task_list.clone());
        let timeout = self.execution_info.task_timeout;
        let event_id = self.append_event(EventAttributes::DecisionTaskScheduled {
            task_list: task_list.clone(),
            start_to_close_timeout: timeout,
            attempt: 0,
        });
        self.pending_decision = Some(DecisionInfo {
            schedule_id: event_id,
            started_id: EMPTY_EVENT_ID,
            scheduled_time: Utc::now(),
            started_time: None,
            attempt: 0,
            request_id: String::new(),
            task_list: task_list.clone(),
        });
        self.transfer_tasks.push(Task::Decision {
            domain_id: self.execution_info.domain_id,
            workflow_id: self.execution_info.workflow_id.clone(),
            run_id: self.execution_info.run_id,
            task_list,
            schedule_id: event_id,
            version: self.current_version,
        });
        self.timer_tasks.push(Task::DecisionTimeout {
            schedule_id: event_id,
            version: self.current_version,
            visibility_time: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        });
        Ok(event_id)
    }

    pub fn add_decision_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: impl Into<String>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let request_id = request_id.into();
        let decision = match self.pending_decision.as_ref() {
            Some(d) if d.schedule_id == schedule_id => d,
            _ => return Err(EngineError::entity_not_exists("decision task not found")),
        };
        if decision.started_id != EMPTY_EVENT_ID {
            if decision.request_id == request_id {
                return Ok(decision.started_id);
            }
            return Err(EngineError::EventAlreadyStarted(
                "Decision task already started.".to_string(),
            ));
        }
        let event_id = self.append_event(EventAttributes::DecisionTaskStarted {
            scheduled_event_id: schedule_id,
            identity: identity.into(),
            request_id: request_id.clone(),
        });
        let decision = self.pending_decision.as_mut().expect("checked above");
        decision.started_id = event_id;
        decision.started_time = Some(Utc::now());
        decision.request_id = request_id;
        Ok(event_id)
    }

    pub fn add_decision_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        match self.pending_decision.as_ref() {
            Some(d) if d.schedule_id == schedule_id && d.started_id == started_id => {}
            _ => return Err(EngineError::entity_not_exists("decision task not found")),
        }
        let event_id = self.append_event(EventAttributes::DecisionTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            identity: identity.into(),
        });
        self.previous_started_event_id = started_id;
        self.pending_decision = None;
        Ok(event_id)
    }

    pub fn add_decision_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        cause: impl Into<String>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        match self.pending_decision.as_ref() {
            Some(d) if d.schedule_id == schedule_id => {}
            _ => return Err(EngineError::entity_not_exists("decision task not found")),
        }
        let event_id = self.append_event(EventAttributes::DecisionTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            cause: cause.into(),
            identity: identity.into(),
        });
        self.pending_decision = None;
        Ok(event_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_activity_task_scheduled_event(
        &mut self,
        activity_id: impl Into<String>,
        activity_type: impl Into<String>,
        task_list: impl Into<String>,
        input: Vec<u8>,
        schedule_to_start_timeout: Duration,
        schedule_to_close_timeout: Duration,
        start_to_close_timeout: Duration,
        heartbeat_timeout: Option<Duration>,
        retry_policy: Option<RetryPolicy>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let activity_id = activity_id.into();
        let activity_type = activity_type.into();
        let task_list = task_list.into();
        if self.activity_id_index.contains_key(&activity_id) {
            return Err(EngineError::BadRequest(format!(
                "activity id {} already pending",
                activity_id
            )));
        }
        let event_id = self.append_event(EventAttributes::ActivityTaskScheduled {
            activity_id: activity_id.clone(),
            activity_type: activity_type.clone(),
            task_list: task_list.clone(),
            input,
            schedule_to_start_timeout,
            schedule_to_close_timeout,
            start_to_close_timeout,
            heartbeat_timeout,
            retry_policy: retry_policy.clone(),
        });
        let retry_expiration = retry_policy
            .as_ref()
            .and_then(|p| p.expiration)
            .map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero()));
        self.pending_activities.insert(
            event_id,
            ActivityInfo {
                schedule_id: event_id,
                scheduled_time: Utc::now(),
                started_id: EMPTY_EVENT_ID,
                started_time: None,
                activity_id: activity_id.clone(),
                activity_type,
                task_list: task_list.clone(),
                request_id: String::new(),
                attempt: 0,
                cancel_requested: false,
                cancel_requested_event_id: EMPTY_EVENT_ID,
                last_heartbeat_time: None,
                heartbeat_details: Vec::new(),
                schedule_to_start_timeout,
                schedule_to_close_timeout,
                start_to_close_timeout,
                heartbeat_timeout,
                retry_policy,
                retry_expiration,
                last_failure_reason: None,
                last_failure_details: Vec::new(),
            },
        );
        self.activity_id_index.insert(activity_id, event_id);
        self.transfer_tasks.push(Task::Activity {
            domain_id: self.execution_info.domain_id,
            workflow_id: self.execution_info.workflow_id.clone(),
            run_id: self.execution_info.run_id,
            task_list,
            schedule_id: event_id,
            version: self.current_version,
        });
        self.timer_tasks.push(Task::ActivityTimeout {
            schedule_id: event_id,
            version: self.current_version,
            visibility_time: Utc::now()
                + chrono::Duration::from_std(schedule_to_close_timeout).unwrap_or_else(|_| chrono::Duration::zero()),
        });
        Ok(event_id)
    }

    pub fn add_activity_task_started_event(
        &mut self,
        schedule_id: i64,
        request_id: impl Into<String>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let attempt = match self.pending_activities.get(&schedule_id) {
            Some(ai) if ai.started_id == EMPTY_EVENT_ID => ai.attempt,
            Some(_) => {
                return Err(EngineError::EventAlreadyStarted(
                    "Activity task already started.".to_string(),
                ))
            }
            None => return Err(EngineError::ActivityTaskNotFound),
        };
        let request_id = request_id.into();
        let event_id = self.append_event(EventAttributes::ActivityTaskStarted {
            scheduled_event_id: schedule_id,
            identity: identity.into(),
            request_id: request_id.clone(),
            attempt,
        });
        let ai = self
            .pending_activities
            .get_mut(&schedule_id)
            .expect("checked above");
        ai.started_id = event_id;
        ai.started_time = Some(Utc::now());
        ai.request_id = request_id;
        Ok(event_id)
    }

    fn remove_pending_activity(&mut self, schedule_id: i64) {
        if let Some(ai) = self.pending_activities.remove(&schedule_id) {
            self.activity_id_index.remove(&ai.activity_id);
        }
    }

    pub fn add_activity_task_completed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        result: Vec<u8>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let event_id = self.append_event(EventAttributes::ActivityTaskCompleted {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            result,
            identity: identity.into(),
        });
        self.remove_pending_activity(schedule_id);
        Ok(event_id)
    }

    pub fn add_activity_task_failed_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        reason: impl Into<String>,
        details: Vec<u8>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let event_id = self.append_event(EventAttributes::ActivityTaskFailed {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            reason: reason.into(),
            details,
            identity: identity.into(),
        });
        self.remove_pending_activity(schedule_id);
        Ok(event_id)
    }

    pub fn add_activity_task_canceled_event(
        &mut self,
        schedule_id: i64,
        started_id: i64,
        cancel_requested_event_id: i64,
        details: Vec<u8>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let event_id = self.append_event(EventAttributes::ActivityTaskCanceled {
            scheduled_event_id: schedule_id,
            started_event_id: started_id,
            cancel_requested_event_id,
            details,
            identity: identity.into(),
        });
        self.remove_pending_activity(schedule_id);
        Ok(event_id)
    }

    /// Consult the activity's retry policy after a failure report.
    ///
    /// Returns `true` when another attempt was scheduled (no failure event
    /// is emitted); `false` when retries are exhausted and the caller must
    /// record the failure.
    pub fn retry_activity(
        &mut self,
        schedule_id: i64,
        reason: &str,
        details: &[u8],
    ) -> Result<bool> {
        let now = Utc::now();
        let version = self.current_version;
        let ai = self
            .pending_activities
            .get_mut(&schedule_id)
            .ok_or(EngineError::ActivityTaskNotFound)?;
        let policy = match &ai.retry_policy {
            Some(p) => p,
            None => return Ok(false),
        };
        if policy.non_retryable_reasons.iter().any(|r| r == reason) {
            return Ok(false);
        }
        if let Some(expiration) = ai.retry_expiration {
            if now >= expiration {
                return Ok(false);
            }
        }
        let delay = match policy.next_delay(ai.attempt as i32) {
            Some(d) => d,
            None => return Ok(false),
        };

        ai.attempt += 1;
        ai.started_id = EMPTY_EVENT_ID;
        ai.started_time = None;
        ai.request_id.clear();
        ai.last_failure_reason = Some(reason.to_string());
        ai.last_failure_details = details.to_vec();
        let attempt = ai.attempt;
        self.timer_tasks.push(Task::ActivityRetryTimer {
            schedule_id,
            attempt,
            version,
            visibility_time: now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        });
        Ok(true)
    }

    /// Heartbeat: progress only, never a state transition.
    pub fn update_activity_progress(&mut self, schedule_id: i64, details: Vec<u8>) -> Result<()> {
        let ai = self
            .pending_activities
            .get_mut(&schedule_id)
            .ok_or(EngineError::ActivityTaskNotFound)?;
        ai.last_heartbeat_time = Some(Utc::now());
        ai.heartbeat_details = details;
        Ok(())
    }

    /// Flag a pending activity for cancellation; the flag is delivered to
    /// the worker on its next heartbeat.
    pub fn request_activity_cancellation(&mut self, schedule_id: i64, event_id: i64) -> Result<()> {
        let ai = self
            .pending_activities
            .get_mut(&schedule_id)
            .ok_or(EngineError::ActivityTaskNotFound)?;
        ai.cancel_requested = true;
        ai.cancel_requested_event_id = event_id;
        Ok(())
    }

    pub fn add_workflow_execution_signaled(
        &mut self,
        signal_name: impl Into<String>,
        input: Vec<u8>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let event_id = self.append_event(EventAttributes::WorkflowExecutionSignaled {
            signal_name: signal_name.into(),
            input,
            identity: identity.into(),
        });
        self.execution_info.signal_count += 1;
        Ok(event_id)
    }

    pub fn add_workflow_execution_cancel_requested_event(
        &mut self,
        cause: impl Into<String>,
        request_id: impl Into<String>,
        identity: impl Into<String>,
        external_execution: Option<crate::state::event::ExternalExecution>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let request_id = request_id.into();
        let event_id = self.append_event(EventAttributes::WorkflowExecutionCancelRequested {
            cause: cause.into(),
            request_id: request_id.clone(),
            identity: identity.into(),
            external_execution,
        });
        self.execution_info.cancel_requested = true;
        self.execution_info.cancel_request_id = request_id;
        Ok(event_id)
    }

    /// Append the terminate event and close the run.
    ///
    /// `first_event_id` is the caller's view of the next event id when it
    /// decided to terminate; a mismatch means the cached state is stale.
    pub fn add_workflow_execution_terminated_event(
        &mut self,
        first_event_id: i64,
        reason: impl Into<String>,
        details: Vec<u8>,
        identity: impl Into<String>,
    ) -> Result<i64> {
        self.ensure_running()?;
        if first_event_id != self.next_event_id {
            return Err(EngineError::StaleState);
        }
        let event_id = self.append_event(EventAttributes::WorkflowExecutionTerminated {
            reason: reason.into(),
            details,
            identity: identity.into(),
        });
        self.close_workflow(CloseStatus::Terminated);
        Ok(event_id)
    }

    pub fn add_workflow_execution_completed_event(
        &mut self,
        decision_completed_event_id: i64,
        result: Vec<u8>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let event_id = self.append_event(EventAttributes::WorkflowExecutionCompleted {
            result,
            decision_completed_event_id,
        });
        self.close_workflow(CloseStatus::Completed);
        Ok(event_id)
    }

    pub fn add_workflow_execution_failed_event(
        &mut self,
        decision_completed_event_id: i64,
        reason: impl Into<String>,
        details: Vec<u8>,
    ) -> Result<i64> {
        self.ensure_running()?;
        let event_id = self.append_event(EventAttributes::WorkflowExecutionFailed {
            reason: reason.into(),
            details,
            decision_completed_event_id,
        });
        self.close_workflow(CloseStatus::Failed);
        Ok(event_id)
    }

    pub fn add_workflow_execution_canceled_event(&mut self, details: Vec<u8>) -> Result<i64> {
        self.ensure_running()?;
        let event_id =
            self.append_event(EventAttributes::WorkflowExecutionCanceled { details });
        self.close_workflow(CloseStatus::Canceled);
        Ok(event_id)
    }

    pub fn add_child_execution_closed_event(
        &mut self,
        initiated_event_id: i64,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        workflow_type: impl Into<String>,
        close: ChildCloseKind,
    ) -> Result<i64> {
        self.ensure_running()?;
        let started_id = self
            .pending_children
            .get(&initiated_event_id)
            .map(|ci| ci.started_id)
            .unwrap_or(EMPTY_EVENT_ID);
        let event_id = self.append_event(EventAttributes::ChildWorkflowExecutionClosed {
            initiated_event_id,
            started_event_id: started_id,
            workflow_id: workflow_id.into(),
            run_id,
            workflow_type: workflow_type.into(),
            close,
        });
        self.pending_children.remove(&initiated_event_id);
        Ok(event_id)
    }

    // ------------------------------------------------------------------
    // Replay & task refresh
    // ------------------------------------------------------------------

    /// Rebuild a projection for `run_id` by replaying committed events
    /// onto the given branch. Used when reset forks a new run.
    pub fn rebuild_from_events(
        domain_id: Uuid,
        workflow_id: impl Into<String>,
        run_id: Uuid,
        branch_token: Vec<u8>,
        events: &[HistoryEvent],
    ) -> Result<Self> {
        let version = events.last().map(|e| e.version).unwrap_or(0);
        let mut ms = Self::new(domain_id, workflow_id, run_id, version);
        ms.version_histories = VersionHistories::new(VersionHistory::new(branch_token));
        for event in events {
            ms.apply_event(event)?;
        }
        Ok(ms)
    }

    /// Apply one committed event to the projection without buffering it.
    fn apply_event(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.event_id != self.next_event_id {
            return Err(EngineError::InternalService(format!(
                "replay out of order: expected event {}, got {}",
                self.next_event_id, event.event_id
            )));
        }
        self.next_event_id = event.event_id + 1;
        self.current_version = event.version;
        self.last_write_version = event.version;
        self.version_histories
            .current_mut()
            .add_or_update_item(event.event_id, event.version)?;

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                workflow_type,
                task_list,
                execution_timeout,
                task_timeout,
                request_id,
                parent,
                first_decision_backoff,
                cron_schedule,
                ..
            } => {
                let info = &mut self.execution_info;
                info.workflow_type = workflow_type.clone();
                info.task_list = task_list.clone();
                info.execution_timeout = *execution_timeout;
                info.task_timeout = *task_timeout;
                info.create_request_id = request_id.clone();
                info.parent = parent.clone();
                info.cron_schedule = cron_schedule.clone();
                info.first_decision_backoff = *first_decision_backoff;
                info.state = WorkflowState::Running;
                info.start_time = event.timestamp;
            }
            EventAttributes::DecisionTaskScheduled {
                task_list,
                attempt,
                ..
            } => {
                self.pending_decision = Some(DecisionInfo {
                    schedule_id: event.event_id,
                    started_id: EMPTY_EVENT_ID,
                    scheduled_time: event.timestamp,
                    started_time: None,
                    attempt: *attempt,
                    request_id: String::new(),
                    task_list: task_list.clone(),
                });
            }
            EventAttributes::DecisionTaskStarted {
                scheduled_event_id,
                request_id,
                ..
            } => {
                if let Some(d) = self.pending_decision.as_mut() {
                    if d.schedule_id == *scheduled_event_id {
                        d.started_id = event.event_id;
                        d.started_time = Some(event.timestamp);
                        d.request_id = request_id.clone();
                    }
                }
            }
            EventAttributes::DecisionTaskCompleted {
                started_event_id, ..
            } => {
                self.previous_started_event_id = *started_event_id;
                self.pending_decision = None;
            }
            EventAttributes::DecisionTaskFailed { .. } => {
                self.pending_decision = None;
            }
            EventAttributes::ActivityTaskScheduled {
                activity_id,
                activity_type,
                task_list,
                schedule_to_start_timeout,
                schedule_to_close_timeout,
                start_to_close_timeout,
                heartbeat_timeout,
                retry_policy,
                ..
            } => {
                self.pending_activities.insert(
                    event.event_id,
                    ActivityInfo {
                        schedule_id: event.event_id,
                        scheduled_time: event.timestamp,
                        started_id: EMPTY_EVENT_ID,
                        started_time: None,
                        activity_id: activity_id.clone(),
                        activity_type: activity_type.clone(),
                        task_list: task_list.clone(),
                        request_id: String::new(),
                        attempt: 0,
                        cancel_requested: false,
                        cancel_requested_event_id: EMPTY_EVENT_ID,
                        last_heartbeat_time: None,
                        heartbeat_details: Vec::new(),
                        schedule_to_start_timeout: *schedule_to_start_timeout,
                        schedule_to_close_timeout: *schedule_to_close_timeout,
                        start_to_close_timeout: *start_to_close_timeout,
                        heartbeat_timeout: *heartbeat_timeout,
                        retry_policy: retry_policy.clone(),
                        retry_expiration: None,
                        last_failure_reason: None,
                        last_failure_details: Vec::new(),
                    },
                );
                self.activity_id_index
                    .insert(activity_id.clone(), event.event_id);
            }
            EventAttributes::ActivityTaskStarted {
                scheduled_event_id,
                request_id,
                attempt,
                ..
            } => {
                if let Some(ai) = self.pending_activities.get_mut(scheduled_event_id) {
                    ai.started_id = event.event_id;
                    ai.started_time = Some(event.timestamp);
                    ai.request_id = request_id.clone();
                    ai.attempt = *attempt;
                }
            }
            EventAttributes::ActivityTaskCompleted {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskFailed {
                scheduled_event_id, ..
            }
            | EventAttributes::ActivityTaskCanceled {
                scheduled_event_id, ..
            } => {
                self.remove_pending_activity(*scheduled_event_id);
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                self.execution_info.signal_count += 1;
            }
            EventAttributes::WorkflowExecutionCancelRequested { request_id, .. } => {
                self.execution_info.cancel_requested = true;
                self.execution_info.cancel_request_id = request_id.clone();
            }
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                self.execution_info.state = WorkflowState::Completed;
                self.execution_info.close_status = CloseStatus::Completed;
                self.pending_decision = None;
            }
            EventAttributes::WorkflowExecutionFailed { .. } => {
                self.execution_info.state = WorkflowState::Completed;
                self.execution_info.close_status = CloseStatus::Failed;
                self.pending_decision = None;
            }
            EventAttributes::WorkflowExecutionCanceled { .. } => {
                self.execution_info.state = WorkflowState::Completed;
                self.execution_info.close_status = CloseStatus::Canceled;
                self.pending_decision = None;
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                self.execution_info.state = WorkflowState::Completed;
                self.execution_info.close_status = CloseStatus::Terminated;
                self.pending_decision = None;
            }
            EventAttributes::WorkflowExecutionTimedOut => {
                self.execution_info.state = WorkflowState::Completed;
                self.execution_info.close_status = CloseStatus::TimedOut;
                self.pending_decision = None;
            }
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                self.execution_info.state = WorkflowState::Completed;
                self.execution_info.close_status = CloseStatus::ContinuedAsNew;
                self.pending_decision = None;
            }
            EventAttributes::ChildWorkflowExecutionClosed {
                initiated_event_id, ..
            } => {
                self.pending_children.remove(initiated_event_id);
            }
        }
        Ok(())
    }

    /// Regenerate the transfer/timer tasks implied by the current pending
    /// state. Used after a reload that may have lost task notifications.
    pub fn refresh_tasks(&mut self) {
        if !self.is_workflow_execution_running() {
            return;
        }
        self.timer_tasks.push(Task::WorkflowTimeout {
            version: self.current_version,
            visibility_time: self.execution_info.start_time
                + chrono::Duration::from_std(self.execution_info.execution_timeout)
                    .unwrap_or_else(|_| chrono::Duration::zero()),
        });
        if let Some(decision) = &self.pending_decision {
            if decision.started_id == EMPTY_EVENT_ID {
                self.transfer_tasks.push(Task::Decision {
                    domain_id: self.execution_info.domain_id,
                    workflow_id: self.execution_info.workflow_id.clone(),
                    run_id: self.execution_info.run_id,
                    task_list: decision.task_list.clone(),
                    schedule_id: decision.schedule_id,
                    version: self.current_version,
                });
                self.timer_tasks.push(Task::DecisionTimeout {
                    schedule_id: decision.schedule_id,
                    version: self.current_version,
                    visibility_time: Utc::now()
                        + chrono::Duration::from_std(self.execution_info.task_timeout)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                });
            }
        }
        let mut activity_tasks = Vec::new();
        for ai in self.pending_activities.values() {
            if ai.started_id == EMPTY_EVENT_ID {
                activity_tasks.push(Task::Activity {
                    domain_id: self.execution_info.domain_id,
                    workflow_id: self.execution_info.workflow_id.clone(),
                    run_id: self.execution_info.run_id,
                    task_list: ai.task_list.clone(),
                    schedule_id: ai.schedule_id,
                    version: self.current_version,
                });
                self.timer_tasks.push(Task::ActivityTimeout {
                    schedule_id: ai.schedule_id,
                    version: self.current_version,
                    visibility_time: ai.scheduled_time
                        + chrono::Duration::from_std(ai.schedule_to_close_timeout)
                            .unwrap_or_else(|_| chrono::Duration::zero()),
                });
            }
        }
        self.transfer_tasks.extend(activity_tasks);
    }

    // ------------------------------------------------------------------
    // Transaction close
    // ------------------------------------------------------------------

    /// Drain the uncommitted batch and follow-up tasks.
    ///
    /// Updates `last_first_event_id` / `last_write_version` when the batch
    /// is non-empty. The returned snapshot's `state` is a clean clone with
    /// empty buffers, suitable for persistence.
    pub fn close_transaction_as_snapshot(&mut self) -> WorkflowSnapshot {
        if let Some(first) = self.uncommitted_events.first() {
            self.last_first_event_id = first.event_id;
            self.last_write_version = self.current_version;
        }
        let events = std::mem::take(&mut self.uncommitted_events);
        let transfer_tasks = std::mem::take(&mut self.transfer_tasks);
        let timer_tasks = std::mem::take(&mut self.timer_tasks);
        WorkflowSnapshot {
            state: self.clone(),
            events,
            transfer_tasks,
            timer_tasks,
        }
    }

    /// Discard buffered mutations after a failed attempt.
    pub fn discard_transaction(&mut self) {
        self.uncommitted_events.clear();
        self.transfer_tasks.clear();
        self.timer_tasks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started_state() -> MutableState {
        let mut ms = MutableState::new(Uuid::new_v4(), "wf", Uuid::new_v4(), 0);
        ms.add_workflow_execution_started_event(
            "order-workflow",
            "orders",
            b"{}".to_vec(),
            Duration::from_secs(60),
            Duration::from_secs(10),
            "req-1",
            "tester",
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();
        ms
    }

    #[test]
    fn start_event_must_be_first() {
        let mut ms = started_state();
        let err = ms
            .add_workflow_execution_started_event(
                "t",
                "tl",
                vec![],
                Duration::from_secs(1),
                Duration::from_secs(1),
                "req-2",
                "tester",
                None,
                None,
                None,
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InternalService(_)));
    }

    #[test]
    fn start_then_first_decision_produces_tasks() {
        let mut ms = started_state();
        let schedule_id = ms.add_first_decision_task_scheduled().unwrap().unwrap();
        assert_eq!(schedule_id, 2);
        assert!(ms.has_pending_decision());

        let snapshot = ms.close_transaction_as_snapshot();
        assert_eq!(snapshot.events.len(), 2);
        assert!(snapshot
            .transfer_tasks
            .iter()
            .any(|t| matches!(t, Task::Decision { schedule_id: 2, .. })));
        assert!(snapshot
            .timer_tasks
            .iter()
            .any(|t| matches!(t, Task::WorkflowTimeout { .. })));
        assert_eq!(ms.last_first_event_id, 1);
        // Buffers drained: a second close commits nothing.
        assert!(ms.close_transaction_as_snapshot().events.is_empty());
    }

    #[test]
    fn terminate_with_stale_first_event_id_is_stale_state() {
        let mut ms = started_state();
        let stale = ms.next_event_id - 1;
        let err = ms
            .add_workflow_execution_terminated_event(stale, "why", vec![], "tester")
            .unwrap_err();
        assert_eq!(err, EngineError::StaleState);
        assert!(ms.is_workflow_execution_running());
    }

    #[test]
    fn terminate_closes_run() {
        let mut ms = started_state();
        let next = ms.next_event_id;
        ms.add_workflow_execution_terminated_event(next, "why", vec![], "tester")
            .unwrap();
        assert!(!ms.is_workflow_execution_running());
        assert_eq!(
            ms.workflow_state_close_status(),
            (WorkflowState::Completed, CloseStatus::Terminated)
        );
        let err = ms
            .add_workflow_execution_signaled("s", vec![], "tester")
            .unwrap_err();
        assert_eq!(err, EngineError::AlreadyCompleted);
    }

    #[test]
    fn retry_activity_backs_off_then_exhausts() {
        let mut ms = started_state();
        let schedule_id = ms
            .add_activity_task_scheduled_event(
                "a1",
                "charge",
                "orders",
                vec![],
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(10),
                None,
                Some(RetryPolicy {
                    max_attempts: 2,
                    initial_delay: Duration::from_millis(10),
                    max_delay: Duration::from_secs(1),
                    backoff_multiplier: 2.0,
                    expiration: None,
                    non_retryable_reasons: vec!["fatal".to_string()],
                }),
            )
            .unwrap();
        ms.add_activity_task_started_event(schedule_id, "poll-1", "worker")
            .unwrap();

        // First failure schedules a retry and rewinds the attempt.
        assert!(ms.retry_activity(schedule_id, "boom", b"d").unwrap());
        let ai = ms.get_activity_info(schedule_id).unwrap();
        assert_eq!(ai.attempt, 1);
        assert_eq!(ai.started_id, EMPTY_EVENT_ID);
        assert_eq!(ai.last_failure_reason.as_deref(), Some("boom"));

        // Attempts exhausted: caller must emit the failure event.
        assert!(!ms.retry_activity(schedule_id, "boom", b"d").unwrap());

        // Non-retryable reasons never retry.
        let mut other = started_state();
        let sid = other
            .add_activity_task_scheduled_event(
                "a2",
                "charge",
                "orders",
                vec![],
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(10),
                None,
                Some(RetryPolicy {
                    max_attempts: 10,
                    initial_delay: Duration::from_millis(10),
                    max_delay: Duration::from_secs(1),
                    backoff_multiplier: 2.0,
                    expiration: None,
                    non_retryable_reasons: vec!["fatal".to_string()],
                }),
            )
            .unwrap();
        assert!(!other.retry_activity(sid, "fatal", b"").unwrap());
    }

    #[test]
    fn heartbeat_updates_progress_without_events() {
        let mut ms = started_state();
        let schedule_id = ms
            .add_activity_task_scheduled_event(
                "a1",
                "charge",
                "orders",
                vec![],
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(10),
                None,
                None,
            )
            .unwrap();
        let before = ms.next_event_id;
        ms.update_activity_progress(schedule_id, b"50%".to_vec())
            .unwrap();
        assert_eq!(ms.next_event_id, before);
        let ai = ms.get_activity_info(schedule_id).unwrap();
        assert_eq!(ai.heartbeat_details, b"50%");
        assert!(ai.last_heartbeat_time.is_some());
    }

    #[test]
    fn activity_lookup_by_id_follows_index() {
        let mut ms = started_state();
        let schedule_id = ms
            .add_activity_task_scheduled_event(
                "a1",
                "charge",
                "orders",
                vec![],
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(10),
                None,
                None,
            )
            .unwrap();
        assert_eq!(
            ms.get_activity_by_activity_id("a1").unwrap().schedule_id,
            schedule_id
        );
        ms.add_activity_task_started_event(schedule_id, "p", "w")
            .unwrap();
        ms.add_activity_task_completed_event(schedule_id, schedule_id + 1, vec![], "w")
            .unwrap();
        assert!(ms.get_activity_by_activity_id("a1").is_none());
    }

    #[test]
    fn duplicate_decision_start_is_idempotent_per_request() {
        let mut ms = started_state();
        let schedule_id = ms.add_decision_task_scheduled_event().unwrap();
        let started = ms
            .add_decision_task_started_event(schedule_id, "poll-1", "worker")
            .unwrap();
        assert_eq!(
            ms.add_decision_task_started_event(schedule_id, "poll-1", "worker")
                .unwrap(),
            started
        );
        let err = ms
            .add_decision_task_started_event(schedule_id, "poll-2", "worker")
            .unwrap_err();
        assert!(matches!(err, EngineError::EventAlreadyStarted(_)));
    }
}
