//! Request and response shapes of the engine's RPC surface.
//!
//! These are in-process types; the host service maps them to its wire
//! protocol. Optional deadlines carry the caller's budget where a handler
//! derives sub-deadlines from it.

use crate::core::IdReusePolicy;
use crate::state::{
    ActivityInfo, ChildCloseKind, ChildExecutionInfo, CloseStatus, DecisionInfo, ExternalExecution,
    HistoryEvent, ParentExecutionInfo, QueryResult, RetryPolicy, VersionHistories, WorkflowState,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_list: String,
    pub input: Vec<u8>,
    pub execution_timeout: Duration,
    pub task_timeout: Duration,
    pub identity: String,
    pub request_id: String,
    pub id_reuse_policy: IdReusePolicy,
    pub retry_policy: Option<RetryPolicy>,
    pub cron_schedule: Option<String>,
    pub first_decision_backoff: Option<Duration>,
    pub parent: Option<ParentExecutionInfo>,
    /// Caller deadline; tightens the current-run lock sub-deadline.
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartWorkflowResponse {
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct SignalWorkflowRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    /// `None` targets whatever run is current.
    pub run_id: Option<Uuid>,
    pub signal_name: String,
    pub input: Vec<u8>,
    pub identity: String,
    /// Dedupe key; a repeat with the same id is a clean no-op.
    pub request_id: Option<String>,
    pub child_workflow_only: bool,
    pub external_execution: Option<ExternalExecution>,
}

#[derive(Debug, Clone)]
pub struct SignalWithStartRequest {
    pub start: StartWorkflowRequest,
    pub signal_name: String,
    pub signal_input: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct TerminateWorkflowRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Option<Uuid>,
    pub reason: String,
    pub details: Vec<u8>,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RequestCancelRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Option<Uuid>,
    pub cause: String,
    pub request_id: String,
    pub identity: String,
    pub child_workflow_only: bool,
    pub external_execution: Option<ExternalExecution>,
}

#[derive(Debug, Clone)]
pub struct RemoveSignalMutableStateRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub request_id: String,
}

#[derive(Debug, Clone)]
pub struct RecordActivityTaskStartedRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub schedule_id: i64,
    /// Poller request id; duplicate reports for it are idempotent.
    pub request_id: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RecordActivityTaskStartedResponse {
    pub scheduled_event: HistoryEvent,
    pub started_timestamp: DateTime<Utc>,
    pub scheduled_timestamp_of_this_attempt: DateTime<Utc>,
    pub attempt: i64,
    pub heartbeat_details: Vec<u8>,
    pub workflow_type: String,
    pub workflow_domain: String,
}

#[derive(Debug, Clone)]
pub struct RespondActivityTaskCompletedRequest {
    pub domain_id: Uuid,
    pub task_token: Vec<u8>,
    pub result: Vec<u8>,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RespondActivityTaskFailedRequest {
    pub domain_id: Uuid,
    pub task_token: Vec<u8>,
    pub reason: String,
    pub details: Vec<u8>,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RespondActivityTaskCanceledRequest {
    pub domain_id: Uuid,
    pub task_token: Vec<u8>,
    pub details: Vec<u8>,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RecordActivityTaskHeartbeatRequest {
    pub domain_id: Uuid,
    pub task_token: Vec<u8>,
    pub details: Vec<u8>,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordActivityTaskHeartbeatResponse {
    pub cancel_requested: bool,
}

#[derive(Debug, Clone)]
pub struct ScheduleDecisionTaskRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RecordDecisionTaskStartedRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub schedule_id: i64,
    pub request_id: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct RecordDecisionTaskStartedResponse {
    pub workflow_type: String,
    pub previous_started_event_id: i64,
    pub scheduled_event_id: i64,
    pub started_event_id: i64,
    pub attempt: i64,
    /// Buffered consistent queries riding on this decision task.
    pub queries: Vec<(Uuid, String, Vec<u8>)>,
}

/// A command the decider returns on decision-task completion. Only the
/// commands the engine itself must interpret are modeled; the rest belong
/// to the decision handler's richer surface.
#[derive(Debug, Clone)]
pub enum Decision {
    ScheduleActivityTask {
        activity_id: String,
        activity_type: String,
        task_list: String,
        input: Vec<u8>,
        schedule_to_start_timeout: Duration,
        schedule_to_close_timeout: Duration,
        start_to_close_timeout: Duration,
        heartbeat_timeout: Option<Duration>,
        retry_policy: Option<RetryPolicy>,
    },
    RequestCancelActivityTask {
        schedule_id: i64,
    },
    CompleteWorkflowExecution {
        result: Vec<u8>,
    },
    FailWorkflowExecution {
        reason: String,
        details: Vec<u8>,
    },
    CancelWorkflowExecution {
        details: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct RespondDecisionTaskCompletedRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub schedule_id: i64,
    pub started_id: i64,
    pub identity: String,
    pub decisions: Vec<Decision>,
    /// Answers for queries that rode on the decision task.
    pub query_results: HashMap<Uuid, QueryResult>,
    pub sticky_task_list: Option<String>,
    pub sticky_schedule_to_start_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct RespondDecisionTaskFailedRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub schedule_id: i64,
    pub started_id: i64,
    pub cause: String,
    pub identity: String,
}

#[derive(Debug, Clone)]
pub struct GetMutableStateRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    /// `None` reads whatever run is current.
    pub run_id: Option<Uuid>,
    /// Non-zero blocks until this event id is visible or the long-poll
    /// timer fires.
    pub expected_next_event_id: i64,
    pub current_branch_token: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMutableStateResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_list: String,
    pub sticky_task_list: Option<String>,
    pub sticky_schedule_to_start_timeout: Duration,
    pub client_supports_sticky_query: bool,
    pub last_first_event_id: i64,
    pub next_event_id: i64,
    pub previous_started_event_id: i64,
    pub is_workflow_running: bool,
    pub current_branch_token: Vec<u8>,
    pub workflow_state: WorkflowState,
    pub close_status: CloseStatus,
    pub version_histories: VersionHistories,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryConsistencyLevel {
    Eventual,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRejectCondition {
    /// Reject whenever the run is closed.
    NotOpen,
    /// Reject when the run closed with anything but a clean completion.
    NotCompletedCleanly,
}

#[derive(Debug, Clone)]
pub struct QueryWorkflowRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Option<Uuid>,
    pub query_type: String,
    pub query_args: Vec<u8>,
    pub consistency_level: QueryConsistencyLevel,
    pub reject_condition: Option<QueryRejectCondition>,
    pub deadline: Option<Instant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryWorkflowResponse {
    Answered(Vec<u8>),
    Rejected { close_status: CloseStatus },
}

#[derive(Debug, Clone)]
pub struct DescribeWorkflowExecutionRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct DescribeWorkflowExecutionResponse {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub workflow_type: String,
    pub task_list: String,
    pub execution_timeout: Duration,
    pub task_timeout: Duration,
    pub start_time: DateTime<Utc>,
    pub history_length: i64,
    pub close_status: Option<CloseStatus>,
    pub parent: Option<ParentExecutionInfo>,
    pub pending_activities: Vec<ActivityInfo>,
    pub pending_children: Vec<ChildExecutionInfo>,
    pub pending_decision: Option<DecisionInfo>,
}

#[derive(Debug, Clone)]
pub struct DescribeMutableStateResponse {
    /// JSON projection of the cached mutable state, when the cache held
    /// one.
    pub mutable_state_in_cache: Option<String>,
    /// JSON projection of the state as loaded from the store.
    pub mutable_state_in_database: String,
}

#[derive(Debug, Clone)]
pub struct ResetStickyTaskListRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct ResetWorkflowRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    /// The base run the new history is forked from.
    pub run_id: Uuid,
    pub reason: String,
    /// Fork boundary: must lie in `(1, next_event_id]` of the base run.
    pub decision_finish_event_id: i64,
    pub request_id: String,
    pub skip_signal_reapply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetWorkflowResponse {
    pub run_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct RecordChildExecutionCompletedRequest {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub initiated_id: i64,
    pub completed_workflow_id: String,
    pub completed_run_id: Uuid,
    pub workflow_type: String,
    pub completion: ChildCloseKind,
}
