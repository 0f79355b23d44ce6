//! History event model.
//!
//! Events are the durable record of everything a run did. The engine
//! appends them through mutable state and hands the batches to the history
//! store; it never rewrites a committed event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Retry behavior for an activity, validated at schedule time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Zero means
    /// unlimited until `expiration` elapses.
    pub max_attempts: i32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Overall budget across attempts; `None` means no time bound.
    pub expiration: Option<Duration>,
    /// Failure reasons that stop retrying immediately.
    pub non_retryable_reasons: Vec<String>,
}

impl RetryPolicy {
    /// Reject malformed policies before they are persisted.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay.is_zero() {
            return Err("InitialIntervalInSeconds must be greater than 0.".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("BackoffCoefficient cannot be less than 1.".to_string());
        }
        if self.max_delay < self.initial_delay {
            return Err(
                "MaximumIntervalInSeconds cannot be less than InitialIntervalInSeconds."
                    .to_string(),
            );
        }
        if self.max_attempts < 0 {
            return Err("MaximumAttempts cannot be negative.".to_string());
        }
        if self.max_attempts == 0 && self.expiration.is_none() {
            return Err(
                "MaximumAttempts and ExpirationIntervalInSeconds are both 0. At least one of \
                 them must be specified."
                    .to_string(),
            );
        }
        Ok(())
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted.
    pub fn next_delay(&self, attempt: i32) -> Option<Duration> {
        if self.max_attempts > 0 && attempt + 1 >= self.max_attempts {
            return None;
        }
        let factor = self.backoff_multiplier.powi(attempt.max(0));
        let delay = self.initial_delay.mul_f64(factor);
        Some(delay.min(self.max_delay))
    }
}

/// Identity of a workflow execution in another service or cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalExecution {
    pub workflow_id: String,
    pub run_id: Uuid,
}

/// Parent linkage carried on a child workflow's start event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentExecutionInfo {
    pub domain_id: Uuid,
    pub domain_name: String,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub initiated_event_id: i64,
}

/// How a child execution closed, as reported by its own cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildCloseKind {
    Completed { result: Vec<u8> },
    Failed { reason: String, details: Vec<u8> },
    Canceled { details: Vec<u8> },
    Terminated,
    TimedOut,
}

/// One history event. `event_id` is dense and strictly increasing within a
/// run; `version` is the failover version the event was written under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: i64,
    pub timestamp: DateTime<Utc>,
    pub version: i64,
    pub attributes: EventAttributes,
}

impl HistoryEvent {
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }
}

/// Discriminant of [`EventAttributes`], for routing and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionCompleted,
    WorkflowExecutionFailed,
    WorkflowExecutionCanceled,
    WorkflowExecutionTerminated,
    WorkflowExecutionTimedOut,
    WorkflowExecutionContinuedAsNew,
    WorkflowExecutionSignaled,
    WorkflowExecutionCancelRequested,
    DecisionTaskScheduled,
    DecisionTaskStarted,
    DecisionTaskCompleted,
    DecisionTaskFailed,
    ActivityTaskScheduled,
    ActivityTaskStarted,
    ActivityTaskCompleted,
    ActivityTaskFailed,
    ActivityTaskCanceled,
    ChildWorkflowExecutionClosed,
}

/// Payload of a history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventAttributes {
    WorkflowExecutionStarted {
        workflow_type: String,
        task_list: String,
        input: Vec<u8>,
        execution_timeout: Duration,
        task_timeout: Duration,
        request_id: String,
        identity: String,
        parent: Option<ParentExecutionInfo>,
        first_decision_backoff: Option<Duration>,
        cron_schedule: Option<String>,
        retry_policy: Option<RetryPolicy>,
        /// Set when this run continues a prior run (reset, continue-as-new,
        /// terminate-and-start).
        continued_from_run_id: Option<Uuid>,
    },
    WorkflowExecutionCompleted {
        result: Vec<u8>,
        decision_completed_event_id: i64,
    },
    WorkflowExecutionFailed {
        reason: String,
        details: Vec<u8>,
        decision_completed_event_id: i64,
    },
    WorkflowExecutionCanceled {
        details: Vec<u8>,
    },
    WorkflowExecutionTerminated {
        reason: String,
        details: Vec<u8>,
        identity: String,
    },
    WorkflowExecutionTimedOut,
    WorkflowExecutionContinuedAsNew {
        new_run_id: Uuid,
    },
    WorkflowExecutionSignaled {
        signal_name: String,
        input: Vec<u8>,
        identity: String,
    },
    WorkflowExecutionCancelRequested {
        cause: String,
        request_id: String,
        identity: String,
        external_execution: Option<ExternalExecution>,
    },
    DecisionTaskScheduled {
        task_list: String,
        start_to_close_timeout: Duration,
        attempt: i64,
    },
    DecisionTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
    },
    DecisionTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        identity: String,
    },
    DecisionTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        cause: String,
        identity: String,
    },
    ActivityTaskScheduled {
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
    ActivityTaskStarted {
        scheduled_event_id: i64,
        identity: String,
        request_id: String,
        attempt: i64,
    },
    ActivityTaskCompleted {
        scheduled_event_id: i64,
        started_event_id: i64,
        result: Vec<u8>,
        identity: String,
    },
    ActivityTaskFailed {
        scheduled_event_id: i64,
        started_event_id: i64,
        reason: String,
        details: Vec<u8>,
        identity: String,
    },
    ActivityTaskCanceled {
        scheduled_event_id: i64,
        started_event_id: i64,
        cancel_requested_event_id: i64,
        details: Vec<u8>,
        identity: String,
    },
    ChildWorkflowExecutionClosed {
        initiated_event_id: i64,
        started_event_id: i64,
        workflow_id: String,
        run_id: Uuid,
        workflow_type: String,
        close: ChildCloseKind,
    },
}

impl EventAttributes {
    pub fn event_type(&self) -> EventType {
        match self {
            EventAttributes::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            EventAttributes::WorkflowExecutionCompleted { .. } => {
                EventType::WorkflowExecutionCompleted
            }
            EventAttributes::WorkflowExecutionFailed { .. } => EventType::WorkflowExecutionFailed,
            EventAttributes::WorkflowExecutionCanceled { .. } => {
                EventType::WorkflowExecutionCanceled
            }
            EventAttributes::WorkflowExecutionTerminated { .. } => {
                EventType::WorkflowExecutionTerminated
            }
            EventAttributes::WorkflowExecutionTimedOut => EventType::WorkflowExecutionTimedOut,
            EventAttributes::WorkflowExecutionContinuedAsNew { .. } => {
                EventType::WorkflowExecutionContinuedAsNew
            }
            EventAttributes::WorkflowExecutionSignaled { .. } => {
                EventType::WorkflowExecutionSignaled
            }
            EventAttributes::WorkflowExecutionCancelRequested { .. } => {
                EventType::WorkflowExecutionCancelRequested
            }
            EventAttributes::DecisionTaskScheduled { .. } => EventType::DecisionTaskScheduled,
            EventAttributes::DecisionTaskStarted { .. } => EventType::DecisionTaskStarted,
            EventAttributes::DecisionTaskCompleted { .. } => EventType::DecisionTaskCompleted,
            EventAttributes::DecisionTaskFailed { .. } => EventType::DecisionTaskFailed,
            EventAttributes::ActivityTaskScheduled { .. } => EventType::ActivityTaskScheduled,
            EventAttributes::ActivityTaskStarted { .. } => EventType::ActivityTaskStarted,
            EventAttributes::ActivityTaskCompleted { .. } => EventType::ActivityTaskCompleted,
            EventAttributes::ActivityTaskFailed { .. } => EventType::ActivityTaskFailed,
            EventAttributes::ActivityTaskCanceled { .. } => EventType::ActivityTaskCanceled,
            EventAttributes::ChildWorkflowExecutionClosed { .. } => {
                EventType::ChildWorkflowExecutionClosed
            }
        }
    }
}
