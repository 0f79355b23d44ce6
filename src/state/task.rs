use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A follow-up task produced by a committed transaction.
///
/// Transfer tasks go to the transfer queue processor, timer tasks to the
/// timer queue processor. The engine only creates and hands them off;
/// acknowledgment and the durable timer wheel belong to the processors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Task {
    /// Dispatch a decision task to matching.
    Decision {
        domain_id: Uuid,
        workflow_id: String,
        run_id: Uuid,
        task_list: String,
        schedule_id: i64,
        version: i64,
    },
    /// Dispatch an activity task to matching.
    Activity {
        domain_id: Uuid,
        workflow_id: String,
        run_id: Uuid,
        task_list: String,
        schedule_id: i64,
        version: i64,
    },
    /// Clean up after a closed run (visibility, archival, parent notify).
    CloseExecution {
        domain_id: Uuid,
        workflow_id: String,
        run_id: Uuid,
        version: i64,
    },
    /// Fires when a scheduled decision overruns start-to-close.
    DecisionTimeout {
        schedule_id: i64,
        version: i64,
        visibility_time: DateTime<Utc>,
    },
    /// Fires when a pending activity overruns one of its timeouts.
    ActivityTimeout {
        schedule_id: i64,
        version: i64,
        visibility_time: DateTime<Utc>,
    },
    /// Re-dispatches an activity after a retry backoff.
    ActivityRetryTimer {
        schedule_id: i64,
        attempt: i64,
        version: i64,
        visibility_time: DateTime<Utc>,
    },
    /// Fires when the whole run overruns its execution timeout.
    WorkflowTimeout {
        version: i64,
        visibility_time: DateTime<Utc>,
    },
    /// Synthetic task used only to force a processor cursor scan; never
    /// persisted.
    Fake { visibility_time: DateTime<Utc> },
}

impl Task {
    /// Failover version the task was created under; resolves which
    /// cluster's processor should pick it up.
    pub fn version(&self) -> i64 {
        match self {
            Task::Decision { version, .. }
            | Task::Activity { version, .. }
            | Task::CloseExecution { version, .. }
            | Task::DecisionTimeout { version, .. }
            | Task::ActivityTimeout { version, .. }
            | Task::ActivityRetryTimer { version, .. }
            | Task::WorkflowTimeout { version, .. } => *version,
            Task::Fake { .. } => crate::core::EMPTY_VERSION,
        }
    }
}

/// Replication task emitted when a domain gracefully fails away from this
/// cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverMarkerTask {
    pub domain_id: Uuid,
    pub failover_version: i64,
}
