use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fully qualified identity of one run of a workflow.
///
/// `(domain_id, workflow_id)` names the workflow; `run_id` pins a single
/// incarnation. A workflow id may accumulate many runs over time but has at
/// most one *current* run (see [`CurrentRunKey`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub domain_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
}

impl ExecutionKey {
    pub fn new(domain_id: Uuid, workflow_id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            domain_id,
            workflow_id: workflow_id.into(),
            run_id,
        }
    }

    /// The current-run key for the same workflow.
    pub fn current(&self) -> CurrentRunKey {
        CurrentRunKey {
            domain_id: self.domain_id,
            workflow_id: self.workflow_id.clone(),
        }
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.domain_id, self.workflow_id, self.run_id
        )
    }
}

/// Names the *current* run of a workflow without pinning a run id.
///
/// Start serializes competing creates by locking this key rather than any
/// concrete run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrentRunKey {
    pub domain_id: Uuid,
    pub workflow_id: String,
}

impl CurrentRunKey {
    pub fn new(domain_id: Uuid, workflow_id: impl Into<String>) -> Self {
        Self {
            domain_id,
            workflow_id: workflow_id.into(),
        }
    }

    /// Pin this workflow to a concrete run.
    pub fn with_run(&self, run_id: Uuid) -> ExecutionKey {
        ExecutionKey {
            domain_id: self.domain_id,
            workflow_id: self.workflow_id.clone(),
            run_id,
        }
    }
}
