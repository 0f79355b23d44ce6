//! Run state: history events, the mutable-state projection, branch version
//! tracking, follow-up tasks, and the per-run query registry.
//!
//! Each submodule hides one decision:
//!
//! - [`event`]: the history event model and retry policy shape
//! - [`mutable_state`]: what a run remembers between events
//! - [`version_history`]: branch ancestry across cluster failovers
//! - [`query_registry`]: how consistent queries park and terminate
//! - [`task`]: the follow-up work a committed transaction produces

pub mod event;
pub mod mutable_state;
pub mod query_registry;
pub mod task;
pub mod version_history;

pub use event::{
    ChildCloseKind, EventAttributes, EventType, ExternalExecution, HistoryEvent,
    ParentExecutionInfo, RetryPolicy,
};
pub use mutable_state::{
    ActivityInfo, ChildExecutionInfo, CloseStatus, DecisionInfo, ExecutionInfo, MutableState,
    WorkflowSnapshot, WorkflowState,
};
pub use query_registry::{QueryRegistry, QueryResult, QueryTermination};
pub use task::{FailoverMarkerTask, Task};
pub use version_history::{VersionHistories, VersionHistory, VersionHistoryItem};
