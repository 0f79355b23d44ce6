//! Persistence seams of the engine.
//!
//! The engine never talks to a database directly; it drives these traits.
//! [`ExecutionStore`] owns the mutable-state rows and the current-run
//! pointer with optimistic concurrency; [`HistoryStore`] owns the
//! append-only event branches. The [`memory`] module provides the
//! dashmap-backed implementation used for embedding and tests.

use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::core::EngineError;
use crate::state::{CloseStatus, HistoryEvent, MutableState, WorkflowSnapshot, WorkflowState};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub mod memory;

pub use memory::InMemoryStore;

/// Storage layer error type.
///
/// `AlreadyStarted` and `Conflict` are not failures to the engine; they
/// carry the signal its retry and reuse-policy logic branches on.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// A create collided with an existing current run.
    #[error("workflow already started: run {run_id}")]
    AlreadyStarted {
        start_request_id: String,
        run_id: Uuid,
        state: WorkflowState,
        close_status: CloseStatus,
        last_write_version: i64,
    },

    /// The optimistic-concurrency condition did not match.
    #[error("conditional update failed")]
    Conflict,

    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The shard lease moved while the operation was in flight.
    #[error("shard ownership lost: {0}")]
    ShardOwnershipLost(String),

    /// Backend failure.
    #[error("store operation failed: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyStarted {
                start_request_id,
                run_id,
                ..
            } => EngineError::WorkflowAlreadyStarted {
                message: format!(
                    "Workflow execution already running. RunId: {}.",
                    run_id
                ),
                start_request_id,
                run_id,
            },
            StoreError::Conflict => EngineError::Conflict,
            StoreError::NotFound(msg) => EngineError::entity_not_exists(msg),
            StoreError::ShardOwnershipLost(msg) => EngineError::ShardOwnershipLost(msg),
            StoreError::Internal(msg) => EngineError::Store(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// How a create treats an existing current run for the same workflow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateWorkflowMode {
    /// Fail with `AlreadyStarted` if any current run exists.
    BrandNew,
    /// Replace the named closed run as current; conflicts if the pointer
    /// moved or the version regressed.
    WorkflowIdReuse {
        prev_run_id: Uuid,
        prev_last_write_version: i64,
    },
    /// Used by the atomic terminate-and-start commit: replace the named
    /// run as current even though it closes in the same transaction.
    WorkflowIdReuseTerminated { prev_run_id: Uuid },
}

/// The current-run pointer for one workflow id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentExecutionRecord {
    pub run_id: Uuid,
    pub create_request_id: String,
    pub state: WorkflowState,
    pub close_status: CloseStatus,
    pub last_write_version: i64,
}

/// Durable execution-state CRUD with optimistic concurrency.
///
/// Every successful write returns the row's new condition token; updates
/// must present the token from the load they mutated, and fail with
/// [`StoreError::Conflict`] when it moved.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_workflow_execution(
        &self,
        snapshot: &WorkflowSnapshot,
        mode: CreateWorkflowMode,
    ) -> Result<u64>;

    async fn update_workflow_execution(
        &self,
        snapshot: &WorkflowSnapshot,
        condition: u64,
    ) -> Result<u64>;

    /// Atomically commit the closing run and create its successor, moving
    /// the current-run pointer in the same transaction.
    async fn update_workflow_execution_with_new(
        &self,
        current: &WorkflowSnapshot,
        condition: u64,
        new: &WorkflowSnapshot,
    ) -> Result<(u64, u64)>;

    async fn get_workflow_execution(&self, key: &ExecutionKey) -> Result<(MutableState, u64)>;

    async fn get_current_execution(&self, key: &CurrentRunKey)
        -> Result<CurrentExecutionRecord>;
}

/// Append-only history branches keyed by branch token.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a batch; returns the batch's serialized size for accounting.
    async fn append_events(&self, branch_token: &[u8], events: &[HistoryEvent]) -> Result<usize>;

    /// Events with `min_event_id <= event_id < max_event_id`.
    async fn read_events(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>>;

    /// Copy events below `fork_event_id` from `base` into a new branch.
    async fn fork_branch(
        &self,
        base_branch: &[u8],
        fork_event_id: i64,
        new_branch: &[u8],
    ) -> Result<()>;
}
