use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy for the shard engine.
///
/// Kinds map one-to-one onto caller-visible retry semantics: validation
/// failures are permanent, resource ceilings want backoff, and the two
/// internal sentinels (`Conflict`, `StaleState`) are consumed by the
/// mutation driver and must never escape an engine API.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EngineError {
    /// Request failed validation.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The target execution, activity, or child does not exist.
    ///
    /// On passive-cluster reads the error carries the active/current
    /// cluster names so the caller can redirect.
    #[error("entity not exists: {message}")]
    EntityNotExists {
        message: String,
        active_cluster: Option<String>,
        current_cluster: Option<String>,
    },

    /// A write was attempted on a cluster that is not active for the domain.
    #[error("domain {domain} is not active in cluster {current_cluster}, active cluster is {active_cluster}")]
    DomainNotActive {
        domain: String,
        current_cluster: String,
        active_cluster: String,
    },

    /// Domain status is not `registered`.
    #[error("domain is deprecated")]
    DomainDeprecated,

    /// A start collided with an existing run under a rejecting reuse policy.
    #[error("workflow execution already started: {message}")]
    WorkflowAlreadyStarted {
        message: String,
        start_request_id: String,
        run_id: Uuid,
    },

    /// The run's current branch changed under the caller (reset race).
    #[error("current branch token and request branch token don't match")]
    CurrentBranchChanged { current_branch_token: Vec<u8> },

    /// Cancellation was already requested with a different request id.
    #[error("cancellation already requested")]
    CancellationAlreadyRequested,

    /// Per-domain signal ceiling reached.
    #[error("signal count limit exceeded")]
    SignalsLimitExceeded,

    /// The run's consistent-query buffer is full.
    #[error("consistent query buffer is full")]
    QueryBufferExceeded,

    /// Strong-consistency queries are disabled globally or for the domain.
    #[error("consistent query is not enabled")]
    ConsistentQueryNotEnabled,

    /// The decider reported a query failure.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Query arrived before the first decision task completed.
    #[error("workflow has no decision task completed yet")]
    QueryBeforeFirstDecision,

    /// A buffered query terminated in a state the registry cannot explain.
    #[error("query entered invalid state, this should be impossible")]
    QueryInvalidState,

    /// The activity task referenced by the token is gone, already started
    /// elsewhere, or carries a mismatched attempt. Benign; the task is
    /// dropped.
    #[error("activity task not found")]
    ActivityTaskNotFound,

    /// The event (activity/decision start) was already recorded by another
    /// call.
    #[error("event already started: {0}")]
    EventAlreadyStarted(String),

    /// Parent execution named in a child-only request does not match.
    #[error("workflow parent does not match")]
    ParentMismatch,

    /// Task token bytes could not be deserialized.
    #[error("error deserializing task token")]
    DeserializingToken,

    /// Mutation attempted against a closed run. Consumed by the mutation
    /// driver's no-op path; surfaced only where the operation is
    /// meaningless on a closed run.
    #[error("workflow execution already completed")]
    AlreadyCompleted,

    /// Cached mutable state is older than the store. Internal only: the
    /// driver clears the cache and reloads.
    #[error("cache mutable state could potentially be stale")]
    StaleState,

    /// Optimistic-concurrency condition failed. Internal only: the driver
    /// reloads and retries.
    #[error("conditional update failed")]
    Conflict,

    /// Lost the current-run lock race within the sub-deadline.
    #[error("another workflow start request is in progress")]
    ConcurrentStartRequest,

    /// Bounded retry loop exhausted without a clean commit.
    #[error("maximum attempts exceeded to update history")]
    MaxAttemptsExceeded,

    /// The shard lease moved to another host.
    #[error("shard ownership lost: {0}")]
    ShardOwnershipLost(String),

    /// Transient overload.
    #[error("service busy: {0}")]
    ServiceBusy(String),

    /// Invariant violation or unclassified internal failure.
    #[error("internal service error: {0}")]
    InternalService(String),

    /// The caller's deadline elapsed mid-operation.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    /// True for the sentinels the mutation driver consumes internally.
    /// These must never be returned from a public engine method.
    pub fn is_internal_sentinel(&self) -> bool {
        matches!(self, EngineError::StaleState | EngineError::Conflict)
    }

    /// True when the caller may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::SignalsLimitExceeded
                | EngineError::QueryBufferExceeded
                | EngineError::QueryBeforeFirstDecision
                | EngineError::ConcurrentStartRequest
                | EngineError::ShardOwnershipLost(_)
                | EngineError::ServiceBusy(_)
                | EngineError::InternalService(_)
                | EngineError::Store(_)
        )
    }

    pub(crate) fn entity_not_exists(message: impl Into<String>) -> Self {
        EngineError::EntityNotExists {
            message: message.into(),
            active_cluster: None,
            current_cluster: None,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
