//! Temenos: per-shard execution engine for workflow orchestration.
//!
//! `temenos` (τέμενος, Greek for a demarcated precinct) is the
//! request-handling core of one shard of a distributed workflow
//! orchestration service. For the slice of the workflow-id space it owns,
//! it mediates every mutation of workflow state: starting, signaling,
//! cancelling, terminating and resetting executions, dispatching decision
//! and activity tasks, long-polling on history progress, routing
//! consistent queries, and reconciling cross-cluster failover.
//!
//! # What it guarantees
//!
//! - **Per-execution serialization**: every mutation of a run happens
//!   under that run's ownership lease; commits linearize through the lock.
//! - **Optimistic concurrency**: commits are conditional; conflicts reload
//!   and retry inside the engine, never at the caller.
//! - **Start semantics**: workflow-id reuse policies, idempotency by
//!   request id, and terminate-and-start, all serialized through the
//!   current-run lock.
//! - **Consistent queries**: strong-consistency queries ride decision
//!   tasks when necessary and dispatch directly when safe.
//!
//! # What it delegates
//!
//! Durable storage ([`store`]), task queue processing, matching, and
//! cross-cluster replication ([`queues`]) sit behind traits; the in-memory
//! implementations back tests and single-process embeddings.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use temenos::prelude::*;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let engine = ShardEngine::new(EngineComponents { /* ... */ });
//! engine.start();
//!
//! let response = engine
//!     .start_workflow_execution(StartWorkflowRequest { /* ... */ })
//!     .await?;
//! println!("started run {}", response.run_id);
//! ```
//!
//! # Module Organization
//!
//! Each module hides one design decision:
//!
//! - [`core`]: identities, domain metadata, reuse policy, error taxonomy
//! - [`state`]: history events and the mutable-state projection
//! - [`store`]: persistence seams (hides the database choice)
//! - [`cache`]: per-execution ownership (hides the locking strategy)
//! - [`notify`]: history-event pub/sub for long-poll waiters
//! - [`queues`]: collaborator seams (processors, matching, replication)
//! - [`shard`]: the shard context an engine is bound to
//! - [`engine`]: the RPC surface itself

pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod notify;
pub mod queues;
pub mod shard;
pub mod state;
pub mod store;

pub use crate::config::EngineConfig;
pub use crate::core::{
    ClusterMetadata, CurrentRunKey, DomainCache, DomainEntry, DomainStatus, EngineError,
    ExecutionKey, IdReusePolicy, Result, TaskToken,
};
pub use crate::engine::{EngineComponents, ShardEngine};
pub use crate::shard::Shard;
pub use crate::state::{CloseStatus, MutableState, WorkflowState};
pub use crate::store::InMemoryStore;

/// Prelude for embedding the engine.
///
/// Pulls in the engine surface, the request/response types, and the
/// in-memory collaborators used in tests and single-process setups.
pub mod prelude {
    pub use crate::cache::ExecutionCache;
    pub use crate::config::EngineConfig;
    pub use crate::core::{
        ClusterMetadata, CurrentRunKey, DomainCache, DomainEntry, DomainStatus, EngineError,
        ExecutionKey, IdReusePolicy, TaskToken,
    };
    pub use crate::engine::*;
    pub use crate::notify::HistoryEventNotifier;
    pub use crate::queues::{
        InMemoryMatchingClient, InMemoryQueueProcessor, InMemoryReplicationQueue,
        InMemoryReplicationStore, InMemoryReplicator,
    };
    pub use crate::shard::Shard;
    pub use crate::state::{CloseStatus, QueryResult, WorkflowState};
    pub use crate::store::InMemoryStore;
}
