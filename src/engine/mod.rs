//! The shard engine: the authoritative gatekeeper between client RPCs and
//! the durable execution/history stores for one shard.
//!
//! Each submodule carries one slice of the RPC surface:
//!
//! - [`update`]: the load-mutate-commit driver every write path uses
//! - [`start`]: start / signal-with-start / terminate-and-start
//! - [`signal`]: signal, cancel, terminate, child completion
//! - [`activity`]: activity task RPCs (token-validated)
//! - [`decision`]: decision task RPCs and decider commands
//! - [`poll`]: mutable-state reads, long-poll, describe
//! - [`query`]: consistent query dispatch (direct vs buffered)
//! - [`reset`]: reset-workflow and cross-cluster event reapply
//! - [`replication`]: replication ingress, DLQ surface, task refresh
//! - [`failover`]: the domain failover callback

mod activity;
mod decision;
mod failover;
mod poll;
mod query;
mod replication;
mod reset;
mod signal;
mod start;
mod types;
mod update;

pub use types::*;
pub use update::UpdateAction;

use crate::cache::{ExecutionCache, ExecutionDeps};
use crate::config::EngineConfig;
use crate::core::domain::{DomainCache, DomainEntry};
use crate::core::{EngineError, Result};
use crate::notify::HistoryEventNotifier;
use crate::queues::{
    ActivityReplicator, HistoryReplicator, MatchingClient, QueueAction, QueueActionResult,
    QueueProcessor, ReplicationAckManager, ReplicationDlqHandler,
};
use crate::shard::Shard;
use crate::state::Task;
use crate::store::{ExecutionStore, HistoryStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

/// Everything an engine is built from. The shard's engine back-reference
/// is wired by [`ShardEngine::new`]; nothing here may dereference it
/// during construction.
pub struct EngineComponents {
    pub shard: Arc<Shard>,
    pub config: EngineConfig,
    pub domain_cache: Arc<DomainCache>,
    pub execution_store: Arc<dyn ExecutionStore>,
    pub history_store: Arc<dyn HistoryStore>,
    pub notifier: Arc<HistoryEventNotifier>,
    pub transfer_processor: Arc<dyn QueueProcessor>,
    pub timer_processor: Arc<dyn QueueProcessor>,
    pub matching_client: Arc<dyn MatchingClient>,
    /// Matching client without caller-level retries, used for sticky
    /// query dispatch with its own deadline.
    pub raw_matching_client: Arc<dyn MatchingClient>,
    pub history_replicator: Arc<dyn HistoryReplicator>,
    pub activity_replicator: Arc<dyn ActivityReplicator>,
    pub replication_ack_manager: Arc<dyn ReplicationAckManager>,
    pub replication_dlq: Arc<dyn ReplicationDlqHandler>,
}

/// Per-shard execution engine.
pub struct ShardEngine {
    pub(crate) current_cluster_name: String,
    pub(crate) shard: Arc<Shard>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) domain_cache: Arc<DomainCache>,
    pub(crate) execution_cache: Arc<ExecutionCache>,
    pub(crate) execution_store: Arc<dyn ExecutionStore>,
    pub(crate) history_store: Arc<dyn HistoryStore>,
    pub(crate) notifier: Arc<HistoryEventNotifier>,
    pub(crate) transfer_processor: Arc<dyn QueueProcessor>,
    pub(crate) timer_processor: Arc<dyn QueueProcessor>,
    pub(crate) matching_client: Arc<dyn MatchingClient>,
    pub(crate) raw_matching_client: Arc<dyn MatchingClient>,
    pub(crate) history_replicator: Arc<dyn HistoryReplicator>,
    pub(crate) activity_replicator: Arc<dyn ActivityReplicator>,
    pub(crate) replication_ack_manager: Arc<dyn ReplicationAckManager>,
    pub(crate) replication_dlq: Arc<dyn ReplicationDlqHandler>,
}

impl ShardEngine {
    /// Build an engine bound to its shard. The shard's back-reference is
    /// assigned here, after the engine exists.
    pub fn new(components: EngineComponents) -> Arc<Self> {
        let EngineComponents {
            shard,
            config,
            domain_cache,
            execution_store,
            history_store,
            notifier,
            transfer_processor,
            timer_processor,
            matching_client,
            raw_matching_client,
            history_replicator,
            activity_replicator,
            replication_ack_manager,
            replication_dlq,
        } = components;

        let config = Arc::new(config);
        let execution_deps = Arc::new(ExecutionDeps {
            execution_store: Arc::clone(&execution_store),
            history_store: Arc::clone(&history_store),
            notifier: Arc::clone(&notifier),
            transfer_processor: Arc::clone(&transfer_processor),
            timer_processor: Arc::clone(&timer_processor),
            cluster_metadata: Arc::clone(shard.cluster_metadata()),
        });
        let execution_cache = Arc::new(ExecutionCache::new(
            Arc::clone(&execution_deps),
            config.execution_cache_max_size,
        ));

        let engine = Arc::new(Self {
            current_cluster_name: shard
                .cluster_metadata()
                .current_cluster_name()
                .to_string(),
            shard: Arc::clone(&shard),
            config,
            domain_cache,
            execution_cache,
            execution_store,
            history_store,
            notifier,
            transfer_processor,
            timer_processor,
            matching_client,
            raw_matching_client,
            history_replicator,
            activity_replicator,
            replication_ack_manager,
            replication_dlq,
        });
        shard.set_engine(&engine);
        engine
    }

    /// Spin up the components serving this shard.
    ///
    /// The failover callback is registered only after the queue processors
    /// are running: the callback's commit phase drives them, and they must
    /// be able to serve it.
    pub fn start(&self) {
        info!(shard_id = self.shard.shard_id(), "shard engine starting");
        self.notifier.start();
        self.transfer_processor.start();
        self.timer_processor.start();
        self.register_domain_failover_callback();
        info!(shard_id = self.shard.shard_id(), "shard engine started");
    }

    pub fn stop(&self) {
        info!(shard_id = self.shard.shard_id(), "shard engine stopping");
        self.transfer_processor.stop();
        self.timer_processor.stop();
        self.notifier.stop();
        self.domain_cache
            .unregister_domain_change_callback(self.shard.shard_id());
        info!(shard_id = self.shard.shard_id(), "shard engine stopped");
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    pub(crate) fn active_domain_entry(&self, domain_id: Uuid) -> Result<Arc<DomainEntry>> {
        self.domain_cache
            .get_active_domain_by_id(domain_id, &self.current_cluster_name)
    }

    /// `DomainNotActive` naming the cluster that owns `failover_version`.
    pub(crate) fn domain_not_active_error(
        &self,
        domain_name: &str,
        failover_version: i64,
    ) -> EngineError {
        let active_cluster = self
            .shard
            .cluster_metadata()
            .cluster_name_for_failover_version(failover_version)
            .unwrap_or_else(|_| "unknown".to_string());
        EngineError::DomainNotActive {
            domain: domain_name.to_string(),
            current_cluster: self.current_cluster_name.clone(),
            active_cluster,
        }
    }

    /// Sub-deadline for the current-run lock: the configured bound,
    /// tightened by whatever remains of the caller's deadline.
    pub(crate) fn lock_acquire_timeout(&self, deadline: Option<Instant>) -> Duration {
        let configured = self.config.lock_acquire_timeout;
        match deadline {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(configured),
            None => configured,
        }
    }

    // ------------------------------------------------------------------
    // Shard status & queue admin
    // ------------------------------------------------------------------

    /// Record a remote cluster's clock and kick both processors.
    ///
    /// The empty task slices are deliberate and must be honored: they are
    /// pure cursor kicks for the standby processors.
    pub fn sync_shard_status(&self, source_cluster: &str, timestamp: DateTime<Utc>) {
        self.shard.set_current_time(source_cluster, timestamp);
        self.transfer_processor
            .notify_new_task(source_cluster, None, Vec::new());
        self.timer_processor
            .notify_new_task(source_cluster, None, Vec::new());
    }

    pub fn reset_transfer_queue(&self, cluster: &str) -> Result<()> {
        self.transfer_processor
            .handle_action(cluster, QueueAction::Reset)
            .map(|_| ())
    }

    pub fn reset_timer_queue(&self, cluster: &str) -> Result<()> {
        self.timer_processor
            .handle_action(cluster, QueueAction::Reset)
            .map(|_| ())
    }

    pub fn describe_transfer_queue(&self, cluster: &str) -> Result<Vec<String>> {
        Self::describe_queue(&self.transfer_processor, cluster)
    }

    pub fn describe_timer_queue(&self, cluster: &str) -> Result<Vec<String>> {
        Self::describe_queue(&self.timer_processor, cluster)
    }

    fn describe_queue(processor: &Arc<dyn QueueProcessor>, cluster: &str) -> Result<Vec<String>> {
        match processor.handle_action(cluster, QueueAction::GetState)? {
            QueueActionResult::State(states) => Ok(states),
            QueueActionResult::Reset => Err(EngineError::InternalService(
                "unexpected queue action result".to_string(),
            )),
        }
    }

    /// Route freshly produced tasks to the processor owning their version's
    /// cluster. Used by processors that generate tasks outside a workflow
    /// transaction.
    pub fn notify_new_transfer_tasks(&self, tasks: Vec<Task>) {
        self.notify_tasks(&self.transfer_processor, tasks);
    }

    pub fn notify_new_timer_tasks(&self, tasks: Vec<Task>) {
        self.notify_tasks(&self.timer_processor, tasks);
    }

    fn notify_tasks(&self, processor: &Arc<dyn QueueProcessor>, tasks: Vec<Task>) {
        let first = match tasks.first() {
            Some(t) => t,
            None => return,
        };
        if let Ok(cluster) = self
            .shard
            .cluster_metadata()
            .cluster_name_for_failover_version(first.version())
        {
            processor.notify_new_task(&cluster, None, tasks);
        }
    }
}
