//! Shard context: the unit of ownership an engine is bound to.
//!
//! Carries the domain-notification cursor, per-cluster clock views, and
//! the failover-marker replication hook. The shard holds a back-reference
//! to its engine, set after construction; the engine must never be
//! dereferenced during its own construction.

use crate::core::domain::ClusterMetadata;
use crate::core::Result;
use crate::engine::ShardEngine;
use crate::queues::ReplicationQueue;
use crate::state::FailoverMarkerTask;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::info;

/// State owned by one shard lease.
///
/// The lease itself is assumed held; leader election is not this crate's
/// concern.
pub struct Shard {
    shard_id: i32,
    cluster_metadata: Arc<ClusterMetadata>,
    replication_queue: Arc<dyn ReplicationQueue>,
    /// Domains with notification versions below this are already accounted
    /// for by this shard's failover processing.
    domain_notification_version: Mutex<i64>,
    /// Last known remote-cluster clocks, fed by `SyncShardStatus`.
    cluster_times: DashMap<String, DateTime<Utc>>,
    engine: RwLock<Weak<ShardEngine>>,
}

impl Shard {
    pub fn new(
        shard_id: i32,
        cluster_metadata: Arc<ClusterMetadata>,
        replication_queue: Arc<dyn ReplicationQueue>,
        domain_notification_version: i64,
    ) -> Self {
        Self {
            shard_id,
            cluster_metadata,
            replication_queue,
            domain_notification_version: Mutex::new(domain_notification_version),
            cluster_times: DashMap::new(),
            engine: RwLock::new(Weak::new()),
        }
    }

    pub fn shard_id(&self) -> i32 {
        self.shard_id
    }

    pub fn cluster_metadata(&self) -> &Arc<ClusterMetadata> {
        &self.cluster_metadata
    }

    pub fn domain_notification_version(&self) -> i64 {
        *self
            .domain_notification_version
            .lock()
            .expect("shard lock poisoned")
    }

    /// Advance the notification cursor. Never regresses.
    pub fn update_domain_notification_version(&self, version: i64) {
        let mut current = self
            .domain_notification_version
            .lock()
            .expect("shard lock poisoned");
        if version > *current {
            info!(
                shard_id = self.shard_id,
                from = *current,
                to = version,
                "advancing domain notification version"
            );
            *current = version;
        }
    }

    /// This shard's view of `cluster`'s current time.
    pub fn current_time(&self, cluster: &str) -> Option<DateTime<Utc>> {
        self.cluster_times.get(cluster).map(|t| *t.value())
    }

    pub fn set_current_time(&self, cluster: &str, time: DateTime<Utc>) {
        self.cluster_times.insert(cluster.to_string(), time);
    }

    /// Submit failover markers to the shard's replication queue.
    pub fn replicate_failover_markers(&self, markers: Vec<FailoverMarkerTask>) -> Result<()> {
        self.replication_queue.publish_failover_markers(markers)
    }

    /// Bind the engine back-reference after construction.
    pub fn set_engine(&self, engine: &Arc<ShardEngine>) {
        *self.engine.write().expect("shard lock poisoned") = Arc::downgrade(engine);
    }

    pub fn engine(&self) -> Option<Arc<ShardEngine>> {
        self.engine.read().expect("shard lock poisoned").upgrade()
    }
}
