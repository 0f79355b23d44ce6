//! Domain metadata and the process-wide domain cache.
//!
//! A domain is the tenancy unit of the orchestration service. The cache
//! holds the metadata the engine consults on every request (status, active
//! cluster, failover versions) and fans domain-change notifications out to
//! registered two-phase callbacks.

use crate::core::error::{EngineError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Sentinel for a domain that has never gracefully failed over.
pub const INITIAL_PREVIOUS_FAILOVER_VERSION: i64 = -1;

/// Registration status of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainStatus {
    Registered,
    Deprecated,
}

/// Cached metadata for one domain.
///
/// Invariant: for a global domain, `(failover_version -> cluster)` is total
/// and agreed with [`ClusterMetadata::cluster_name_for_failover_version`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEntry {
    pub id: Uuid,
    pub name: String,
    pub status: DomainStatus,
    /// Global domains replicate across clusters; local domains are always
    /// active wherever they live.
    pub is_global: bool,
    pub active_cluster_name: String,
    pub clusters: Vec<String>,
    pub failover_version: i64,
    pub failover_notification_version: i64,
    pub previous_failover_version: i64,
    /// Monotonic version assigned by the metadata store on every change.
    pub notification_version: i64,
}

impl DomainEntry {
    /// Whether writes for this domain are served by `cluster`.
    pub fn is_active_in(&self, cluster: &str) -> bool {
        !self.is_global || self.active_cluster_name == cluster
    }
}

/// Maps failover versions back to cluster names.
///
/// Each cluster owns a residue class modulo `failover_version_increment`;
/// a domain's failover version advances by whole increments so the mapping
/// stays total.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    current_cluster_name: String,
    failover_version_increment: i64,
    initial_versions: HashMap<String, i64>,
}

impl ClusterMetadata {
    pub fn new(
        current_cluster_name: impl Into<String>,
        failover_version_increment: i64,
        initial_versions: HashMap<String, i64>,
    ) -> Self {
        Self {
            current_cluster_name: current_cluster_name.into(),
            failover_version_increment,
            initial_versions,
        }
    }

    /// Single-cluster metadata, for local-only deployments and tests.
    pub fn single(cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        let mut initial_versions = HashMap::new();
        initial_versions.insert(cluster.clone(), 0);
        Self::new(cluster, 10, initial_versions)
    }

    pub fn current_cluster_name(&self) -> &str {
        &self.current_cluster_name
    }

    pub fn cluster_name_for_failover_version(&self, version: i64) -> Result<String> {
        if version < 0 {
            return Ok(self.current_cluster_name.clone());
        }
        let residue = version % self.failover_version_increment;
        self.initial_versions
            .iter()
            .find(|(_, initial)| **initial == residue)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| {
                EngineError::InternalService(format!(
                    "could not resolve failover version {} to a cluster",
                    version
                ))
            })
    }
}

/// Two-phase domain-change callback.
///
/// `prepare` runs before the new entries become visible (the engine uses it
/// to quiesce task processing); `commit` runs with the previous and next
/// entries once they are.
pub struct DomainChangeCallback {
    pub prepare: Box<dyn Fn() + Send + Sync>,
    pub commit: Box<dyn Fn(&[Arc<DomainEntry>], &[Arc<DomainEntry>]) + Send + Sync>,
}

/// Process-wide registry of domain metadata.
///
/// Refreshes replace entries wholesale and drive registered callbacks in
/// notification-version order.
pub struct DomainCache {
    entries: DashMap<Uuid, Arc<DomainEntry>>,
    names: DashMap<String, Uuid>,
    callbacks: Mutex<HashMap<i32, DomainChangeCallback>>,
}

impl DomainCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            names: DashMap::new(),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_domain_by_id(&self, domain_id: Uuid) -> Result<Arc<DomainEntry>> {
        self.entries
            .get(&domain_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::entity_not_exists(format!("domain {} not found", domain_id)))
    }

    pub fn get_domain_by_name(&self, name: &str) -> Result<Arc<DomainEntry>> {
        let id = self
            .names
            .get(name)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::entity_not_exists(format!("domain {} not found", name)))?;
        self.get_domain_by_id(id)
    }

    pub fn get_domain_name(&self, domain_id: Uuid) -> Result<String> {
        Ok(self.get_domain_by_id(domain_id)?.name.clone())
    }

    /// Resolve the entry and reject if this cluster is not active for it.
    pub fn get_active_domain_by_id(
        &self,
        domain_id: Uuid,
        current_cluster: &str,
    ) -> Result<Arc<DomainEntry>> {
        let entry = self.get_domain_by_id(domain_id)?;
        if !entry.is_active_in(current_cluster) {
            return Err(EngineError::DomainNotActive {
                domain: entry.name.clone(),
                current_cluster: current_cluster.to_string(),
                active_cluster: entry.active_cluster_name.clone(),
            });
        }
        Ok(entry)
    }

    /// Register a two-phase callback keyed by shard id.
    ///
    /// Re-registering for the same shard replaces the previous callback.
    pub fn register_domain_change_callback(&self, shard_id: i32, callback: DomainChangeCallback) {
        self.callbacks
            .lock()
            .expect("domain callback lock poisoned")
            .insert(shard_id, callback);
    }

    pub fn unregister_domain_change_callback(&self, shard_id: i32) {
        self.callbacks
            .lock()
            .expect("domain callback lock poisoned")
            .remove(&shard_id);
    }

    /// Install a batch of refreshed entries and notify callbacks.
    ///
    /// Entries are applied in notification-version order; each callback sees
    /// `prepare` strictly before the new entries are visible through the
    /// getters, then `commit(prev, next)`.
    pub fn refresh_domains(&self, mut domains: Vec<DomainEntry>) {
        if domains.is_empty() {
            return;
        }
        domains.sort_by_key(|d| d.notification_version);

        let callbacks = self
            .callbacks
            .lock()
            .expect("domain callback lock poisoned");
        for cb in callbacks.values() {
            (cb.prepare)();
        }

        let mut prev_entries = Vec::new();
        let mut next_entries = Vec::new();
        for domain in domains {
            let next = Arc::new(domain);
            if let Some(prev) = self.entries.insert(next.id, Arc::clone(&next)) {
                prev_entries.push(prev);
            }
            self.names.insert(next.name.clone(), next.id);
            debug!(
                domain = %next.name,
                notification_version = next.notification_version,
                "domain cache entry refreshed"
            );
            next_entries.push(next);
        }

        for cb in callbacks.values() {
            (cb.commit)(&prev_entries, &next_entries);
        }
    }
}

impl Default for DomainCache {
    fn default() -> Self {
        Self::new()
    }
}
