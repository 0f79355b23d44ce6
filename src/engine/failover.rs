//! Domain failover callback.
//!
//! Tasks are created while holding the shard lock, and the failover cursor
//! update also takes the shard lock; locking task processing across the
//! domain-change window is what guarantees any task created before the
//! failover is visible at the computed cursor. The protocol is:
//!
//! 1. prepare: lock task processing on both queue processors.
//! 2. commit: compute the domains becoming active here, fail them over on
//!    both processors, and kick the cursors with a fake task at now.
//! 3. For domains gracefully failing away from this cluster, submit
//!    failover markers to the replication queue; on error return without
//!    advancing so the next refresh retries.
//! 4. Advance the shard's domain-notification version.
//! 5. Unlock task processing regardless of outcome.

use super::ShardEngine;
use crate::core::domain::{DomainChangeCallback, DomainEntry, INITIAL_PREVIOUS_FAILOVER_VERSION};
use crate::core::domain::ClusterMetadata;
use crate::queues::QueueProcessor;
use crate::shard::Shard;
use crate::state::{FailoverMarkerTask, Task};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

impl ShardEngine {
    /// Register the two-phase failover callback with the domain cache.
    ///
    /// Must run after the queue processors have started: the commit phase
    /// drives them.
    pub(crate) fn register_domain_failover_callback(&self) {
        let transfer = Arc::clone(&self.transfer_processor);
        let timer = Arc::clone(&self.timer_processor);
        let prepare_transfer = Arc::clone(&transfer);
        let prepare_timer = Arc::clone(&timer);
        let shard = Arc::clone(&self.shard);
        let cluster_metadata = Arc::clone(self.shard.cluster_metadata());
        let current_cluster = self.current_cluster_name.clone();

        self.domain_cache.register_domain_change_callback(
            self.shard.shard_id(),
            DomainChangeCallback {
                prepare: Box::new(move || {
                    prepare_transfer.lock_task_processing();
                    prepare_timer.lock_task_processing();
                }),
                commit: Box::new(move |_prev, next| {
                    commit_domain_changes(
                        &shard,
                        &cluster_metadata,
                        &current_cluster,
                        &transfer,
                        &timer,
                        next,
                    );
                    transfer.unlock_task_processing();
                    timer.unlock_task_processing();
                }),
            },
        );
    }
}

fn becoming_active(
    entry: &DomainEntry,
    shard_notification_version: i64,
    current_cluster: &str,
) -> bool {
    entry.is_global
        && entry.failover_notification_version >= shard_notification_version
        && entry.active_cluster_name == current_cluster
}

fn gracefully_leaving(
    entry: &DomainEntry,
    shard_notification_version: i64,
    cluster_metadata: &ClusterMetadata,
    current_cluster: &str,
) -> bool {
    entry.is_global
        && entry.failover_notification_version >= shard_notification_version
        && entry.active_cluster_name != current_cluster
        && entry.previous_failover_version != INITIAL_PREVIOUS_FAILOVER_VERSION
        && cluster_metadata
            .cluster_name_for_failover_version(entry.previous_failover_version)
            .map(|c| c == current_cluster)
            .unwrap_or(false)
}

fn commit_domain_changes(
    shard: &Arc<Shard>,
    cluster_metadata: &Arc<ClusterMetadata>,
    current_cluster: &str,
    transfer: &Arc<dyn QueueProcessor>,
    timer: &Arc<dyn QueueProcessor>,
    next: &[Arc<DomainEntry>],
) {
    if next.is_empty() {
        return;
    }
    let shard_notification_version = shard.domain_notification_version();

    let failover_domain_ids: HashSet<Uuid> = next
        .iter()
        .filter(|entry| becoming_active(entry, shard_notification_version, current_cluster))
        .map(|entry| entry.id)
        .collect();

    if !failover_domain_ids.is_empty() {
        info!(
            shard_id = shard.shard_id(),
            domains = failover_domain_ids.len(),
            "domain failover start"
        );
        transfer.failover_domain(&failover_domain_ids);
        timer.failover_domain(&failover_domain_ids);

        // The fake tasks are never processed; a non-empty slice with the
        // right timestamp is what forces a cursor scan.
        let now = Utc::now();
        transfer.notify_new_task(
            current_cluster,
            None,
            vec![Task::Fake { visibility_time: now }],
        );
        timer.notify_new_task(
            current_cluster,
            None,
            vec![Task::Fake { visibility_time: now }],
        );
    }

    // Graceful failover away from this cluster leaves a marker in the
    // replication stream so the new active cluster knows where we stopped.
    let failover_markers: Vec<FailoverMarkerTask> = next
        .iter()
        .filter(|entry| {
            gracefully_leaving(
                entry,
                shard_notification_version,
                cluster_metadata,
                current_cluster,
            )
        })
        .map(|entry| FailoverMarkerTask {
            domain_id: entry.id,
            failover_version: entry.failover_version,
        })
        .collect();
    if !failover_markers.is_empty() {
        if let Err(e) = shard.replicate_failover_markers(failover_markers) {
            error!(
                shard_id = shard.shard_id(),
                error = %e,
                "failed to insert failover markers, will retry on next domain refresh"
            );
            // Returning without advancing the notification version makes
            // the next refresh redo this window.
            return;
        }
    }

    let max_notification_version = next
        .iter()
        .map(|entry| entry.notification_version)
        .max()
        .unwrap_or(shard_notification_version);
    shard.update_domain_notification_version(max_notification_version + 1);
}
