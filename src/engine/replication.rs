//! Replication ingress and the DLQ surface.
//!
//! Applying remote history and activity state is delegated to the
//! replicators; this module is the routing layer plus the read side of the
//! shard's replication queue and the task-refresh admin path.

use super::ShardEngine;
use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result};
use crate::queues::{ReplicationMessages, ReplicationTask, ReplicationTaskInfo, SyncActivityRequest};
use chrono::Utc;
use tracing::{debug, error};
use uuid::Uuid;

impl ShardEngine {
    /// Apply a batch of events replicated from another cluster.
    pub async fn replicate_events(&self, task: ReplicationTask) -> Result<()> {
        self.history_replicator.apply_events(task).await
    }

    /// Apply remote activity state.
    pub async fn sync_activity(&self, request: SyncActivityRequest) -> Result<()> {
        self.activity_replicator.sync_activity(request).await
    }

    /// Replication tasks for a polling cluster, stamped with this shard's
    /// clock for sync-shard bookkeeping.
    pub async fn get_replication_messages(
        &self,
        polling_cluster: &str,
        last_read_id: i64,
    ) -> Result<ReplicationMessages> {
        let (tasks, last_retrieved_id) = self
            .replication_ack_manager
            .get_tasks(polling_cluster, last_read_id)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to retrieve replication messages");
                e
            })?;
        debug!(count = tasks.len(), polling_cluster, "fetched replication messages");
        Ok(ReplicationMessages {
            tasks,
            last_retrieved_id,
            sync_shard_timestamp: Utc::now(),
        })
    }

    /// Re-read specific replication tasks for DLQ hydration. Tasks that
    /// vanished are skipped, not errors.
    pub async fn get_dlq_replication_messages(
        &self,
        task_infos: &[ReplicationTaskInfo],
    ) -> Result<Vec<ReplicationTask>> {
        let mut tasks = Vec::with_capacity(task_infos.len());
        for info in task_infos {
            if let Some(task) = self.replication_ack_manager.get_task(info).await? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    pub async fn read_dlq_messages(
        &self,
        source_cluster: &str,
        last_message_id: i64,
        page_size: usize,
    ) -> Result<Vec<ReplicationTask>> {
        self.replication_dlq
            .read_messages(source_cluster, last_message_id, page_size)
            .await
    }

    pub async fn purge_dlq_messages(
        &self,
        source_cluster: &str,
        last_message_id: i64,
    ) -> Result<()> {
        self.replication_dlq
            .purge_messages(source_cluster, last_message_id)
            .await
    }

    pub async fn merge_dlq_messages(
        &self,
        source_cluster: &str,
        last_message_id: i64,
    ) -> Result<usize> {
        self.replication_dlq
            .merge_messages(source_cluster, last_message_id)
            .await
    }

    /// Regenerate a running execution's transfer and timer tasks and
    /// commit, for recovery after lost notifications.
    pub async fn refresh_workflow_tasks(
        &self,
        domain_id: Uuid,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<()> {
        self.active_domain_entry(domain_id)?;
        let key = ExecutionKey::new(domain_id, workflow_id.to_string(), run_id);
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let result = async {
            let ms = lease.load_mutable_state().await?;
            if !ms.is_workflow_execution_running() {
                return Ok(());
            }
            ms.refresh_tasks();
            lease.update_workflow_execution_as_active().await
        }
        .await;
        // A conflict means another commit landed mid-refresh; the caller
        // retries.
        let result = match result {
            Err(EngineError::Conflict) => Err(EngineError::ServiceBusy(
                "execution updated concurrently during task refresh".to_string(),
            )),
            other => other,
        };
        lease.release_with(&result);
        result
    }
}
