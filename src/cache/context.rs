//! Per-run workflow context: the persistence bindings for one execution.
//!
//! A context caches the run's mutable state together with the store
//! condition it was loaded under, and owns the commit paths. All methods
//! assume the caller holds the context's lock through the execution cache.
//!
//! The run's query registry lives on the context, not on the state
//! snapshot: a conflict-driven clear-and-reload replaces the snapshot but
//! must never replace the registry, or buffered query waiters would be
//! stranded on channels nothing can terminate.

use crate::core::domain::ClusterMetadata;
use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result};
use crate::notify::{EventNotification, HistoryEventNotifier};
use crate::queues::QueueProcessor;
use crate::state::{MutableState, QueryRegistry, Task, WorkflowSnapshot};
use crate::store::{CreateWorkflowMode, ExecutionStore, HistoryStore, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Shared components every context commits through.
pub struct ExecutionDeps {
    pub execution_store: Arc<dyn ExecutionStore>,
    pub history_store: Arc<dyn HistoryStore>,
    pub notifier: Arc<HistoryEventNotifier>,
    pub transfer_processor: Arc<dyn QueueProcessor>,
    pub timer_processor: Arc<dyn QueueProcessor>,
    pub cluster_metadata: Arc<ClusterMetadata>,
}

/// Handle to one run's persistent state.
pub struct WorkflowContext {
    key: ExecutionKey,
    deps: Arc<ExecutionDeps>,
    mutable_state: Option<MutableState>,
    condition: u64,
    query_registry: Arc<QueryRegistry>,
}

impl WorkflowContext {
    pub(crate) fn new(key: ExecutionKey, deps: Arc<ExecutionDeps>) -> Self {
        Self {
            key,
            deps,
            mutable_state: None,
            condition: 0,
            query_registry: Arc::new(QueryRegistry::new()),
        }
    }

    pub fn key(&self) -> &ExecutionKey {
        &self.key
    }

    /// The run's query registry. Survives [`clear`](Self::clear): parked
    /// queries outlive any one state snapshot.
    pub fn query_registry(&self) -> Arc<QueryRegistry> {
        Arc::clone(&self.query_registry)
    }

    pub fn has_buffered_queries(&self) -> bool {
        self.query_registry.has_buffered()
    }

    /// Drop the cached state so the next load hits the store. The query
    /// registry is untouched.
    pub fn clear(&mut self) {
        self.mutable_state = None;
        self.condition = 0;
    }

    pub fn cached_state(&self) -> Option<&MutableState> {
        self.mutable_state.as_ref()
    }

    /// Load (or reuse) the run's mutable state.
    pub async fn load_mutable_state(&mut self) -> Result<&mut MutableState> {
        if self.mutable_state.is_none() {
            let (state, condition) = self
                .deps
                .execution_store
                .get_workflow_execution(&self.key)
                .await
                .map_err(EngineError::from)?;
            self.mutable_state = Some(state);
            self.condition = condition;
        }
        Ok(self.mutable_state.as_mut().expect("just loaded"))
    }

    /// Force-reload from the store.
    pub async fn reload_mutable_state(&mut self) -> Result<&mut MutableState> {
        self.clear();
        self.load_mutable_state().await
    }

    /// The loaded state, without touching the store.
    pub fn mutable_state_mut(&mut self) -> Result<&mut MutableState> {
        self.mutable_state.as_mut().ok_or_else(|| {
            EngineError::InternalService("mutable state accessed before load".to_string())
        })
    }

    /// Install freshly built state (brand-new or forked run).
    pub fn install_state(&mut self, state: MutableState) {
        self.mutable_state = Some(state);
        self.condition = 0;
    }

    /// Append a new run's first event batch to its history branch.
    ///
    /// Runs once before [`create_workflow_execution`](Self::create_workflow_execution),
    /// which may then be attempted more than once (brand-new, then
    /// id-reuse) against the same persisted batch.
    pub async fn persist_first_events(&self, snapshot: &WorkflowSnapshot) -> Result<usize> {
        self.deps
            .history_store
            .append_events(&snapshot.state.current_branch_token(), &snapshot.events)
            .await
            .map_err(EngineError::from)
    }

    /// Create the execution row for a snapshot whose first events are
    /// already persisted. A create that loses leaves the batch behind as
    /// an unreferenced branch.
    pub async fn create_workflow_execution(
        &mut self,
        snapshot: &WorkflowSnapshot,
        mode: CreateWorkflowMode,
    ) -> std::result::Result<(), StoreError> {
        let condition = self
            .deps
            .execution_store
            .create_workflow_execution(snapshot, mode)
            .await?;
        self.mutable_state = Some(snapshot.state.clone());
        self.condition = condition;
        self.notify_committed(snapshot);
        Ok(())
    }

    /// Commit the loaded state's open transaction as the active cluster.
    ///
    /// Events are persisted before the conditional row commit; a batch
    /// stranded by a commit that then conflicts is superseded when the
    /// retried transaction re-appends at the same event ids. On
    /// [`EngineError::Conflict`] the cached state is cleared; the caller
    /// reloads and retries under its bounded loop.
    pub async fn update_workflow_execution_as_active(&mut self) -> Result<()> {
        let state = self.mutable_state.as_mut().ok_or_else(|| {
            EngineError::InternalService("update attempted before load".to_string())
        })?;
        let snapshot = state.close_transaction_as_snapshot();
        if let Err(e) = self
            .deps
            .history_store
            .append_events(&snapshot.state.current_branch_token(), &snapshot.events)
            .await
        {
            self.clear();
            return Err(e.into());
        }
        match self
            .deps
            .execution_store
            .update_workflow_execution(&snapshot, self.condition)
            .await
        {
            Ok(condition) => {
                self.condition = condition;
                self.notify_committed(&snapshot);
                Ok(())
            }
            Err(StoreError::Conflict) => {
                self.clear();
                Err(EngineError::Conflict)
            }
            Err(e) => {
                self.clear();
                Err(e.into())
            }
        }
    }

    /// Atomically close this run and create its successor (same workflow
    /// id). Used by terminate-and-start and by reset.
    ///
    /// Both event batches are persisted before the atomic row commit,
    /// matching the single-run update path; batches stranded by a
    /// conflicting commit are superseded on retry.
    pub async fn update_workflow_execution_with_new_as_active(
        &mut self,
        new_snapshot: &WorkflowSnapshot,
    ) -> Result<()> {
        let state = self.mutable_state.as_mut().ok_or_else(|| {
            EngineError::InternalService("update attempted before load".to_string())
        })?;
        let current_snapshot = state.close_transaction_as_snapshot();
        let appends = async {
            self.deps
                .history_store
                .append_events(
                    &current_snapshot.state.current_branch_token(),
                    &current_snapshot.events,
                )
                .await?;
            self.deps
                .history_store
                .append_events(&new_snapshot.state.current_branch_token(), &new_snapshot.events)
                .await
        };
        if let Err(e) = appends.await {
            self.clear();
            return Err(e.into());
        }
        match self
            .deps
            .execution_store
            .update_workflow_execution_with_new(&current_snapshot, self.condition, new_snapshot)
            .await
        {
            Ok((condition, _new_condition)) => {
                self.condition = condition;
                self.notify_committed(&current_snapshot);
                self.notify_committed(new_snapshot);
                Ok(())
            }
            Err(StoreError::Conflict) => {
                self.clear();
                Err(EngineError::Conflict)
            }
            Err(e) => {
                self.clear();
                Err(e.into())
            }
        }
    }

    /// Broadcast a committed snapshot and hand its tasks to the queue
    /// processors.
    fn notify_committed(&self, snapshot: &WorkflowSnapshot) {
        self.deps
            .notifier
            .notify(EventNotification::from_state(&snapshot.state));
        self.notify_tasks(&snapshot.transfer_tasks, &self.deps.transfer_processor, snapshot);
        self.notify_tasks(&snapshot.timer_tasks, &self.deps.timer_processor, snapshot);
    }

    fn notify_tasks(
        &self,
        tasks: &[Task],
        processor: &Arc<dyn QueueProcessor>,
        snapshot: &WorkflowSnapshot,
    ) {
        let first = match tasks.first() {
            Some(t) => t,
            None => return,
        };
        let cluster = match self
            .deps
            .cluster_metadata
            .cluster_name_for_failover_version(first.version())
        {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "dropping task notification with unmapped version");
                return;
            }
        };
        processor.notify_new_task(
            &cluster,
            Some(&snapshot.state.execution_info),
            tasks.to_vec(),
        );
    }
}
