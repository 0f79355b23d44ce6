//! In-memory store using DashMap for concurrent access.
//!
//! Implements both [`ExecutionStore`] and [`HistoryStore`] so a single
//! instance can back an engine in tests and single-process embeddings.
//! Rows are plain clones of mutable state; the condition token is a
//! per-row counter bumped on every write.

use super::{
    CreateWorkflowMode, CurrentExecutionRecord, ExecutionStore, HistoryStore, Result, StoreError,
};
use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::state::{HistoryEvent, MutableState, WorkflowSnapshot, WorkflowState};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

struct ExecutionRow {
    state: MutableState,
    condition: u64,
}

/// DashMap-backed execution + history store.
pub struct InMemoryStore {
    executions: DashMap<ExecutionKey, ExecutionRow>,
    currents: DashMap<CurrentRunKey, CurrentExecutionRecord>,
    branches: DashMap<Vec<u8>, Vec<HistoryEvent>>,
    next_condition: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
            currents: DashMap::new(),
            branches: DashMap::new(),
            next_condition: AtomicU64::new(1),
        }
    }

    fn bump(&self) -> u64 {
        self.next_condition.fetch_add(1, Ordering::SeqCst)
    }

    fn current_record(state: &MutableState) -> CurrentExecutionRecord {
        let (wf_state, close_status) = state.workflow_state_close_status();
        CurrentExecutionRecord {
            run_id: state.execution_info.run_id,
            create_request_id: state.execution_info.create_request_id.clone(),
            state: wf_state,
            close_status,
            last_write_version: state.last_write_version,
        }
    }

    fn key_of(state: &MutableState) -> ExecutionKey {
        ExecutionKey {
            domain_id: state.execution_info.domain_id,
            workflow_id: state.execution_info.workflow_id.clone(),
            run_id: state.execution_info.run_id,
        }
    }

    fn store_row(&self, snapshot: &WorkflowSnapshot) -> u64 {
        let key = Self::key_of(&snapshot.state);
        let condition = self.bump();
        self.executions.insert(
            key,
            ExecutionRow {
                state: snapshot.state.clone(),
                condition,
            },
        );
        condition
    }

    /// Refresh the current pointer iff it points at this run.
    fn sync_current(&self, state: &MutableState) {
        let current_key = CurrentRunKey {
            domain_id: state.execution_info.domain_id,
            workflow_id: state.execution_info.workflow_id.clone(),
        };
        if let Some(mut entry) = self.currents.get_mut(&current_key) {
            if entry.run_id == state.execution_info.run_id {
                *entry.value_mut() = Self::current_record(state);
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryStore {
    async fn create_workflow_execution(
        &self,
        snapshot: &WorkflowSnapshot,
        mode: CreateWorkflowMode,
    ) -> Result<u64> {
        let state = &snapshot.state;
        let current_key = CurrentRunKey {
            domain_id: state.execution_info.domain_id,
            workflow_id: state.execution_info.workflow_id.clone(),
        };

        // The dashmap entry keeps competing creates for one workflow id
        // serialized on the shard of this key.
        match self.currents.entry(current_key) {
            Entry::Vacant(vacant) => match &mode {
                CreateWorkflowMode::BrandNew => {
                    vacant.insert(Self::current_record(state));
                }
                CreateWorkflowMode::WorkflowIdReuse { .. }
                | CreateWorkflowMode::WorkflowIdReuseTerminated { .. } => {
                    return Err(StoreError::Conflict);
                }
            },
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                match &mode {
                    CreateWorkflowMode::BrandNew => {
                        return Err(StoreError::AlreadyStarted {
                            start_request_id: existing.create_request_id.clone(),
                            run_id: existing.run_id,
                            state: existing.state,
                            close_status: existing.close_status,
                            last_write_version: existing.last_write_version,
                        });
                    }
                    CreateWorkflowMode::WorkflowIdReuse {
                        prev_run_id,
                        prev_last_write_version,
                    } => {
                        if existing.run_id != *prev_run_id
                            || existing.last_write_version != *prev_last_write_version
                        {
                            return Err(StoreError::Conflict);
                        }
                        if matches!(
                            existing.state,
                            WorkflowState::Created | WorkflowState::Running
                        ) {
                            return Err(StoreError::AlreadyStarted {
                                start_request_id: existing.create_request_id.clone(),
                                run_id: existing.run_id,
                                state: existing.state,
                                close_status: existing.close_status,
                                last_write_version: existing.last_write_version,
                            });
                        }
                    }
                    CreateWorkflowMode::WorkflowIdReuseTerminated { prev_run_id } => {
                        if existing.run_id != *prev_run_id {
                            return Err(StoreError::Conflict);
                        }
                    }
                }
                *occupied.get_mut() = Self::current_record(state);
            }
        }

        debug!(
            workflow_id = %state.execution_info.workflow_id,
            run_id = %state.execution_info.run_id,
            ?mode,
            "created workflow execution"
        );
        Ok(self.store_row(snapshot))
    }

    async fn update_workflow_execution(
        &self,
        snapshot: &WorkflowSnapshot,
        condition: u64,
    ) -> Result<u64> {
        let key = Self::key_of(&snapshot.state);
        let mut row = self
            .executions
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("execution {} not found", key)))?;
        if row.condition != condition {
            return Err(StoreError::Conflict);
        }
        let new_condition = self.bump();
        row.state = snapshot.state.clone();
        row.condition = new_condition;
        drop(row);

        self.sync_current(&snapshot.state);
        Ok(new_condition)
    }

    async fn update_workflow_execution_with_new(
        &self,
        current: &WorkflowSnapshot,
        condition: u64,
        new: &WorkflowSnapshot,
    ) -> Result<(u64, u64)> {
        let key = Self::key_of(&current.state);
        {
            let row = self
                .executions
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(format!("execution {} not found", key)))?;
            if row.condition != condition {
                return Err(StoreError::Conflict);
            }
        }

        let current_condition = {
            let mut row = self.executions.get_mut(&key).expect("checked above");
            let c = self.bump();
            row.state = current.state.clone();
            row.condition = c;
            c
        };

        let new_condition = self
            .create_workflow_execution(
                new,
                CreateWorkflowMode::WorkflowIdReuseTerminated {
                    prev_run_id: current.state.execution_info.run_id,
                },
            )
            .await?;
        Ok((current_condition, new_condition))
    }

    async fn get_workflow_execution(&self, key: &ExecutionKey) -> Result<(MutableState, u64)> {
        self.executions
            .get(key)
            .map(|row| (row.state.clone(), row.condition))
            .ok_or_else(|| StoreError::NotFound(format!("execution {} not found", key)))
    }

    async fn get_current_execution(
        &self,
        key: &CurrentRunKey,
    ) -> Result<CurrentExecutionRecord> {
        self.currents
            .get(key)
            .map(|r| r.value().clone())
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "current execution for workflow {} not found",
                    key.workflow_id
                ))
            })
    }
}

#[async_trait]
impl HistoryStore for InMemoryStore {
    async fn append_events(&self, branch_token: &[u8], events: &[HistoryEvent]) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }
        let mut branch = self.branches.entry(branch_token.to_vec()).or_default();
        if let (Some(last), Some(first)) = (branch.last(), events.first()) {
            if first.event_id > last.event_id + 1 {
                return Err(StoreError::Internal(format!(
                    "event batch not contiguous: branch ends at {}, batch starts at {}",
                    last.event_id, first.event_id
                )));
            }
            // Appends for a run are serialized by its execution lock, so
            // an overlapping batch is a retried transaction superseding
            // the one a failed row commit stranded.
            if first.event_id <= last.event_id {
                let first_event_id = first.event_id;
                branch.retain(|e| e.event_id < first_event_id);
            }
        }
        branch.extend_from_slice(events);
        let size = serde_json::to_vec(events)
            .map(|b| b.len())
            .unwrap_or_default();
        Ok(size)
    }

    async fn read_events(
        &self,
        branch_token: &[u8],
        min_event_id: i64,
        max_event_id: i64,
    ) -> Result<Vec<HistoryEvent>> {
        let branch = self
            .branches
            .get(branch_token)
            .ok_or_else(|| StoreError::NotFound("history branch not found".to_string()))?;
        Ok(branch
            .iter()
            .filter(|e| e.event_id >= min_event_id && e.event_id < max_event_id)
            .cloned()
            .collect())
    }

    async fn fork_branch(
        &self,
        base_branch: &[u8],
        fork_event_id: i64,
        new_branch: &[u8],
    ) -> Result<()> {
        let events = self.read_events(base_branch, 0, fork_event_id).await?;
        self.branches.insert(new_branch.to_vec(), events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn snapshot(domain_id: Uuid, workflow_id: &str, request_id: &str) -> WorkflowSnapshot {
        let mut ms = MutableState::new(domain_id, workflow_id, Uuid::new_v4(), 0);
        ms.add_workflow_execution_started_event(
            "t",
            "tl",
            vec![],
            Duration::from_secs(60),
            Duration::from_secs(10),
            request_id,
            "tester",
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();
        ms.close_transaction_as_snapshot()
    }

    #[tokio::test]
    async fn brand_new_create_conflicts_with_existing_current() {
        let store = InMemoryStore::new();
        let domain_id = Uuid::new_v4();
        let first = snapshot(domain_id, "wf", "req-1");
        store
            .create_workflow_execution(&first, CreateWorkflowMode::BrandNew)
            .await
            .unwrap();

        let second = snapshot(domain_id, "wf", "req-2");
        let err = store
            .create_workflow_execution(&second, CreateWorkflowMode::BrandNew)
            .await
            .unwrap_err();
        match err {
            StoreError::AlreadyStarted {
                start_request_id,
                run_id,
                ..
            } => {
                assert_eq!(start_request_id, "req-1");
                assert_eq!(run_id, first.state.execution_info.run_id);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn conditional_update_detects_conflicts() {
        let store = InMemoryStore::new();
        let domain_id = Uuid::new_v4();
        let snap = snapshot(domain_id, "wf", "req-1");
        let key = InMemoryStore::key_of(&snap.state);
        let condition = store
            .create_workflow_execution(&snap, CreateWorkflowMode::BrandNew)
            .await
            .unwrap();

        let (mut loaded, cond) = store.get_workflow_execution(&key).await.unwrap();
        assert_eq!(cond, condition);
        loaded
            .add_workflow_execution_signaled("s", vec![], "t")
            .unwrap();
        let update = loaded.close_transaction_as_snapshot();
        let next = store
            .update_workflow_execution(&update, cond)
            .await
            .unwrap();

        // Stale condition now fails.
        let err = store
            .update_workflow_execution(&update, cond)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        assert_ne!(next, cond);
    }

    #[tokio::test]
    async fn history_appends_reject_gaps_and_supersede_overlaps() {
        let store = InMemoryStore::new();
        let snap = snapshot(Uuid::new_v4(), "wf", "req-1");
        let branch = snap.state.current_branch_token();
        store.append_events(&branch, &snap.events).await.unwrap();

        // A retried batch at the same ids replaces the stranded one.
        store.append_events(&branch, &snap.events).await.unwrap();
        let events = store.read_events(&branch, 0, i64::MAX).await.unwrap();
        assert_eq!(events.len(), snap.events.len());

        // A gap is still a corruption signal.
        let mut gapped = snap.events.clone();
        for event in &mut gapped {
            event.event_id += 10;
        }
        let err = store.append_events(&branch, &gapped).await.unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
    }
}
