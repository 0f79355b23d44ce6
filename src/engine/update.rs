//! Mutation driver: the bounded load-mutate-commit loop behind every
//! write path.
//!
//! The caller-supplied action mutates loaded state and reports what should
//! follow the commit. `Conflict` and `StaleState` never escape this
//! module: conflicts reload and retry, stale state clears the cache first.
//! The final retry does not reload, so the terminal error surfaces.

use super::ShardEngine;
use crate::cache::ExecutionLease;
use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::core::{EngineError, Result};
use crate::state::MutableState;
use tracing::{info, warn};
use uuid::Uuid;

/// What the mutation wants after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateAction {
    /// Commit nothing; the action observed an acceptable terminal state.
    pub noop: bool,
    /// Schedule a decision task (if none pending) before committing.
    pub create_decision: bool,
}

impl UpdateAction {
    pub fn noop() -> Self {
        Self {
            noop: true,
            create_decision: false,
        }
    }

    pub fn with_new_decision() -> Self {
        Self {
            noop: false,
            create_decision: true,
        }
    }

    pub fn without_decision() -> Self {
        Self::default()
    }
}

impl ShardEngine {
    /// Run `action` against the run's mutable state and commit, optionally
    /// scheduling a decision task afterwards.
    pub(crate) async fn update_with_action<F>(
        &self,
        key: ExecutionKey,
        create_decision: bool,
        mut action: F,
    ) -> Result<()>
    where
        F: FnMut(&mut MutableState) -> Result<()> + Send,
    {
        self.update_with_action_fn(key, move |ms| {
            action(ms)?;
            Ok(UpdateAction {
                noop: false,
                create_decision,
            })
        })
        .await
    }

    /// As [`update_with_action`](Self::update_with_action), with the action
    /// deciding the post-commit behavior itself.
    pub(crate) async fn update_with_action_fn<F>(&self, key: ExecutionKey, mut action: F) -> Result<()>
    where
        F: FnMut(&mut MutableState) -> Result<UpdateAction> + Send,
    {
        let mut lease = self.execution_cache.get_or_create(&key).await?;
        let result = self.update_locked(&mut lease, &mut action).await;
        lease.release_with(&result);
        result
    }

    /// Resolve the current run of the workflow, then update it. For
    /// operations whose semantic target is "whatever run is current".
    pub(crate) async fn update_current_with_action_fn<F>(
        &self,
        domain_id: Uuid,
        workflow_id: &str,
        mut action: F,
    ) -> Result<()>
    where
        F: FnMut(&mut MutableState) -> Result<UpdateAction> + Send,
    {
        let current_key = CurrentRunKey::new(domain_id, workflow_id);
        let current = self
            .execution_store
            .get_current_execution(&current_key)
            .await
            .map_err(EngineError::from)?;
        self.update_with_action_fn(current_key.with_run(current.run_id), &mut action)
            .await
    }

    async fn update_locked<F>(&self, lease: &mut ExecutionLease, action: &mut F) -> Result<()>
    where
        F: FnMut(&mut MutableState) -> Result<UpdateAction> + Send,
    {
        let retry_count = self.config.conditional_retry_count;
        for attempt in 0..retry_count {
            let ms = lease.load_mutable_state().await?;
            let update_action = match action(&mut *ms) {
                Ok(a) => a,
                Err(EngineError::StaleState) => {
                    warn!(
                        key = %lease.key(),
                        attempt,
                        "stale mutable state detected, clearing cache"
                    );
                    lease.clear();
                    // The last attempt falls out of the loop without a
                    // reload so the terminal error is visible.
                    continue;
                }
                Err(e) => return Err(e),
            };

            if update_action.noop {
                return Ok(());
            }
            if update_action.create_decision && !ms.has_pending_decision() {
                ms.add_decision_task_scheduled_event()?;
            }

            match lease.update_workflow_execution_as_active().await {
                Ok(()) => return Ok(()),
                Err(EngineError::Conflict) => {
                    info!(
                        key = %lease.key(),
                        attempt,
                        "conditional update conflict, reloading"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::MaxAttemptsExceeded)
    }
}
