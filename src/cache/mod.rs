//! Execution cache: per-run ownership and context reuse.
//!
//! The cache maps an execution identity to a single [`WorkflowContext`]
//! guarded by an async lock. Holding the lease is what serializes all
//! mutations of a run; the load-mutate-commit cycle must happen entirely
//! under it. A separate *current-run* slot per workflow id serializes
//! competing starts.
//!
//! The cache must never be re-entered for the same key from the task that
//! already holds the lease: nested acquisition deadlocks.

mod context;

pub use context::{ExecutionDeps, WorkflowContext};

use crate::core::identity::{CurrentRunKey, ExecutionKey};
use crate::core::{EngineError, Result};
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    Run(ExecutionKey),
    Current(CurrentRunKey),
}

type Slot = Arc<tokio::sync::Mutex<WorkflowContext>>;

struct CacheInner {
    entries: HashMap<CacheKey, Slot>,
    order: VecDeque<CacheKey>,
}

/// LRU cache of workflow contexts with per-entry async ownership.
pub struct ExecutionCache {
    deps: Arc<ExecutionDeps>,
    inner: Mutex<CacheInner>,
    max_size: usize,
}

impl ExecutionCache {
    pub fn new(deps: Arc<ExecutionDeps>, max_size: usize) -> Self {
        Self {
            deps,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size: max_size.max(1),
        }
    }

    fn slot(&self, key: CacheKey, context_key: ExecutionKey) -> Slot {
        let mut inner = self.inner.lock().expect("execution cache poisoned");
        if let Some(slot) = inner.entries.get(&key) {
            let slot = Arc::clone(slot);
            // Refresh recency.
            inner.order.retain(|k| k != &key);
            inner.order.push_back(key);
            return slot;
        }

        let slot: Slot = Arc::new(tokio::sync::Mutex::new(WorkflowContext::new(
            context_key,
            Arc::clone(&self.deps),
        )));
        inner.entries.insert(key.clone(), Arc::clone(&slot));
        inner.order.push_back(key);

        // Evict cold, unheld entries once over capacity. Entries that are
        // locked, still referenced, or carrying buffered queries are
        // skipped and re-queued: evicting a context would discard the
        // registry its parked callers wait on.
        let mut scanned = 0;
        while inner.entries.len() > self.max_size && scanned < inner.order.len() {
            scanned += 1;
            let candidate = match inner.order.pop_front() {
                Some(k) => k,
                None => break,
            };
            let evictable = inner
                .entries
                .get(&candidate)
                .map(|s| {
                    Arc::strong_count(s) == 1
                        && s.try_lock()
                            .map(|ctx| !ctx.has_buffered_queries())
                            .unwrap_or(false)
                })
                .unwrap_or(false);
            if evictable {
                trace!(?candidate, "evicting execution cache entry");
                inner.entries.remove(&candidate);
            } else {
                inner.order.push_back(candidate);
            }
        }
        slot
    }

    /// A context outside the cache, for creating a run while the
    /// current-run slot is the lock being held.
    pub fn standalone_context(&self, key: ExecutionKey) -> WorkflowContext {
        WorkflowContext::new(key, Arc::clone(&self.deps))
    }

    /// Acquire exclusive ownership of a run.
    ///
    /// The returned lease must be released exactly once with the final
    /// error; dropping it without release invalidates the context.
    pub async fn get_or_create(&self, key: &ExecutionKey) -> Result<ExecutionLease> {
        let slot = self.slot(CacheKey::Run(key.clone()), key.clone());
        let guard = slot.lock_owned().await;
        Ok(ExecutionLease {
            guard,
            released: false,
        })
    }

    /// Acquire the current-run slot for a workflow id, bounded by
    /// `timeout`. Exceeding it means another start holds the slot.
    pub async fn get_or_create_current(
        &self,
        key: &CurrentRunKey,
        timeout: Duration,
    ) -> Result<ExecutionLease> {
        let slot = self.slot(
            CacheKey::Current(key.clone()),
            key.with_run(Uuid::nil()),
        );
        let guard = tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| EngineError::ConcurrentStartRequest)?;
        Ok(ExecutionLease {
            guard,
            released: false,
        })
    }
}

/// Exclusive ownership of one context.
///
/// Mirrors the release-function protocol: call [`release`](Self::release)
/// with the operation's final error so the cache can invalidate on
/// failure. A lease dropped without release (panic, cancellation) clears
/// the context conservatively.
pub struct ExecutionLease {
    guard: OwnedMutexGuard<WorkflowContext>,
    released: bool,
}

impl std::fmt::Debug for ExecutionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionLease")
            .field("released", &self.released)
            .finish()
    }
}

impl ExecutionLease {
    /// Release ownership. A non-nil error clears the cached state so the
    /// next holder reloads from the store.
    pub fn release(mut self, error: Option<&EngineError>) {
        if error.is_some() {
            self.guard.clear();
        }
        self.released = true;
    }

    /// Release, clearing on `Err` and keeping the cache warm on `Ok`.
    pub fn release_with<T>(self, result: &Result<T>) {
        self.release(result.as_ref().err());
    }
}

impl Drop for ExecutionLease {
    fn drop(&mut self) {
        if !self.released {
            self.guard.clear();
        }
    }
}

impl Deref for ExecutionLease {
    type Target = WorkflowContext;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ExecutionLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}
