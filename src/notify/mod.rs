//! History-event pub/sub.
//!
//! Long-poll callers subscribe to a run's progress; every committed
//! transaction broadcasts a [`EventNotification`] snapshot. Subscriptions
//! are leased by subscriber id and must be released on caller exit.

use crate::core::identity::ExecutionKey;
use crate::core::{EngineError, Result};
use crate::state::{CloseStatus, MutableState, WorkflowState};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Snapshot of a run's progress broadcast on every commit.
#[derive(Debug, Clone, PartialEq)]
pub struct EventNotification {
    pub key: ExecutionKey,
    pub last_first_event_id: i64,
    pub next_event_id: i64,
    pub previous_started_event_id: i64,
    pub workflow_state: WorkflowState,
    pub close_status: CloseStatus,
    pub current_branch_token: Vec<u8>,
}

impl EventNotification {
    pub fn from_state(state: &MutableState) -> Self {
        let (workflow_state, close_status) = state.workflow_state_close_status();
        Self {
            key: ExecutionKey {
                domain_id: state.execution_info.domain_id,
                workflow_id: state.execution_info.workflow_id.clone(),
                run_id: state.execution_info.run_id,
            },
            last_first_event_id: state.last_first_event_id,
            next_event_id: state.next_event_id,
            previous_started_event_id: state.previous_started_event_id,
            workflow_state,
            close_status,
            current_branch_token: state.current_branch_token(),
        }
    }

    pub fn is_workflow_running(&self) -> bool {
        self.close_status == CloseStatus::None
    }
}

/// Leased subscription handle; pass it back to [`HistoryEventNotifier::unwatch`].
pub type SubscriberId = u64;

/// Fan-out of history-progress notifications keyed by execution.
///
/// Lifecycle is `start -> notify*/watch*/unwatch* -> stop`; notifications
/// before start or after stop are dropped.
pub struct HistoryEventNotifier {
    subscribers: DashMap<ExecutionKey, HashMap<SubscriberId, mpsc::UnboundedSender<EventNotification>>>,
    next_subscriber_id: AtomicU64,
    running: AtomicBool,
}

impl HistoryEventNotifier {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_subscriber_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.subscribers.clear();
    }

    /// Subscribe to one run's progress.
    pub fn watch(
        &self,
        key: &ExecutionKey,
    ) -> Result<(SubscriberId, mpsc::UnboundedReceiver<EventNotification>)> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(EngineError::InternalService(
                "history event notifier is not running".to_string(),
            ));
        }
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(key.clone())
            .or_default()
            .insert(subscriber_id, tx);
        Ok((subscriber_id, rx))
    }

    /// Release a lease taken by [`watch`](Self::watch).
    pub fn unwatch(&self, key: &ExecutionKey, subscriber_id: SubscriberId) {
        if let Some(mut entry) = self.subscribers.get_mut(key) {
            entry.remove(&subscriber_id);
            if entry.is_empty() {
                drop(entry);
                self.subscribers.remove_if(key, |_, subs| subs.is_empty());
            }
        }
    }

    /// Broadcast a commit to that run's watchers. Fire-and-forget.
    pub fn notify(&self, notification: EventNotification) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(entry) = self.subscribers.get(&notification.key) {
            debug!(
                key = %notification.key,
                next_event_id = notification.next_event_id,
                watchers = entry.len(),
                "notifying history event watchers"
            );
            for tx in entry.values() {
                // A watcher that went away takes its lease with it.
                let _ = tx.send(notification.clone());
            }
        }
    }
}

impl Default for HistoryEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}
