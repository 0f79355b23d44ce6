//! Per-run registry of outstanding consistent queries.
//!
//! A buffered query parks its caller on a termination channel until a
//! decision-task response answers it, unblocks it for direct dispatch, or
//! fails it. The registry is runtime-only state and is never persisted.

use crate::core::error::{EngineError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Result produced by the decider for one query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Answered(Vec<u8>),
    Failed(String),
}

/// Terminal state of a buffered query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTermination {
    /// The decider responded; carries the answer or its failure message.
    Completed(QueryResult),
    /// It became safe to dispatch directly; the caller retries through
    /// matching.
    Unblocked,
    /// The registry gave up on the query.
    Failed(EngineError),
}

struct BufferedQuery {
    query_type: String,
    input: Vec<u8>,
    termination: Option<QueryTermination>,
    notify: Option<oneshot::Sender<()>>,
}

/// Registry of buffered queries for a single run.
///
/// Callers hold the returned receiver across lock release; terminations are
/// observed by re-reading the state after the channel fires.
pub struct QueryRegistry {
    queries: Mutex<HashMap<Uuid, BufferedQuery>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            queries: Mutex::new(HashMap::new()),
        }
    }

    /// Park a query. Returns its id and the termination channel.
    pub fn buffer_query(
        &self,
        query_type: impl Into<String>,
        input: Vec<u8>,
    ) -> (Uuid, oneshot::Receiver<()>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.queries.lock().expect("query registry poisoned").insert(
            id,
            BufferedQuery {
                query_type: query_type.into(),
                input,
                termination: None,
                notify: Some(tx),
            },
        );
        (id, rx)
    }

    /// Ids of queries still waiting on a termination.
    pub fn buffered_ids(&self) -> Vec<Uuid> {
        self.queries
            .lock()
            .expect("query registry poisoned")
            .iter()
            .filter(|(_, q)| q.termination.is_none())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffered_ids().is_empty()
    }

    /// The query payloads a decision task should carry to the decider.
    pub fn buffered_queries(&self) -> Vec<(Uuid, String, Vec<u8>)> {
        self.queries
            .lock()
            .expect("query registry poisoned")
            .iter()
            .filter(|(_, q)| q.termination.is_none())
            .map(|(id, q)| (*id, q.query_type.clone(), q.input.clone()))
            .collect()
    }

    pub fn complete_query(&self, id: Uuid, result: QueryResult) -> Result<()> {
        self.terminate(id, QueryTermination::Completed(result))
    }

    pub fn unblock_query(&self, id: Uuid) -> Result<()> {
        self.terminate(id, QueryTermination::Unblocked)
    }

    pub fn fail_query(&self, id: Uuid, error: EngineError) -> Result<()> {
        self.terminate(id, QueryTermination::Failed(error))
    }

    fn terminate(&self, id: Uuid, termination: QueryTermination) -> Result<()> {
        let mut queries = self.queries.lock().expect("query registry poisoned");
        let query = queries
            .get_mut(&id)
            .ok_or_else(|| EngineError::InternalService(format!("unknown query id {}", id)))?;
        if query.termination.is_some() {
            return Err(EngineError::QueryInvalidState);
        }
        query.termination = Some(termination);
        if let Some(tx) = query.notify.take() {
            // Receiver may have gone away with its caller; that is fine.
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Terminal state for a query whose channel has fired.
    pub fn termination_state(&self, id: Uuid) -> Result<QueryTermination> {
        let queries = self.queries.lock().expect("query registry poisoned");
        let query = queries
            .get(&id)
            .ok_or_else(|| EngineError::InternalService(format!("unknown query id {}", id)))?;
        query
            .termination
            .clone()
            .ok_or(EngineError::QueryInvalidState)
    }

    /// Forget a query once its caller has returned.
    pub fn remove_query(&self, id: Uuid) {
        self.queries
            .lock()
            .expect("query registry poisoned")
            .remove(&id);
    }
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_fires_termination_channel() {
        let registry = QueryRegistry::new();
        let (id, rx) = registry.buffer_query("status", b"{}".to_vec());
        assert_eq!(registry.buffered_ids(), vec![id]);

        registry
            .complete_query(id, QueryResult::Answered(b"ok".to_vec()))
            .unwrap();
        rx.await.unwrap();

        match registry.termination_state(id).unwrap() {
            QueryTermination::Completed(QueryResult::Answered(bytes)) => {
                assert_eq!(bytes, b"ok")
            }
            other => panic!("unexpected termination: {:?}", other),
        }
        assert!(registry.buffered_ids().is_empty());
    }

    #[tokio::test]
    async fn double_termination_is_invalid() {
        let registry = QueryRegistry::new();
        let (id, _rx) = registry.buffer_query("status", vec![]);
        registry.unblock_query(id).unwrap();
        let err = registry.unblock_query(id).unwrap_err();
        assert_eq!(err, EngineError::QueryInvalidState);
    }

    #[test]
    fn termination_before_signal_is_invalid_state() {
        let registry = QueryRegistry::new();
        let (id, _rx) = registry.buffer_query("status", vec![]);
        assert_eq!(
            registry.termination_state(id).unwrap_err(),
            EngineError::QueryInvalidState
        );
    }
}
