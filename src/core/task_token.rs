use crate::core::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token handed to workers with each dispatched activity task.
///
/// Workers echo it back when reporting outcomes; the engine trusts it only
/// after re-validating against live mutable state. Serialized as a JSON
/// blob on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskToken {
    pub workflow_id: String,
    pub run_id: Uuid,
    /// Zero when the worker addresses the activity by id instead.
    #[serde(default)]
    pub schedule_id: i64,
    #[serde(default)]
    pub schedule_attempt: i64,
    #[serde(default)]
    pub activity_id: String,
    #[serde(default)]
    pub workflow_type: String,
    #[serde(default)]
    pub activity_type: String,
}

impl TaskToken {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| EngineError::InternalService(format!("failed to serialize task token: {}", e)))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|_| EngineError::DeserializingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let token = TaskToken {
            workflow_id: "wf".to_string(),
            run_id: Uuid::new_v4(),
            schedule_id: 5,
            schedule_attempt: 2,
            activity_id: "act-1".to_string(),
            workflow_type: "order".to_string(),
            activity_type: "charge".to_string(),
        };
        let bytes = token.serialize().unwrap();
        assert_eq!(TaskToken::deserialize(&bytes).unwrap(), token);
    }

    #[test]
    fn garbage_bytes_fail_with_token_error() {
        let err = TaskToken::deserialize(b"not json").unwrap_err();
        assert_eq!(err, EngineError::DeserializingToken);
    }
}
