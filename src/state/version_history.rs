use crate::core::error::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// One `(event_id, version)` segment: all events up to and including
/// `event_id` that are not covered by an earlier item were written under
/// `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistoryItem {
    pub event_id: i64,
    pub version: i64,
}

/// Ancestry of a single history branch across cluster failovers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistory {
    pub branch_token: Vec<u8>,
    pub items: Vec<VersionHistoryItem>,
}

impl VersionHistory {
    pub fn new(branch_token: Vec<u8>) -> Self {
        Self {
            branch_token,
            items: Vec::new(),
        }
    }

    /// Record that events through `event_id` were written under `version`.
    ///
    /// Extends the tail item when the version matches; versions must not
    /// regress and event ids must advance.
    pub fn add_or_update_item(&mut self, event_id: i64, version: i64) -> Result<()> {
        match self.items.last_mut() {
            None => {
                self.items.push(VersionHistoryItem { event_id, version });
                Ok(())
            }
            Some(last) if version == last.version => {
                if event_id < last.event_id {
                    return Err(EngineError::InternalService(format!(
                        "version history event id regressed: {} < {}",
                        event_id, last.event_id
                    )));
                }
                last.event_id = event_id;
                Ok(())
            }
            Some(last) if version > last.version => {
                self.items.push(VersionHistoryItem { event_id, version });
                Ok(())
            }
            Some(last) => Err(EngineError::InternalService(format!(
                "version history version regressed: {} < {}",
                version, last.version
            ))),
        }
    }

    /// Version the given event was written under.
    pub fn event_version(&self, event_id: i64) -> Result<i64> {
        for item in &self.items {
            if event_id <= item.event_id {
                return Ok(item.version);
            }
        }
        Err(EngineError::InternalService(format!(
            "event id {} not covered by version history",
            event_id
        )))
    }

    pub fn last_item(&self) -> Option<VersionHistoryItem> {
        self.items.last().copied()
    }
}

/// All known branches of a run's history tree, with one current branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHistories {
    pub current_index: usize,
    pub histories: Vec<VersionHistory>,
}

impl VersionHistories {
    pub fn new(current: VersionHistory) -> Self {
        Self {
            current_index: 0,
            histories: vec![current],
        }
    }

    pub fn current(&self) -> &VersionHistory {
        &self.histories[self.current_index]
    }

    pub fn current_mut(&mut self) -> &mut VersionHistory {
        &mut self.histories[self.current_index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_extend_and_split_by_version() {
        let mut history = VersionHistory::new(b"branch-0".to_vec());
        history.add_or_update_item(3, 0).unwrap();
        history.add_or_update_item(5, 0).unwrap();
        history.add_or_update_item(9, 10).unwrap();

        assert_eq!(history.items.len(), 2);
        assert_eq!(history.event_version(2).unwrap(), 0);
        assert_eq!(history.event_version(5).unwrap(), 0);
        assert_eq!(history.event_version(6).unwrap(), 10);
        assert!(history.event_version(10).is_err());
    }

    #[test]
    fn version_regression_is_rejected() {
        let mut history = VersionHistory::new(b"branch-0".to_vec());
        history.add_or_update_item(3, 10).unwrap();
        assert!(history.add_or_update_item(4, 5).is_err());
        assert!(history.add_or_update_item(2, 10).is_err());
    }
}
