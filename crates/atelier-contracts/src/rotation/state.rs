use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogSet;

pub const ROTATION_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub pose_index: usize,
    pub expression_index: usize,
    pub accessory_index: usize,
    #[serde(default)]
    pub pose_overridden: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationState {
    #[serde(default = "default_schema_version")]
    pub schema_version: u64,
    #[serde(default)]
    pub last_pose_index: usize,
    #[serde(default)]
    pub last_expression_index: usize,
    #[serde(default)]
    pub last_accessory_index: usize,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            schema_version: ROTATION_SCHEMA_VERSION,
            last_pose_index: 0,
            last_expression_index: 0,
            last_accessory_index: 0,
            history: Vec::new(),
            updated_at: None,
        }
    }
}

impl RotationState {
    /// Appends `entry`, evicting the oldest entries beyond `limit`.
    pub fn push_history(&mut self, entry: HistoryEntry, limit: usize) {
        self.updated_at = Some(entry.timestamp);
        self.history.push(entry);
        let limit = limit.max(1);
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
        }
    }

    /// Accessory indices of the most recent `count` selections, newest first.
    pub fn recent_accessories(&self, count: usize) -> Vec<usize> {
        self.history
            .iter()
            .rev()
            .take(count)
            .map(|entry| entry.accessory_index)
            .collect()
    }

    /// Pulls cursors back into range after a catalog shrank. Returns whether
    /// anything moved.
    pub fn clamp_to(&mut self, catalogs: &CatalogSet) -> bool {
        let before = (
            self.last_pose_index,
            self.last_expression_index,
            self.last_accessory_index,
        );
        self.last_pose_index = catalogs.pose.clamp_index(self.last_pose_index);
        self.last_expression_index = catalogs.expression.clamp_index(self.last_expression_index);
        self.last_accessory_index = catalogs.accessory.clamp_index(self.last_accessory_index);
        before
            != (
                self.last_pose_index,
                self.last_expression_index,
                self.last_accessory_index,
            )
    }
}

fn default_schema_version() -> u64 {
    ROTATION_SCHEMA_VERSION
}

#[cfg(test)]
mod tests {
    use crate::catalog::{CatalogOverrides, CatalogSet};

    use super::*;

    fn entry(accessory_index: usize) -> HistoryEntry {
        HistoryEntry {
            pose_index: 0,
            expression_index: 0,
            accessory_index,
            pose_overridden: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn history_never_exceeds_limit() {
        let mut state = RotationState::default();
        for idx in 0..50 {
            state.push_history(entry(idx), 8);
            assert!(state.history.len() <= 8);
        }
        assert_eq!(state.history.len(), 8);
        assert_eq!(state.history.first().map(|row| row.accessory_index), Some(42));
        assert_eq!(state.recent_accessories(2), vec![49, 48]);
    }

    #[test]
    fn clamp_pulls_cursors_into_range() {
        let catalogs = CatalogSet::builtin().with_overrides(&CatalogOverrides {
            pose: vec!["a".to_string(), "b".to_string()],
            ..CatalogOverrides::default()
        });
        let mut state = RotationState {
            last_pose_index: 5,
            ..RotationState::default()
        };
        assert!(state.clamp_to(&catalogs));
        assert_eq!(state.last_pose_index, 1);
        assert!(!state.clamp_to(&catalogs));
    }

    #[test]
    fn decodes_minimal_record() -> anyhow::Result<()> {
        let state: RotationState = serde_json::from_str(r#"{"last_pose_index": 3}"#)?;
        assert_eq!(state.last_pose_index, 3);
        assert_eq!(state.schema_version, ROTATION_SCHEMA_VERSION);
        assert!(state.history.is_empty());
        Ok(())
    }
}
