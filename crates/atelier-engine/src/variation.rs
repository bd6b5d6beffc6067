use std::sync::Arc;

use atelier_contracts::catalog::{CatalogSet, VariationCatalog};
use atelier_contracts::config::RotationConfig;
use atelier_contracts::error::{ErrorKind, StoreError};
use atelier_contracts::rotation::{HistoryEntry, RotationState, RotationStore};
use chrono::Utc;
use indexmap::IndexMap;

use crate::narrative::{detect_narrative_pose, NarrativePoseOverride};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariationSelection {
    pub pose_phrase: String,
    pub expression_phrase: String,
    pub accessory_phrase: String,
    pub pose_index: usize,
    pub expression_index: usize,
    pub accessory_index: usize,
    pub narrative: NarrativePoseOverride,
}

impl VariationSelection {
    pub fn pose_overridden(&self) -> bool {
        self.narrative.matched
    }
}

/// Picks the next pose/expression/accessory combination for a persona,
/// advancing its rotation record under the store's persona lock.
#[derive(Debug)]
pub struct VariationSelector {
    store: Arc<RotationStore>,
    default_catalogs: CatalogSet,
    persona_catalogs: IndexMap<String, CatalogSet>,
    history_limit: usize,
    accessory_repeat_window: usize,
}

impl VariationSelector {
    pub fn new(store: Arc<RotationStore>, config: &RotationConfig) -> Self {
        Self {
            store,
            default_catalogs: CatalogSet::builtin(),
            persona_catalogs: IndexMap::new(),
            history_limit: config.history_limit.max(1),
            accessory_repeat_window: config.accessory_repeat_window,
        }
    }

    pub fn with_default_catalogs(mut self, catalogs: CatalogSet) -> Self {
        self.default_catalogs = catalogs;
        self
    }

    pub fn with_persona_catalogs(mut self, persona_id: impl Into<String>, catalogs: CatalogSet) -> Self {
        self.persona_catalogs.insert(persona_id.into(), catalogs);
        self
    }

    pub fn store(&self) -> &RotationStore {
        &self.store
    }

    pub fn catalogs_for(&self, persona_id: &str) -> &CatalogSet {
        self.persona_catalogs
            .get(persona_id)
            .unwrap_or(&self.default_catalogs)
    }

    /// The lock is released before this returns, so callers can go on to
    /// network calls without holding it. Only a lock timeout is an error; a
    /// store that cannot be read or written still yields a selection.
    pub fn select(
        &self,
        persona_id: &str,
        caller_text: &str,
    ) -> Result<VariationSelection, StoreError> {
        let catalogs = self.catalogs_for(persona_id);
        let narrative = detect_narrative_pose(caller_text);

        let mut lease = match self.store.lock(persona_id) {
            Ok(lease) => Some(lease),
            Err(err) if err.is_retryable() => return Err(err),
            Err(err) => {
                log::warn!(
                    "{}: rotation lock for '{persona_id}' unavailable: {err}; selecting without persisting",
                    ErrorKind::StateStoreCorrupt
                );
                None
            }
        };
        let mut unpersisted = RotationState::default();
        let state = match lease.as_mut() {
            Some(lease) => lease.state_mut(),
            None => {
                unpersisted = self.store.load(persona_id);
                &mut unpersisted
            }
        };
        if state.clamp_to(catalogs) {
            log::warn!("rotation cursors for '{persona_id}' were out of range; clamped to catalogs");
        }

        let pose_index = if narrative.matched {
            state.last_pose_index
        } else {
            next_distinct(&catalogs.pose, state.last_pose_index, &[state.last_pose_index])
        };
        let expression_index = next_distinct(
            &catalogs.expression,
            state.last_expression_index,
            &[state.last_expression_index],
        );
        let accessory_index = next_accessory(
            &catalogs.accessory,
            state,
            self.accessory_repeat_window,
        );

        state.last_pose_index = pose_index;
        state.last_expression_index = expression_index;
        state.last_accessory_index = accessory_index;
        state.push_history(
            HistoryEntry {
                pose_index,
                expression_index,
                accessory_index,
                pose_overridden: narrative.matched,
                timestamp: Utc::now(),
            },
            self.history_limit,
        );
        if let Some(lease) = lease {
            if let Err(err) = lease.commit() {
                log::warn!(
                    "{}: rotation state for '{persona_id}' not saved: {err}",
                    ErrorKind::StateStoreCorrupt
                );
            }
        }

        let pose_phrase = match narrative.framing() {
            Some(framing) => framing,
            None => phrase(&catalogs.pose, pose_index),
        };
        log::debug!(
            "selected variation for '{persona_id}': pose={pose_index} expression={expression_index} accessory={accessory_index} override={}",
            narrative.matched
        );
        Ok(VariationSelection {
            pose_phrase,
            expression_phrase: phrase(&catalogs.expression, expression_index),
            accessory_phrase: phrase(&catalogs.accessory, accessory_index),
            pose_index,
            expression_index,
            accessory_index,
            narrative,
        })
    }
}

/// Walks forward from `last` to the first index not in `avoid`. A
/// single-entry catalog always yields index 0.
fn next_distinct(catalog: &VariationCatalog, last: usize, avoid: &[usize]) -> usize {
    if catalog.len() <= 1 {
        return 0;
    }
    let mut candidate = catalog.next_index(last);
    for _ in 0..catalog.len() {
        if !avoid.contains(&candidate) {
            return candidate;
        }
        candidate = catalog.next_index(candidate);
    }
    catalog.next_index(last)
}

/// Accessory picks only have to differ from the trailing `window` picks in
/// history, which may be looser than the cursor-based rule for pose and
/// expression.
fn next_accessory(catalog: &VariationCatalog, state: &RotationState, window: usize) -> usize {
    let window = window.clamp(1, catalog.len().saturating_sub(1).max(1));
    let mut recent = state.recent_accessories(window);
    if recent.is_empty() {
        recent.push(state.last_accessory_index);
    }
    next_distinct(catalog, state.last_accessory_index, &recent)
}

fn phrase(catalog: &VariationCatalog, index: usize) -> String {
    catalog.get(index).unwrap_or_default().to_string()
}
