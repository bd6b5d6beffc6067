use std::fmt;

use serde::{Deserialize, Serialize};

const DEFAULT_CATALOGS_JSON: &str = include_str!("../resources/default_catalogs.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariationKind {
    Pose,
    Expression,
    Accessory,
}

impl VariationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pose => "pose",
            Self::Expression => "expression",
            Self::Accessory => "accessory",
        }
    }
}

impl fmt::Display for VariationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, immutable list of prompt fragments for one variation kind.
///
/// Blank and duplicate fragments are dropped on construction, so advancing a
/// cursor by one position always lands on a different phrase when the catalog
/// holds more than one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariationCatalog {
    kind: VariationKind,
    entries: Vec<String>,
}

impl VariationCatalog {
    pub fn new<I, S>(kind: VariationKind, entries: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut deduped: Vec<String> = Vec::new();
        for entry in entries {
            let trimmed = entry.as_ref().trim();
            if trimmed.is_empty() || deduped.iter().any(|existing| existing == trimmed) {
                continue;
            }
            deduped.push(trimmed.to_string());
        }
        if deduped.is_empty() {
            return None;
        }
        Some(Self {
            kind,
            entries: deduped,
        })
    }

    pub fn kind(&self) -> VariationKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Cyclic successor of `index`.
    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.entries.len()
    }

    pub fn clamp_index(&self, index: usize) -> usize {
        if index < self.entries.len() {
            index
        } else {
            index % self.entries.len()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogOverrides {
    #[serde(default)]
    pub pose: Vec<String>,
    #[serde(default)]
    pub expression: Vec<String>,
    #[serde(default)]
    pub accessory: Vec<String>,
}

/// The three catalogs a persona rotates through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSet {
    pub pose: VariationCatalog,
    pub expression: VariationCatalog,
    pub accessory: VariationCatalog,
}

impl CatalogSet {
    pub fn builtin() -> Self {
        let raw: CatalogOverrides = serde_json::from_str(DEFAULT_CATALOGS_JSON).unwrap_or_default();
        Self {
            pose: builtin_or_fallback(VariationKind::Pose, &raw.pose, "standing naturally"),
            expression: builtin_or_fallback(
                VariationKind::Expression,
                &raw.expression,
                "a natural smile",
            ),
            accessory: builtin_or_fallback(
                VariationKind::Accessory,
                &raw.accessory,
                "simple stud earrings",
            ),
        }
    }

    /// Replaces every catalog the overrides provide; empty lists keep the
    /// current catalog.
    pub fn with_overrides(mut self, overrides: &CatalogOverrides) -> Self {
        if let Some(pose) = VariationCatalog::new(VariationKind::Pose, &overrides.pose) {
            self.pose = pose;
        }
        if let Some(expression) =
            VariationCatalog::new(VariationKind::Expression, &overrides.expression)
        {
            self.expression = expression;
        }
        if let Some(accessory) =
            VariationCatalog::new(VariationKind::Accessory, &overrides.accessory)
        {
            self.accessory = accessory;
        }
        self
    }

    pub fn get(&self, kind: VariationKind) -> &VariationCatalog {
        match kind {
            VariationKind::Pose => &self.pose,
            VariationKind::Expression => &self.expression,
            VariationKind::Accessory => &self.accessory,
        }
    }
}

impl Default for CatalogSet {
    fn default() -> Self {
        Self::builtin()
    }
}

fn builtin_or_fallback(kind: VariationKind, entries: &[String], fallback: &str) -> VariationCatalog {
    VariationCatalog::new(kind, entries).unwrap_or_else(|| VariationCatalog {
        kind,
        entries: vec![fallback.to_string()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalogs_are_populated() {
        let catalogs = CatalogSet::builtin();
        assert!(catalogs.pose.len() > 1);
        assert!(catalogs.expression.len() > 1);
        assert!(catalogs.accessory.len() > 1);
        assert!(catalogs.accessory.len() < catalogs.pose.len());
    }

    #[test]
    fn catalog_drops_blank_and_duplicate_entries() {
        let catalog =
            VariationCatalog::new(VariationKind::Pose, ["kneel", " ", "kneel ", "sit"]).unwrap();
        assert_eq!(catalog.entries(), &["kneel".to_string(), "sit".to_string()]);
        assert!(VariationCatalog::new(VariationKind::Pose, ["", "  "]).is_none());
    }

    #[test]
    fn next_index_wraps_and_single_entry_is_fixed() {
        let catalog = VariationCatalog::new(VariationKind::Expression, ["a", "b", "c"]).unwrap();
        assert_eq!(catalog.next_index(0), 1);
        assert_eq!(catalog.next_index(2), 0);
        assert_eq!(catalog.clamp_index(7), 1);

        let single = VariationCatalog::new(VariationKind::Accessory, ["watch"]).unwrap();
        assert_eq!(single.next_index(0), 0);
    }

    #[test]
    fn overrides_replace_only_non_empty_catalogs() {
        let overrides = CatalogOverrides {
            pose: vec!["sitting cross-legged".to_string()],
            ..CatalogOverrides::default()
        };
        let catalogs = CatalogSet::builtin().with_overrides(&overrides);
        assert_eq!(catalogs.pose.len(), 1);
        assert_eq!(catalogs.expression, CatalogSet::builtin().expression);
    }
}
