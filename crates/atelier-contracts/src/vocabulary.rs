use serde::{Deserialize, Serialize};

const DEFAULT_VOCABULARY_JSON: &str = include_str!("../resources/default_vocabulary.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VocabularyTier {
    #[default]
    Default,
    Fallback,
}

impl VocabularyTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubstitutionRule {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutfitRule {
    pub noun: String,
    pub replacement: String,
    /// Words that, directly before the noun, mark it as already intensified.
    #[serde(default)]
    pub qualifiers: Vec<String>,
}

/// Substitution tables, kept as data so they can be extended from config
/// without touching the matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VocabularyTables {
    pub default: Vec<SubstitutionRule>,
    pub fallback: Vec<SubstitutionRule>,
    pub outfit: Vec<OutfitRule>,
}

impl VocabularyTables {
    pub fn builtin() -> Self {
        serde_json::from_str(DEFAULT_VOCABULARY_JSON).unwrap_or_default()
    }

    pub fn rules(&self, tier: VocabularyTier) -> &[SubstitutionRule] {
        match tier {
            VocabularyTier::Default => &self.default,
            VocabularyTier::Fallback => &self.fallback,
        }
    }

    /// Layers `overrides` on top: a table the overrides leave empty keeps the
    /// built-in rules.
    pub fn merged(mut self, overrides: Option<&VocabularyTables>) -> Self {
        let Some(overrides) = overrides else {
            return self;
        };
        if !overrides.default.is_empty() {
            self.default = overrides.default.clone();
        }
        if !overrides.fallback.is_empty() {
            self.fallback = overrides.fallback.clone();
        }
        if !overrides.outfit.is_empty() {
            self.outfit = overrides.outfit.clone();
        }
        self
    }
}
