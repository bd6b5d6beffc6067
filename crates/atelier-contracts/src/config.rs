use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::CatalogOverrides;
use crate::error::ConfigError;
use crate::references::{default_slot_order, Orientation, SlotRole};
use crate::vocabulary::VocabularyTables;

pub const RESOLUTION_TIERS: &[&str] = &["1k", "2k", "4k"];
pub const GUIDANCE_MIN: f64 = 0.0;
pub const GUIDANCE_MAX: f64 = 20.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AtelierConfig {
    pub provider: ProviderConfig,
    pub generation: GenerationConfig,
    pub retry: RetryConfig,
    pub rotation: RotationConfig,
    pub references: ReferenceConfig,
    pub vocabulary: Option<VocabularyTables>,
    pub personas: IndexMap<String, PersonaConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            name: "dryrun".to_string(),
            api_base: "http://127.0.0.1:8188/v1".to_string(),
            api_key: None,
            timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub aspect_ratio: String,
    pub resolution_tier: String,
    pub guidance_strength: f64,
    pub seed: Option<i64>,
    pub provider_options: Map<String, Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            aspect_ratio: "3:4".to_string(),
            resolution_tier: "2k".to_string(),
            guidance_strength: 3.5,
            seed: None,
            provider_options: Map::new(),
        }
    }
}

impl GenerationConfig {
    pub fn clamped_guidance(&self) -> f64 {
        if self.guidance_strength.is_finite() {
            self.guidance_strength.clamp(GUIDANCE_MIN, GUIDANCE_MAX)
        } else {
            GenerationConfig::default().guidance_strength
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_rate_limit_retries: u32,
    pub max_transport_retries: u32,
    pub max_server_retries: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_retries: 2,
            max_transport_retries: 2,
            max_server_retries: 2,
            backoff_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub state_dir: PathBuf,
    pub history_limit: usize,
    /// How many trailing accessory picks a new pick must differ from.
    pub accessory_repeat_window: usize,
    pub lock_timeout_ms: u64,
    pub stale_lock_ms: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".atelier/rotation"),
            history_limit: 32,
            accessory_repeat_window: 1,
            lock_timeout_ms: 5_000,
            stale_lock_ms: 30_000,
        }
    }
}

impl RotationConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_lock_after(&self) -> Duration {
        Duration::from_millis(self.stale_lock_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub slot_order: Vec<SlotRole>,
    pub multi_anchor: bool,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            slot_order: default_slot_order(),
            multi_anchor: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PersonaConfig {
    pub display_name: String,
    pub base_prompt: String,
    pub style_suffix: String,
    pub references: ReferencePaths,
    pub catalogs: CatalogOverrides,
}

/// Where the content directory keeps a persona's reference images. Only the
/// CLI resolves these; the pipeline consumes loaded images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ReferencePaths {
    pub pose_source: Option<PathBuf>,
    pub face_anchors: Vec<PathBuf>,
    pub body_anchors: Vec<BodyAnchorPath>,
    pub background: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyAnchorPath {
    pub path: PathBuf,
    #[serde(default)]
    pub orientation: Orientation,
    #[serde(default)]
    pub primary: bool,
}

/// Persona identity threaded through composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersonaProfile {
    pub id: String,
    pub display_name: String,
    pub base_prompt: String,
    pub style_suffix: String,
}

impl PersonaProfile {
    pub fn new(id: impl Into<String>, base_prompt: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            base_prompt: base_prompt.into(),
            style_suffix: String::new(),
        }
    }
}

impl AtelierConfig {
    /// Reads `path` when given (a missing file is an error), otherwise starts
    /// from defaults, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str::<Self>(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(dir) = non_empty_env("ATELIER_STATE_DIR") {
            self.rotation.state_dir = PathBuf::from(dir);
        }
        if let Some(base) = non_empty_env("ATELIER_API_BASE") {
            self.provider.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(key) = non_empty_env("ATELIER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(name) = non_empty_env("ATELIER_PROVIDER") {
            self.provider.name = name;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.references.slot_order.first() != Some(&SlotRole::PoseSource) {
            return Err(ConfigError::Invalid(
                "references.slot_order must start with pose_source".to_string(),
            ));
        }
        for role in &self.references.slot_order {
            if self
                .references
                .slot_order
                .iter()
                .filter(|other| *other == role)
                .count()
                > 1
            {
                return Err(ConfigError::Invalid(format!(
                    "references.slot_order lists {} more than once",
                    role.as_str()
                )));
            }
        }
        let tier = self.generation.resolution_tier.trim().to_ascii_lowercase();
        if !RESOLUTION_TIERS.contains(&tier.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "generation.resolution_tier '{}' is not one of {}",
                self.generation.resolution_tier,
                RESOLUTION_TIERS.join(", ")
            )));
        }
        if parse_aspect_ratio(&self.generation.aspect_ratio).is_none() {
            return Err(ConfigError::Invalid(format!(
                "generation.aspect_ratio '{}' is not W:H",
                self.generation.aspect_ratio
            )));
        }
        if self.rotation.history_limit == 0 {
            return Err(ConfigError::Invalid(
                "rotation.history_limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn persona(&self, id: &str) -> Option<PersonaProfile> {
        self.personas.get(id).map(|persona| PersonaProfile {
            id: id.to_string(),
            display_name: if persona.display_name.trim().is_empty() {
                id.to_string()
            } else {
                persona.display_name.clone()
            },
            base_prompt: persona.base_prompt.clone(),
            style_suffix: persona.style_suffix.clone(),
        })
    }
}

pub fn parse_aspect_ratio(raw: &str) -> Option<(u32, u32)> {
    let (w, h) = raw.trim().split_once(':')?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    Some((w, h))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
