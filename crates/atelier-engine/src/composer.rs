use atelier_contracts::config::{GenerationConfig, PersonaProfile};
use atelier_contracts::vocabulary::{VocabularyTables, VocabularyTier};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::assignment::{AssignedImage, ReferenceAssignment};
use crate::outfit::OutfitEnhancer;
use crate::variation::VariationSelection;
use crate::vocabulary::VocabularyTransformer;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub aspect_ratio: String,
    pub resolution_tier: String,
    pub guidance_strength: f64,
    pub seed: Option<i64>,
    pub provider_options: Map<String, Value>,
}

impl From<&GenerationConfig> for GenerationParameters {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            aspect_ratio: config.aspect_ratio.trim().to_string(),
            resolution_tier: config.resolution_tier.trim().to_ascii_lowercase(),
            guidance_strength: config.clamped_guidance(),
            seed: config.seed,
            provider_options: config.provider_options.clone(),
        }
    }
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

/// A single provider submission. Built fresh for every attempt that changes
/// the prompt and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedRequest {
    pub request_id: String,
    pub persona_id: String,
    pub prompt: String,
    pub vocabulary_tier: VocabularyTier,
    pub reference_images: Vec<AssignedImage>,
    pub parameters: GenerationParameters,
}

impl ComposedRequest {
    /// Loggable summary with image bytes left out.
    pub fn preview(&self) -> Value {
        json!({
            "request_id": self.request_id,
            "persona_id": self.persona_id,
            "prompt": self.prompt,
            "vocabulary_tier": self.vocabulary_tier.as_str(),
            "reference_images": self.reference_images.iter().map(|assigned| json!({
                "slot": assigned.slot,
                "role": assigned.role.as_str(),
                "label": assigned.image.label,
                "mime_type": assigned.image.mime_type,
                "bytes": assigned.image.len(),
            })).collect::<Vec<Value>>(),
            "parameters": {
                "aspect_ratio": self.parameters.aspect_ratio,
                "resolution_tier": self.parameters.resolution_tier,
                "guidance_strength": self.parameters.guidance_strength,
                "seed": self.parameters.seed,
                "provider_options": self.parameters.provider_options,
            },
        })
    }
}

/// Everything a prompt is composed from. The persona is required; there is
/// no fallback identity.
#[derive(Debug, Clone, Copy)]
pub struct CompositionInput<'a> {
    pub persona: &'a PersonaProfile,
    pub caller_text: &'a str,
    pub variation: &'a VariationSelection,
    pub references: &'a ReferenceAssignment,
    pub parameters: &'a GenerationParameters,
}

#[derive(Debug, Clone)]
pub struct RequestComposer {
    vocabulary: VocabularyTransformer,
    outfit: OutfitEnhancer,
}

impl RequestComposer {
    pub fn new(tables: &VocabularyTables) -> Self {
        Self {
            vocabulary: VocabularyTransformer::new(tables),
            outfit: OutfitEnhancer::new(&tables.outfit),
        }
    }

    pub fn builtin() -> Self {
        Self::new(&VocabularyTables::builtin())
    }

    pub fn vocabulary(&self) -> &VocabularyTransformer {
        &self.vocabulary
    }

    /// The assembled prompt before any safety or outfit rewriting.
    pub fn raw_prompt(&self, input: &CompositionInput<'_>) -> String {
        let expression = prefixed("with", &input.variation.expression_phrase);
        let accessory = prefixed("wearing", &input.variation.accessory_phrase);
        let parts = [
            input.persona.base_prompt.as_str(),
            input.caller_text,
            input.variation.pose_phrase.as_str(),
            expression.as_str(),
            accessory.as_str(),
            input.persona.style_suffix.as_str(),
        ];
        parts
            .iter()
            .map(|part| collapse_whitespace(part))
            .map(|part| part.trim_matches(|ch: char| ch == ',' || ch.is_whitespace()).to_string())
            .filter(|part| !part.is_empty())
            .collect::<Vec<String>>()
            .join(", ")
    }

    /// Safety pass at `tier`, then outfit enhancement with the safety output
    /// protected.
    pub fn compose(&self, input: &CompositionInput<'_>, tier: VocabularyTier) -> ComposedRequest {
        let raw = self.raw_prompt(input);
        let safe = self.vocabulary.transform_marked(&raw, tier);
        let enhanced = self.outfit.enhance_marked(&safe.text, &safe.produced);
        ComposedRequest {
            request_id: Uuid::new_v4().to_string(),
            persona_id: input.persona.id.clone(),
            prompt: enhanced.text,
            vocabulary_tier: tier,
            reference_images: input.references.images.clone(),
            parameters: input.parameters.clone(),
        }
    }
}

impl Default for RequestComposer {
    fn default() -> Self {
        Self::builtin()
    }
}

fn prefixed(prefix: &str, phrase: &str) -> String {
    if phrase.trim().is_empty() {
        String::new()
    } else {
        format!("{prefix} {}", phrase.trim())
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}
