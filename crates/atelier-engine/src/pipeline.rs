use std::sync::Arc;

use atelier_contracts::catalog::CatalogSet;
use atelier_contracts::config::{AtelierConfig, PersonaProfile};
use atelier_contracts::error::{ErrorKind, ReferenceSetError, StoreError};
use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::references::ReferenceSet;
use atelier_contracts::rotation::RotationStore;
use atelier_contracts::vocabulary::{VocabularyTables, VocabularyTier};
use serde_json::Value;
use thiserror::Error;

use crate::assignment::{ReferenceAssigner, ReferenceAssignment};
use crate::client::{BackoffSleeper, CancelToken, GenerationClient, GenerationOutcome};
use crate::composer::{ComposedRequest, CompositionInput, GenerationParameters, RequestComposer};
use crate::providers::GenerationProvider;
use crate::variation::{VariationSelection, VariationSelector};

/// One unit of caller work. The persona is mandatory.
#[derive(Debug, Clone, Copy)]
pub struct ContentRequest<'a> {
    pub persona: &'a PersonaProfile,
    pub caller_text: &'a str,
    pub references: &'a ReferenceSet,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("malformed reference set: {0}")]
    MalformedReferenceSet(#[from] ReferenceSetError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// `None` for lock contention, which is not a fault in the request itself.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::MalformedReferenceSet(err) => Some(err.kind()),
            Self::Store(StoreError::LockTimeout { .. }) => None,
            Self::Store(_) => Some(ErrorKind::StateStoreCorrupt),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedReferenceSet(_) => false,
            Self::Store(err) => err.is_retryable(),
        }
    }
}

/// Selection and assignment for a request, ready to compose.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub variation: VariationSelection,
    pub references: ReferenceAssignment,
}

#[derive(Debug)]
pub enum BatchItemResult {
    Completed(GenerationOutcome),
    Failed(PipelineError),
    Skipped,
}

#[derive(Debug)]
pub struct BatchItemReport {
    pub index: usize,
    pub persona_id: String,
    pub result: BatchItemResult,
}

impl BatchItemReport {
    pub fn succeeded(&self) -> bool {
        matches!(&self.result, BatchItemResult::Completed(outcome) if outcome.is_success())
    }
}

pub struct Pipeline {
    selector: VariationSelector,
    assigner: ReferenceAssigner,
    composer: RequestComposer,
    client: GenerationClient,
    parameters: GenerationParameters,
    events: EventWriter,
}

impl Pipeline {
    pub fn new(
        selector: VariationSelector,
        assigner: ReferenceAssigner,
        composer: RequestComposer,
        client: GenerationClient,
        parameters: GenerationParameters,
    ) -> Self {
        Self {
            selector,
            assigner,
            composer,
            client,
            parameters,
            events: EventWriter::detached(),
        }
    }

    pub fn from_config(config: &AtelierConfig, provider: Arc<dyn GenerationProvider>) -> Self {
        let store = Arc::new(RotationStore::from_config(&config.rotation));
        let mut selector = VariationSelector::new(store, &config.rotation);
        for (persona_id, persona) in &config.personas {
            let overrides = &persona.catalogs;
            if overrides.pose.is_empty()
                && overrides.expression.is_empty()
                && overrides.accessory.is_empty()
            {
                continue;
            }
            selector = selector
                .with_persona_catalogs(persona_id.clone(), CatalogSet::builtin().with_overrides(overrides));
        }
        let tables = VocabularyTables::builtin().merged(config.vocabulary.as_ref());
        Self::new(
            selector,
            ReferenceAssigner::new(&config.references),
            RequestComposer::new(&tables),
            GenerationClient::new(provider, config.retry.clone()),
            GenerationParameters::from(&config.generation),
        )
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.client = self.client.with_events(events.clone());
        self.events = events;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn BackoffSleeper>) -> Self {
        self.client = self.client.with_sleeper(sleeper);
        self
    }

    pub fn selector(&self) -> &VariationSelector {
        &self.selector
    }

    pub fn parameters(&self) -> &GenerationParameters {
        &self.parameters
    }

    /// References are validated before the rotation record is touched. The
    /// persona lock is released again before this returns.
    pub fn prepare(&self, request: &ContentRequest<'_>) -> Result<PreparedRequest, PipelineError> {
        request.references.validate()?;
        let variation = self.selector.select(&request.persona.id, request.caller_text)?;
        self.record_selection(&request.persona.id, &variation);
        let references = self.assigner.assign(request.references, request.caller_text)?;
        Ok(PreparedRequest {
            variation,
            references,
        })
    }

    /// Composes the default-tier request without sending it. This still
    /// advances the persona's rotation.
    pub fn preview(&self, request: &ContentRequest<'_>) -> Result<ComposedRequest, PipelineError> {
        let prepared = self.prepare(request)?;
        let input = self.input(request, &prepared);
        Ok(self.composer.compose(&input, VocabularyTier::Default))
    }

    pub fn run(
        &self,
        request: &ContentRequest<'_>,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome, PipelineError> {
        let prepared = self.prepare(request)?;
        let input = self.input(request, &prepared);
        Ok(self.client.execute(&self.composer, &input, cancel))
    }

    /// Runs every item in order. A failing item is recorded and the batch
    /// moves on; once cancelled the remaining items are skipped.
    pub fn run_batch(
        &self,
        requests: &[ContentRequest<'_>],
        cancel: &CancelToken,
    ) -> Vec<BatchItemReport> {
        let mut reports = Vec::with_capacity(requests.len());
        for (index, request) in requests.iter().enumerate() {
            let persona_id = request.persona.id.clone();
            if cancel.is_cancelled() {
                reports.push(BatchItemReport {
                    index,
                    persona_id,
                    result: BatchItemResult::Skipped,
                });
                continue;
            }
            let result = match self.run(request, cancel) {
                Ok(outcome) => {
                    if !outcome.is_success() {
                        self.record_batch_failure(
                            index,
                            &persona_id,
                            outcome.last_error_kind.map(ErrorKind::as_str),
                            outcome.last_error_message.as_deref().unwrap_or_default(),
                        );
                    }
                    BatchItemResult::Completed(outcome)
                }
                Err(err) => {
                    log::warn!("batch item {index} for '{persona_id}' failed: {err}");
                    self.record_batch_failure(
                        index,
                        &persona_id,
                        err.kind().map(ErrorKind::as_str),
                        &err.to_string(),
                    );
                    BatchItemResult::Failed(err)
                }
            };
            reports.push(BatchItemReport {
                index,
                persona_id,
                result,
            });
        }
        reports
    }

    fn input<'a>(
        &'a self,
        request: &ContentRequest<'a>,
        prepared: &'a PreparedRequest,
    ) -> CompositionInput<'a> {
        CompositionInput {
            persona: request.persona,
            caller_text: request.caller_text,
            variation: &prepared.variation,
            references: &prepared.references,
            parameters: &self.parameters,
        }
    }

    fn record_selection(&self, persona_id: &str, variation: &VariationSelection) {
        let mut payload = EventPayload::new();
        payload.insert("persona_id".to_string(), Value::from(persona_id));
        payload.insert("pose_index".to_string(), Value::from(variation.pose_index));
        payload.insert(
            "expression_index".to_string(),
            Value::from(variation.expression_index),
        );
        payload.insert(
            "accessory_index".to_string(),
            Value::from(variation.accessory_index),
        );
        payload.insert(
            "pose_overridden".to_string(),
            Value::from(variation.pose_overridden()),
        );
        self.events.record("rotation_selected", payload);
    }

    fn record_batch_failure(
        &self,
        index: usize,
        persona_id: &str,
        kind: Option<&str>,
        message: &str,
    ) {
        let mut payload = EventPayload::new();
        payload.insert("index".to_string(), Value::from(index));
        payload.insert("persona_id".to_string(), Value::from(persona_id));
        payload.insert(
            "error_kind".to_string(),
            kind.map(Value::from).unwrap_or(Value::Null),
        );
        payload.insert("error".to_string(), Value::from(message));
        self.events.record("batch_item_failed", payload);
    }
}
