pub mod assignment;
pub mod client;
pub mod composer;
pub mod loader;
pub mod narrative;
pub mod outfit;
pub mod pipeline;
pub mod providers;
pub mod rewrite;
pub mod variation;
pub mod vocabulary;

pub use assignment::{AssignedImage, ReferenceAssigner, ReferenceAssignment};
pub use client::{
    BackoffSleeper, CancelToken, GenerationClient, GenerationOutcome, GenerationStatus,
    ThreadSleeper,
};
pub use composer::{ComposedRequest, CompositionInput, GenerationParameters, RequestComposer};
pub use pipeline::{
    BatchItemReport, BatchItemResult, ContentRequest, Pipeline, PipelineError, PreparedRequest,
};
pub use providers::{
    default_provider_registry, DryrunProvider, GenerationProvider, HttpProvider, ProviderError,
    ProviderPayload, ProviderRegistry,
};
pub use variation::{VariationSelection, VariationSelector};
