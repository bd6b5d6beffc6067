mod dryrun;
mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use atelier_contracts::config::ProviderConfig;
use atelier_contracts::error::ErrorKind;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::composer::ComposedRequest;

pub use dryrun::DryrunProvider;
pub use http::{classify_failure, HttpProvider};

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPayload {
    pub image_bytes: Vec<u8>,
    pub mime_type: String,
    pub seed: Option<i64>,
    pub provider_response: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    #[error("transport failure: {message}")]
    Transport { message: String },
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("content policy rejection: {message}")]
    PolicyRejected { message: String },
    #[error("request rejected{}: {message}", status_suffix(.status))]
    Rejected {
        status: Option<u16>,
        message: String,
    },
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Server { .. } => ErrorKind::Server,
            Self::PolicyRejected { .. } => ErrorKind::PolicyRejected,
            Self::Rejected { .. } => ErrorKind::Rejected,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

/// The external synthesis endpoint, seen as a black box that returns image
/// bytes or a classified failure.
pub trait GenerationProvider: Send + Sync {
    fn name(&self) -> &str;
    fn submit(&self, request: &ComposedRequest) -> Result<ProviderPayload, ProviderError>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn GenerationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: GenerationProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn GenerationProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(config: &ProviderConfig) -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(DryrunProvider);
    match HttpProvider::new(config) {
        Ok(provider) => providers.register(provider),
        Err(err) => log::warn!("http provider unavailable: {err:#}"),
    }
    providers
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays a fixed script of outcomes and records every request it saw.
    pub(crate) struct ScriptedProvider {
        script: Mutex<VecDeque<Result<ProviderPayload, ProviderError>>>,
        seen: Mutex<Vec<ComposedRequest>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(script: Vec<Result<ProviderPayload, ProviderError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn seen(&self) -> Vec<ComposedRequest> {
            self.seen.lock().map(|rows| rows.clone()).unwrap_or_default()
        }
    }

    impl GenerationProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn submit(&self, request: &ComposedRequest) -> Result<ProviderPayload, ProviderError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.clone());
            }
            self.script
                .lock()
                .ok()
                .and_then(|mut script| script.pop_front())
                .unwrap_or_else(|| Ok(payload()))
        }
    }

    pub(crate) fn payload() -> ProviderPayload {
        ProviderPayload {
            image_bytes: vec![0x89, b'P', b'N', b'G'],
            mime_type: "image/png".to_string(),
            seed: Some(7),
            provider_response: Map::new(),
        }
    }

    pub(crate) fn rate_limited() -> Result<ProviderPayload, ProviderError> {
        Err(ProviderError::RateLimited {
            retry_after: None,
            message: "slow down".to_string(),
        })
    }

    pub(crate) fn policy_rejected() -> Result<ProviderPayload, ProviderError> {
        Err(ProviderError::PolicyRejected {
            message: "flagged".to_string(),
        })
    }
}
