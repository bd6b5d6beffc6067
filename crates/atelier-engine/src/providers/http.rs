use std::time::Duration;

use anyhow::{Context, Result};
use atelier_contracts::config::ProviderConfig;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde_json::{json, Map, Value};

use super::{GenerationProvider, ProviderError, ProviderPayload};
use crate::composer::ComposedRequest;

const POLICY_MARKERS: &[&str] = &[
    "content_policy",
    "content policy",
    "policy_violation",
    "safety_violation",
    "safety system",
    "safety filter",
    "safety_filter",
    "moderation",
    "nsfw",
];
const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);
const ERROR_BODY_CHARS: usize = 512;

/// JSON-over-HTTP generation endpoint (`POST {api_base}/generations`).
pub struct HttpProvider {
    endpoint: String,
    api_key: Option<String>,
    http: HttpClient,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1_000)))
            .build()
            .context("failed building http client")?;
        Ok(Self {
            endpoint: format!("{}/generations", config.api_base.trim_end_matches('/')),
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn download_image(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ProviderError> {
        let response = self.http.get(url).send().map_err(transport_error)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_failure(status, &body, None));
        }
        let mime_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().map_err(transport_error)?.to_vec();
        Ok((bytes, mime_type))
    }
}

impl GenerationProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn submit(&self, request: &ComposedRequest) -> Result<ProviderPayload, ProviderError> {
        let mut builder = self.http.post(&self.endpoint).json(&request_body(request));
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        let response = builder.send().map_err(transport_error)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().map_err(transport_error)?;
        if !(200..300).contains(&status) {
            return Err(classify_failure(status, &body, retry_after.as_deref()));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|err| ProviderError::Server {
            status,
            message: format!("invalid JSON payload: {err}"),
        })?;
        if let Some(error) = parsed.get("error").filter(|value| !value.is_null()) {
            let text = error.to_string();
            return Err(if contains_policy_marker(&text) {
                ProviderError::PolicyRejected {
                    message: truncate_text(&text, ERROR_BODY_CHARS),
                }
            } else {
                ProviderError::Rejected {
                    status: Some(status),
                    message: truncate_text(&text, ERROR_BODY_CHARS),
                }
            });
        }

        let Some(image) = find_image(&parsed) else {
            return Err(ProviderError::Server {
                status,
                message: "response carried no image".to_string(),
            });
        };
        let (image_bytes, mime_type) = match image {
            FoundImage::Inline { data, mime_type } => {
                let bytes = BASE64.decode(data.trim()).map_err(|err| ProviderError::Server {
                    status,
                    message: format!("invalid base64 image: {err}"),
                })?;
                (bytes, mime_type)
            }
            FoundImage::Url { url, mime_type } => {
                let (bytes, downloaded_mime) = self.download_image(&url)?;
                (bytes, mime_type.or(downloaded_mime))
            }
        };

        Ok(ProviderPayload {
            image_bytes,
            mime_type: mime_type.unwrap_or_else(|| "image/png".to_string()),
            seed: parsed.get("seed").and_then(Value::as_i64),
            provider_response: summarize_response(&parsed),
        })
    }
}

/// Maps a non-success status and body to the client's retry taxonomy.
pub fn classify_failure(status: u16, body: &str, retry_after: Option<&str>) -> ProviderError {
    let message = truncate_text(body.trim(), ERROR_BODY_CHARS);
    match status {
        429 => ProviderError::RateLimited {
            retry_after: retry_after.and_then(parse_retry_after),
            message,
        },
        408 => ProviderError::Transport { message },
        500..=599 => ProviderError::Server { status, message },
        400 | 403 | 422 | 451 if contains_policy_marker(body) => {
            ProviderError::PolicyRejected { message }
        }
        _ => ProviderError::Rejected {
            status: Some(status),
            message,
        },
    }
}

fn request_body(request: &ComposedRequest) -> Value {
    let images: Vec<Value> = request
        .reference_images
        .iter()
        .map(|assigned| {
            json!({
                "slot": assigned.slot,
                "role": assigned.role.as_str(),
                "mime_type": assigned.image.mime_type,
                "data": BASE64.encode(assigned.image.bytes()),
            })
        })
        .collect();
    json!({
        "request_id": request.request_id,
        "prompt": request.prompt,
        "images": images,
        "aspect_ratio": request.parameters.aspect_ratio,
        "resolution": request.parameters.resolution_tier,
        "guidance": request.parameters.guidance_strength,
        "seed": request.parameters.seed,
        "options": request.parameters.provider_options,
    })
}

enum FoundImage {
    Inline {
        data: String,
        mime_type: Option<String>,
    },
    Url {
        url: String,
        mime_type: Option<String>,
    },
}

fn find_image(payload: &Value) -> Option<FoundImage> {
    let mut candidates: Vec<&Value> = Vec::new();
    for key in ["images", "data", "output"] {
        if let Some(first) = payload.get(key).and_then(Value::as_array).and_then(|rows| rows.first()) {
            candidates.push(first);
        }
    }
    if let Some(image) = payload.get("image").filter(|value| value.is_object()) {
        candidates.push(image);
    }
    candidates.push(payload);

    for candidate in candidates {
        let Some(obj) = candidate.as_object() else {
            continue;
        };
        let mime_type = ["mime_type", "mimeType", "content_type"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string);
        if let Some(data) = ["b64_json", "b64", "base64", "image_base64"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
        {
            return Some(FoundImage::Inline {
                data: data.to_string(),
                mime_type,
            });
        }
        if let Some(url) = obj
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| url.starts_with("http"))
        {
            return Some(FoundImage::Url {
                url: url.to_string(),
                mime_type,
            });
        }
    }
    None
}

fn summarize_response(payload: &Value) -> Map<String, Value> {
    let mut summary = Map::new();
    if let Some(obj) = payload.as_object() {
        for key in ["id", "model", "seed", "status", "created"] {
            if let Some(value) = obj.get(key) {
                summary.insert(key.to_string(), value.clone());
            }
        }
    }
    summary
}

fn contains_policy_marker(body: &str) -> bool {
    let lowered = body.to_ascii_lowercase();
    POLICY_MARKERS.iter().any(|marker| lowered.contains(marker))
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds).min(MAX_RETRY_AFTER))
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    let cause = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connect"
    } else {
        "request"
    };
    ProviderError::Transport {
        message: format!("{cause}: {err}"),
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use atelier_contracts::references::{ImageHandle, SlotRole};
    use atelier_contracts::vocabulary::VocabularyTier;

    use crate::assignment::AssignedImage;
    use crate::composer::GenerationParameters;

    use super::*;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_failure(429, "busy", Some("4")),
            ProviderError::RateLimited {
                retry_after: Some(Duration::from_secs(4)),
                message: "busy".to_string(),
            }
        );
        assert!(matches!(
            classify_failure(429, "busy", Some("Wed, 21 Oct 2015 07:28:00 GMT")),
            ProviderError::RateLimited {
                retry_after: None,
                ..
            }
        ));
        assert!(matches!(
            classify_failure(503, "down", None),
            ProviderError::Server { status: 503, .. }
        ));
        assert!(matches!(
            classify_failure(400, r#"{"error":{"code":"content_policy_violation"}}"#, None),
            ProviderError::PolicyRejected { .. }
        ));
        assert!(matches!(
            classify_failure(400, "missing prompt", None),
            ProviderError::Rejected {
                status: Some(400),
                ..
            }
        ));
        assert!(matches!(
            classify_failure(400, "blocked by the safety system", None),
            ProviderError::PolicyRejected { .. }
        ));
        assert!(matches!(
            classify_failure(400, "safety_tolerance must be <= 6", None),
            ProviderError::Rejected {
                status: Some(400),
                ..
            }
        ));
        assert!(matches!(
            classify_failure(408, "", None),
            ProviderError::Transport { .. }
        ));
    }

    #[test]
    fn retry_after_is_capped() {
        assert_eq!(parse_retry_after("99999"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("-1"), None);
        assert_eq!(parse_retry_after("1.5"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn finds_inline_and_url_images() {
        let inline = json!({"data": [{"b64_json": "AAEC", "mime_type": "image/webp"}], "seed": 3});
        match find_image(&inline) {
            Some(FoundImage::Inline { data, mime_type }) => {
                assert_eq!(data, "AAEC");
                assert_eq!(mime_type.as_deref(), Some("image/webp"));
            }
            _ => panic!("expected inline image"),
        }

        let url = json!({"output": [{"url": "https://cdn.example/img.png"}]});
        assert!(matches!(find_image(&url), Some(FoundImage::Url { .. })));
        assert!(find_image(&json!({"status": "ok"})).is_none());
    }

    #[test]
    fn request_body_carries_slots_in_order() {
        let request = ComposedRequest {
            request_id: "req-1".to_string(),
            persona_id: "ava".to_string(),
            prompt: "portrait".to_string(),
            vocabulary_tier: VocabularyTier::Default,
            reference_images: vec![
                AssignedImage {
                    slot: 1,
                    role: SlotRole::PoseSource,
                    image: ImageHandle::new("pose", "image/png", vec![1, 2]),
                },
                AssignedImage {
                    slot: 2,
                    role: SlotRole::FaceAnchors,
                    image: ImageHandle::new("face", "image/jpeg", vec![3]),
                },
            ],
            parameters: GenerationParameters::default(),
        };
        let body = request_body(&request);
        assert_eq!(body["images"][0]["role"], "pose_source");
        assert_eq!(body["images"][0]["data"], BASE64.encode([1u8, 2]));
        assert_eq!(body["images"][1]["slot"], 2);
        assert_eq!(body["resolution"], "2k");
        assert!(body["seed"].is_null());
    }

    #[test]
    fn endpoint_is_derived_from_api_base() -> anyhow::Result<()> {
        let provider = HttpProvider::new(&ProviderConfig {
            api_base: "https://api.example/v2/".to_string(),
            ..ProviderConfig::default()
        })?;
        assert_eq!(provider.endpoint(), "https://api.example/v2/generations");
        Ok(())
    }
}
