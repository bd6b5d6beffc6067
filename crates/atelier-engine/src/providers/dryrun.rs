use std::io::Cursor;

use atelier_contracts::config::parse_aspect_ratio;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::{GenerationProvider, ProviderError, ProviderPayload};
use crate::composer::ComposedRequest;

const LONG_SIDE: u32 = 256;

/// Offline provider: renders a flat swatch whose colour is derived from the
/// prompt, so identical requests yield identical bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunProvider;

impl GenerationProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn submit(&self, request: &ComposedRequest) -> Result<ProviderPayload, ProviderError> {
        let (width, height) = dims_for(&request.parameters.aspect_ratio);
        let (r, g, b) = color_from_prompt(&request.prompt, request.parameters.seed.unwrap_or_default());
        let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));

        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|err| ProviderError::Server {
                status: 500,
                message: format!("dryrun encode failed: {err}"),
            })?;

        let mut provider_response = Map::new();
        provider_response.insert("provider".to_string(), Value::from("dryrun"));
        provider_response.insert("size".to_string(), json!([width, height]));
        provider_response.insert("reference_images".to_string(), Value::from(request.reference_images.len()));
        Ok(ProviderPayload {
            image_bytes: bytes,
            mime_type: "image/png".to_string(),
            seed: request.parameters.seed,
            provider_response,
        })
    }
}

fn dims_for(aspect_ratio: &str) -> (u32, u32) {
    let (w, h) = parse_aspect_ratio(aspect_ratio).unwrap_or((1, 1));
    if w >= h {
        (LONG_SIDE, (LONG_SIDE * h / w).max(1))
    } else {
        ((LONG_SIDE * w / h).max(1), LONG_SIDE)
    }
}

fn color_from_prompt(prompt: &str, seed: i64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
