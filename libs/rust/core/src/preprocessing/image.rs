//! Raw pixel payloads → fixed-size, colour-converted, normalised image tensors.
//!
//! Accepted payload: `{"width": w, "height": h, "channels": 1|3|4, "pixels": [...] }`
//! where `pixels` is either a row-major array of bytes or a base64 string of them
//! (an optional `data:image/...;base64,` prefix is stripped).

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{config_digest, Preprocessor};
use crate::error::{LifecycleError, LifecycleResult};
use crate::model::Tensor;

const MAX_SIDE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode { Rgb, Grayscale, Rgba }

impl ColorMode {
    pub fn channels(self) -> usize {
        match self { ColorMode::Grayscale => 1, ColorMode::Rgb => 3, ColorMode::Rgba => 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// (width, height)
    pub target_size: (usize, usize),
    pub normalize: bool,
    pub normalize_range: (f32, f32),
    pub color_mode: ColorMode,
}

impl Default for ImageConfig {
    fn default() -> Self { Self { target_size: (224, 224), normalize: true, normalize_range: (0.0, 1.0), color_mode: ColorMode::Rgb } }
}

#[derive(Debug, Clone)]
pub struct ImagePreprocessor {
    config: ImageConfig,
}

struct RawImage {
    width: usize,
    height: usize,
    channels: usize,
    pixels: Vec<u8>,
}

impl ImagePreprocessor {
    pub fn new(config: ImageConfig) -> LifecycleResult<Self> {
        let (w, h) = config.target_size;
        if w == 0 || h == 0 || w > MAX_SIDE || h > MAX_SIDE {
            return Err(LifecycleError::invalid_config(format!("target size {w}x{h} out of range")));
        }
        let (lo, hi) = config.normalize_range;
        if !(lo.is_finite() && hi.is_finite() && lo < hi) {
            return Err(LifecycleError::invalid_config("normalize_range must be finite and increasing"));
        }
        Ok(Self { config })
    }

    fn decode(&self, raw: &Value) -> LifecycleResult<RawImage> {
        let obj = raw.as_object().ok_or_else(|| LifecycleError::invalid_input("image payload must be an object"))?;
        let dim = |key: &str| -> LifecycleResult<usize> {
            obj.get(key)
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .filter(|v| *v > 0 && *v <= MAX_SIDE)
                .ok_or_else(|| LifecycleError::invalid_input(format!("'{key}' must be an integer in 1..={MAX_SIDE}")))
        };
        let (width, height) = (dim("width")?, dim("height")?);
        let channels = obj.get("channels").and_then(Value::as_u64).unwrap_or(3) as usize;
        if !matches!(channels, 1 | 3 | 4) {
            return Err(LifecycleError::invalid_input(format!("unsupported channel count {channels}")));
        }
        let pixels = match obj.get("pixels") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|p| p.as_u64().filter(|v| *v <= 255).map(|v| v as u8))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| LifecycleError::invalid_input("pixels must be integers in 0..=255"))?,
            Some(Value::String(s)) => {
                let body = s.split_once("base64,").map_or(s.as_str(), |(_, b)| b);
                base64::engine::general_purpose::STANDARD
                    .decode(body.trim())
                    .map_err(|e| LifecycleError::invalid_input(format!("pixels: bad base64: {e}")))?
            }
            _ => return Err(LifecycleError::invalid_input("missing 'pixels'")),
        };
        let expected = width * height * channels;
        if pixels.len() != expected {
            return Err(LifecycleError::invalid_input(format!("{width}x{height}x{channels} image needs {expected} bytes, got {}", pixels.len())));
        }
        Ok(RawImage { width, height, channels, pixels })
    }

    fn convert_pixel(src: &[u8], to: ColorMode) -> [u8; 4] {
        let (r, g, b, a) = match src.len() {
            1 => (src[0], src[0], src[0], 255),
            3 => (src[0], src[1], src[2], 255),
            _ => (src[0], src[1], src[2], src[3]),
        };
        match to {
            ColorMode::Grayscale => {
                let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
                [y.round().clamp(0.0, 255.0) as u8, 0, 0, 0]
            }
            ColorMode::Rgb => [r, g, b, 0],
            ColorMode::Rgba => [r, g, b, a],
        }
    }
}

impl Preprocessor for ImagePreprocessor {
    fn validate(&self, raw: &Value) -> LifecycleResult<()> { self.decode(raw).map(|_| ()) }

    fn process(&self, raw: &Value) -> LifecycleResult<Tensor> {
        let img = self.decode(raw)?;
        let (tw, th) = self.config.target_size;
        let out_c = self.config.color_mode.channels();
        let (lo, hi) = self.config.normalize_range;
        let mut data = Vec::with_capacity(tw * th * out_c);
        // nearest-neighbour sampling
        for y in 0..th {
            let sy = (y * img.height / th).min(img.height - 1);
            for x in 0..tw {
                let sx = (x * img.width / tw).min(img.width - 1);
                let offset = (sy * img.width + sx) * img.channels;
                let px = Self::convert_pixel(&img.pixels[offset..offset + img.channels], self.config.color_mode);
                for &v in &px[..out_c] {
                    let v = v as f32;
                    data.push(if self.config.normalize { lo + (v / 255.0) * (hi - lo) } else { v });
                }
            }
        }
        Tensor::new(vec![th, tw, out_c], data).map_err(|e| LifecycleError::invalid_input(e.to_string()))
    }

    fn fingerprint(&self) -> String { format!("image:{}", config_digest(&self.config)) }

    fn output_len(&self) -> usize {
        let (w, h) = self.config.target_size;
        w * h * self.config.color_mode.channels()
    }
}
