//! Input validation and transformation into model-ready tensors.
//!
//! A preprocessor must match what the model was trained with; its `fingerprint` is
//! stored with trained versions and compared again at serving time.

pub mod image;
pub mod tabular;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{LifecycleError, LifecycleResult};
use crate::model::Tensor;

pub use image::{ColorMode, ImageConfig, ImagePreprocessor};
pub use tabular::TabularPreprocessor;

/// Version metadata key holding the fingerprint of the preprocessor a model was trained with.
pub const PREPROCESSOR_METADATA_KEY: &str = "preprocessor";

pub trait Preprocessor: Send + Sync {
    /// Cheap structural check; nothing reaches the model unless this passes.
    fn validate(&self, raw: &Value) -> LifecycleResult<()>;

    fn process(&self, raw: &Value) -> LifecycleResult<Tensor>;

    fn process_batch(&self, raws: &[Value]) -> LifecycleResult<Vec<Tensor>> {
        raws.iter()
            .enumerate()
            .map(|(index, raw)| {
                self.validate(raw)
                    .and_then(|_| self.process(raw))
                    .map_err(|e| LifecycleError::BatchItemFailed { index, source: Box::new(e) })
            })
            .collect()
    }

    /// Stable description of the configuration (feature order, scaling, target size...).
    fn fingerprint(&self) -> String;

    fn output_len(&self) -> usize;
}

/// First 16 hex chars of the sha256 of the JSON encoding of `cfg`.
pub(crate) fn config_digest<T: Serialize>(cfg: &T) -> String {
    let bytes = serde_json::to_vec(cfg).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))[..16].to_string()
}
