//! Online inference: version resolution, single-flight model loading and an LRU of
//! loaded instances.

pub mod cache;
pub mod service;

pub use cache::{CacheConfig, CacheKey, LoadedModel, ModelCache};
pub use service::{HealthStatus, InferenceConfig, InferenceService, ModelHealth, PredictionResult};
