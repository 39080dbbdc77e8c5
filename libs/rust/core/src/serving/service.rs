//! Inference over registered versions: resolve → preprocess → load (cached) → predict.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::cache::{CacheConfig, LoadedModel, ModelCache};
use crate::error::{ErrorKind, LifecycleError, LifecycleResult};
use crate::model::{CatalogEntry, ModelCatalog, ModelError, RawPrediction};
use crate::preprocessing::PREPROCESSOR_METADATA_KEY;
use crate::registry::{ModelRegistry, ModelVersion, Stage};
use crate::LIFECYCLE_METRICS;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Stage served when a caller names neither version nor stage.
    pub default_stage: Stage,
    pub cache: CacheConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self { Self { default_stage: Stage::Production, cache: CacheConfig::default() } }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub prediction: Value,
    /// Always within [0, 1] when present.
    pub confidence: Option<f64>,
    pub model_name: String,
    pub model_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The serving version is loaded.
    Ready,
    /// A serving version exists but is not in the cache yet.
    Cold,
    /// Nothing servable in the default stage.
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelHealth {
    pub model: String,
    pub status: HealthStatus,
    pub serving_version: Option<u32>,
    pub loaded_versions: Vec<u32>,
}

pub struct InferenceService {
    registry: Arc<ModelRegistry>,
    catalog: Arc<ModelCatalog>,
    cache: ModelCache,
    default_stage: Stage,
}

/// Resolved version plus the catalog entry that knows how to build and feed it.
struct Target {
    version: ModelVersion,
    entry: CatalogEntry,
}

impl InferenceService {
    pub fn new(registry: Arc<ModelRegistry>, catalog: Arc<ModelCatalog>, cfg: InferenceConfig) -> Self {
        Self { registry, catalog, cache: ModelCache::new(&cfg.cache), default_stage: cfg.default_stage }
    }

    pub async fn predict(&self, name: &str, data: &Value, version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<PredictionResult> {
        let start = Instant::now();
        let result = self.predict_one(name, data, version, stage).await;
        record_outcome(name, start, 1, &result);
        result
    }

    async fn predict_one(&self, name: &str, data: &Value, version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<PredictionResult> {
        let target = self.target(name, version, stage)?;
        let pre = &target.entry.preprocessor;
        pre.validate(data)?;
        let input = pre.process(data)?;
        let loaded = self.acquire(&target).await?;
        let raw = loaded.model().predict(&input).await.map_err(|e| prediction_error(&target.version, e))?;
        Ok(finish(&target.version, raw))
    }

    /// All items are preprocessed before the model sees any of them; the first failure
    /// fails the whole call with its index.
    pub async fn predict_batch(&self, name: &str, data: &[Value], version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<Vec<PredictionResult>> {
        let start = Instant::now();
        let result = self.predict_all(name, data, version, stage).await;
        record_outcome(name, start, data.len() as u64, &result);
        result
    }

    async fn predict_all(&self, name: &str, data: &[Value], version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<Vec<PredictionResult>> {
        let target = self.target(name, version, stage)?;
        let inputs = target.entry.preprocessor.process_batch(data)?;
        if inputs.is_empty() { return Ok(Vec::new()); }
        let loaded = self.acquire(&target).await?;
        let mut out = Vec::with_capacity(inputs.len());
        for (index, input) in inputs.iter().enumerate() {
            let raw = loaded
                .model()
                .predict(input)
                .await
                .map_err(|e| LifecycleError::BatchItemFailed { index, source: Box::new(prediction_error(&target.version, e)) })?;
            out.push(finish(&target.version, raw));
        }
        Ok(out)
    }

    /// Per-item outcomes. The outer error covers what applies to every item (resolution,
    /// preprocessor mismatch, load failure).
    pub async fn predict_batch_partial(
        &self,
        name: &str,
        data: &[Value],
        version: Option<u32>,
        stage: Option<Stage>,
    ) -> LifecycleResult<Vec<LifecycleResult<PredictionResult>>> {
        let target = self.target(name, version, stage)?;
        let loaded = self.acquire(&target).await?;
        let pre = &target.entry.preprocessor;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let start = Instant::now();
            let res = match pre.validate(item).and_then(|_| pre.process(item)) {
                Ok(input) => loaded.model().predict(&input).await.map(|raw| finish(&target.version, raw)).map_err(|e| prediction_error(&target.version, e)),
                Err(e) => Err(e),
            };
            record_outcome(name, start, 1, &res);
            out.push(res);
        }
        Ok(out)
    }

    /// Evict a specific version from the cache. Returns whether it was loaded.
    pub fn unload(&self, name: &str, version: u32) -> bool {
        let removed = self.cache.remove(&(name.to_string(), version));
        if removed { info!(name, version, "model unloaded"); }
        removed
    }

    /// Drop and load again, e.g. after the artifact was rewritten in place.
    pub async fn reload(&self, name: &str, version: u32) -> LifecycleResult<()> {
        let target = self.target(name, Some(version), None)?;
        self.cache.remove(&(name.to_string(), version));
        self.acquire(&target).await.map(|_| ())
    }

    pub fn is_loaded(&self, name: &str, version: u32) -> bool { self.cache.contains(&(name.to_string(), version)) }

    pub fn health(&self, name: &str) -> ModelHealth {
        let serving = self.registry.get(name, None, Some(self.default_stage)).ok().map(|v| v.version);
        let loaded_versions: Vec<u32> = self.cache.keys().into_iter().filter(|(n, _)| n == name).map(|(_, v)| v).collect();
        let status = match serving {
            Some(v) if loaded_versions.contains(&v) => HealthStatus::Ready,
            Some(_) => HealthStatus::Cold,
            None => HealthStatus::Unavailable,
        };
        ModelHealth { model: name.to_string(), status, serving_version: serving, loaded_versions }
    }

    /// Record of the version that would serve `name` by default.
    pub fn model_info(&self, name: &str) -> LifecycleResult<ModelVersion> { self.resolve(name, None, None) }

    /// Names with a version in the default serving stage.
    pub fn available_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.registry.list_models(Some(self.default_stage)).into_iter().map(|v| v.name).collect();
        names.dedup();
        names
    }

    fn resolve(&self, name: &str, version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<ModelVersion> {
        let found = match version {
            Some(v) => self.registry.get(name, Some(v), None),
            None => self.registry.get(name, None, Some(stage.unwrap_or(self.default_stage))),
        };
        found.map_err(|e| match e.kind() {
            ErrorKind::NotFound => LifecycleError::ModelNotFound { name: name.to_string(), reason: e.to_string() },
            _ => e,
        })
    }

    fn target(&self, name: &str, version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<Target> {
        let version = self.resolve(name, version, stage)?;
        let entry = self.catalog.entry(&version.kind)?.clone();
        if let Some(expected) = version.metadata.get(PREPROCESSOR_METADATA_KEY) {
            let actual = entry.preprocessor.fingerprint();
            if *expected != actual {
                warn!(name, version = version.version, %expected, %actual, "preprocessor does not match training");
                return Err(LifecycleError::PreprocessorMismatch { name: name.to_string(), version: version.version, expected: expected.clone(), actual });
            }
        }
        Ok(Target { version, entry })
    }

    async fn acquire(&self, target: &Target) -> LifecycleResult<Arc<LoadedModel>> {
        let record = target.version.clone();
        let constructor = target.entry.constructor.clone();
        let key = (record.name.clone(), record.version);
        self.cache
            .get_or_load(key, move || {
                async move {
                    let start = Instant::now();
                    let mut model = constructor();
                    debug!(name = %record.name, version = record.version, location = %record.artifact_location, "loading model");
                    match model.load(&record.artifact_location).await {
                        Ok(()) => {
                            LIFECYCLE_METRICS.model_loads_total.add(1, &[]);
                            info!(name = %record.name, version = record.version, ms = start.elapsed().as_millis() as u64, "model loaded");
                            Ok(LoadedModel::new(record, model))
                        }
                        Err(e) => {
                            LIFECYCLE_METRICS.model_load_failures_total.add(1, &[]);
                            warn!(name = %record.name, version = record.version, error = %e, "model load failed");
                            Err(LifecycleError::ModelLoad { name: record.name, version: record.version, location: record.artifact_location, reason: e.to_string() })
                        }
                    }
                }
                .boxed()
            })
            .await
    }
}

fn finish(version: &ModelVersion, raw: RawPrediction) -> PredictionResult {
    PredictionResult {
        prediction: raw.prediction,
        confidence: raw.confidence.filter(|c| c.is_finite()).map(|c| c.clamp(0.0, 1.0)),
        model_name: version.name.clone(),
        model_version: version.version,
    }
}

fn prediction_error(version: &ModelVersion, err: ModelError) -> LifecycleError {
    LifecycleError::Prediction { name: version.name.clone(), version: version.version, reason: err.to_string() }
}

fn record_outcome<T>(name: &str, start: Instant, items: u64, result: &LifecycleResult<T>) {
    let attrs = [KeyValue::new("model", name.to_string())];
    match result {
        Ok(_) => {
            LIFECYCLE_METRICS.predictions_total.add(items, &attrs);
            LIFECYCLE_METRICS.prediction_latency_ms.record(start.elapsed().as_secs_f64() * 1000.0, &attrs);
        }
        Err(e) => {
            LIFECYCLE_METRICS.prediction_errors_total.add(1, &[KeyValue::new("model", name.to_string()), KeyValue::new("kind", format!("{:?}", e.kind()))]);
            debug!(name, error = %e, "prediction failed");
        }
    }
}
