//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mlops_core::model::{Example, Metrics, Model, ModelError, ModelInfo, RawPrediction, Tensor, Trainable};
use mlops_core::models::LogisticRegression;
use mlops_core::preprocessing::{Preprocessor, TabularPreprocessor};
use mlops_core::{Dataset, ExperimentTracker, ModelCatalog, ModelRegistry, RegistryConfig, Trainer, TrainerSettings};
use serde_json::{json, Value};

pub const FEATURES: [&str; 2] = ["tenure", "spend"];

pub fn tabular() -> Arc<TabularPreprocessor> { Arc::new(TabularPreprocessor::new(FEATURES)) }

/// Linearly separable churn-like records: label 1 when tenure + spend > 1.
pub fn records(n: usize) -> Vec<(Value, f32)> {
    (0..n)
        .map(|i| {
            let tenure = (i % 10) as f64 / 10.0;
            let spend = (i % 7) as f64 / 7.0;
            (json!({"tenure": tenure, "spend": spend}), if tenure + spend > 1.0 { 1.0 } else { 0.0 })
        })
        .collect()
}

pub fn dataset(pre: &dyn Preprocessor, n: usize) -> Dataset { Dataset::from_records(pre, &records(n)).unwrap() }

pub struct Stack {
    pub registry: Arc<ModelRegistry>,
    pub tracker: Arc<ExperimentTracker>,
    pub trainer: Trainer,
}

pub fn stack(artifact_root: &Path) -> Stack {
    let registry = Arc::new(ModelRegistry::new(RegistryConfig::default()));
    let tracker = Arc::new(ExperimentTracker::default());
    let trainer = Trainer::new(registry.clone(), tracker.clone(), TrainerSettings { artifact_root: artifact_root.to_path_buf() });
    Stack { registry, tracker, trainer }
}

pub fn logistic_catalog(pre: Arc<TabularPreprocessor>) -> Arc<ModelCatalog> {
    Arc::new(ModelCatalog::new().with(LogisticRegression::KIND, || Box::new(LogisticRegression::unloaded()), pre))
}

/// Trainable whose per-epoch loss follows a script; NaN entries fail the step.
pub struct Scripted {
    pub losses: Vec<f64>,
    pub step: usize,
}

impl Scripted {
    pub const KIND: &'static str = "scripted";
    pub fn new(losses: Vec<f64>) -> Self { Self { losses, step: 0 } }
    fn current(&self, step: usize) -> f64 { self.losses[step.min(self.losses.len() - 1)] }
}

#[async_trait]
impl Model for Scripted {
    fn kind(&self) -> &str { Self::KIND }
    async fn load(&mut self, _: &str) -> Result<(), ModelError> { Ok(()) }
    async fn predict(&self, _: &Tensor) -> Result<RawPrediction, ModelError> { Ok(RawPrediction { prediction: json!(0), confidence: None }) }
    fn is_loaded(&self) -> bool { true }
    fn info(&self) -> ModelInfo { ModelInfo { kind: Self::KIND.into(), input_dim: None, is_loaded: true, location: None } }
}

#[async_trait]
impl Trainable for Scripted {
    fn train_step(&mut self, _: &[Example], _: f64) -> Result<f64, ModelError> {
        let loss = self.current(self.step);
        self.step += 1;
        if loss.is_nan() { Err(ModelError::Divergence(loss)) } else { Ok(loss) }
    }
    fn evaluate(&self, _: &[Example]) -> Result<Metrics, ModelError> {
        Ok(Metrics::from([("loss".to_string(), self.current(self.step.saturating_sub(1)))]))
    }
    async fn save(&self, path: &Path) -> Result<(), ModelError> {
        tokio::fs::write(path, serde_json::to_vec(&self.losses)?).await?;
        Ok(())
    }
}

/// Logistic model that counts and slows down its loads.
pub struct CountingLoads {
    pub inner: LogisticRegression,
    pub loads: Arc<AtomicUsize>,
}

#[async_trait]
impl Model for CountingLoads {
    fn kind(&self) -> &str { LogisticRegression::KIND }
    async fn load(&mut self, location: &str) -> Result<(), ModelError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.inner.load(location).await
    }
    async fn predict(&self, input: &Tensor) -> Result<RawPrediction, ModelError> { self.inner.predict(input).await }
    fn is_loaded(&self) -> bool { self.inner.is_loaded() }
    fn info(&self) -> ModelInfo { self.inner.info() }
}
