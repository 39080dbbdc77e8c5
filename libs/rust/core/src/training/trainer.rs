//! Epoch-based training of any [`Trainable`] with tracking, early stopping, cooperative
//! cancellation and registration of the checkpoint as a `Staging` version.
//!
//! Per call: Initialized → Running → {Completed | Failed | Cancelled}. Only a Completed
//! run leaves an artifact and a servable registry entry behind.
//!
//! `train_step` is synchronous CPU work. On a multi-thread runtime each epoch runs inside
//! `block_in_place`; on a current-thread runtime it runs inline, so callers that share
//! that runtime with latency-sensitive tasks should train on a dedicated one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use super::dataset::Dataset;
use super::tracker::{ExperimentTracker, RunId, RunStatus};
use crate::error::{LifecycleError, LifecycleResult};
use crate::model::{Metrics, ModelError, Trainable};
use crate::preprocessing::{Preprocessor, PREPROCESSOR_METADATA_KEY};
use crate::registry::{ModelRegistry, ModelVersion, Stage};
use crate::LIFECYCLE_METRICS;

const CHECKPOINT_FILE: &str = "model.json";
const CHECKSUM_METADATA_KEY: &str = "sha256";
const FINE_TUNED_FROM_KEY: &str = "fine_tuned_from";
/// Larger class ids skip the confusion matrix.
const MAX_CONFUSION_CLASSES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub epochs: u32,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Fraction of the training set held out when no validation set is given.
    pub validation_split: f64,
    pub early_stopping: bool,
    pub patience: u32,
    pub min_delta: f64,
    /// Per-epoch shuffle seed; `None` keeps dataset order.
    pub shuffle_seed: Option<u64>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self { epochs: 10, batch_size: 32, learning_rate: 0.001, validation_split: 0.0, early_stopping: true, patience: 5, min_delta: 0.0, shuffle_seed: None }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> LifecycleResult<()> {
        if self.epochs == 0 { return Err(LifecycleError::invalid_config("epochs must be >= 1")); }
        if self.batch_size == 0 { return Err(LifecycleError::invalid_config("batch_size must be >= 1")); }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) { return Err(LifecycleError::invalid_config("learning_rate must be positive")); }
        if !(0.0..1.0).contains(&self.validation_split) { return Err(LifecycleError::invalid_config("validation_split must be in [0, 1)")); }
        if !(self.min_delta.is_finite() && self.min_delta >= 0.0) { return Err(LifecycleError::invalid_config("min_delta must be >= 0")); }
        Ok(())
    }

    fn as_params(&self) -> BTreeMap<String, String> {
        let mut p = BTreeMap::from([
            ("epochs".to_string(), self.epochs.to_string()),
            ("batch_size".to_string(), self.batch_size.to_string()),
            ("learning_rate".to_string(), self.learning_rate.to_string()),
            ("validation_split".to_string(), self.validation_split.to_string()),
            ("early_stopping".to_string(), self.early_stopping.to_string()),
            ("patience".to_string(), self.patience.to_string()),
            ("min_delta".to_string(), self.min_delta.to_string()),
        ]);
        if let Some(seed) = self.shuffle_seed { p.insert("shuffle_seed".into(), seed.to_string()); }
        p
    }
}

/// Shared flag checked between epochs.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self { Self::default() }
    pub fn cancel(&self) { self.0.store(true, Ordering::SeqCst); }
    pub fn is_cancelled(&self) -> bool { self.0.load(Ordering::SeqCst) }
}

/// What is being trained and where the result is registered.
#[derive(Debug, Clone)]
pub struct TrainJob {
    pub model_name: String,
    pub kind: String,
    pub experiment: String,
    pub parameters: BTreeMap<String, String>,
    pub metadata: BTreeMap<String, String>,
    pub cancel: CancellationFlag,
}

impl TrainJob {
    pub fn new(model_name: &str, kind: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            kind: kind.to_string(),
            experiment: model_name.to_string(),
            parameters: BTreeMap::new(),
            metadata: BTreeMap::new(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn experiment(mut self, experiment: &str) -> Self { self.experiment = experiment.to_string(); self }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self { self.parameters.insert(key.to_string(), value.to_string()); self }

    /// Record the fingerprint so serving can refuse a mismatched preprocessor.
    pub fn preprocessor(mut self, pre: &dyn Preprocessor) -> Self {
        self.metadata.insert(PREPROCESSOR_METADATA_KEY.to_string(), pre.fingerprint());
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self { self.cancel = flag; self }
}

#[derive(Debug, Clone)]
pub struct TrainResult {
    pub run_id: RunId,
    pub epochs_completed: u32,
    pub stopped_early: bool,
    pub best_epoch: Option<u32>,
    pub final_loss: f64,
    pub final_metrics: Metrics,
    /// Per-epoch values keyed by metric name (`train_loss`, `val_loss`, ...).
    pub history: BTreeMap<String, Vec<f64>>,
    pub artifact_path: PathBuf,
    pub registered_version: ModelVersion,
}

/// Evaluation with per-example predictions; `confusion_matrix[actual][predicted]` is
/// present when every target and prediction is a small non-negative class id.
#[derive(Debug, Clone, Serialize)]
pub struct EvalResult {
    pub loss: f64,
    pub metrics: Metrics,
    pub predictions: Vec<Value>,
    pub confusion_matrix: Option<Vec<Vec<u64>>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    /// Checkpoints land in `<artifact_root>/<model_name>/<run_id>/model.json`.
    pub artifact_root: PathBuf,
}

impl Default for TrainerSettings {
    fn default() -> Self { Self { artifact_root: PathBuf::from("artifacts") } }
}

pub struct Trainer {
    registry: Arc<ModelRegistry>,
    tracker: Arc<ExperimentTracker>,
    settings: TrainerSettings,
}

impl Trainer {
    pub fn new(registry: Arc<ModelRegistry>, tracker: Arc<ExperimentTracker>, settings: TrainerSettings) -> Self { Self { registry, tracker, settings } }

    pub fn tracker(&self) -> &Arc<ExperimentTracker> { &self.tracker }

    pub async fn train(
        &self,
        model: &mut dyn Trainable,
        job: &TrainJob,
        train_data: &Dataset,
        config: &TrainConfig,
        validation_data: Option<&Dataset>,
    ) -> LifecycleResult<TrainResult> {
        config.validate()?;
        if train_data.is_empty() { return Err(LifecycleError::invalid_input("training data is empty")); }
        let held_out;
        let (train, validation) = match validation_data {
            Some(v) => (train_data, Some(v).filter(|d| !d.is_empty())),
            None if config.validation_split > 0.0 => {
                held_out = train_data.clone().split(config.validation_split)?;
                (&held_out.0, Some(&held_out.1).filter(|d| !d.is_empty()))
            }
            None => (train_data, None),
        };
        if train.is_empty() {
            return Err(LifecycleError::invalid_input(format!("validation_split {} leaves no training examples", config.validation_split)));
        }
        let train = match config.shuffle_seed {
            Some(seed) => train.clone().with_shuffle(seed),
            None => train.clone(),
        };

        let mut params = config.as_params();
        params.extend(job.parameters.clone());
        params.insert("model_name".into(), job.model_name.clone());
        params.insert("kind".into(), job.kind.clone());
        let run_id = self.tracker.start_run(&job.experiment, params)?;
        info!(%run_id, name = %job.model_name, epochs = config.epochs, examples = train.len(), "training started");

        let monitor = if validation.is_some() { "val_loss" } else { "train_loss" };
        let mut history: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut final_metrics = Metrics::new();
        let (mut best, mut best_epoch, mut stale) = (f64::INFINITY, None, 0u32);
        let mut epochs_completed = 0u32;
        let mut stopped_early = false;

        for epoch in 1..=config.epochs {
            tokio::task::yield_now().await;
            if job.cancel.is_cancelled() { return Err(self.cancelled(run_id, epochs_completed)); }

            let metrics = match blocking(|| run_epoch(model, &train, validation, config, epoch)) {
                Ok(m) => m,
                Err(e) => return Err(self.failed(run_id, epoch, e.to_string())),
            };
            for (name, value) in &metrics {
                if let Err(e) = self.tracker.log_metric(run_id, epoch as u64, name, *value) {
                    return Err(self.failed(run_id, epoch, format!("tracking: {e}")));
                }
                history.entry(name.clone()).or_default().push(*value);
            }
            LIFECYCLE_METRICS.training_epochs_total.add(1, &[]);
            epochs_completed = epoch;

            let current = metrics.get(monitor).copied().unwrap_or(f64::INFINITY);
            debug!(%run_id, epoch, monitor, value = current, "epoch finished");
            final_metrics = metrics;
            if current < best - config.min_delta {
                best = current;
                best_epoch = Some(epoch);
                stale = 0;
            } else {
                stale += 1;
                if config.early_stopping && stale >= config.patience.max(1) {
                    info!(%run_id, epoch, best_epoch = ?best_epoch, "early stopping");
                    stopped_early = true;
                    break;
                }
            }
        }

        let dir = self.settings.artifact_root.join(&job.model_name).join(run_id.to_string());
        let (artifact_path, checksum) = match checkpoint(model, &dir).await {
            Ok(saved) => saved,
            Err(e) => {
                remove_checkpoint(&dir).await;
                self.failed(run_id, epochs_completed, e.to_string());
                return Err(e);
            }
        };
        let location = artifact_path.to_string_lossy().to_string();
        if let Err(e) = self.tracker.log_artifact(run_id, &location) {
            remove_checkpoint(&dir).await;
            return Err(self.failed(run_id, epochs_completed, format!("tracking: {e}")));
        }

        let mut metadata = job.metadata.clone();
        metadata.insert("run_id".into(), run_id.to_string());
        metadata.insert("experiment".into(), job.experiment.clone());
        metadata.insert(CHECKSUM_METADATA_KEY.into(), checksum);
        if let Some(e) = best_epoch { metadata.insert("best_epoch".into(), e.to_string()); }
        for (name, value) in &final_metrics { metadata.insert(format!("metric.{name}"), value.to_string()); }

        let registered = match self.registry.register_with_metadata(&job.model_name, &job.kind, &location, Stage::Staging, metadata).await {
            Ok(v) => v,
            Err(e) => {
                remove_checkpoint(&dir).await;
                self.failed(run_id, epochs_completed, format!("registration: {e}"));
                return Err(e);
            }
        };
        let closed = self
            .tracker
            .set_tag(run_id, "registered_version", registered.version)
            .and_then(|_| self.tracker.end_run(run_id, RunStatus::Completed));
        if let Err(e) = closed {
            // the run was ended elsewhere while registering; retire the version it produced
            if let Err(retire) = self.registry.set_stage(&job.model_name, registered.version, Stage::Archived).await {
                warn!(%run_id, version = registered.version, error = %retire, "could not archive orphaned version");
            }
            remove_checkpoint(&dir).await;
            return Err(self.failed(run_id, epochs_completed, format!("tracking: {e}")));
        }
        LIFECYCLE_METRICS.training_runs_total.add(1, &[KeyValue::new("outcome", RunStatus::Completed.as_str())]);
        info!(%run_id, name = %job.model_name, version = registered.version, epochs_completed, stopped_early, "training completed");

        Ok(TrainResult {
            run_id,
            epochs_completed,
            stopped_early,
            best_epoch,
            final_loss: final_metrics.get("train_loss").copied().unwrap_or(f64::NAN),
            final_metrics,
            history,
            artifact_path,
            registered_version: registered,
        })
    }

    /// Continue training from a registered version's weights and publish the result as a
    /// new `Staging` version that records its base in `fine_tuned_from`.
    pub async fn fine_tune(
        &self,
        model: &mut dyn Trainable,
        from: &ModelVersion,
        job: &TrainJob,
        train_data: &Dataset,
        config: &TrainConfig,
        validation_data: Option<&Dataset>,
    ) -> LifecycleResult<TrainResult> {
        config.validate()?;
        self.load_checkpoint(model, from).await?;
        let mut job = job.clone().param("base_version", from.id());
        job.metadata.insert(FINE_TUNED_FROM_KEY.into(), from.id());
        info!(name = %job.model_name, base = %from.id(), "fine-tuning");
        self.train(model, &job, train_data, config, validation_data).await
    }

    /// Load `version`'s artifact into `model` after checking kind and the recorded
    /// checksum. Returns the version's metadata.
    pub async fn load_checkpoint(&self, model: &mut dyn Trainable, version: &ModelVersion) -> LifecycleResult<BTreeMap<String, String>> {
        if model.kind() != version.kind {
            return Err(LifecycleError::invalid_input(format!("{} is a '{}' model, got a '{}' instance", version.id(), version.kind, model.kind())));
        }
        let location = &version.artifact_location;
        if let Some(expected) = version.metadata.get(CHECKSUM_METADATA_KEY) {
            let bytes = tokio::fs::read(location).await.map_err(|e| LifecycleError::artifact_io(location.as_str(), e))?;
            let actual = hex::encode(Sha256::digest(&bytes));
            if *expected != actual {
                return Err(LifecycleError::ChecksumMismatch { location: location.clone(), expected: expected.clone(), actual });
            }
        }
        model.load(location).await.map_err(|e| LifecycleError::ModelLoad {
            name: version.name.clone(),
            version: version.version,
            location: location.clone(),
            reason: e.to_string(),
        })?;
        debug!(version = %version.id(), location = %location, "checkpoint loaded");
        Ok(version.metadata.clone())
    }

    /// Evaluate without touching the model or any run.
    pub fn evaluate(&self, model: &dyn Trainable, test_data: &Dataset) -> LifecycleResult<Metrics> {
        if test_data.is_empty() { return Err(LifecycleError::invalid_input("test data is empty")); }
        model.evaluate(test_data.examples()).map_err(|e| LifecycleError::invalid_input(e.to_string()))
    }

    /// [`Trainer::evaluate`] plus one prediction per example and, for classifiers, a
    /// confusion matrix.
    pub async fn evaluate_detailed(&self, model: &dyn Trainable, test_data: &Dataset) -> LifecycleResult<EvalResult> {
        let metrics = self.evaluate(model, test_data)?;
        let loss = metrics.get("loss").copied().ok_or_else(|| LifecycleError::invalid_input(format!("'{}' reported no loss", model.kind())))?;
        let mut predictions = Vec::with_capacity(test_data.len());
        for (index, example) in test_data.examples().iter().enumerate() {
            let raw = model
                .predict(&example.features)
                .await
                .map_err(|e| LifecycleError::BatchItemFailed { index, source: Box::new(LifecycleError::invalid_input(e.to_string())) })?;
            predictions.push(raw.prediction);
        }
        let confusion_matrix = confusion(test_data, &predictions);
        Ok(EvalResult { loss, metrics, predictions, confusion_matrix })
    }

    fn failed(&self, run_id: RunId, epoch: u32, reason: String) -> LifecycleError {
        warn!(%run_id, epoch, %reason, "training failed");
        if let Err(e) = self.tracker.set_tag(run_id, "error", &reason).and_then(|_| self.tracker.set_tag(run_id, "failed_epoch", epoch)) {
            warn!(%run_id, error = %e, "could not tag failed run");
        }
        self.close(run_id, RunStatus::Failed);
        LifecycleError::TrainingFailed { run_id, epoch, reason }
    }

    fn cancelled(&self, run_id: RunId, epoch: u32) -> LifecycleError {
        info!(%run_id, epoch, "training cancelled");
        self.close(run_id, RunStatus::Cancelled);
        LifecycleError::TrainingCancelled { run_id, epoch }
    }

    fn close(&self, run_id: RunId, status: RunStatus) {
        // a run ended elsewhere has nothing left to close
        if let Err(e) = self.tracker.end_run(run_id, status) { debug!(%run_id, error = %e, "run already closed"); }
        LIFECYCLE_METRICS.training_runs_total.add(1, &[KeyValue::new("outcome", status.as_str())]);
    }
}

/// Run CPU-bound work without stalling the other tasks of a multi-thread runtime.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

fn class_id(prediction: &Value) -> Option<usize> {
    let v = prediction.get("class_id").or_else(|| prediction.get("label")).unwrap_or(prediction);
    v.as_u64().map(|c| c as usize).or_else(|| v.as_bool().map(usize::from))
}

fn confusion(data: &Dataset, predictions: &[Value]) -> Option<Vec<Vec<u64>>> {
    let mut pairs = Vec::with_capacity(predictions.len());
    for (example, prediction) in data.examples().iter().zip(predictions) {
        let t = example.target;
        if t < 0.0 || t.fract() != 0.0 { return None; }
        pairs.push((t as usize, class_id(prediction)?));
    }
    let classes = pairs.iter().map(|(a, p)| a.max(p) + 1).max()?;
    if classes > MAX_CONFUSION_CLASSES { return None; }
    let mut matrix = vec![vec![0u64; classes]; classes];
    for (actual, predicted) in pairs { matrix[actual][predicted] += 1; }
    Some(matrix)
}

fn run_epoch(model: &mut dyn Trainable, train: &Dataset, validation: Option<&Dataset>, config: &TrainConfig, epoch: u32) -> Result<Metrics, ModelError> {
    let (mut weighted, mut seen) = (0.0, 0usize);
    for batch in train.batches(config.batch_size, epoch) {
        let loss = model.train_step(&batch, config.learning_rate)?;
        if !loss.is_finite() { return Err(ModelError::Divergence(loss)); }
        weighted += loss * batch.len() as f64;
        seen += batch.len();
    }
    let mut metrics = Metrics::from([("train_loss".to_string(), weighted / seen.max(1) as f64)]);
    if let Some(val) = validation {
        for (name, value) in model.evaluate(val.examples())? {
            if !value.is_finite() && name == "loss" { return Err(ModelError::Divergence(value)); }
            metrics.insert(format!("val_{name}"), value);
        }
    }
    Ok(metrics)
}

/// Save through a temp file and rename, so a partial artifact is never visible.
async fn checkpoint(model: &dyn Trainable, dir: &Path) -> LifecycleResult<(PathBuf, String)> {
    let io = |e: std::io::Error| LifecycleError::artifact_io(dir.display().to_string(), e);
    tokio::fs::create_dir_all(dir).await.map_err(io)?;
    let tmp = dir.join(format!("{CHECKPOINT_FILE}.tmp"));
    let path = dir.join(CHECKPOINT_FILE);
    model.save(&tmp).await.map_err(|e| LifecycleError::artifact_io(tmp.display().to_string(), e))?;
    tokio::fs::rename(&tmp, &path).await.map_err(io)?;
    let bytes = tokio::fs::read(&path).await.map_err(io)?;
    Ok((path, hex::encode(Sha256::digest(&bytes))))
}

async fn remove_checkpoint(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound { warn!(dir = %dir.display(), error = %e, "could not remove checkpoint"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Example, Model, ModelInfo, RawPrediction, Tensor};
    use crate::models::LogisticRegression;
    use crate::registry::RegistryConfig;
    use crate::training::tracker::TrackerConfig;
    use async_trait::async_trait;

    /// Reports losses from a script, one entry per epoch.
    struct Scripted {
        losses: Vec<f64>,
        step: usize,
        /// Ends every running run from inside `train_step`.
        interfere: Option<Arc<ExperimentTracker>>,
    }

    impl Scripted {
        fn new(losses: Vec<f64>) -> Self { Self { losses, step: 0, interfere: None } }
    }

    #[async_trait]
    impl Model for Scripted {
        fn kind(&self) -> &str { "scripted" }
        async fn load(&mut self, _: &str) -> Result<(), ModelError> { Ok(()) }
        async fn predict(&self, _: &Tensor) -> Result<RawPrediction, ModelError> { Err(ModelError::NotLoaded) }
        fn is_loaded(&self) -> bool { true }
        fn info(&self) -> ModelInfo { ModelInfo { kind: "scripted".into(), input_dim: None, is_loaded: true, location: None } }
    }

    #[async_trait]
    impl Trainable for Scripted {
        fn train_step(&mut self, _: &[Example], _: f64) -> Result<f64, ModelError> {
            let loss = self.losses[self.step.min(self.losses.len() - 1)];
            self.step += 1;
            if let Some(tracker) = &self.interfere {
                for run in tracker.list_runs(None, Some(RunStatus::Running)) { tracker.end_run(run.run_id, RunStatus::Cancelled).unwrap(); }
            }
            if loss.is_nan() { return Err(ModelError::Divergence(loss)); }
            Ok(loss)
        }
        fn evaluate(&self, _: &[Example]) -> Result<Metrics, ModelError> {
            Ok(Metrics::from([("loss".to_string(), self.losses[self.step.saturating_sub(1).min(self.losses.len() - 1)])]))
        }
        async fn save(&self, path: &Path) -> Result<(), ModelError> {
            tokio::fs::write(path, serde_json::to_vec(&self.losses)?).await?;
            Ok(())
        }
    }

    fn fixture(root: &Path) -> Trainer {
        Trainer::new(
            Arc::new(ModelRegistry::new(RegistryConfig::default())),
            Arc::new(ExperimentTracker::new(TrackerConfig::default())),
            TrainerSettings { artifact_root: root.to_path_buf() },
        )
    }

    fn data() -> Dataset { Dataset::new(vec![Example::new(vec![0.0], 0.0); 4]) }

    fn one_batch(epochs: u32) -> TrainConfig { TrainConfig { epochs, batch_size: 4, learning_rate: 0.1, ..Default::default() } }

    #[tokio::test]
    async fn completed_run_registers_staging_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted::new(vec![0.9, 0.5, 0.3]);
        let res = trainer.train(&mut model, &TrainJob::new("m", "scripted"), &data(), &one_batch(3), Some(&data())).await.unwrap();
        assert_eq!(res.epochs_completed, 3);
        assert_eq!(res.best_epoch, Some(3));
        assert_eq!(res.history["train_loss"], vec![0.9, 0.5, 0.3]);
        assert_eq!(res.registered_version.stage, Stage::Staging);
        assert!(res.artifact_path.ends_with(format!("m/{}/model.json", res.run_id)));
        assert!(res.artifact_path.exists());
        assert_eq!(res.registered_version.metadata["sha256"].len(), 64);
        let run = trainer.tracker().get_run(res.run_id).unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.parameters["epochs"], "3");
        assert_eq!(run.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn divergence_fails_run_without_registering() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted::new(vec![0.9, f64::NAN]);
        let err = trainer.train(&mut model, &TrainJob::new("m", "scripted"), &data(), &one_batch(5), None).await.unwrap_err();
        let (run_id, epoch) = match err {
            LifecycleError::TrainingFailed { run_id, epoch, .. } => (run_id, epoch),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(epoch, 2);
        let run = trainer.tracker().get_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.tags["failed_epoch"], "2");
        assert!(trainer.registry.list_versions("m").is_empty());
        assert!(!dir.path().join("m").join(run_id.to_string()).exists());
    }

    #[tokio::test]
    async fn cancelled_before_first_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let flag = CancellationFlag::new();
        flag.cancel();
        let job = TrainJob::new("m", "scripted").with_cancellation(flag);
        let mut model = Scripted::new(vec![0.5]);
        let err = trainer.train(&mut model, &job, &data(), &one_batch(3), None).await.unwrap_err();
        let (run_id, epoch) = match err {
            LifecycleError::TrainingCancelled { run_id, epoch } => (run_id, epoch),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(epoch, 0);
        assert_eq!(trainer.tracker().get_run(run_id).unwrap().status, RunStatus::Cancelled);
        assert!(trainer.registry.list_versions("m").is_empty());
    }

    #[tokio::test]
    async fn min_delta_counts_small_gains_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted::new(vec![1.0, 0.99, 0.98, 0.97]);
        let cfg = TrainConfig { patience: 2, min_delta: 0.05, ..one_batch(10) };
        let res = trainer.train(&mut model, &TrainJob::new("m", "scripted"), &data(), &cfg, None).await.unwrap();
        assert!(res.stopped_early);
        assert_eq!((res.best_epoch, res.epochs_completed), (Some(1), 3));
    }

    #[tokio::test]
    async fn bad_config_and_empty_data_are_rejected_before_a_run_starts() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted::new(vec![0.5]);
        let job = TrainJob::new("m", "scripted");
        assert!(matches!(trainer.train(&mut model, &job, &data(), &one_batch(0), None).await, Err(LifecycleError::InvalidConfig(_))));
        assert!(matches!(trainer.train(&mut model, &job, &Dataset::default(), &one_batch(1), None).await, Err(LifecycleError::InvalidInput(_))));
        assert!(trainer.tracker().list_runs(None, None).is_empty());
    }

    #[tokio::test]
    async fn split_that_leaves_no_training_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted::new(vec![0.5]);
        let single = Dataset::new(vec![Example::new(vec![0.0], 0.0)]);
        let cfg = TrainConfig { validation_split: 0.5, ..one_batch(3) };
        let err = trainer.train(&mut model, &TrainJob::new("m", "scripted"), &single, &cfg, None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidInput(_)));
        assert_eq!(model.step, 0);
        assert!(trainer.tracker().list_runs(None, None).is_empty());
        assert!(trainer.registry.list_versions("m").is_empty());
    }

    #[tokio::test]
    async fn run_ended_elsewhere_fails_training() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted { interfere: Some(trainer.tracker().clone()), ..Scripted::new(vec![0.5, 0.4]) };
        let err = trainer.train(&mut model, &TrainJob::new("m", "scripted"), &data(), &one_batch(3), None).await.unwrap_err();
        let (run_id, epoch) = match err {
            LifecycleError::TrainingFailed { run_id, epoch, .. } => (run_id, epoch),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(epoch, 1);
        assert_eq!(trainer.tracker().get_run(run_id).unwrap().status, RunStatus::Cancelled);
        assert!(trainer.registry.list_versions("m").is_empty());
        assert!(!dir.path().join("m").join(run_id.to_string()).exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trains_on_multi_thread_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = Scripted::new(vec![0.9, 0.5]);
        let res = trainer.train(&mut model, &TrainJob::new("m", "scripted"), &data(), &one_batch(2), None).await.unwrap();
        assert_eq!(res.history["train_loss"], vec![0.9, 0.5]);
    }

    fn separable(n: usize) -> Dataset {
        Dataset::new((0..n).map(|i| {
            let x = i as f32 / n as f32 * 4.0 - 2.0;
            Example::new(vec![x], if x > 0.0 { 1.0 } else { 0.0 })
        }).collect())
    }

    #[tokio::test]
    async fn fine_tune_warm_starts_from_registered_version() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let cfg = TrainConfig { epochs: 20, batch_size: 8, learning_rate: 0.5, early_stopping: false, ..Default::default() };
        let mut cold = LogisticRegression::new(1);
        let base = trainer.train(&mut cold, &TrainJob::new("m", LogisticRegression::KIND), &separable(40), &cfg, None).await.unwrap();

        let mut warm = LogisticRegression::unloaded();
        let tuned = trainer
            .fine_tune(&mut warm, &base.registered_version, &TrainJob::new("m", LogisticRegression::KIND), &separable(40), &TrainConfig { epochs: 2, ..cfg }, None)
            .await
            .unwrap();
        assert!(tuned.history["train_loss"][0] < base.history["train_loss"][0]);
        assert_eq!(tuned.registered_version.version, 2);
        assert_eq!(tuned.registered_version.stage, Stage::Staging);
        assert_eq!(tuned.registered_version.metadata[FINE_TUNED_FROM_KEY], "m@1");
        assert_eq!(trainer.tracker().get_run(tuned.run_id).unwrap().parameters["base_version"], "m@1");
    }

    #[tokio::test]
    async fn load_checkpoint_checks_kind_and_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = LogisticRegression::new(1);
        let res = trainer.train(&mut model, &TrainJob::new("m", LogisticRegression::KIND), &separable(8), &one_batch(1), None).await.unwrap();
        let version = res.registered_version;

        let mut wrong_kind = Scripted::new(vec![0.5]);
        assert!(matches!(trainer.load_checkpoint(&mut wrong_kind, &version).await, Err(LifecycleError::InvalidInput(_))));

        let mut fresh = LogisticRegression::unloaded();
        assert_eq!(trainer.load_checkpoint(&mut fresh, &version).await.unwrap()["run_id"], res.run_id.to_string());
        assert!(fresh.is_loaded());

        std::fs::write(&version.artifact_location, b"{}").unwrap();
        let err = trainer.load_checkpoint(&mut LogisticRegression::unloaded(), &version).await.unwrap_err();
        assert!(matches!(err, LifecycleError::ChecksumMismatch { .. }));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn detailed_evaluation_builds_confusion_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let mut model = LogisticRegression::new(1);
        let data = separable(20);
        for _ in 0..200 { model.train_step(data.examples(), 1.0).unwrap(); }
        let eval = trainer.evaluate_detailed(&model, &data).await.unwrap();
        assert_eq!(eval.predictions.len(), 20);
        assert_eq!(eval.loss, eval.metrics["loss"]);
        let matrix = eval.confusion_matrix.unwrap();
        assert_eq!(matrix.len(), 2);
        assert_eq!(matrix.iter().flatten().sum::<u64>(), 20);
        assert_eq!(matrix[0][0] + matrix[1][1], (eval.metrics["accuracy"] * 20.0).round() as u64);
    }

    #[test]
    fn confusion_needs_integral_targets() {
        let data = Dataset::new(vec![Example::new(vec![0.0], 0.5)]);
        assert!(confusion(&data, &[serde_json::json!({"label": 0})]).is_none());
        let data = Dataset::new(vec![Example::new(vec![0.0], 2.0), Example::new(vec![0.0], 0.0)]);
        let m = confusion(&data, &[serde_json::json!({"class_id": 1}), serde_json::json!(0)]).unwrap();
        assert_eq!(m, vec![vec![1, 0, 0], vec![0, 0, 0], vec![0, 1, 0]]);
    }

    #[test]
    fn evaluate_is_pure() {
        let dir = tempfile::tempdir().unwrap();
        let trainer = fixture(dir.path());
        let model = Scripted::new(vec![0.25]);
        assert_eq!(trainer.evaluate(&model, &data()).unwrap()["loss"], 0.25);
        assert!(trainer.evaluate(&model, &Dataset::default()).is_err());
    }
}
