//! Line-oriented inference gateway.
//!
//! Bootstraps a registry, trains and promotes the demo `churn` classifier, publishes a
//! two-class `brightness` image classifier, then answers
//! one JSON request per stdin line with one JSON response per stdout line:
//! `{"model": "churn", "input": {...}, "version": 2, "stage": "staging"}`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use mlops_core::models::{CentroidClassifier, LogisticRegression};
use mlops_core::preprocessing::{ImageConfig, ImagePreprocessor, Preprocessor, TabularPreprocessor, PREPROCESSOR_METADATA_KEY};
use mlops_core::{
    init_tracing, retry_retriable, Dataset, ExperimentTracker, InferenceService, LifecycleConfig, MemoryStore, ModelCatalog, ModelRegistry,
    ModelVersion, Stage, TrainJob, Trainer,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

const SERVICE: &str = "model-gateway";
const CHURN_FEATURES: [&str; 2] = ["tenure", "spend"];

#[derive(Debug, Deserialize)]
struct Request {
    model: String,
    input: Value,
    version: Option<u32>,
    stage: Option<Stage>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let file = std::env::var("MLOPS_CONFIG_FILE").ok().map(PathBuf::from);
    let cfg = LifecycleConfig::load(file.as_deref())?;
    init_tracing(cfg.service_name.as_deref().unwrap_or(SERVICE), cfg.json_logs)?;
    info!(?cfg, "config_loaded");

    let store = Arc::new(MemoryStore::<ModelVersion>::new());
    let registry = Arc::new(ModelRegistry::open(cfg.registry.clone(), store).await?);
    let tracker = Arc::new(ExperimentTracker::new(cfg.tracker.clone()));
    let trainer = Trainer::new(registry.clone(), tracker.clone(), cfg.trainer.clone());

    let tabular: Arc<dyn Preprocessor> = Arc::new(TabularPreprocessor::new(CHURN_FEATURES));
    let image: Arc<dyn Preprocessor> = Arc::new(ImagePreprocessor::new(ImageConfig { target_size: (8, 8), ..Default::default() })?);
    let catalog = Arc::new(
        ModelCatalog::new()
            .with(LogisticRegression::KIND, || Box::new(LogisticRegression::unloaded()), tabular.clone())
            .with(CentroidClassifier::KIND, || Box::new(CentroidClassifier::unloaded()), image.clone()),
    );

    bootstrap_churn(&trainer, &registry, tabular.as_ref(), &cfg).await?;
    bootstrap_brightness(&registry, image.as_ref(), &cfg).await?;
    let service = InferenceService::new(registry.clone(), catalog, cfg.inference.clone());
    info!(models = ?service.available_models(), "gateway ready");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() { continue; }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(req) => {
                let out = retry_retriable(&cfg.retry, |_| service.predict(&req.model, &req.input, req.version, req.stage)).await;
                match out {
                    Ok(result) => serde_json::to_value(&result)?,
                    Err(e) => {
                        warn!(model = %req.model, error = %e, "request failed");
                        json!({"error": e.to_string(), "kind": format!("{:?}", e.kind())})
                    }
                }
            }
            Err(e) => json!({"error": format!("malformed request: {e}"), "kind": "InvalidInput"}),
        };
        stdout.write_all(format!("{response}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    info!("stdin closed, shutdown");
    Ok(())
}

/// Train the demo churn model and promote it so there is something to serve.
async fn bootstrap_churn(trainer: &Trainer, registry: &ModelRegistry, pre: &dyn Preprocessor, cfg: &LifecycleConfig) -> Result<()> {
    let records: Vec<(Value, f32)> = (0..200)
        .map(|i| {
            let (tenure, spend) = ((i % 20) as f64 / 20.0, (i % 13) as f64 / 13.0);
            (json!({"tenure": tenure, "spend": spend}), if tenure + spend > 1.0 { 1.0 } else { 0.0 })
        })
        .collect();
    let (train, validation) = Dataset::from_records(pre, &records)?.with_shuffle(7).split(0.2)?;
    let job = TrainJob::new("churn", LogisticRegression::KIND).experiment("churn-bootstrap").preprocessor(pre);
    let mut model = LogisticRegression::new(CHURN_FEATURES.len());
    let result = trainer.train(&mut model, &job, &train, &cfg.training, Some(&validation)).await.context("bootstrap training")?;
    registry.set_stage("churn", result.registered_version.version, Stage::Production).await?;
    info!(run_id = %result.run_id, version = result.registered_version.version, epochs = result.epochs_completed, final_loss = result.final_loss, "churn model promoted");
    Ok(())
}

/// Publish a fixed dark/light centroid classifier straight to production.
async fn bootstrap_brightness(registry: &ModelRegistry, pre: &dyn Preprocessor, cfg: &LifecycleConfig) -> Result<()> {
    let dim = pre.output_len();
    let model = CentroidClassifier::from_parts(vec!["dark".into(), "light".into()], vec![vec![0.0; dim], vec![1.0; dim]], 0.1)?;
    let dir = cfg.trainer.artifact_root.join("brightness").join("bootstrap");
    tokio::fs::create_dir_all(&dir).await.with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join("model.json");
    model.write_artifact(&path).await?;
    let metadata = BTreeMap::from([(PREPROCESSOR_METADATA_KEY.to_string(), pre.fingerprint())]);
    let version = registry
        .register_with_metadata("brightness", CentroidClassifier::KIND, &path.to_string_lossy(), Stage::Production, metadata)
        .await?;
    info!(version = version.version, dim, "brightness model published");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlops_core::{InferenceConfig, TrainerSettings};

    #[tokio::test]
    async fn brightness_model_is_servable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = LifecycleConfig { trainer: TrainerSettings { artifact_root: dir.path().to_path_buf() }, ..Default::default() };
        let registry = Arc::new(ModelRegistry::default());
        let image: Arc<dyn Preprocessor> = Arc::new(ImagePreprocessor::new(ImageConfig { target_size: (8, 8), ..Default::default() }).unwrap());
        bootstrap_brightness(&registry, image.as_ref(), &cfg).await.unwrap();

        let catalog = Arc::new(ModelCatalog::new().with(CentroidClassifier::KIND, || Box::new(CentroidClassifier::unloaded()), image));
        let service = InferenceService::new(registry, catalog, InferenceConfig::default());
        assert_eq!(service.available_models(), vec!["brightness".to_string()]);
        let dark = json!({"width": 2, "height": 2, "channels": 1, "pixels": [0, 0, 0, 0]});
        let light = json!({"width": 2, "height": 2, "channels": 1, "pixels": [255, 255, 255, 255]});
        assert_eq!(service.predict("brightness", &dark, None, None).await.unwrap().prediction["label"], "dark");
        assert_eq!(service.predict("brightness", &light, None, None).await.unwrap().prediction["label"], "light");
    }
}
