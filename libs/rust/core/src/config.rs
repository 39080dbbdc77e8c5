//! Layered configuration: built-in defaults → optional YAML/TOML/JSON file → `MLOPS__*`
//! environment variables (`__` separates nesting, e.g. `MLOPS__INFERENCE__CACHE__CAPACITY=4`).
//!
//! Only binaries call [`LifecycleConfig::load`]; the library takes the per-component
//! structs through constructors.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::registry::RegistryConfig;
use crate::resilience::RetryConfig;
use crate::serving::InferenceConfig;
use crate::training::{TrackerConfig, TrainConfig, TrainerSettings};

pub const ENV_PREFIX: &str = "MLOPS";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub service_name: Option<String>,
    pub json_logs: bool,
    pub registry: RegistryConfig,
    pub inference: InferenceConfig,
    pub tracker: TrackerConfig,
    pub trainer: TrainerSettings,
    /// Defaults for jobs that do not bring their own.
    pub training: TrainConfig,
    pub retry: RetryConfig,
}

impl LifecycleConfig {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(file, ENV_PREFIX)
    }

    fn load_with_prefix(file: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(config::Environment::with_prefix(prefix).prefix_separator("__").separator("__").try_parsing(true));
        let cfg: LifecycleConfig = builder
            .build()
            .context("reading configuration sources")?
            .try_deserialize()
            .context("decoding lifecycle configuration")?;
        cfg.training.validate().context("training defaults")?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DemotionTarget, Stage};

    #[test]
    fn defaults_without_sources() {
        let cfg = LifecycleConfig::load_with_prefix(None, "MLOPS_TEST_NONE").unwrap();
        assert_eq!(cfg.inference.default_stage, Stage::Production);
        assert_eq!(cfg.inference.cache.capacity, 8);
        assert_eq!(cfg.registry.demote_to, DemotionTarget::Archived);
        assert!(!cfg.tracker.single_active_run);
        assert_eq!(cfg.training.epochs, 10);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.yaml");
        std::fs::write(
            &path,
            "registry:\n  demote_to: staging\ninference:\n  default_stage: staging\n  cache:\n    capacity: 2\ntrainer:\n  artifact_root: /var/models\ntraining:\n  patience: 2\n",
        )
        .unwrap();
        let cfg = LifecycleConfig::load_with_prefix(Some(&path), "MLOPS_TEST_FILE").unwrap();
        assert_eq!(cfg.registry.demote_to, DemotionTarget::Staging);
        assert_eq!(cfg.inference.default_stage, Stage::Staging);
        assert_eq!(cfg.inference.cache.capacity, 2);
        assert_eq!(cfg.trainer.artifact_root, std::path::PathBuf::from("/var/models"));
        assert_eq!(cfg.training.patience, 2);
    }

    #[test]
    fn environment_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.yaml");
        std::fs::write(&path, "tracker:\n  single_active_run: false\n").unwrap();
        std::env::set_var("MLOPS_TEST_ENV__TRACKER__SINGLE_ACTIVE_RUN", "true");
        let cfg = LifecycleConfig::load_with_prefix(Some(&path), "MLOPS_TEST_ENV").unwrap();
        std::env::remove_var("MLOPS_TEST_ENV__TRACKER__SINGLE_ACTIVE_RUN");
        assert!(cfg.tracker.single_active_run);
    }

    #[test]
    fn invalid_training_defaults_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "training:\n  epochs: 0\n").unwrap();
        assert!(LifecycleConfig::load_with_prefix(Some(&path), "MLOPS_TEST_BAD").is_err());
    }
}
