//! Core of the model lifecycle engine: registry, serving, training and tracking.

use anyhow::Result;
use once_cell::sync::{Lazy, OnceCell};
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

pub mod config;
pub mod error;
pub mod model;
pub mod models;
pub mod preprocessing;
pub mod registry;
pub mod resilience;
pub mod serving;
pub mod store;
pub mod training;

pub use config::LifecycleConfig;
pub use error::{ErrorKind, LifecycleError, LifecycleResult};
pub use model::{Example, Metrics, Model, ModelCatalog, ModelError, RawPrediction, Tensor, Trainable};
pub use registry::{DemotionTarget, ModelRegistry, ModelVersion, RegistryConfig, Stage};
pub use resilience::{retry_retriable, RetryConfig};
pub use serving::{InferenceConfig, InferenceService, ModelHealth, PredictionResult};
pub use store::{MemoryStore, Record, RecordFilter, RecordStore};
pub use training::{CancellationFlag, Dataset, EvalResult, ExperimentTracker, RunId, RunStatus, TrainConfig, TrainJob, TrainResult, Trainer, TrainerSettings};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

#[derive(Clone, Debug)]
pub struct LifecycleMetrics {
    pub registrations_total: Counter<u64>,
    pub promotions_total: Counter<u64>,
    pub predictions_total: Counter<u64>,
    pub prediction_errors_total: Counter<u64>,
    pub prediction_latency_ms: Histogram<f64>,
    pub model_loads_total: Counter<u64>,
    pub model_load_failures_total: Counter<u64>,
    pub cache_hits_total: Counter<u64>,
    pub cache_evictions_total: Counter<u64>,
    pub training_runs_total: Counter<u64>,
    pub training_epochs_total: Counter<u64>,
}

static LIFECYCLE_METER: Lazy<Meter> = Lazy::new(|| global::meter("mlops_lifecycle"));

pub static LIFECYCLE_METRICS: Lazy<LifecycleMetrics> = Lazy::new(|| LifecycleMetrics {
    registrations_total: LIFECYCLE_METER.u64_counter("mlops_registry_registrations_total")
        .with_description("Model versions registered")
        .build(),
    promotions_total: LIFECYCLE_METER.u64_counter("mlops_registry_promotions_total")
        .with_description("Versions moved to production")
        .build(),
    predictions_total: LIFECYCLE_METER.u64_counter("mlops_predictions_total")
        .with_description("Successful predictions (batch items counted individually)")
        .build(),
    prediction_errors_total: LIFECYCLE_METER.u64_counter("mlops_prediction_errors_total")
        .with_description("Failed prediction calls by error family")
        .build(),
    prediction_latency_ms: LIFECYCLE_METER.f64_histogram("mlops_prediction_latency_ms")
        .with_description("Latency of a predict call including load on miss (ms)")
        .with_unit("ms")
        .build(),
    model_loads_total: LIFECYCLE_METER.u64_counter("mlops_model_loads_total")
        .with_description("Model instances loaded into the serving cache")
        .build(),
    model_load_failures_total: LIFECYCLE_METER.u64_counter("mlops_model_load_failures_total")
        .with_description("Failed model loads")
        .build(),
    cache_hits_total: LIFECYCLE_METER.u64_counter("mlops_cache_hits_total")
        .with_description("Predictions served by an already loaded instance")
        .build(),
    cache_evictions_total: LIFECYCLE_METER.u64_counter("mlops_cache_evictions_total")
        .with_description("Idle instances evicted by LRU")
        .build(),
    training_runs_total: LIFECYCLE_METER.u64_counter("mlops_training_runs_total")
        .with_description("Finished training runs by outcome")
        .build(),
    training_epochs_total: LIFECYCLE_METER.u64_counter("mlops_training_epochs_total")
        .with_description("Completed training epochs")
        .build(),
});

/// Install the global subscriber once: `EnvFilter` (RUST_LOG, default `info`) plus a plain
/// or JSON fmt layer.
pub fn init_tracing(service: &str, json: bool) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let fmt_layer = if json {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
                .boxed()
        };
        tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "mlops_core", service, json, "tracing initialized");
    Ok(())
}
