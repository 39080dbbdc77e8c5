//! Offline training: datasets, the epoch loop and experiment tracking.

pub mod dataset;
pub mod tracker;
pub mod trainer;

pub use dataset::{Batches, Dataset};
pub use tracker::{ExperimentRun, ExperimentTracker, MetricPoint, RunId, RunStatus, TrackerConfig};
pub use trainer::{CancellationFlag, EvalResult, TrainConfig, TrainJob, TrainResult, Trainer, TrainerSettings};
