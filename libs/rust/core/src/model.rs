//! Model capability contracts and the kind → constructor catalog.
//!
//! Serving and training only see these traits; concrete variants live in `models/`.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{LifecycleError, LifecycleResult};
use crate::preprocessing::Preprocessor;

/// Dense, row-major model input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, ModelError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(ModelError::Shape { expected: vec![expected], got: vec![data.len()] });
        }
        Ok(Self { shape, data })
    }

    pub fn vector(data: Vec<f32>) -> Self { Self { shape: vec![data.len()], data } }

    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }
}

/// One supervised training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub features: Tensor,
    pub target: f32,
}

impl Example {
    pub fn new(features: Vec<f32>, target: f32) -> Self { Self { features: Tensor::vector(features), target } }
}

/// What a model returns before the service attaches name/version.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPrediction {
    pub prediction: serde_json::Value,
    pub confidence: Option<f64>,
}

pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ModelError {
    #[error("model not loaded")]
    NotLoaded,
    #[error("artifact io: {0}")]
    Io(String),
    #[error("artifact format: {0}")]
    Format(String),
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    Shape { expected: Vec<usize>, got: Vec<usize> },
    #[error("malformed batch: {0}")]
    MalformedBatch(String),
    #[error("numeric divergence: loss={0}")]
    Divergence(f64),
}

impl From<std::io::Error> for ModelError {
    fn from(e: std::io::Error) -> Self { ModelError::Io(e.to_string()) }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self { ModelError::Format(e.to_string()) }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub kind: String,
    pub input_dim: Option<usize>,
    pub is_loaded: bool,
    pub location: Option<String>,
}

#[async_trait]
pub trait Model: Send + Sync {
    fn kind(&self) -> &str;

    /// Read weights from `location`. Called once per cached version.
    async fn load(&mut self, location: &str) -> Result<(), ModelError>;

    async fn predict(&self, input: &Tensor) -> Result<RawPrediction, ModelError>;

    fn is_loaded(&self) -> bool;

    fn info(&self) -> ModelInfo;
}

/// A model that can be fitted in-process.
#[async_trait]
pub trait Trainable: Model {
    /// One optimisation step over `batch`; returns the mean batch loss.
    fn train_step(&mut self, batch: &[Example], learning_rate: f64) -> Result<f64, ModelError>;

    /// Pure evaluation; must report at least `loss`.
    fn evaluate(&self, examples: &[Example]) -> Result<Metrics, ModelError>;

    /// Write a loadable artifact to `path`.
    async fn save(&self, path: &Path) -> Result<(), ModelError>;
}

pub type ModelConstructor = Arc<dyn Fn() -> Box<dyn Model> + Send + Sync>;

#[derive(Clone)]
pub struct CatalogEntry {
    pub constructor: ModelConstructor,
    pub preprocessor: Arc<dyn Preprocessor>,
}

/// Maps a registered version's `kind` to how it is built and fed.
#[derive(Clone, Default)]
pub struct ModelCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl ModelCatalog {
    pub fn new() -> Self { Self::default() }

    pub fn with<F>(mut self, kind: &str, constructor: F, preprocessor: Arc<dyn Preprocessor>) -> Self
    where F: Fn() -> Box<dyn Model> + Send + Sync + 'static {
        self.insert(kind, constructor, preprocessor);
        self
    }

    pub fn insert<F>(&mut self, kind: &str, constructor: F, preprocessor: Arc<dyn Preprocessor>)
    where F: Fn() -> Box<dyn Model> + Send + Sync + 'static {
        self.entries.insert(kind.to_string(), CatalogEntry { constructor: Arc::new(constructor), preprocessor });
    }

    pub fn entry(&self, kind: &str) -> LifecycleResult<&CatalogEntry> {
        self.entries.get(kind).ok_or_else(|| LifecycleError::UnknownModelKind(kind.to_string()))
    }
}
