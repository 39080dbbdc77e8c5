//! Nearest-centroid image classifier.
//!
//! Each class is a centroid in the preprocessed feature space; confidence is the softmax
//! of negative mean squared distances. Artifact: JSON
//! `{"format": "centroid/v1", "labels": [...], "centroids": [[...]], "temperature": t}`.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{Model, ModelError, ModelInfo, RawPrediction, Tensor};

const FORMAT: &str = "centroid/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Artifact {
    format: String,
    labels: Vec<String>,
    centroids: Vec<Vec<f32>>,
    temperature: f32,
}

#[derive(Debug, Clone, Default)]
pub struct CentroidClassifier {
    labels: Vec<String>,
    centroids: Vec<Vec<f32>>,
    temperature: f32,
    loaded: bool,
    location: Option<String>,
}

impl CentroidClassifier {
    pub const KIND: &'static str = "image-centroid";

    pub fn unloaded() -> Self { Self { temperature: 1.0, ..Default::default() } }

    pub fn from_parts(labels: Vec<String>, centroids: Vec<Vec<f32>>, temperature: f32) -> Result<Self, ModelError> {
        validate(&labels, &centroids, temperature)?;
        Ok(Self { labels, centroids, temperature, loaded: true, location: None })
    }

    pub fn class_labels(&self) -> &[String] { &self.labels }

    /// Write this classifier as a loadable artifact.
    pub async fn write_artifact(&self, path: &Path) -> Result<(), ModelError> {
        let art = Artifact { format: FORMAT.into(), labels: self.labels.clone(), centroids: self.centroids.clone(), temperature: self.temperature };
        tokio::fs::write(path, serde_json::to_vec(&art)?).await?;
        Ok(())
    }
}

fn validate(labels: &[String], centroids: &[Vec<f32>], temperature: f32) -> Result<(), ModelError> {
    if labels.is_empty() || labels.len() != centroids.len() {
        return Err(ModelError::Format(format!("{} labels for {} centroids", labels.len(), centroids.len())));
    }
    let dim = centroids[0].len();
    if dim == 0 || centroids.iter().any(|c| c.len() != dim || c.iter().any(|v| !v.is_finite())) {
        return Err(ModelError::Format("centroids must share a non-zero dimension and be finite".into()));
    }
    if !(temperature.is_finite() && temperature > 0.0) {
        return Err(ModelError::Format("temperature must be positive".into()));
    }
    Ok(())
}

#[async_trait]
impl Model for CentroidClassifier {
    fn kind(&self) -> &str { Self::KIND }

    async fn load(&mut self, location: &str) -> Result<(), ModelError> {
        let art: Artifact = serde_json::from_slice(&tokio::fs::read(location).await?)?;
        if art.format != FORMAT { return Err(ModelError::Format(format!("expected {FORMAT}, found {}", art.format))); }
        validate(&art.labels, &art.centroids, art.temperature)?;
        self.labels = art.labels;
        self.centroids = art.centroids;
        self.temperature = art.temperature;
        self.loaded = true;
        self.location = Some(location.to_string());
        Ok(())
    }

    async fn predict(&self, input: &Tensor) -> Result<RawPrediction, ModelError> {
        if !self.loaded { return Err(ModelError::NotLoaded); }
        let dim = self.centroids[0].len();
        if input.len() != dim { return Err(ModelError::Shape { expected: vec![dim], got: input.shape.clone() }); }
        let logits: Vec<f32> = self
            .centroids
            .iter()
            .map(|c| -c.iter().zip(&input.data).map(|(a, b)| (a - b).powi(2)).sum::<f32>() / dim as f32 / self.temperature)
            .collect();
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();
        let (class_id, best) = exps
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |acc, (i, e)| if *e > acc.1 { (i, *e) } else { acc });
        Ok(RawPrediction {
            prediction: json!({ "label": self.labels[class_id], "class_id": class_id }),
            confidence: Some((best / total) as f64),
        })
    }

    fn is_loaded(&self) -> bool { self.loaded }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            kind: Self::KIND.to_string(),
            input_dim: self.centroids.first().map(Vec::len),
            is_loaded: self.loaded,
            location: self.location.clone(),
        }
    }
}
