//! Binary logistic regression over dense tabular features.
//!
//! Artifact: JSON `{"format": "logistic/v1", "weights": [...], "bias": b, "threshold": t}`.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::model::{Example, Metrics, Model, ModelError, ModelInfo, RawPrediction, Tensor, Trainable};

const FORMAT: &str = "logistic/v1";
const EPS: f64 = 1e-12;

#[derive(Debug, Serialize, Deserialize)]
struct Artifact {
    format: String,
    weights: Vec<f64>,
    bias: f64,
    threshold: f64,
}

#[derive(Debug, Clone)]
pub struct LogisticRegression {
    weights: Vec<f64>,
    bias: f64,
    threshold: f64,
    loaded: bool,
    location: Option<String>,
}

impl LogisticRegression {
    pub const KIND: &'static str = "logistic";

    /// Fresh zero-initialised model ready for training.
    pub fn new(input_dim: usize) -> Self {
        Self { weights: vec![0.0; input_dim], bias: 0.0, threshold: 0.5, loaded: true, location: None }
    }

    /// Empty shell for the serving catalog; weights arrive through `load`.
    pub fn unloaded() -> Self { Self { weights: Vec::new(), bias: 0.0, threshold: 0.5, loaded: false, location: None } }

    fn check_input(&self, x: &[f32]) -> Result<(), ModelError> {
        if x.len() != self.weights.len() {
            return Err(ModelError::Shape { expected: vec![self.weights.len()], got: vec![x.len()] });
        }
        Ok(())
    }

    fn probability(&self, x: &[f32]) -> f64 {
        let z: f64 = self.bias + self.weights.iter().zip(x).map(|(w, v)| w * *v as f64).sum::<f64>();
        1.0 / (1.0 + (-z).exp())
    }

    fn check_examples(&self, examples: &[Example]) -> Result<(), ModelError> {
        if examples.is_empty() { return Err(ModelError::MalformedBatch("empty batch".into())); }
        for (i, ex) in examples.iter().enumerate() {
            if ex.features.len() != self.weights.len() {
                return Err(ModelError::MalformedBatch(format!("example {i}: {} features, model expects {}", ex.features.len(), self.weights.len())));
            }
            if !(0.0..=1.0).contains(&ex.target) {
                return Err(ModelError::MalformedBatch(format!("example {i}: target {} outside [0,1]", ex.target)));
            }
        }
        Ok(())
    }

    fn bce(p: f64, y: f64) -> f64 {
        let p = p.clamp(EPS, 1.0 - EPS);
        -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
    }
}

#[async_trait]
impl Model for LogisticRegression {
    fn kind(&self) -> &str { Self::KIND }

    async fn load(&mut self, location: &str) -> Result<(), ModelError> {
        let bytes = tokio::fs::read(location).await?;
        let art: Artifact = serde_json::from_slice(&bytes)?;
        if art.format != FORMAT { return Err(ModelError::Format(format!("expected {FORMAT}, found {}", art.format))); }
        if art.weights.is_empty() || art.weights.iter().any(|w| !w.is_finite()) || !art.bias.is_finite() {
            return Err(ModelError::Format("weights must be non-empty and finite".into()));
        }
        self.weights = art.weights;
        self.bias = art.bias;
        self.threshold = art.threshold;
        self.loaded = true;
        self.location = Some(location.to_string());
        Ok(())
    }

    async fn predict(&self, input: &Tensor) -> Result<RawPrediction, ModelError> {
        if !self.loaded { return Err(ModelError::NotLoaded); }
        self.check_input(&input.data)?;
        let p = self.probability(&input.data);
        let label = u8::from(p >= self.threshold);
        Ok(RawPrediction {
            prediction: json!({ "label": label, "probability": p }),
            confidence: Some(if label == 1 { p } else { 1.0 - p }),
        })
    }

    fn is_loaded(&self) -> bool { self.loaded }

    fn info(&self) -> ModelInfo {
        ModelInfo { kind: Self::KIND.to_string(), input_dim: self.loaded.then_some(self.weights.len()), is_loaded: self.loaded, location: self.location.clone() }
    }
}

#[async_trait]
impl Trainable for LogisticRegression {
    fn train_step(&mut self, batch: &[Example], learning_rate: f64) -> Result<f64, ModelError> {
        self.check_examples(batch)?;
        let n = batch.len() as f64;
        let mut grad_w = vec![0.0; self.weights.len()];
        let mut grad_b = 0.0;
        let mut loss = 0.0;
        for ex in batch {
            let p = self.probability(&ex.features.data);
            let y = ex.target as f64;
            let err = p - y;
            for (g, x) in grad_w.iter_mut().zip(&ex.features.data) { *g += err * *x as f64; }
            grad_b += err;
            loss += Self::bce(p, y);
        }
        for (w, g) in self.weights.iter_mut().zip(&grad_w) { *w -= learning_rate * g / n; }
        self.bias -= learning_rate * grad_b / n;
        let loss = loss / n;
        if !loss.is_finite() || !self.bias.is_finite() || self.weights.iter().any(|w| !w.is_finite()) {
            return Err(ModelError::Divergence(loss));
        }
        Ok(loss)
    }

    fn evaluate(&self, examples: &[Example]) -> Result<Metrics, ModelError> {
        self.check_examples(examples)?;
        let mut loss = 0.0;
        let mut correct = 0usize;
        for ex in examples {
            let p = self.probability(&ex.features.data);
            let y = ex.target as f64;
            loss += Self::bce(p, y);
            if (p >= self.threshold) == (y >= 0.5) { correct += 1; }
        }
        let n = examples.len() as f64;
        Ok(Metrics::from([("loss".to_string(), loss / n), ("accuracy".to_string(), correct as f64 / n)]))
    }

    async fn save(&self, path: &Path) -> Result<(), ModelError> {
        let art = Artifact { format: FORMAT.to_string(), weights: self.weights.clone(), bias: self.bias, threshold: self.threshold };
        tokio::fs::write(path, serde_json::to_vec_pretty(&art)?).await?;
        Ok(())
    }
}
