//! Named numeric features with optional standardisation.

use serde::Serialize;
use serde_json::Value;

use super::{config_digest, Preprocessor};
use crate::error::{LifecycleError, LifecycleResult};
use crate::model::Tensor;

#[derive(Debug, Clone, Serialize)]
pub struct TabularPreprocessor {
    features: Vec<String>,
    /// Per-feature (mean, std) applied as `(x - mean) / std`.
    scaling: Option<Vec<(f32, f32)>>,
}

impl TabularPreprocessor {
    pub fn new<S: Into<String>>(features: impl IntoIterator<Item = S>) -> Self {
        Self { features: features.into_iter().map(Into::into).collect(), scaling: None }
    }

    pub fn with_scaling(mut self, stats: Vec<(f32, f32)>) -> LifecycleResult<Self> {
        if stats.len() != self.features.len() {
            return Err(LifecycleError::invalid_config(format!("{} scaling pairs for {} features", stats.len(), self.features.len())));
        }
        if stats.iter().any(|(m, s)| !m.is_finite() || !s.is_finite() || *s <= 0.0) {
            return Err(LifecycleError::invalid_config("scaling needs finite means and positive stds"));
        }
        self.scaling = Some(stats);
        Ok(self)
    }

    fn raw_values(&self, raw: &Value) -> LifecycleResult<Vec<f32>> {
        let values: Vec<Option<f64>> = match raw {
            Value::Object(map) => self.features.iter().map(|f| map.get(f).and_then(Value::as_f64)).collect(),
            Value::Array(items) => {
                if items.len() != self.features.len() {
                    return Err(LifecycleError::invalid_input(format!("expected {} features, got {}", self.features.len(), items.len())));
                }
                items.iter().map(Value::as_f64).collect()
            }
            other => return Err(LifecycleError::invalid_input(format!("tabular input must be an object or array, got {}", type_name(other)))),
        };
        values
            .into_iter()
            .zip(&self.features)
            .map(|(v, name)| match v {
                Some(x) if x.is_finite() && x.abs() <= f32::MAX as f64 => Ok(x as f32),
                Some(x) if x.is_finite() => Err(LifecycleError::invalid_input(format!("feature '{name}' = {x} does not fit in f32"))),
                Some(_) => Err(LifecycleError::invalid_input(format!("feature '{name}' is not finite"))),
                None => Err(LifecycleError::invalid_input(format!("feature '{name}' missing or not numeric"))),
            })
            .collect()
    }
}

impl Preprocessor for TabularPreprocessor {
    fn validate(&self, raw: &Value) -> LifecycleResult<()> { self.raw_values(raw).map(|_| ()) }

    fn process(&self, raw: &Value) -> LifecycleResult<Tensor> {
        let mut values = self.raw_values(raw)?;
        if let Some(stats) = &self.scaling {
            for ((x, (mean, std)), name) in values.iter_mut().zip(stats).zip(&self.features) {
                *x = (*x - mean) / std;
                if !x.is_finite() { return Err(LifecycleError::invalid_input(format!("feature '{name}' overflows after scaling"))); }
            }
        }
        Ok(Tensor::vector(values))
    }

    fn fingerprint(&self) -> String { format!("tabular:{}", config_digest(self)) }

    fn output_len(&self) -> usize { self.features.len() }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
