//! Finite, restartable example collections with lazy mini-batching.

use std::borrow::Cow;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;

use crate::error::{LifecycleError, LifecycleResult};
use crate::model::Example;
use crate::preprocessing::Preprocessor;

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    examples: Vec<Example>,
    shuffle_seed: Option<u64>,
}

impl Dataset {
    pub fn new(examples: Vec<Example>) -> Self { Self { examples, shuffle_seed: None } }

    /// Run raw records through `pre`, keeping the record index in any error.
    pub fn from_records(pre: &dyn Preprocessor, records: &[(Value, f32)]) -> LifecycleResult<Self> {
        let raws: Vec<Value> = records.iter().map(|(raw, _)| raw.clone()).collect();
        let tensors = pre.process_batch(&raws)?;
        let examples = tensors.into_iter().zip(records).map(|(features, (_, target))| Example { features, target: *target }).collect();
        Ok(Self::new(examples))
    }

    /// Reshuffle every epoch, deterministically for a given seed.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.shuffle_seed = Some(seed);
        self
    }

    pub fn len(&self) -> usize { self.examples.len() }
    pub fn is_empty(&self) -> bool { self.examples.is_empty() }
    pub fn examples(&self) -> &[Example] { &self.examples }

    /// Split off the trailing `fraction` of examples, e.g. for validation.
    pub fn split(mut self, fraction: f64) -> LifecycleResult<(Dataset, Dataset)> {
        if !(0.0..1.0).contains(&fraction) { return Err(LifecycleError::invalid_input(format!("split fraction {fraction} outside [0, 1)"))); }
        let keep = self.examples.len() - (self.examples.len() as f64 * fraction).round() as usize;
        let tail = self.examples.split_off(keep);
        Ok((Dataset { examples: self.examples, shuffle_seed: self.shuffle_seed }, Dataset::new(tail)))
    }

    /// Batches for one epoch; the last one may be short. Calling again restarts.
    pub fn batches(&self, batch_size: usize, epoch: u32) -> Batches<'_> {
        let order = self.shuffle_seed.map(|seed| {
            let mut idx: Vec<usize> = (0..self.examples.len()).collect();
            idx.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch as u64)));
            idx
        });
        Batches { data: &self.examples, order, pos: 0, batch_size: batch_size.max(1) }
    }
}

impl From<Vec<Example>> for Dataset {
    fn from(examples: Vec<Example>) -> Self { Self::new(examples) }
}

pub struct Batches<'a> {
    data: &'a [Example],
    order: Option<Vec<usize>>,
    pos: usize,
    batch_size: usize,
}

impl<'a> Iterator for Batches<'a> {
    type Item = Cow<'a, [Example]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.data.len() { return None; }
        let end = (self.pos + self.batch_size).min(self.data.len());
        let batch = match &self.order {
            None => Cow::Borrowed(&self.data[self.pos..end]),
            Some(order) => Cow::Owned(order[self.pos..end].iter().map(|&i| self.data[i].clone()).collect()),
        };
        self.pos = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.data.len().saturating_sub(self.pos).div_ceil(self.batch_size);
        (n, Some(n))
    }
}
