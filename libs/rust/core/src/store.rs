//! Persistence boundary for durable registry state.
//!
//! The engine only depends on [`RecordStore`]; production deployments plug in their own
//! backend. [`MemoryStore`] keeps records in-process (tests, single-node gateway).

use std::collections::BTreeMap;
use std::marker::PhantomData;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{LifecycleError, LifecycleResult};

/// A persisted record: addressable by a unique key and grouped by partition (model name).
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn key(&self) -> String;
    fn partition(&self) -> &str;
}

#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub partition: Option<String>,
}

impl RecordFilter {
    pub fn all() -> Self { Self::default() }
    pub fn partition(p: impl Into<String>) -> Self { Self { partition: Some(p.into()) } }
}

#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Insert or replace the record under `record.key()`.
    async fn save(&self, record: &R) -> LifecycleResult<()>;
    async fn load(&self, key: &str) -> LifecycleResult<Option<R>>;
    async fn list(&self, filter: &RecordFilter) -> LifecycleResult<Vec<R>>;
}

/// Records are kept serialized so a round-trip through the store behaves like a real backend.
pub struct MemoryStore<R> {
    rows: RwLock<BTreeMap<String, (String, serde_json::Value)>>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Default for MemoryStore<R> {
    fn default() -> Self { Self { rows: RwLock::new(BTreeMap::new()), _marker: PhantomData } }
}

impl<R> MemoryStore<R> {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { self.rows.read().len() }
    pub fn is_empty(&self) -> bool { self.rows.read().is_empty() }
}

fn decode<R: Record>(v: &serde_json::Value) -> LifecycleResult<R> {
    serde_json::from_value(v.clone()).map_err(|e| LifecycleError::Storage(format!("decode: {e}")))
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore<R> {
    async fn save(&self, record: &R) -> LifecycleResult<()> {
        let value = serde_json::to_value(record).map_err(|e| LifecycleError::Storage(format!("encode: {e}")))?;
        self.rows.write().insert(record.key(), (record.partition().to_string(), value));
        Ok(())
    }

    async fn load(&self, key: &str) -> LifecycleResult<Option<R>> {
        self.rows.read().get(key).map(|(_, v)| decode(v)).transpose()
    }

    async fn list(&self, filter: &RecordFilter) -> LifecycleResult<Vec<R>> {
        let rows = self.rows.read();
        rows.values()
            .filter(|(p, _)| filter.partition.as_deref().map_or(true, |want| want == p))
            .map(|(_, v)| decode(v))
            .collect()
    }
}
