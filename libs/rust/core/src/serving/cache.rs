//! Bounded LRU of loaded model instances keyed by (name, version).
//!
//! Concurrent misses for one key share a single in-flight load (a `Shared` future stored
//! in the slot); other keys are never blocked by it. Instances are handed out as
//! `Arc<LoadedModel>`: an entry whose `Arc` is held outside the cache is busy and is
//! skipped by eviction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::debug;

use crate::error::LifecycleResult;
use crate::model::Model;
use crate::registry::ModelVersion;
use crate::LIFECYCLE_METRICS;

pub type CacheKey = (String, u32);

/// A model instance bound to the registry record it was loaded from.
pub struct LoadedModel {
    version: ModelVersion,
    model: Box<dyn Model>,
    loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    pub fn new(version: ModelVersion, model: Box<dyn Model>) -> Self { Self { version, model, loaded_at: Utc::now() } }
    pub fn version(&self) -> &ModelVersion { &self.version }
    pub fn model(&self) -> &dyn Model { self.model.as_ref() }
    pub fn loaded_at(&self) -> DateTime<Utc> { self.loaded_at }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self { Self { capacity: 8 } }
}

type LoadFuture = Shared<BoxFuture<'static, LifecycleResult<Arc<LoadedModel>>>>;

enum Slot {
    Loading { generation: u64, fut: LoadFuture },
    Ready { model: Arc<LoadedModel>, last_used: u64 },
}

#[derive(Default)]
struct Inner {
    slots: HashMap<CacheKey, Slot>,
    tick: u64,
    generation: u64,
}

pub struct ModelCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl ModelCache {
    pub fn new(cfg: &CacheConfig) -> Self { Self { capacity: cfg.capacity.max(1), inner: Mutex::new(Inner::default()) } }

    pub fn capacity(&self) -> usize { self.capacity }

    /// Return the cached instance or run `load` once for all concurrent callers of `key`.
    /// A failed load clears the slot so the next call starts a fresh attempt.
    pub async fn get_or_load<F>(&self, key: CacheKey, load: F) -> LifecycleResult<Arc<LoadedModel>>
    where F: FnOnce() -> BoxFuture<'static, LifecycleResult<LoadedModel>> {
        let (fut, generation) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.tick += 1;
            let tick = inner.tick;
            match inner.slots.get_mut(&key) {
                Some(Slot::Ready { model, last_used }) => {
                    *last_used = tick;
                    LIFECYCLE_METRICS.cache_hits_total.add(1, &[]);
                    return Ok(model.clone());
                }
                Some(Slot::Loading { generation, fut }) => (fut.clone(), *generation),
                None => {
                    inner.generation += 1;
                    let generation = inner.generation;
                    let fut = load().map(|res| res.map(Arc::new)).boxed().shared();
                    inner.slots.insert(key.clone(), Slot::Loading { generation, fut: fut.clone() });
                    (fut, generation)
                }
            }
        };
        let result = fut.await;
        self.settle(&key, generation, &result);
        result
    }

    fn settle(&self, key: &CacheKey, generation: u64, result: &LifecycleResult<Arc<LoadedModel>>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let pending = matches!(inner.slots.get(key), Some(Slot::Loading { generation: g, .. }) if *g == generation);
        if !pending { return; }
        match result {
            Ok(model) => {
                inner.tick += 1;
                inner.slots.insert(key.clone(), Slot::Ready { model: model.clone(), last_used: inner.tick });
                self.evict_over_capacity(inner);
            }
            Err(_) => { inner.slots.remove(key); }
        }
    }

    fn evict_over_capacity(&self, inner: &mut Inner) {
        loop {
            let ready = inner.slots.values().filter(|s| matches!(s, Slot::Ready { .. })).count();
            if ready <= self.capacity { return; }
            let victim = inner
                .slots
                .iter()
                .filter_map(|(k, s)| match s {
                    Slot::Ready { model, last_used } if Arc::strong_count(model) == 1 => Some((k.clone(), *last_used)),
                    _ => None,
                })
                .min_by_key(|(_, used)| *used)
                .map(|(k, _)| k);
            let Some(victim) = victim else {
                debug!(ready, capacity = self.capacity, "all cached models busy, eviction deferred");
                return;
            };
            inner.slots.remove(&victim);
            LIFECYCLE_METRICS.cache_evictions_total.add(1, &[]);
            debug!(name = %victim.0, version = victim.1, "evicted model from cache");
        }
    }

    /// Drop a ready entry. Callers still holding the instance keep it alive until done.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get(key) {
            Some(Slot::Ready { .. }) => inner.slots.remove(key).is_some(),
            _ => false,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool { matches!(self.inner.lock().slots.get(key), Some(Slot::Ready { .. })) }

    /// Number of ready entries.
    pub fn len(&self) -> usize { self.inner.lock().slots.values().filter(|s| matches!(s, Slot::Ready { .. })).count() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<CacheKey> {
        let inner = self.inner.lock();
        let mut keys: Vec<CacheKey> = inner.slots.iter().filter(|(_, s)| matches!(s, Slot::Ready { .. })).map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::model::{ModelError, ModelInfo, RawPrediction, Tensor};
    use crate::registry::Stage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Constant;

    #[async_trait]
    impl Model for Constant {
        fn kind(&self) -> &str { "constant" }
        async fn load(&mut self, _location: &str) -> Result<(), ModelError> { Ok(()) }
        async fn predict(&self, _input: &Tensor) -> Result<RawPrediction, ModelError> {
            Ok(RawPrediction { prediction: serde_json::json!(1), confidence: None })
        }
        fn is_loaded(&self) -> bool { true }
        fn info(&self) -> ModelInfo { ModelInfo { kind: "constant".into(), input_dim: None, is_loaded: true, location: None } }
    }

    fn record(name: &str, version: u32) -> ModelVersion {
        let now = Utc::now();
        ModelVersion { name: name.into(), version, kind: "constant".into(), stage: Stage::Production, artifact_location: format!("/a/{version}"), created_at: now, stage_changed_at: now, metadata: Default::default() }
    }

    fn loader(name: &str, version: u32, calls: Arc<AtomicUsize>) -> impl FnOnce() -> BoxFuture<'static, LifecycleResult<LoadedModel>> {
        let rec = record(name, version);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(LoadedModel::new(rec, Box::new(Constant)))
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_misses_share_one_load() {
        let cache = Arc::new(ModelCache::new(&CacheConfig { capacity: 4 }));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let (cache, calls) = (cache.clone(), calls.clone());
            handles.push(tokio::spawn(async move { cache.get_or_load(("m".into(), 1), loader("m", 1, calls)).await.unwrap() }));
        }
        let mut models = Vec::new();
        for h in handles { models.push(h.await.unwrap()); }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(models.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn least_recently_used_idle_entry_is_evicted() {
        let cache = ModelCache::new(&CacheConfig { capacity: 2 });
        let calls = Arc::new(AtomicUsize::new(0));
        drop(cache.get_or_load(("a".into(), 1), loader("a", 1, calls.clone())).await.unwrap());
        drop(cache.get_or_load(("b".into(), 1), loader("b", 1, calls.clone())).await.unwrap());
        // touch a so b becomes least recently used
        drop(cache.get_or_load(("a".into(), 1), loader("a", 1, calls.clone())).await.unwrap());
        drop(cache.get_or_load(("c".into(), 1), loader("c", 1, calls.clone())).await.unwrap());
        assert_eq!(cache.keys(), vec![("a".to_string(), 1), ("c".to_string(), 1)]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn busy_entries_survive_eviction() {
        let cache = ModelCache::new(&CacheConfig { capacity: 1 });
        let calls = Arc::new(AtomicUsize::new(0));
        let held = cache.get_or_load(("a".into(), 1), loader("a", 1, calls.clone())).await.unwrap();
        let _b = cache.get_or_load(("b".into(), 1), loader("b", 1, calls.clone())).await.unwrap();
        assert!(cache.contains(&("a".into(), 1)));
        assert_eq!(cache.len(), 2);
        drop(held);
        drop(cache.get_or_load(("c".into(), 1), loader("c", 1, calls)).await.unwrap());
        assert!(!cache.contains(&("a".into(), 1)));
    }

    #[tokio::test]
    async fn failed_load_is_not_cached() {
        let cache = ModelCache::new(&CacheConfig::default());
        let err = cache
            .get_or_load(("m".into(), 1), || async { Err(LifecycleError::Storage("blob unavailable".into())) }.boxed())
            .await
            .err().expect("load should fail");
        assert!(err.is_retriable());
        assert!(cache.is_empty());
        let calls = Arc::new(AtomicUsize::new(0));
        assert!(cache.get_or_load(("m".into(), 1), loader("m", 1, calls)).await.is_ok());
    }
}
