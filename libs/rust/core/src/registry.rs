//! Model registry for named, versioned, staged model artifacts.
//!
//! Versions are appended per name (1, 2, 3, ...) and never removed; `Archived` marks
//! retirement. Stage-mutating calls for one name run behind that name's async gate, and
//! the in-memory commit of a promotion (target + demoted predecessor) happens under a
//! single write lock, so no reader ever observes two `Production` versions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::store::{Record, RecordFilter, RecordStore};
use crate::LIFECYCLE_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage { None, Staging, Production, Archived }

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self { Stage::None => "none", Stage::Staging => "staging", Stage::Production => "production", Stage::Archived => "archived" }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for Stage {
    type Err = LifecycleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            other => Err(LifecycleError::invalid_input(format!("unknown stage '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    /// Catalog kind used to instantiate the model at serving time.
    pub kind: String,
    pub stage: Stage,
    pub artifact_location: String,
    pub created_at: DateTime<Utc>,
    pub stage_changed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ModelVersion {
    pub fn id(&self) -> String { format!("{}@{}", self.name, self.version) }

    fn with_stage(&self, stage: Stage, at: DateTime<Utc>) -> Self {
        Self { stage, stage_changed_at: at, ..self.clone() }
    }
}

impl Record for ModelVersion {
    fn key(&self) -> String { self.id() }
    fn partition(&self) -> &str { &self.name }
}

/// Where the previous `Production` version goes on promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemotionTarget { #[default] Archived, Staging }

impl DemotionTarget {
    pub fn stage(self) -> Stage {
        match self { DemotionTarget::Archived => Stage::Archived, DemotionTarget::Staging => Stage::Staging }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub demote_to: DemotionTarget,
    /// Reject a second live registration of the same (name, artifact_location).
    pub reject_duplicate_artifacts: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self { Self { demote_to: DemotionTarget::Archived, reject_duplicate_artifacts: true } }
}

struct NameSlot {
    gate: tokio::sync::Mutex<()>,
    versions: RwLock<Vec<ModelVersion>>,
}

impl NameSlot {
    fn new(versions: Vec<ModelVersion>) -> Self { Self { gate: tokio::sync::Mutex::new(()), versions: RwLock::new(versions) } }
}

/// A stage change that has been computed but not yet committed.
struct Transition {
    primary: ModelVersion,
    /// (demoted record, record before demotion)
    demoted: Option<(ModelVersion, ModelVersion)>,
    is_new: bool,
}

pub struct ModelRegistry {
    cfg: RegistryConfig,
    slots: RwLock<HashMap<String, Arc<NameSlot>>>,
    store: Option<Arc<dyn RecordStore<ModelVersion>>>,
}

impl Default for ModelRegistry {
    fn default() -> Self { Self::new(RegistryConfig::default()) }
}

impl ModelRegistry {
    /// Empty, process-local registry.
    pub fn new(cfg: RegistryConfig) -> Self { Self { cfg, slots: RwLock::new(HashMap::new()), store: None } }

    /// Registry backed by `store`; existing records are loaded and checked before use.
    pub async fn open(cfg: RegistryConfig, store: Arc<dyn RecordStore<ModelVersion>>) -> LifecycleResult<Self> {
        let mut grouped: BTreeMap<String, Vec<ModelVersion>> = BTreeMap::new();
        for rec in store.list(&RecordFilter::all()).await? {
            grouped.entry(rec.name.clone()).or_default().push(rec);
        }
        let mut slots = HashMap::with_capacity(grouped.len());
        for (name, mut versions) in grouped {
            versions.sort_by_key(|v| v.version);
            if versions.windows(2).any(|w| w[0].version == w[1].version) {
                return Err(LifecycleError::Storage(format!("duplicate version numbers stored for '{name}'")));
            }
            if versions.iter().filter(|v| v.stage == Stage::Production).count() > 1 {
                return Err(LifecycleError::Storage(format!("store holds several production versions of '{name}'")));
            }
            slots.insert(name, Arc::new(NameSlot::new(versions)));
        }
        info!(names = slots.len(), "model registry restored from store");
        Ok(Self { cfg, slots: RwLock::new(slots), store: Some(store) })
    }

    fn slot(&self, name: &str) -> Arc<NameSlot> {
        if let Some(s) = self.slots.read().get(name) { return s.clone(); }
        self.slots.write().entry(name.to_string()).or_insert_with(|| Arc::new(NameSlot::new(Vec::new()))).clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Arc<NameSlot>> { self.slots.read().get(name).cloned() }

    pub async fn register(&self, name: &str, kind: &str, artifact_location: &str, stage: Stage) -> LifecycleResult<ModelVersion> {
        self.register_with_metadata(name, kind, artifact_location, stage, BTreeMap::new()).await
    }

    pub async fn register_with_metadata(
        &self,
        name: &str,
        kind: &str,
        artifact_location: &str,
        stage: Stage,
        metadata: BTreeMap<String, String>,
    ) -> LifecycleResult<ModelVersion> {
        if name.trim().is_empty() { return Err(LifecycleError::invalid_input("model name must not be empty")); }
        if artifact_location.trim().is_empty() { return Err(LifecycleError::invalid_input("artifact location must not be empty")); }
        let slot = self.slot(name);
        let _gate = slot.gate.lock().await;
        let transition = {
            let versions = slot.versions.read();
            if self.cfg.reject_duplicate_artifacts {
                if let Some(dup) = versions.iter().find(|v| v.artifact_location == artifact_location && v.stage != Stage::Archived) {
                    return Err(LifecycleError::DuplicateArtifact {
                        name: name.to_string(),
                        artifact_location: artifact_location.to_string(),
                        existing_version: dup.version,
                        stage: dup.stage,
                    });
                }
            }
            let now = Utc::now();
            let record = ModelVersion {
                name: name.to_string(),
                version: versions.last().map_or(1, |v| v.version + 1),
                kind: kind.to_string(),
                stage,
                artifact_location: artifact_location.to_string(),
                created_at: now,
                stage_changed_at: now,
                metadata,
            };
            let demoted = if stage == Stage::Production { self.demotion_of(&versions, record.version, now) } else { None };
            Transition { primary: record, demoted, is_new: true }
        };
        self.persist(&transition).await?;
        self.commit(&slot, &transition);
        LIFECYCLE_METRICS.registrations_total.add(1, &[KeyValue::new("stage", stage.as_str())]);
        info!(name, version = transition.primary.version, kind, %stage, location = artifact_location, "model version registered");
        Ok(transition.primary)
    }

    /// Move `name@version` to `new_stage`. Promotion demotes the current production
    /// version of the same name in the same critical section.
    pub async fn set_stage(&self, name: &str, version: u32, new_stage: Stage) -> LifecycleResult<ModelVersion> {
        let slot = self.existing_slot(name).ok_or_else(|| LifecycleError::VersionNotFound { name: name.to_string(), version })?;
        let _gate = slot.gate.lock().await;
        let transition = {
            let versions = slot.versions.read();
            let current = find_version(&versions, version).ok_or_else(|| LifecycleError::VersionNotFound { name: name.to_string(), version })?;
            if current.stage == new_stage {
                debug!(name, version, %new_stage, "stage unchanged");
                return Ok(current.clone());
            }
            let now = Utc::now();
            let demoted = if new_stage == Stage::Production { self.demotion_of(&versions, version, now) } else { None };
            Transition { primary: current.with_stage(new_stage, now), demoted, is_new: false }
        };
        self.persist(&transition).await?;
        self.commit(&slot, &transition);
        if new_stage == Stage::Production {
            LIFECYCLE_METRICS.promotions_total.add(1, &[]);
        }
        match &transition.demoted {
            Some((d, _)) => info!(name, version, %new_stage, demoted_version = d.version, demoted_to = %d.stage, "stage changed"),
            None => info!(name, version, %new_stage, "stage changed"),
        }
        Ok(transition.primary)
    }

    fn demotion_of(&self, versions: &[ModelVersion], promoted: u32, at: DateTime<Utc>) -> Option<(ModelVersion, ModelVersion)> {
        versions
            .iter()
            .find(|v| v.stage == Stage::Production && v.version != promoted)
            .map(|prev| (prev.with_stage(self.cfg.demote_to.stage(), at), prev.clone()))
    }

    /// Write-through before the in-memory commit. A failed promotion write restores the
    /// demoted record so the store never ends up without its production version.
    async fn persist(&self, t: &Transition) -> LifecycleResult<()> {
        let Some(store) = &self.store else { return Ok(()) };
        if let Some((demoted, _)) = &t.demoted {
            store.save(demoted).await?;
        }
        if let Err(e) = store.save(&t.primary).await {
            if let Some((_, previous)) = &t.demoted {
                if let Err(restore) = store.save(previous).await {
                    warn!(record = %previous.id(), error = %restore, "could not restore demoted record after failed write");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn commit(&self, slot: &NameSlot, t: &Transition) {
        let mut versions = slot.versions.write();
        if let Some((demoted, _)) = &t.demoted {
            if let Some(v) = find_version_mut(&mut versions, demoted.version) { *v = demoted.clone(); }
        }
        if t.is_new {
            versions.push(t.primary.clone());
        } else if let Some(v) = find_version_mut(&mut versions, t.primary.version) {
            *v = t.primary.clone();
        }
    }

    /// `version` selects an exact match, `stage` the newest version holding that stage,
    /// neither selects the newest version. Giving both is ambiguous.
    pub fn get(&self, name: &str, version: Option<u32>, stage: Option<Stage>) -> LifecycleResult<ModelVersion> {
        let no_match = |query: String| LifecycleError::NoMatchingVersion { name: name.to_string(), query };
        let found = match (version, stage) {
            (Some(_), Some(_)) => return Err(LifecycleError::AmbiguousQuery { name: name.to_string() }),
            (Some(v), None) => self.with_versions(name, |vs| find_version(vs, v).cloned()).ok_or_else(|| no_match(format!("version={v}")))?,
            (None, Some(s)) => self
                .with_versions(name, |vs| vs.iter().rev().find(|m| m.stage == s).cloned())
                .ok_or_else(|| no_match(format!("stage={s}")))?,
            (None, None) => self.with_versions(name, |vs| vs.last().cloned()).ok_or_else(|| no_match("latest".to_string()))?,
        };
        Ok(found)
    }

    pub fn production(&self, name: &str) -> Option<ModelVersion> { self.get(name, None, Some(Stage::Production)).ok() }

    /// Versions of `name` ascending; empty when the name is unknown.
    pub fn list_versions(&self, name: &str) -> Vec<ModelVersion> { self.with_versions(name, |vs| Some(vs.to_vec())).unwrap_or_default() }

    /// Every version across names, ordered by (name, version), optionally filtered by stage.
    pub fn list_models(&self, stage: Option<Stage>) -> Vec<ModelVersion> {
        let mut out: Vec<ModelVersion> = self
            .slots
            .read()
            .values()
            .flat_map(|s| s.versions.read().iter().filter(|v| stage.map_or(true, |st| v.stage == st)).cloned().collect::<Vec<_>>())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
        out
    }

    fn with_versions<T>(&self, name: &str, f: impl FnOnce(&[ModelVersion]) -> Option<T>) -> Option<T> {
        let slot = self.existing_slot(name)?;
        let versions = slot.versions.read();
        f(&versions)
    }
}

fn find_version(versions: &[ModelVersion], version: u32) -> Option<&ModelVersion> {
    versions.binary_search_by_key(&version, |v| v.version).ok().map(|i| &versions[i])
}

fn find_version_mut(versions: &mut [ModelVersion], version: u32) -> Option<&mut ModelVersion> {
    versions.binary_search_by_key(&version, |v| v.version).ok().map(move |i| &mut versions[i])
}
