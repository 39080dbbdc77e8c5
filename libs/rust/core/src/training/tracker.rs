//! In-process experiment tracking: runs, parameters, append-only metric series, tags and
//! artifact references.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for RunId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

impl FromStr for RunId {
    type Err = LifecycleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self).map_err(|e| LifecycleError::invalid_input(format!("run id '{s}': {e}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus { Running, Completed, Failed, Cancelled }

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self { RunStatus::Running => "running", RunStatus::Completed => "completed", RunStatus::Failed => "failed", RunStatus::Cancelled => "cancelled" }
    }
    pub fn is_terminal(&self) -> bool { !matches!(self, RunStatus::Running) }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub step: u64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentRun {
    pub run_id: RunId,
    pub experiment: String,
    pub status: RunStatus,
    pub parameters: BTreeMap<String, String>,
    pub metrics: BTreeMap<String, Vec<MetricPoint>>,
    pub tags: BTreeMap<String, String>,
    pub artifacts: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ExperimentRun {
    /// Most recently logged value of `name`.
    pub fn last_metric(&self, name: &str) -> Option<f64> { self.metrics.get(name).and_then(|s| s.last()).map(|p| p.value) }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Refuse `start_run` while another run is still `Running`.
    pub single_active_run: bool,
}

#[derive(Default)]
pub struct ExperimentTracker {
    cfg: TrackerConfig,
    runs: RwLock<HashMap<RunId, ExperimentRun>>,
}

impl ExperimentTracker {
    pub fn new(cfg: TrackerConfig) -> Self { Self { cfg, runs: RwLock::new(HashMap::new()) } }

    pub fn start_run(&self, experiment: &str, parameters: BTreeMap<String, String>) -> LifecycleResult<RunId> {
        if experiment.trim().is_empty() { return Err(LifecycleError::invalid_input("experiment name must not be empty")); }
        let mut runs = self.runs.write();
        if self.cfg.single_active_run {
            if let Some(active) = runs.values().find(|r| r.status == RunStatus::Running) {
                return Err(LifecycleError::RunAlreadyActive(active.run_id));
            }
        }
        let run_id = RunId::new();
        runs.insert(run_id, ExperimentRun {
            run_id,
            experiment: experiment.to_string(),
            status: RunStatus::Running,
            parameters,
            metrics: BTreeMap::new(),
            tags: BTreeMap::new(),
            artifacts: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        });
        info!(%run_id, experiment, "run started");
        Ok(run_id)
    }

    /// Appends; logging the same (step, name) twice keeps both points.
    pub fn log_metric(&self, run_id: RunId, step: u64, name: &str, value: f64) -> LifecycleResult<()> {
        self.with_active(run_id, |run| {
            run.metrics.entry(name.to_string()).or_default().push(MetricPoint { step, value, timestamp: Utc::now() });
        })?;
        debug!(%run_id, step, metric = name, value, "metric logged");
        Ok(())
    }

    pub fn log_param(&self, run_id: RunId, key: &str, value: impl fmt::Display) -> LifecycleResult<()> {
        self.with_active(run_id, |run| { run.parameters.insert(key.to_string(), value.to_string()); })
    }

    pub fn set_tag(&self, run_id: RunId, key: &str, value: impl fmt::Display) -> LifecycleResult<()> {
        self.with_active(run_id, |run| { run.tags.insert(key.to_string(), value.to_string()); })
    }

    pub fn log_artifact(&self, run_id: RunId, path: &str) -> LifecycleResult<()> {
        self.with_active(run_id, |run| run.artifacts.push(path.to_string()))?;
        debug!(%run_id, path, "artifact logged");
        Ok(())
    }

    pub fn end_run(&self, run_id: RunId, status: RunStatus) -> LifecycleResult<()> {
        if !status.is_terminal() { return Err(LifecycleError::invalid_input("a run cannot be ended as running")); }
        self.with_active(run_id, |run| {
            run.status = status;
            run.ended_at = Some(Utc::now());
        })?;
        info!(%run_id, %status, "run ended");
        Ok(())
    }

    pub fn get_run(&self, run_id: RunId) -> LifecycleResult<ExperimentRun> {
        self.runs.read().get(&run_id).cloned().ok_or(LifecycleError::RunNotFound(run_id))
    }

    /// Runs ordered by start time, optionally filtered.
    pub fn list_runs(&self, experiment: Option<&str>, status: Option<RunStatus>) -> Vec<ExperimentRun> {
        let mut out: Vec<ExperimentRun> = self
            .runs
            .read()
            .values()
            .filter(|r| experiment.map_or(true, |e| r.experiment == e) && status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
        out
    }

    /// Completed run of `experiment` with the best final value of `metric`.
    pub fn best_run(&self, experiment: &str, metric: &str, maximize: bool) -> Option<ExperimentRun> {
        self.list_runs(Some(experiment), Some(RunStatus::Completed))
            .into_iter()
            .filter_map(|r| r.last_metric(metric).filter(|v| v.is_finite()).map(|v| (v, r)))
            .max_by(|(a, _), (b, _)| if maximize { a.total_cmp(b) } else { b.total_cmp(a) })
            .map(|(_, r)| r)
    }

    pub fn metric_history(&self, run_id: RunId, name: &str) -> LifecycleResult<Vec<MetricPoint>> {
        let runs = self.runs.read();
        let run = runs.get(&run_id).ok_or(LifecycleError::RunNotFound(run_id))?;
        Ok(run.metrics.get(name).cloned().unwrap_or_default())
    }

    fn with_active<T>(&self, run_id: RunId, f: impl FnOnce(&mut ExperimentRun) -> T) -> LifecycleResult<T> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(&run_id).ok_or(LifecycleError::RunNotFound(run_id))?;
        if run.status.is_terminal() { return Err(LifecycleError::RunAlreadyEnded(run_id)); }
        Ok(f(run))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ExperimentTracker { ExperimentTracker::new(TrackerConfig::default()) }

    #[test]
    fn metrics_append_and_runs_close_once() {
        let t = tracker();
        let run = t.start_run("churn", BTreeMap::from([("lr".into(), "0.1".into())])).unwrap();
        t.log_metric(run, 1, "loss", 0.9).unwrap();
        t.log_metric(run, 2, "loss", 0.7).unwrap();
        t.end_run(run, RunStatus::Completed).unwrap();
        assert_eq!(t.metric_history(run, "loss").unwrap().iter().map(|p| p.value).collect::<Vec<_>>(), vec![0.9, 0.7]);
        assert!(matches!(t.end_run(run, RunStatus::Failed), Err(LifecycleError::RunAlreadyEnded(_))));
        assert!(matches!(t.log_metric(run, 3, "loss", 0.5), Err(LifecycleError::RunAlreadyEnded(_))));
        assert_eq!(t.get_run(run).unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn ending_as_running_is_rejected() {
        let t = tracker();
        let run = t.start_run("x", BTreeMap::new()).unwrap();
        assert!(matches!(t.end_run(run, RunStatus::Running), Err(LifecycleError::InvalidInput(_))));
        assert!(matches!(t.end_run(RunId::new(), RunStatus::Completed), Err(LifecycleError::RunNotFound(_))));
    }

    #[test]
    fn single_active_run_is_opt_in() {
        let relaxed = tracker();
        relaxed.start_run("a", BTreeMap::new()).unwrap();
        assert!(relaxed.start_run("a", BTreeMap::new()).is_ok());

        let strict = ExperimentTracker::new(TrackerConfig { single_active_run: true });
        let first = strict.start_run("a", BTreeMap::new()).unwrap();
        assert!(matches!(strict.start_run("b", BTreeMap::new()), Err(LifecycleError::RunAlreadyActive(id)) if id == first));
        strict.end_run(first, RunStatus::Cancelled).unwrap();
        assert!(strict.start_run("b", BTreeMap::new()).is_ok());
    }

    #[test]
    fn best_run_uses_final_value_of_completed_runs() {
        let t = tracker();
        let mut ids = Vec::new();
        for (final_loss, status) in [(0.4, RunStatus::Completed), (0.2, RunStatus::Completed), (0.1, RunStatus::Failed)] {
            let run = t.start_run("exp", BTreeMap::new()).unwrap();
            t.log_metric(run, 1, "val_loss", 0.05).unwrap();
            t.log_metric(run, 2, "val_loss", final_loss).unwrap();
            t.end_run(run, status).unwrap();
            ids.push(run);
        }
        assert_eq!(t.best_run("exp", "val_loss", false).unwrap().run_id, ids[1]);
        assert_eq!(t.best_run("exp", "val_loss", true).unwrap().run_id, ids[0]);
        assert!(t.best_run("other", "val_loss", false).is_none());
        assert_eq!(t.list_runs(Some("exp"), Some(RunStatus::Failed)).len(), 1);
    }

    #[test]
    fn ended_run_is_frozen() {
        let t = tracker();
        let run = t.start_run("x", BTreeMap::new()).unwrap();
        t.log_artifact(run, "/tmp/model.json").unwrap();
        t.set_tag(run, "stage", "warmup").unwrap();
        t.end_run(run, RunStatus::Failed).unwrap();
        assert!(matches!(t.set_tag(run, "error", "diverged"), Err(LifecycleError::RunAlreadyEnded(id)) if id == run));
        assert!(matches!(t.log_param(run, "lr", 0.1), Err(LifecycleError::RunAlreadyEnded(_))));
        let r = t.get_run(run).unwrap();
        assert_eq!(r.tags.len(), 1);
        assert_eq!(r.tags["stage"], "warmup");
        assert_eq!(r.artifacts, vec!["/tmp/model.json".to_string()]);
    }

    #[test]
    fn run_id_parses_back() {
        let id = RunId::new();
        assert_eq!(id.to_string().parse::<RunId>().unwrap(), id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }
}
