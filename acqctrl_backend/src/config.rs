//! Manager configuration and task-description presets.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acq_backend::clock::secs;
use acq_backend::error::Result;
use acq_backend::TaskDescription;

/// Called inside every polling sleep so that a host event loop (e.g. a GUI) stays
/// responsive while tasks run on its thread. Headless callers keep the no-op default.
pub type HostEventTick = Arc<dyn Fn() + Send + Sync>;

pub fn no_host_tick() -> HostEventTick {
    Arc::new(|| {})
}

/// All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root of the data store.
    pub base_dir: PathBuf,
    /// Directory of `*.json` task-description presets.
    pub config_dir: Option<PathBuf>,
    pub reserve_timeout: f64,
    /// Added to `duration + leadTime` when a description carries no `timeout_margin`.
    pub timeout_margin: f64,
    pub poll_interval: f64,
    /// Longest time `abort_all` waits for tasks to release their devices.
    pub abort_wait: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data"),
            config_dir: None,
            reserve_timeout: 30.,
            timeout_margin: 5.,
            poll_interval: 0.010,
            abort_wait: 10.,
        }
    }
}

impl ManagerConfig {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Default::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn reserve_timeout(&self) -> Duration {
        secs(self.reserve_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval)
    }

    pub fn abort_wait(&self) -> Duration {
        secs(self.abort_wait)
    }
}

/// Loads every `*.json` file of `dir` as a preset named after the file stem, in name
/// order. A missing directory has no presets.
pub fn load_presets(dir: &Path) -> Result<IndexMap<String, TaskDescription>> {
    let mut presets = IndexMap::new();
    if !dir.is_dir() {
        return Ok(presets);
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().map_or(false, |e| e == "json"))
        .collect();
    paths.sort();
    for path in paths {
        let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
            continue;
        };
        let desc = TaskDescription::from_json(&fs::read_to_string(&path)?)?;
        tracing::debug!(preset = %stem, "loaded preset");
        presets.insert(stem, desc);
    }
    Ok(presets)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let cfg: ManagerConfig = serde_json::from_str(r#"{"base_dir": "/tmp/x", "reserve_timeout": 2.5}"#).unwrap();
        assert_eq!(cfg.base_dir, PathBuf::from("/tmp/x"));
        assert_eq!(cfg.reserve_timeout(), Duration::from_millis(2500));
        assert_eq!(cfg.timeout_margin, 5.);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(10));
        assert_eq!(cfg.abort_wait, 10.);
    }

    #[test]
    fn presets_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("pulse.json"), r#"{"protocol": {"duration": 0.02}, "daq": {}}"#).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let presets = load_presets(dir.path()).unwrap();
        assert_eq!(presets.len(), 1);
        assert_eq!(presets["pulse"].protocol.duration, 0.02);
        assert!(load_presets(&dir.path().join("missing")).unwrap().is_empty());
    }
}
