//! Tracker configuration file

use anyhow::Context;
use satwatch_origin::{MonitorConfig, OriginConfig};
use satwatch_sequencer::{CatalogEntry, ExecutorConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Every section is optional; missing fields take their defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub origin: OriginConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
    pub monitor: MonitorConfig,
    /// Objects to plan passes for
    pub catalog: Vec<CatalogEntry>,
    /// Precomputed trajectories, keyed by object id
    pub trajectories_path: PathBuf,
    /// Where each new plan and its trajectories are saved
    pub plan_path: PathBuf,
    pub plan_trajectories_path: PathBuf,
    /// Daily rolling log files go here when set
    pub log_dir: Option<PathBuf>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            origin: OriginConfig::default(),
            scheduler: SchedulerConfig::default(),
            executor: ExecutorConfig::default(),
            monitor: MonitorConfig::default(),
            catalog: Vec::new(),
            trajectories_path: PathBuf::from("trajectories.json"),
            plan_path: PathBuf::from("plan.json"),
            plan_trajectories_path: PathBuf::from("plan_trajectories.json"),
            log_dir: None,
        }
    }
}

impl TrackerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Catalog entries, or one entry per trajectory when the catalog is empty
    pub fn catalog_or<'a>(&self, object_ids: impl Iterator<Item = &'a str>) -> Vec<CatalogEntry> {
        if !self.catalog.is_empty() {
            return self.catalog.clone();
        }
        let mut ids: Vec<&str> = object_ids.collect();
        ids.sort_unstable();
        ids.into_iter().map(|id| CatalogEntry::new(id, id)).collect()
    }
}
