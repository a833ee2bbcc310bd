//! Persisted plan artifacts
//!
//! A plan is saved as two JSON documents: the pass summaries and the trajectories keyed by
//! pass id. Both are written atomically so a reader never sees a partial file.

use crate::error::{SequencerError, SequencerResult};
use crate::trajectory::{Trajectory, TrajectoryPoint};
use crate::{Pass, PassPlan, PassRecord};
use chrono::{DateTime, Utc};
use satwatch_origin::transfer::write_atomically;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
struct PlanDocument {
    generated_at: DateTime<Utc>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    passes: Vec<PassRecord>,
}

#[derive(Debug, Clone)]
pub struct PlanArtifacts {
    plan_path: PathBuf,
    trajectories_path: PathBuf,
}

impl PlanArtifacts {
    pub fn new(plan_path: impl Into<PathBuf>, trajectories_path: impl Into<PathBuf>) -> Self {
        Self {
            plan_path: plan_path.into(),
            trajectories_path: trajectories_path.into(),
        }
    }

    /// `plan.json` and `plan_trajectories.json` inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("plan.json"), dir.join("plan_trajectories.json"))
    }

    pub fn plan_path(&self) -> &Path {
        &self.plan_path
    }

    pub fn trajectories_path(&self) -> &Path {
        &self.trajectories_path
    }

    pub async fn save(&self, plan: &PassPlan) -> SequencerResult<()> {
        let document = PlanDocument {
            generated_at: plan.generated_at,
            window_start: plan.window_start,
            window_end: plan.window_end,
            passes: plan.records(),
        };
        let trajectories: BTreeMap<String, &[TrajectoryPoint]> = plan
            .iter()
            .map(|pass| (pass.id(), pass.trajectory.points()))
            .collect();

        write_document(&self.plan_path, &serde_json::to_vec_pretty(&document)?).await?;
        write_document(&self.trajectories_path, &serde_json::to_vec_pretty(&trajectories)?).await?;
        tracing::info!(
            "Saved plan with {} pass(es) to {}",
            plan.len(),
            self.plan_path.display()
        );
        Ok(())
    }

    /// Rebuild a saved plan; every pass must have its trajectory
    pub async fn load(&self) -> SequencerResult<PassPlan> {
        let document: PlanDocument = serde_json::from_slice(&tokio::fs::read(&self.plan_path).await?)?;
        let mut trajectories: BTreeMap<String, Vec<TrajectoryPoint>> =
            serde_json::from_slice(&tokio::fs::read(&self.trajectories_path).await?)?;

        let mut passes = Vec::with_capacity(document.passes.len());
        for record in document.passes {
            let points = trajectories.remove(&record.pass_id).ok_or_else(|| {
                SequencerError::Artifact(format!("no trajectory stored for pass {}", record.pass_id))
            })?;
            passes.push(Pass {
                object: record.object,
                start: record.start,
                end: record.end,
                max_elevation_deg: record.max_elevation_deg,
                trajectory: Arc::new(Trajectory::new(points)?),
            });
        }
        Ok(PassPlan::new(
            document.generated_at,
            document.window_start,
            document.window_end,
            passes,
        ))
    }
}

async fn write_document(path: &Path, bytes: &[u8]) -> SequencerResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    write_atomically(path, bytes)
        .await
        .map_err(|e| SequencerError::Artifact(format!("writing {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{linear_pass, t0};

    #[tokio::test]
    async fn test_save_and_load_plan() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = PlanArtifacts::in_dir(&dir.path().join("state"));
        let plan = PassPlan::new(
            t0(),
            t0(),
            t0() + chrono::Duration::hours(7),
            vec![
                linear_pass("43013", t0() + chrono::Duration::seconds(600), 5),
                linear_pass("25544", t0() + chrono::Duration::seconds(60), 20),
            ],
        );
        artifacts.save(&plan).await.unwrap();

        let loaded = artifacts.load().await.unwrap();
        assert_eq!(loaded.records(), plan.records());
        assert_eq!(loaded.window_end, plan.window_end);
        assert_eq!(loaded.passes()[0].trajectory.points(), plan.passes()[0].trajectory.points());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(artifacts.trajectories_path()).unwrap()).unwrap();
        let first = &raw[plan.passes()[0].id()][0];
        assert_eq!(first["azimuth_deg"], 100.0);
        assert!(first["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_load_requires_every_trajectory() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = PlanArtifacts::in_dir(dir.path());
        let plan = PassPlan::new(
            t0(),
            t0(),
            t0(),
            vec![linear_pass("25544", t0(), 3)],
        );
        artifacts.save(&plan).await.unwrap();
        std::fs::write(artifacts.trajectories_path(), "{}").unwrap();

        assert!(matches!(artifacts.load().await, Err(SequencerError::Artifact(_))));
    }
}
