//! Pass scheduling and execution
//!
//! Turns precomputed trajectories into a plan of non-conflicting passes and flies each pass in
//! real time: pre-position, stream pointing updates, trigger captures, collect images.

pub mod artifacts;
pub mod clock;
pub mod device_ops;
mod error;
pub mod executor;
pub mod scheduler;
pub mod session;
pub mod trajectory;

#[cfg(test)]
mod testing;

pub use artifacts::PlanArtifacts;
pub use clock::{Clock, MonotonicClock, SharedClock, SystemClock};
pub use device_ops::{OriginScopeOps, ScopeOps, SharedScopeOps};
pub use error::{SequencerError, SequencerResult, TrajectoryError};
pub use executor::{CancelToken, ExecutorConfig, ExecutorEvent, PassExecutor, PassReport, PassState};
pub use scheduler::{observing_window, PassScheduler, SchedulerConfig};
pub use session::PassSession;
pub use trajectory::{FileTrajectorySource, SharedTrajectorySource, Trajectory, TrajectoryPoint, TrajectorySource};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// An object that can be tracked
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Catalog number, e.g. a NORAD id
    pub object_id: String,
    pub name: String,
}

impl CatalogEntry {
    pub fn new(object_id: &str, name: &str) -> Self {
        Self {
            object_id: object_id.to_string(),
            name: name.to_string(),
        }
    }
}

/// A scheduled visibility window of one object
#[derive(Debug, Clone)]
pub struct Pass {
    pub object: CatalogEntry,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_elevation_deg: f64,
    pub trajectory: Arc<Trajectory>,
}

impl Pass {
    /// Build a pass spanning the whole trajectory
    pub fn new(object: CatalogEntry, trajectory: Trajectory) -> Self {
        Self {
            object,
            start: trajectory.start(),
            end: trajectory.end(),
            max_elevation_deg: trajectory.max_elevation_deg(),
            trajectory: Arc::new(trajectory),
        }
    }

    /// Stable identifier: object id and start time
    pub fn id(&self) -> String {
        format!("{}_{}", self.object.object_id, self.start.timestamp())
    }

    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }

    /// When pre-positioning for this pass begins
    pub fn pre_position_at(&self, lead: Duration) -> DateTime<Utc> {
        self.start - chrono::Duration::from_std(lead).unwrap_or_else(|_| chrono::Duration::zero())
    }

    pub fn record(&self) -> PassRecord {
        PassRecord {
            pass_id: self.id(),
            object: self.object.clone(),
            start: self.start,
            end: self.end,
            max_elevation_deg: self.max_elevation_deg,
            points: self.trajectory.len(),
        }
    }
}

/// Serializable summary of a pass; the trajectory is stored separately
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassRecord {
    pub pass_id: String,
    pub object: CatalogEntry,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub max_elevation_deg: f64,
    pub points: usize,
}

/// Passes of one scheduling cycle, ascending by start
///
/// Never modified once built; cloning shares the same passes.
#[derive(Debug, Clone)]
pub struct PassPlan {
    pub generated_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    passes: Arc<[Pass]>,
}

impl PassPlan {
    pub fn new(
        generated_at: DateTime<Utc>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        mut passes: Vec<Pass>,
    ) -> Self {
        passes.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.object.object_id.cmp(&b.object.object_id)));
        Self {
            generated_at,
            window_start,
            window_end,
            passes: passes.into(),
        }
    }

    pub fn empty(now: DateTime<Utc>, window_end: DateTime<Utc>) -> Self {
        Self::new(now, now, window_end, Vec::new())
    }

    pub fn passes(&self) -> &[Pass] {
        &self.passes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Pass> {
        self.passes.iter()
    }

    pub fn len(&self) -> usize {
        self.passes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn records(&self) -> Vec<PassRecord> {
        self.passes.iter().map(Pass::record).collect()
    }

    /// Every consecutive pair is separated by at least `cooldown`
    pub fn is_spaced_by(&self, cooldown: Duration) -> bool {
        let cooldown = chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
        self.passes
            .windows(2)
            .all(|pair| pair[1].start - pair[0].end >= cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pass_at(id: &str, start_offset: i64, len: i64) -> Pass {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap();
        let points = (0..len)
            .map(|i| TrajectoryPoint::from_degrees(t0 + chrono::Duration::seconds(start_offset + i), 180.0, 30.0 + i as f64))
            .collect();
        Pass::new(CatalogEntry::new(id, id), Trajectory::new(points).unwrap())
    }

    #[test]
    fn test_pass_fields_from_trajectory() {
        let pass = pass_at("25544", 0, 11);
        assert_eq!(pass.duration(), Duration::from_secs(10));
        assert_eq!(pass.max_elevation_deg, 40.0);
        assert_eq!(pass.id(), format!("25544_{}", pass.start.timestamp()));
        assert_eq!(
            pass.pre_position_at(Duration::from_secs(45)),
            pass.start - chrono::Duration::seconds(45)
        );
        assert_eq!(pass.record().points, 11);
    }

    #[test]
    fn test_plan_sorted_and_spacing() {
        let plan = PassPlan::new(
            Utc::now(),
            Utc::now(),
            Utc::now(),
            vec![pass_at("b", 300, 10), pass_at("a", 0, 10)],
        );
        assert_eq!(plan.passes()[0].object.object_id, "a");
        assert!(plan.is_spaced_by(Duration::from_secs(120)));
        assert!(!plan.is_spaced_by(Duration::from_secs(400)));

        let shared = plan.clone();
        assert!(std::ptr::eq(shared.passes().as_ptr(), plan.passes().as_ptr()));
    }
}
