//! Pass scheduling
//!
//! Builds the plan for one observing window: every visible interval of every catalog object
//! becomes a candidate pass, then conflicts closer than the cooldown are resolved in favour of
//! the higher pass.

use crate::error::SequencerError;
use crate::trajectory::{SharedTrajectorySource, Trajectory, TrajectoryPoint};
use crate::{CatalogEntry, Pass, PassPlan};
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Points below this elevation are not observable (default: 20 degrees)
    pub min_elevation_deg: f64,
    /// Minimum time between the end of one pass and the start of the next (default: 120 s)
    pub cooldown_secs: u64,
    /// Local hour at which the observing window closes (default: 05:00)
    pub cutoff_hour: u32,
    /// Offset of local time from UTC, in minutes
    pub cutoff_utc_offset_minutes: i32,
    /// Larger spacing between points splits a pass (default: 1000 ms)
    pub max_sample_gap_ms: u64,
    /// Shorter visible intervals are ignored (default: 2 points)
    pub min_points: usize,
    /// Pause between trajectory requests (default: none)
    pub request_spacing_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_elevation_deg: 20.0,
            cooldown_secs: 120,
            cutoff_hour: 5,
            cutoff_utc_offset_minutes: 0,
            max_sample_gap_ms: 1000,
            min_points: 2,
            request_spacing_ms: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn max_sample_gap(&self) -> Duration {
        Duration::from_millis(self.max_sample_gap_ms)
    }
}

/// `[now, next cutoff]`, where the cutoff is the next occurrence of the cutoff hour after `now`
pub fn observing_window(now: DateTime<Utc>, config: &SchedulerConfig) -> (DateTime<Utc>, DateTime<Utc>) {
    let offset = chrono::Duration::minutes(config.cutoff_utc_offset_minutes as i64);
    let local_now = now.naive_utc() + offset;
    let cutoff_time = NaiveTime::from_hms_opt(config.cutoff_hour % 24, 0, 0).unwrap_or(NaiveTime::MIN);

    let mut cutoff = Utc.from_utc_datetime(&(local_now.date().and_time(cutoff_time) - offset));
    if cutoff <= now {
        cutoff += chrono::Duration::days(1);
    }
    (now, cutoff)
}

/// Maximal runs of observable points without oversized gaps
fn visible_runs<'a>(points: &'a [TrajectoryPoint], config: &SchedulerConfig) -> Vec<&'a [TrajectoryPoint]> {
    let max_gap = chrono::Duration::from_std(config.max_sample_gap()).unwrap_or_else(|_| chrono::Duration::zero());
    let mut runs = Vec::new();
    let mut run_start: Option<usize> = None;

    for (index, point) in points.iter().enumerate() {
        let visible = point.elevation_deg >= config.min_elevation_deg;
        let contiguous = index > 0 && point.timestamp - points[index - 1].timestamp <= max_gap;

        match run_start {
            Some(_) if visible && contiguous => {}
            Some(start) => {
                runs.push(&points[start..index]);
                run_start = visible.then_some(index);
            }
            None if visible => run_start = Some(index),
            None => {}
        }
    }
    if let Some(start) = run_start {
        runs.push(&points[start..]);
    }

    runs.retain(|run| run.len() >= config.min_points.max(1));
    runs
}

/// Higher maximum elevation first, then earlier start, then object id
fn priority(a: &Pass, b: &Pass) -> Ordering {
    b.max_elevation_deg
        .total_cmp(&a.max_elevation_deg)
        .then_with(|| a.start.cmp(&b.start))
        .then_with(|| a.object.object_id.cmp(&b.object.object_id))
        .then_with(|| a.end.cmp(&b.end))
}

fn is_spaced(a: &Pass, b: &Pass, cooldown: chrono::Duration) -> bool {
    let (first, second) = if a.start <= b.start { (a, b) } else { (b, a) };
    second.start - first.end >= cooldown
}

/// Keep the best passes such that every pair is at least `cooldown` apart
pub fn resolve_conflicts(mut candidates: Vec<Pass>, cooldown: Duration) -> Vec<Pass> {
    let cooldown = chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::zero());
    candidates.sort_by(priority);

    let mut accepted: Vec<Pass> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match accepted.iter().find(|kept| !is_spaced(kept, &candidate, cooldown)) {
            Some(kept) => tracing::info!(
                "Dropping {} (max el {:.1}°): within cooldown of {} (max el {:.1}°)",
                candidate.id(),
                candidate.max_elevation_deg,
                kept.id(),
                kept.max_elevation_deg
            ),
            None => accepted.push(candidate),
        }
    }

    accepted.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.object.object_id.cmp(&b.object.object_id)));
    accepted
}

pub struct PassScheduler {
    source: SharedTrajectorySource,
    config: SchedulerConfig,
}

impl PassScheduler {
    pub fn new(source: SharedTrajectorySource, config: SchedulerConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Candidate passes of one object inside the window
    pub async fn candidate_passes(
        &self,
        object: &CatalogEntry,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<Pass>, SequencerError> {
        let scheduling_error = |reason: String| SequencerError::Scheduling {
            object: object.object_id.clone(),
            reason,
        };

        let mut points = self
            .source
            .trajectory(object, window_start, window_end)
            .await
            .map_err(|e| scheduling_error(e.to_string()))?;
        points.retain(|p| p.timestamp >= window_start && p.timestamp <= window_end);
        if points.is_empty() {
            return Ok(Vec::new());
        }
        let trajectory = Trajectory::new(points).map_err(|e| scheduling_error(e.to_string()))?;

        let mut passes = Vec::new();
        for run in visible_runs(trajectory.points(), &self.config) {
            let segment = Trajectory::new(run.to_vec()).map_err(|e| scheduling_error(e.to_string()))?;
            passes.push(Pass::new(object.clone(), segment));
        }
        Ok(passes)
    }

    /// Build the plan for the window starting at `now`
    ///
    /// Objects whose trajectory cannot be obtained are logged and skipped.
    pub async fn build_plan(&self, catalog: &[CatalogEntry], now: DateTime<Utc>) -> PassPlan {
        let (window_start, window_end) = observing_window(now, &self.config);
        tracing::info!(
            "Scheduling {} object(s) between {} and {}",
            catalog.len(),
            window_start.format("%Y-%m-%d %H:%M:%S UTC"),
            window_end.format("%Y-%m-%d %H:%M:%S UTC")
        );

        let mut candidates = Vec::new();
        for (index, object) in catalog.iter().enumerate() {
            if index > 0 && self.config.request_spacing_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.request_spacing_ms)).await;
            }
            match self.candidate_passes(object, window_start, window_end).await {
                Ok(passes) if passes.is_empty() => {
                    tracing::info!(
                        "{} ({}) never reaches {:.0}° in this window",
                        object.name,
                        object.object_id,
                        self.config.min_elevation_deg
                    );
                }
                Ok(passes) => {
                    tracing::debug!("{} candidate pass(es) for {}", passes.len(), object.name);
                    candidates.extend(passes);
                }
                Err(e) => tracing::warn!("Skipping {}: {}", object.name, e),
            }
        }

        let passes = resolve_conflicts(candidates, self.config.cooldown());
        for pass in &passes {
            tracing::info!(
                "Planned {} {} -> {} (max el {:.1}°)",
                pass.object.name,
                pass.start.format("%H:%M:%S"),
                pass.end.format("%H:%M:%S"),
                pass.max_elevation_deg
            );
        }
        PassPlan::new(now, window_start, window_end, passes)
    }
}
