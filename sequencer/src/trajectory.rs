//! Trajectories and their source
//!
//! Positions are computed elsewhere; a [`TrajectorySource`] hands over timestamped
//! azimuth/elevation points for an object over a time range.

use crate::error::TrajectoryError;
use crate::CatalogEntry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use satwatch_origin::AltAzTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// A timestamped horizontal position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "PointRecord")]
pub struct TrajectoryPoint {
    pub timestamp: DateTime<Utc>,
    pub azimuth_deg: f64,
    pub elevation_deg: f64,
    pub azimuth_rad: f64,
    pub elevation_rad: f64,
}

#[derive(Deserialize)]
struct PointRecord {
    timestamp: DateTime<Utc>,
    azimuth_deg: f64,
    elevation_deg: f64,
}

impl From<PointRecord> for TrajectoryPoint {
    fn from(record: PointRecord) -> Self {
        TrajectoryPoint::from_degrees(record.timestamp, record.azimuth_deg, record.elevation_deg)
    }
}

impl TrajectoryPoint {
    pub fn from_degrees(timestamp: DateTime<Utc>, azimuth_deg: f64, elevation_deg: f64) -> Self {
        Self {
            timestamp,
            azimuth_deg,
            elevation_deg,
            azimuth_rad: azimuth_deg.to_radians(),
            elevation_rad: elevation_deg.to_radians(),
        }
    }

    /// Mount target for this point, in radians
    pub fn target(&self) -> AltAzTarget {
        AltAzTarget::from_radians(self.elevation_rad, self.azimuth_rad)
    }
}

/// Points with strictly increasing timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub fn new(points: Vec<TrajectoryPoint>) -> Result<Self, TrajectoryError> {
        if points.is_empty() {
            return Err(TrajectoryError::Empty);
        }
        if let Some(index) = points
            .windows(2)
            .position(|pair| pair[1].timestamp <= pair[0].timestamp)
        {
            return Err(TrajectoryError::NonMonotonic { index: index + 1 });
        }
        Ok(Self { points })
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> &TrajectoryPoint {
        &self.points[0]
    }

    pub fn last(&self) -> &TrajectoryPoint {
        &self.points[self.points.len() - 1]
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.first().timestamp
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.last().timestamp
    }

    pub fn max_elevation_deg(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.elevation_deg)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// The most recent point due at `at`; never one in the future
    pub fn point_at_or_before(&self, at: DateTime<Utc>) -> Option<&TrajectoryPoint> {
        let due = self.points.partition_point(|p| p.timestamp <= at);
        due.checked_sub(1).map(|index| &self.points[index])
    }

    /// Spacing of the first two points, the nominal sampling step
    pub fn sample_interval(&self) -> Option<Duration> {
        self.points
            .get(1)
            .and_then(|second| (second.timestamp - self.points[0].timestamp).to_std().ok())
    }

    /// Largest spacing between consecutive points
    pub fn max_gap(&self) -> Duration {
        self.points
            .windows(2)
            .filter_map(|pair| (pair[1].timestamp - pair[0].timestamp).to_std().ok())
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// Producer of trajectories for catalog objects
#[async_trait]
pub trait TrajectorySource: Send + Sync {
    /// Points for `object` between `start` and `end`, in time order
    async fn trajectory(
        &self,
        object: &CatalogEntry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrajectoryPoint>, TrajectoryError>;
}

pub type SharedTrajectorySource = Arc<dyn TrajectorySource>;

/// Serves precomputed trajectories, keyed by object id
///
/// The file format is a JSON object mapping each object id to a list of
/// `{"timestamp", "azimuth_deg", "elevation_deg"}` points.
#[derive(Debug, Clone, Default)]
pub struct FileTrajectorySource {
    trajectories: HashMap<String, Vec<TrajectoryPoint>>,
}

impl FileTrajectorySource {
    pub fn from_map(trajectories: HashMap<String, Vec<TrajectoryPoint>>) -> Self {
        Self { trajectories }
    }

    pub async fn load(path: &Path) -> Result<Self, TrajectoryError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TrajectoryError::Source(format!("reading {}: {}", path.display(), e)))?;
        let trajectories = serde_json::from_str(&text)
            .map_err(|e| TrajectoryError::Source(format!("parsing {}: {}", path.display(), e)))?;
        Ok(Self { trajectories })
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &str> {
        self.trajectories.keys().map(String::as_str)
    }
}

#[async_trait]
impl TrajectorySource for FileTrajectorySource {
    async fn trajectory(
        &self,
        object: &CatalogEntry,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TrajectoryPoint>, TrajectoryError> {
        let points = self
            .trajectories
            .get(&object.object_id)
            .ok_or_else(|| TrajectoryError::NotFound(object.object_id.clone()))?;
        Ok(points
            .iter()
            .filter(|p| p.timestamp >= start && p.timestamp <= end)
            .copied()
            .collect())
    }
}
