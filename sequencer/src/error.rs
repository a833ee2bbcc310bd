//! Sequencer error types

use satwatch_origin::OriginError;
use thiserror::Error;

/// Errors at the trajectory source boundary
#[derive(Debug, Clone, Error)]
pub enum TrajectoryError {
    #[error("trajectory has no points")]
    Empty,

    #[error("trajectory timestamps not strictly increasing at point {index}")]
    NonMonotonic { index: usize },

    #[error("no trajectory available for {0}")]
    NotFound(String),

    /// The producer failed
    #[error("trajectory source error: {0}")]
    Source(String),
}

#[derive(Debug, Error)]
pub enum SequencerError {
    // ========================================================================
    // Scheduling
    // ========================================================================
    #[error("scheduling {object} failed: {reason}")]
    Scheduling { object: String, reason: String },

    #[error(transparent)]
    Trajectory(#[from] TrajectoryError),

    // ========================================================================
    // Device
    // ========================================================================
    #[error(transparent)]
    Device(#[from] OriginError),

    // ========================================================================
    // Artifacts
    // ========================================================================
    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SequencerResult<T> = Result<T, SequencerError>;
