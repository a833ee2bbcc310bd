//! Connection statistics
//!
//! Counters and rolling logs describing the life of one client connection. Written by the
//! client's connection lifecycle, its heartbeat and the health monitor; everyone else reads
//! snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Entries kept in the rolling error log
pub const MAX_ERROR_LOG: usize = 50;
/// Heartbeat latency samples kept
pub const MAX_LATENCY_SAMPLES: usize = 50;

/// Connection state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Link is up but heartbeats are not being answered
    Degraded,
}

impl ConnectionState {
    /// Commands may be sent in this state
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub failed_connections: u64,
    pub disconnections: u64,
    pub reconnections: u64,
    /// Attempt number of the reconnection currently in progress (0 when none)
    pub reconnect_attempt: u32,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub missed_heartbeats: u32,
    pub error_log: VecDeque<ErrorRecord>,
    pub ping_latencies: VecDeque<LatencySample>,
}

impl ConnectionStats {
    /// Time since the current connection was established
    pub fn uptime(&self, now: DateTime<Utc>) -> Option<Duration> {
        if !self.state.is_usable() {
            return None;
        }
        self.last_connected
            .and_then(|since| (now - since).to_std().ok())
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.ping_latencies.is_empty() {
            return None;
        }
        let total: f64 = self.ping_latencies.iter().map(|s| s.latency_ms).sum();
        Some(total / self.ping_latencies.len() as f64)
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error_log.back()
    }
}

/// Shared handle over one client's statistics
#[derive(Debug, Clone, Default)]
pub struct SharedStats {
    inner: Arc<RwLock<ConnectionStats>>,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ConnectionStats {
        self.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.read().state
    }

    fn read(&self) -> RwLockReadGuard<'_, ConnectionStats> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConnectionStats> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the previous state if it changed
    pub(crate) fn set_state(&self, state: ConnectionState) -> Option<ConnectionState> {
        let mut stats = self.write();
        if stats.state == state {
            return None;
        }
        Some(std::mem::replace(&mut stats.state, state))
    }

    /// Change state only while in `expected`
    pub(crate) fn set_state_if(&self, expected: ConnectionState, state: ConnectionState) -> bool {
        let mut stats = self.write();
        if stats.state != expected {
            return false;
        }
        stats.state = state;
        true
    }

    pub(crate) fn record_attempt(&self) {
        self.write().connection_attempts += 1;
    }

    pub(crate) fn record_connected(&self, is_reconnect: bool) {
        let mut stats = self.write();
        stats.successful_connections += 1;
        if is_reconnect {
            stats.reconnections += 1;
        }
        stats.reconnect_attempt = 0;
        stats.missed_heartbeats = 0;
        stats.last_connected = Some(Utc::now());
    }

    pub(crate) fn record_failed_connect(&self, error: &str) {
        self.write().failed_connections += 1;
        self.record_error("connection", error);
    }

    pub(crate) fn record_disconnected(&self, reason: &str) {
        {
            let mut stats = self.write();
            stats.disconnections += 1;
            stats.last_disconnected = Some(Utc::now());
        }
        self.record_error("connection", reason);
    }

    pub(crate) fn set_reconnect_attempt(&self, attempt: u32) {
        self.write().reconnect_attempt = attempt;
    }

    pub(crate) fn record_heartbeat_ok(&self, latency: Duration) {
        let mut stats = self.write();
        stats.missed_heartbeats = 0;
        stats.ping_latencies.push_back(LatencySample {
            timestamp: Utc::now(),
            latency_ms: latency.as_secs_f64() * 1000.0,
        });
        while stats.ping_latencies.len() > MAX_LATENCY_SAMPLES {
            stats.ping_latencies.pop_front();
        }
    }

    /// Returns the number of consecutive misses, including this one
    pub(crate) fn record_heartbeat_missed(&self) -> u32 {
        let mut stats = self.write();
        stats.missed_heartbeats += 1;
        stats.missed_heartbeats
    }

    /// Append to the rolling error log
    pub fn record_error(&self, source: &str, message: &str) {
        let mut stats = self.write();
        stats.error_log.push_back(ErrorRecord {
            timestamp: Utc::now(),
            source: source.to_string(),
            message: message.to_string(),
        });
        while stats.error_log.len() > MAX_ERROR_LOG {
            stats.error_log.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_log_is_bounded() {
        let stats = SharedStats::new();
        for i in 0..(MAX_ERROR_LOG + 10) {
            stats.record_error("test", &format!("error {}", i));
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.error_log.len(), MAX_ERROR_LOG);
        assert_eq!(snapshot.error_log.front().unwrap().message, "error 10");
        assert_eq!(snapshot.last_error().unwrap().message, "error 59");
    }

    #[test]
    fn test_latency_samples_bounded_and_averaged() {
        let stats = SharedStats::new();
        for _ in 0..(MAX_LATENCY_SAMPLES + 5) {
            stats.record_heartbeat_ok(Duration::from_millis(20));
        }
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.ping_latencies.len(), MAX_LATENCY_SAMPLES);
        let avg = snapshot.average_latency_ms().unwrap();
        assert!((avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_connection_counters() {
        let stats = SharedStats::new();
        stats.record_attempt();
        stats.record_connected(false);
        stats.set_state(ConnectionState::Connected);
        stats.record_disconnected("socket closed");
        stats.set_reconnect_attempt(1);
        stats.record_attempt();
        stats.record_connected(true);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connection_attempts, 2);
        assert_eq!(snapshot.successful_connections, 2);
        assert_eq!(snapshot.disconnections, 1);
        assert_eq!(snapshot.reconnections, 1);
        assert_eq!(snapshot.reconnect_attempt, 0);
        assert_eq!(snapshot.last_error().unwrap().message, "socket closed");
    }

    #[test]
    fn test_uptime_only_while_usable() {
        let stats = SharedStats::new();
        stats.record_connected(false);
        let now = Utc::now() + chrono::Duration::seconds(10);
        assert!(stats.snapshot().uptime(now).is_none());

        stats.set_state(ConnectionState::Degraded);
        let uptime = stats.snapshot().uptime(now).unwrap();
        assert!(uptime >= Duration::from_secs(9));
    }

    #[test]
    fn test_heartbeat_miss_counter_resets() {
        let stats = SharedStats::new();
        assert_eq!(stats.record_heartbeat_missed(), 1);
        assert_eq!(stats.record_heartbeat_missed(), 2);
        stats.record_heartbeat_ok(Duration::from_millis(5));
        assert_eq!(stats.record_heartbeat_missed(), 1);
    }
}
