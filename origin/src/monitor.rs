//! Device health monitoring
//!
//! Probes device subsystems at a low rate on the shared client and keeps the latest result of
//! each. Probe failures are recorded, never propagated.

use crate::client::OriginClient;
use crate::protocol::{targets, verbs, Payload};
use crate::stats::SharedStats;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// One status command issued by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub target: String,
    pub verb: String,
}

impl Probe {
    pub fn new(target: &str, verb: &str) -> Self {
        Self {
            target: target.to_string(),
            verb: verb.to_string(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}.{}", self.target, self.verb)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Time between probe rounds (default: 30 seconds)
    pub interval_secs: u64,
    /// Timeout of each probe command (default: 5 seconds)
    pub probe_timeout_secs: u64,
    pub probes: Vec<Probe>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            probe_timeout_secs: 5,
            probes: vec![
                Probe::new(targets::MOUNT, verbs::GET_STATUS),
                Probe::new(targets::DISK, verbs::GET_STATUS),
                Probe::new(targets::ENVIRONMENT, verbs::GET_STATUS),
                Probe::new(targets::CAMERA, verbs::GET_CAMERA_INFO),
            ],
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

/// Latest known health of one subsystem
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubsystemHealth {
    pub name: String,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_ok: Option<DateTime<Utc>>,
    pub latency_ms: Option<f64>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_payload: Option<Payload>,
}

impl SubsystemHealth {
    pub fn is_healthy(&self) -> bool {
        self.last_ok.is_some() && self.consecutive_failures == 0
    }
}

/// Outcome of a single probe round
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub subsystems: Vec<SubsystemHealth>,
}

impl HealthReport {
    pub fn all_healthy(&self) -> bool {
        self.subsystems.iter().all(SubsystemHealth::is_healthy)
    }

    pub fn failing(&self) -> impl Iterator<Item = &SubsystemHealth> {
        self.subsystems.iter().filter(|s| !s.is_healthy())
    }
}

/// Appends terminal errors from other activities to the connection's error log
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    stats: SharedStats,
}

impl ErrorReporter {
    pub fn new(stats: SharedStats) -> Self {
        Self { stats }
    }

    pub fn report(&self, source: &str, message: &str) {
        self.stats.record_error(source, message);
    }
}

pub struct HealthMonitor {
    client: OriginClient,
    config: MonitorConfig,
    health: Arc<RwLock<BTreeMap<String, SubsystemHealth>>>,
}

impl HealthMonitor {
    pub fn new(client: OriginClient, config: MonitorConfig) -> Self {
        Self {
            client,
            config,
            health: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    pub fn error_reporter(&self) -> ErrorReporter {
        ErrorReporter::new(self.client.stats_handle())
    }

    /// Latest health of every probed subsystem, ordered by name
    pub fn health(&self) -> Vec<SubsystemHealth> {
        self.health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Run every probe once
    pub async fn check_once(&self) -> HealthReport {
        let stats = self.client.stats_handle();
        let mut subsystems = Vec::with_capacity(self.config.probes.len());

        for probe in &self.config.probes {
            let name = probe.name();
            let started = Instant::now();
            let result = self
                .client
                .send_command(&probe.target, &probe.verb, Payload::new(), self.config.probe_timeout())
                .await;
            let now = Utc::now();

            let mut guard = self.health.write().unwrap_or_else(|e| e.into_inner());
            let entry = guard.entry(name.clone()).or_insert_with(|| SubsystemHealth {
                name: name.clone(),
                ..Default::default()
            });
            entry.last_checked = Some(now);
            match result {
                Ok(payload) => {
                    entry.last_ok = Some(now);
                    entry.latency_ms = Some(started.elapsed().as_secs_f64() * 1000.0);
                    entry.last_error = None;
                    entry.consecutive_failures = 0;
                    entry.last_payload = Some(payload);
                    tracing::debug!("Probe {} ok", name);
                }
                Err(e) => {
                    entry.last_error = Some(e.to_string());
                    entry.consecutive_failures += 1;
                    tracing::warn!("Probe {} failed: {}", name, e);
                    stats.record_error(&name, &e.to_string());
                }
            }
            subsystems.push(entry.clone());
        }

        HealthReport {
            checked_at: Utc::now(),
            subsystems,
        }
    }

    /// Probe forever; rounds are skipped while the client is not connected
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !self.client.is_connected() {
                tracing::debug!("Health probes skipped while disconnected");
                continue;
            }
            let report = self.check_once().await;
            if !report.all_healthy() {
                let failing: Vec<_> = report.failing().map(|s| s.name.as_str()).collect();
                tracing::warn!("Unhealthy subsystems: {}", failing.join(", "));
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Handle for reading health while the monitor runs in the background
    pub fn health_handle(&self) -> HealthHandle {
        HealthHandle {
            health: self.health.clone(),
        }
    }
}

/// Read-only view of a running monitor's results
#[derive(Clone)]
pub struct HealthHandle {
    health: Arc<RwLock<BTreeMap<String, SubsystemHealth>>>,
}

impl HealthHandle {
    pub fn snapshot(&self) -> Vec<SubsystemHealth> {
        self.health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use crate::OriginConfig;
    use serde_json::json;

    #[test]
    fn test_default_probes() {
        let config = MonitorConfig::default();
        let names: Vec<_> = config.probes.iter().map(Probe::name).collect();
        assert_eq!(
            names,
            vec!["Mount.GetStatus", "Disk.GetStatus", "Environment.GetStatus", "Camera.GetCameraInfo"]
        );
        assert_eq!(config.interval(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_check_once_records_failures_without_propagating() {
        let mut config = OriginConfig::for_host("memory");
        config.verify_on_connect = false;
        config.heartbeat.enabled = false;
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), config);
        client.connect().await.unwrap();
        let mut device = acceptor.accept().await.unwrap();

        tokio::spawn(async move {
            while let Some(command) = device.next_command().await {
                if command["Destination"] == "Disk" {
                    device
                        .respond_with_code(&command, 5, "disk not mounted", Payload::new())
                        .await;
                } else {
                    let mut payload = Payload::new();
                    payload.insert("Ok".to_string(), json!(true));
                    device.respond(&command, payload).await;
                }
            }
        });

        let monitor = HealthMonitor::new(
            client.clone(),
            MonitorConfig {
                probes: vec![
                    Probe::new(targets::MOUNT, verbs::GET_STATUS),
                    Probe::new(targets::DISK, verbs::GET_STATUS),
                ],
                ..Default::default()
            },
        );

        let report = monitor.check_once().await;
        assert!(!report.all_healthy());
        let failing: Vec<_> = report.failing().map(|s| s.name.clone()).collect();
        assert_eq!(failing, vec!["Disk.GetStatus".to_string()]);

        let health = monitor.health();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].name, "Disk.GetStatus");
        assert_eq!(health[0].consecutive_failures, 1);
        assert!(health[1].is_healthy());

        let stats = client.stats();
        let last = stats.last_error().unwrap();
        assert_eq!(last.source, "Disk.GetStatus");
        assert!(last.message.contains("disk not mounted"));
    }

    #[test]
    fn test_error_reporter_appends_to_log() {
        let stats = SharedStats::new();
        let reporter = ErrorReporter::new(stats.clone());
        reporter.report("pass", "aborted: link lost");
        assert_eq!(stats.snapshot().error_log.len(), 1);
    }
}
