//! Origin protocol client
//!
//! Multiplexes commands, their responses and device notifications over one link. A supervisor
//! task owns the link: it runs the dispatch loop and, when the link drops, fails every pending
//! command and reconnects with exponential backoff. A heartbeat task pings the device and marks
//! the connection degraded when pings go unanswered.

use crate::error::{OriginError, OriginResult};
use crate::protocol::{targets, verbs, Command, Envelope, Notification, Payload, Response};
use crate::stats::{ConnectionState, ConnectionStats, SharedStats};
use crate::transport::{Connector, WebSocketConnector};
use crate::OriginConfig;
use futures::Stream;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, timeout_at, Instant, MissedTickBehavior};

/// Reconnection configuration with jitter support
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// Base delay for exponential backoff
    pub base_delay_secs: u64,
    /// Maximum delay cap
    pub max_delay_secs: u64,
    /// Give up after this many attempts (None keeps trying)
    pub max_attempts: Option<u32>,
    pub use_jitter: bool,
    /// Total jitter width as a fraction of the delay (0.4 = ±20%)
    pub jitter_factor: f64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 30,
            max_attempts: None,
            use_jitter: true,
            jitter_factor: 0.4,
        }
    }
}

impl ReconnectionConfig {
    /// Delay before reconnection attempt `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_secs(self.base_delay_secs);
        let max = Duration::from_secs(self.max_delay_secs);

        let exponential_delay = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| base.checked_mul(factor))
            .unwrap_or(max)
            .min(max);

        if self.use_jitter && self.jitter_factor > 0.0 {
            let jitter_range = exponential_delay.as_secs_f64() * self.jitter_factor;
            let random_factor = rand::thread_rng().gen::<f64>() * jitter_range - (jitter_range / 2.0);
            let jittered_secs = (exponential_delay.as_secs_f64() + random_factor).max(0.1);
            Duration::from_secs_f64(jittered_secs.min(max.as_secs_f64()))
        } else {
            exponential_delay
        }
    }
}

/// Heartbeat supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    /// Consecutive misses before the connection is marked Degraded
    pub missed_before_degraded: u32,
    /// Consecutive misses before the link is dropped and re-established
    pub missed_before_reconnect: Option<u32>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            timeout_secs: 5,
            missed_before_degraded: 3,
            missed_before_reconnect: Some(6),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OriginEvent {
    StateChanged(ConnectionState),
    ReconnectScheduled { attempt: u32, delay_ms: u64 },
    Reconnected { attempts: u32 },
    ReconnectFailed { attempts: u32, last_error: String },
    Heartbeat { latency_ms: f64 },
    HeartbeatMissed { consecutive: u32 },
}

/// Ordered notifications for one event name
///
/// Yields every matching notification received while it is held. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    event: String,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl Subscription {
    /// Wrap an existing notification channel
    pub fn from_channel(event: impl Into<String>, rx: mpsc::UnboundedReceiver<Notification>) -> Self {
        Self {
            event: event.into(),
            rx,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub async fn next(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

type PendingResponse = oneshot::Sender<OriginResult<Response>>;

enum LinkEnd {
    Shutdown,
    Lost(String),
}

struct ClientTasks {
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
    heartbeat: Option<JoinHandle<()>>,
}

struct Shared {
    config: OriginConfig,
    connector: Arc<dyn Connector>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingResponse>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Notification>>>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    stats: SharedStats,
    events: broadcast::Sender<OriginEvent>,
    link_kick: Notify,
    tasks: Mutex<Option<ClientTasks>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Client for one telescope's control endpoint
#[derive(Clone)]
pub struct OriginClient {
    shared: Arc<Shared>,
}

impl OriginClient {
    pub fn new(connector: Arc<dyn Connector>, config: OriginConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                next_id: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                stats: SharedStats::new(),
                events,
                link_kick: Notify::new(),
                tasks: Mutex::new(None),
            }),
        }
    }

    /// Client using the WebSocket control endpoint of `config.host`
    pub fn websocket(config: OriginConfig) -> Self {
        let connector = WebSocketConnector::for_host(&config.host)
            .with_connect_timeout(config.timeouts.connection_timeout());
        Self::new(Arc::new(connector), config)
    }

    pub fn config(&self) -> &OriginConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.stats.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_usable()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats.snapshot()
    }

    pub fn stats_handle(&self) -> SharedStats {
        self.shared.stats.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<OriginEvent> {
        self.shared.events.subscribe()
    }

    /// Connect to the device
    ///
    /// Once this succeeds the client keeps itself connected until [`disconnect`](Self::disconnect).
    pub async fn connect(&self) -> OriginResult<()> {
        {
            let mut tasks = lock(&self.shared.tasks);
            if let Some(running) = tasks.as_ref() {
                if !running.supervisor.is_finished() {
                    if self.shared.stats.state().is_usable() {
                        tracing::debug!("Connect requested while already connected");
                        return Ok(());
                    }
                    return Err(OriginError::Link(format!(
                        "connection to {} is being re-established",
                        self.shared.connector.endpoint()
                    )));
                }
                *tasks = None;
            }
        }

        let shared = &self.shared;
        shared.set_state(ConnectionState::Connecting);
        let link = match shared.open_link().await {
            Ok(link) => link,
            Err(e) => {
                shared.stats.record_failed_connect(&e.to_string());
                shared.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        shared.install_link(link.outbound);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(shared.clone(), link.inbound, shutdown_rx.clone()));
        *lock(&shared.tasks) = Some(ClientTasks {
            shutdown: shutdown_tx,
            supervisor,
            heartbeat: None,
        });

        if shared.config.verify_on_connect {
            let check = shared
                .request(
                    targets::SYSTEM,
                    verbs::GET_VERSION,
                    Payload::new(),
                    shared.config.heartbeat.timeout(),
                    false,
                )
                .await;
            if let Err(e) = check {
                let error = OriginError::Link(format!("device did not answer version check: {}", e));
                self.stop_tasks().await;
                shared.drop_link(&error.to_string());
                shared.stats.record_failed_connect(&error.to_string());
                shared.set_state(ConnectionState::Disconnected);
                return Err(error);
            }
        }

        shared.stats.record_connected(false);
        shared.set_state(ConnectionState::Connected);

        if shared.config.heartbeat.enabled {
            let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), shutdown_rx));
            if let Some(tasks) = lock(&shared.tasks).as_mut() {
                tasks.heartbeat = Some(heartbeat);
            }
        }

        tracing::info!("Connected to {}", shared.connector.endpoint());
        Ok(())
    }

    /// Close the link and stop reconnecting
    pub async fn disconnect(&self) {
        self.stop_tasks().await;
        self.shared.drop_link("client disconnected");
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!("Disconnected from {}", self.shared.connector.endpoint());
    }

    async fn stop_tasks(&self) {
        let tasks = lock(&self.shared.tasks).take();
        if let Some(tasks) = tasks {
            let _ = tasks.shutdown.send(true);
            if let Some(heartbeat) = tasks.heartbeat {
                heartbeat.abort();
                let _ = heartbeat.await;
            }
            let _ = tasks.supervisor.await;
        }
    }

    /// Send a command and wait for its response payload
    ///
    /// Fails with `CommandTimeout` if no response arrives within `timeout`, `CommandRejected`
    /// if the device answers with a non-zero code, and `Link` if the client is not connected
    /// or the link drops while waiting.
    pub async fn send_command(
        &self,
        target: &str,
        verb: &str,
        payload: Payload,
        timeout: Duration,
    ) -> OriginResult<Payload> {
        let method = format!("{}.{}", target, verb);
        let response = self
            .shared
            .request(target, verb, payload, timeout, true)
            .await?;
        if !response.is_success() {
            return Err(OriginError::CommandRejected {
                method,
                code: response.result_code,
                message: response.message,
            });
        }
        Ok(response.payload)
    }

    /// [`send_command`](Self::send_command) with the configured default timeout
    pub async fn call(&self, target: &str, verb: &str, payload: Payload) -> OriginResult<Payload> {
        let timeout = self.shared.config.timeouts.command_timeout();
        self.send_command(target, verb, payload, timeout).await
    }

    /// Subscribe to notifications named `event`
    pub fn subscribe(&self, event: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared.subscribers)
            .entry(event.to_string())
            .or_default()
            .push(tx);
        Subscription::from_channel(event, rx)
    }

    /// Number of commands currently awaiting a response
    pub fn pending_count(&self) -> usize {
        lock(&self.shared.pending).len()
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        if let Some(previous) = self.stats.set_state(state) {
            tracing::info!("Connection state {:?} -> {:?}", previous, state);
            let _ = self.events.send(OriginEvent::StateChanged(state));
        }
    }

    fn set_state_if(&self, expected: ConnectionState, state: ConnectionState) {
        if self.stats.set_state_if(expected, state) {
            tracing::info!("Connection state {:?} -> {:?}", expected, state);
            let _ = self.events.send(OriginEvent::StateChanged(state));
        }
    }

    async fn open_link(&self) -> OriginResult<crate::transport::Link> {
        self.stats.record_attempt();
        let connect_timeout = self.config.timeouts.connection_timeout();
        match timeout(connect_timeout, self.connector.connect()).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::Link(format!(
                "connection to {} timed out after {:?}",
                self.connector.endpoint(),
                connect_timeout
            ))),
        }
    }

    fn install_link(&self, outbound: mpsc::Sender<String>) {
        *lock(&self.outbound) = Some(outbound);
    }

    /// Release the current link and fail everything waiting on it
    fn drop_link(&self, reason: &str) {
        lock(&self.outbound).take();
        let pending: Vec<_> = lock(&self.pending).drain().collect();
        if !pending.is_empty() {
            tracing::warn!("Failing {} pending command(s): {}", pending.len(), reason);
        }
        for (_, waiter) in pending {
            let _ = waiter.send(Err(OriginError::Link(reason.to_string())));
        }
    }

    async fn request(
        &self,
        target: &str,
        verb: &str,
        payload: Payload,
        wait: Duration,
        require_usable: bool,
    ) -> OriginResult<Response> {
        if require_usable && !self.stats.state().is_usable() {
            return Err(OriginError::not_connected());
        }

        let deadline = Instant::now() + wait;
        let correlation_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let command = Command::new(target, verb, payload, correlation_id);
        let frame = command.to_json()?;
        let (tx, mut rx) = oneshot::channel();

        // Registration and link lookup happen under the pending lock so that a concurrent
        // drop_link either sees this waiter or this call sees no link.
        let sender = {
            let mut pending = lock(&self.pending);
            let sender = lock(&self.outbound)
                .clone()
                .ok_or_else(OriginError::not_connected)?;
            pending.insert(correlation_id, tx);
            sender
        };

        tracing::debug!("-> {} #{}", command.method(), correlation_id);
        // A stalled writer must not outlast the caller's timeout.
        match timeout_at(deadline, sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                lock(&self.pending).remove(&correlation_id);
                return Err(OriginError::Link("link closed while sending".to_string()));
            }
            Err(_) => {
                lock(&self.pending).remove(&correlation_id);
                tracing::warn!(
                    "{} #{} could not be sent within {:?}",
                    command.method(),
                    correlation_id,
                    wait
                );
                return Err(OriginError::CommandTimeout {
                    method: command.method(),
                    correlation_id,
                    timeout: wait,
                });
            }
        }

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OriginError::Link("response channel closed".to_string())),
            Err(_) => {
                if lock(&self.pending).remove(&correlation_id).is_none() {
                    // Resolved between the deadline and now
                    if let Ok(result) = rx.try_recv() {
                        return result;
                    }
                }
                tracing::warn!("{} #{} timed out after {:?}", command.method(), correlation_id, wait);
                Err(OriginError::CommandTimeout {
                    method: command.method(),
                    correlation_id,
                    timeout: wait,
                })
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Dropping inbound frame: {}", e);
                return;
            }
        };

        if let Some(id) = envelope.response_id() {
            let waiter = lock(&self.pending).remove(&id);
            if let Some(waiter) = waiter {
                tracing::debug!("<- response #{}", id);
                let _ = waiter.send(Ok(envelope.into_response(id)));
                return;
            }
            if envelope.kind.as_deref() == Some(crate::protocol::envelope_types::RESPONSE) {
                tracing::warn!("Discarding unmatched response #{}", id);
                return;
            }
        }

        match envelope.into_notification() {
            Some(notification) => self.publish(notification),
            None => tracing::warn!("Dropping frame with no correlation and no event name"),
        }
    }

    fn publish(&self, notification: Notification) {
        let mut subscribers = lock(&self.subscribers);
        let Some(list) = subscribers.get_mut(&notification.event) else {
            tracing::debug!(
                "No subscribers for {}.{}",
                notification.source,
                notification.event
            );
            return;
        };
        list.retain(|tx| tx.send(notification.clone()).is_ok());
        if list.is_empty() {
            subscribers.remove(&notification.event);
        }
    }

    async fn run_link(
        &self,
        inbound: &mut mpsc::Receiver<OriginResult<String>>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(e)) => return LinkEnd::Lost(e.to_string()),
                    None => return LinkEnd::Lost("link closed".to_string()),
                },
                _ = self.link_kick.notified() => {
                    return LinkEnd::Lost("heartbeat not answered".to_string());
                }
                _ = wait_shutdown(shutdown) => return LinkEnd::Shutdown,
            }
        }
    }

    /// Re-establish the link; None when shut down or out of attempts
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<mpsc::Receiver<OriginResult<String>>> {
        let config = &self.config.reconnection;
        let mut attempt: u32 = 0;
        let mut last_error = String::new();

        loop {
            attempt += 1;
            if let Some(max) = config.max_attempts {
                if attempt > max {
                    let error = OriginError::ReconnectionFailed {
                        attempts: max,
                        last_error: last_error.clone(),
                    };
                    tracing::error!("{}", error);
                    self.stats.record_error("connection", &error.to_string());
                    self.stats.set_reconnect_attempt(0);
                    let _ = self.events.send(OriginEvent::ReconnectFailed {
                        attempts: max,
                        last_error,
                    });
                    self.set_state(ConnectionState::Disconnected);
                    return None;
                }
            }

            let delay = config.calculate_delay(attempt);
            self.stats.set_reconnect_attempt(attempt);
            let _ = self.events.send(OriginEvent::ReconnectScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tracing::info!(
                "Reconnection attempt {} to {} in {:.1}s",
                attempt,
                self.connector.endpoint(),
                delay.as_secs_f64()
            );

            tokio::select! {
                _ = sleep(delay) => {}
                _ = wait_shutdown(shutdown) => return None,
            }

            self.set_state(ConnectionState::Connecting);
            let result = tokio::select! {
                result = self.open_link() => result,
                _ = wait_shutdown(shutdown) => return None,
            };

            match result {
                Ok(link) => {
                    self.install_link(link.outbound);
                    self.stats.record_connected(true);
                    self.set_state(ConnectionState::Connected);
                    let _ = self.events.send(OriginEvent::Reconnected { attempts: attempt });
                    tracing::info!("Reconnected after {} attempt(s)", attempt);
                    return Some(link.inbound);
                }
                Err(e) => {
                    tracing::warn!("Reconnection attempt {} failed: {}", attempt, e);
                    self.stats.record_failed_connect(&e.to_string());
                    self.set_state(ConnectionState::Disconnected);
                    last_error = e.to_string();
                }
            }
        }
    }
}

/// Owns the link for the lifetime of a connection, including reconnections
async fn supervise(
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<OriginResult<String>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut inbound = inbound;
    loop {
        match shared.run_link(&mut inbound, &mut shutdown).await {
            LinkEnd::Shutdown => {
                shared.drop_link("client disconnected");
                break;
            }
            LinkEnd::Lost(reason) => {
                tracing::warn!("Link to {} lost: {}", shared.connector.endpoint(), reason);
                shared.drop_link(&reason);
                shared.stats.record_disconnected(&reason);
                shared.set_state(ConnectionState::Disconnected);
            }
        }

        match shared.reconnect(&mut shutdown).await {
            Some(next) => inbound = next,
            None => break,
        }
    }
    tracing::debug!("Link supervisor stopped");
}

async fn heartbeat_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let config = shared.config.heartbeat.clone();
    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; the connection was just verified
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }

        if !shared.stats.state().is_usable() {
            continue;
        }

        let started = Instant::now();
        let result = shared
            .request(targets::SYSTEM, verbs::GET_VERSION, Payload::new(), config.timeout(), true)
            .await;

        match result {
            Ok(_) => {
                let latency = started.elapsed();
                tracing::debug!("Heartbeat answered in {:?}", latency);
                shared.stats.record_heartbeat_ok(latency);
                let _ = shared.events.send(OriginEvent::Heartbeat {
                    latency_ms: latency.as_secs_f64() * 1000.0,
                });
                shared.set_state_if(ConnectionState::Degraded, ConnectionState::Connected);
            }
            Err(e) if e.is_link() => {
                tracing::debug!("Heartbeat skipped: {}", e);
            }
            Err(e) => {
                let missed = shared.stats.record_heartbeat_missed();
                tracing::warn!("Heartbeat missed ({} consecutive): {}", missed, e);
                let _ = shared
                    .events
                    .send(OriginEvent::HeartbeatMissed { consecutive: missed });
                if missed >= config.missed_before_degraded {
                    shared.set_state_if(ConnectionState::Connected, ConnectionState::Degraded);
                }
                if let Some(limit) = config.missed_before_reconnect {
                    if missed >= limit {
                        tracing::warn!("Dropping unresponsive link after {} missed heartbeats", missed);
                        shared.link_kick.notify_one();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceAcceptor, DeviceEnd, MemoryConnector};
    use serde_json::{json, Value};

    fn test_config() -> OriginConfig {
        let mut config = OriginConfig::for_host("memory");
        config.verify_on_connect = false;
        config.heartbeat.enabled = false;
        config.reconnection.use_jitter = false;
        config
    }

    async fn connected_client(config: OriginConfig) -> (OriginClient, DeviceAcceptor, DeviceEnd) {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), config);
        client.connect().await.unwrap();
        let device = acceptor.accept().await.unwrap();
        (client, acceptor, device)
    }

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => Payload::new(),
        }
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let config = ReconnectionConfig {
            use_jitter: false,
            ..Default::default()
        };
        assert_eq!(config.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(3), Duration::from_secs(4));
        assert_eq!(config.calculate_delay(4), Duration::from_secs(8));
        assert_eq!(config.calculate_delay(5), Duration::from_secs(16));
        assert_eq!(config.calculate_delay(6), Duration::from_secs(30));
        assert_eq!(config.calculate_delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_backoff_jitter_range() {
        let config = ReconnectionConfig::default();
        for _ in 0..50 {
            let delay = config.calculate_delay(3).as_secs_f64();
            assert!(delay >= 4.0 * 0.8 - 1e-9, "delay {} below range", delay);
            assert!(delay <= 4.0 * 1.2 + 1e-9, "delay {} above range", delay);
        }
        // Jitter never pushes past the cap
        for _ in 0..50 {
            assert!(config.calculate_delay(10) <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_heartbeat_config_defaults() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert_eq!(config.missed_before_degraded, 3);
    }

    #[tokio::test]
    async fn test_send_command_not_connected() {
        let (connector, _acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), test_config());
        let result = client
            .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(OriginError::Link(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_unreachable_is_link_error() {
        let (connector, acceptor) = MemoryConnector::pair();
        acceptor.set_reachable(false);
        let client = OriginClient::new(Arc::new(connector), test_config());
        assert!(matches!(client.connect().await, Err(OriginError::Link(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.stats().failed_connections, 1);
    }

    #[tokio::test]
    async fn test_send_command_resolves_response() {
        let (client, _acceptor, mut device) = connected_client(test_config()).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), Duration::from_secs(5))
                .await
        });

        let command = device.next_command().await.unwrap();
        assert_eq!(command["Destination"], "Mount");
        assert_eq!(command["Command"], "GetStatus");
        device
            .respond(&command, payload(json!({"IsGotoOver": true})))
            .await;

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["IsGotoOver"], true);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_command_rejected() {
        let (client, _acceptor, mut device) = connected_client(test_config()).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command(targets::MOUNT, verbs::GOTO_ALT_AZM, Payload::new(), Duration::from_secs(5))
                .await
        });

        let command = device.next_command().await.unwrap();
        device
            .respond_with_code(&command, -78, "target below horizon", Payload::new())
            .await;

        match call.await.unwrap() {
            Err(OriginError::CommandRejected { method, code, message }) => {
                assert_eq!(method, "Mount.GotoAltAzm");
                assert_eq!(code, -78);
                assert_eq!(message, "target below horizon");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_response_is_discarded() {
        let (client, _acceptor, mut device) = connected_client(test_config()).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command(targets::SYSTEM, verbs::GET_MODEL, Payload::new(), Duration::from_millis(500))
                .await
        });

        let command = device.next_command().await.unwrap();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(OriginError::CommandTimeout { correlation_id: 1, .. })));
        assert_eq!(client.pending_count(), 0);

        // Late answer for the abandoned id must not disturb the next command
        device.respond(&command, Payload::new()).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command(targets::SYSTEM, verbs::GET_MODEL, Payload::new(), Duration::from_secs(5))
                .await
        });
        let second = device.next_command().await.unwrap();
        assert_eq!(second["SequenceID"], 2);
        device
            .respond(&second, payload(json!({"Model": "Origin"})))
            .await;
        assert_eq!(call.await.unwrap().unwrap()["Model"], "Origin");
    }

    #[tokio::test]
    async fn test_notifications_fan_out_in_order() {
        let (client, _acceptor, device) = connected_client(test_config()).await;

        let mut first = client.subscribe(verbs::NEW_IMAGE_READY);
        let mut second = client.subscribe(verbs::NEW_IMAGE_READY);
        let dropped = client.subscribe(verbs::NEW_IMAGE_READY);
        drop(dropped);
        let mut other = client.subscribe("GetStatus");

        for i in 0..3 {
            device
                .notify(
                    targets::IMAGE_SERVER,
                    verbs::NEW_IMAGE_READY,
                    payload(json!({"FileLocation": format!("Images/{}.jpg", i)})),
                )
                .await;
        }

        for i in 0..3 {
            let expected = format!("Images/{}.jpg", i);
            assert_eq!(first.next().await.unwrap().payload["FileLocation"], expected.as_str());
            assert_eq!(second.next().await.unwrap().payload["FileLocation"], expected.as_str());
        }
        assert!(other.try_next().is_none());
        assert_eq!(lock(&client.shared.subscribers)[verbs::NEW_IMAGE_READY].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_fails_pending_and_reconnects() {
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), test_config());
        let mut events = client.subscribe_events();
        client.connect().await.unwrap();
        let mut device = acceptor.accept().await.unwrap();

        let mut calls = Vec::new();
        for _ in 0..2 {
            let caller = client.clone();
            calls.push(tokio::spawn(async move {
                caller
                    .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), Duration::from_secs(600))
                    .await
            }));
        }
        let first_ids = [
            device.next_command().await.unwrap()["SequenceID"].as_u64().unwrap(),
            device.next_command().await.unwrap()["SequenceID"].as_u64().unwrap(),
        ];
        assert_eq!(client.pending_count(), 2);

        device.fail("simulated drop").await;

        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(OriginError::Link(_))));
        }

        let mut device = acceptor.accept().await.unwrap();
        while client.state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let OriginEvent::StateChanged(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );

        let stats = client.stats();
        assert_eq!(stats.disconnections, 1);
        assert_eq!(stats.reconnections, 1);
        assert_eq!(stats.successful_connections, 2);

        // Correlation ids keep increasing on the new link
        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), Duration::from_secs(5))
                .await
        });
        let command = device.next_command().await.unwrap();
        let next_id = command["SequenceID"].as_u64().unwrap();
        assert!(first_ids.iter().all(|id| next_id > *id));
        device.respond(&command, Payload::new()).await;
        assert!(call.await.unwrap().is_ok());

        client.disconnect().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_gives_up_after_max_attempts() {
        let mut config = test_config();
        config.reconnection.max_attempts = Some(2);
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), config);
        let mut events = client.subscribe_events();
        client.connect().await.unwrap();
        let device = acceptor.accept().await.unwrap();

        acceptor.set_reachable(false);
        device.fail("simulated drop").await;

        let failed = loop {
            match events.recv().await.unwrap() {
                OriginEvent::ReconnectFailed { attempts, .. } => break attempts,
                _ => continue,
            }
        };
        assert_eq!(failed, 2);
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.stats().failed_connections, 2);

        // A manual connect works again once the device is back
        acceptor.set_reachable(true);
        client.connect().await.unwrap();
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_blocked_by_stalled_writer_times_out() {
        // The device never reads, so the outbound channel fills up
        let (client, _acceptor, _device) = connected_client(test_config()).await;

        let mut calls = Vec::new();
        for _ in 0..crate::transport::DEFAULT_LINK_CAPACITY + 1 {
            let caller = client.clone();
            calls.push(tokio::spawn(async move {
                caller
                    .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), Duration::from_millis(100))
                    .await
            }));
        }

        let outcomes = tokio::time::timeout(Duration::from_secs(3600), async {
            let mut outcomes = Vec::new();
            for call in calls {
                outcomes.push(call.await.unwrap());
            }
            outcomes
        })
        .await
        .expect("every command resolves within its timeout");

        assert!(outcomes
            .iter()
            .all(|outcome| matches!(outcome, Err(OriginError::CommandTimeout { .. }))));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_with_link_error() {
        let (client, _acceptor, mut device) = connected_client(test_config()).await;

        let caller = client.clone();
        let call = tokio::spawn(async move {
            caller
                .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), Duration::from_secs(600))
                .await
        });
        // Device receives the command and stays silent
        device.next_command().await.unwrap();
        assert_eq!(client.pending_count(), 1);

        client.disconnect().await;
        assert!(matches!(call.await.unwrap(), Err(OriginError::Link(_))));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_reconnection_is_link_error() {
        let mut config = test_config();
        config.reconnection.base_delay_secs = 60;
        config.reconnection.max_delay_secs = 60;
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), config);
        let mut events = client.subscribe_events();
        client.connect().await.unwrap();
        let device = acceptor.accept().await.unwrap();

        acceptor.set_reachable(false);
        drop(device);
        loop {
            if let OriginEvent::ReconnectScheduled { .. } = events.recv().await.unwrap() {
                break;
            }
        }

        assert!(matches!(client.connect().await, Err(OriginError::Link(_))));
        assert!(!client.is_connected());
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_degrade_then_recover() {
        let mut config = test_config();
        config.heartbeat = HeartbeatConfig {
            enabled: true,
            interval_secs: 5,
            timeout_secs: 1,
            missed_before_degraded: 3,
            missed_before_reconnect: None,
        };
        let (client, _acceptor, mut device) = connected_client(config).await;

        // Ignore the first three pings
        for _ in 0..3 {
            let ping = device.next_command().await.unwrap();
            assert_eq!(ping["Command"], "GetVersion");
        }
        while client.state() != ConnectionState::Degraded {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(client.stats().missed_heartbeats, 3);

        let ping = device.next_command().await.unwrap();
        device
            .respond(&ping, payload(json!({"Version": "1.0"})))
            .await;
        while client.state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let stats = client.stats();
        assert_eq!(stats.missed_heartbeats, 0);
        assert_eq!(stats.ping_latencies.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_verifies_device() {
        let mut config = test_config();
        config.verify_on_connect = true;
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), config);

        let device = tokio::spawn(async move {
            let mut device = acceptor.accept().await.unwrap();
            let command = device.next_command().await.unwrap();
            assert_eq!(command["Destination"], "System");
            assert_eq!(command["Command"], "GetVersion");
            device.respond(&command, payload(json!({"Version": "2.1"}))).await;
            device
        });

        client.connect().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        let _device = device.await.unwrap();
    }
}
