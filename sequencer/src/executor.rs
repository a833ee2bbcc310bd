//! Pass execution engine
//!
//! Flies one pass in real time. Pre-positioning starts a lead time before the pass, then
//! each tick sends the currently due pointing and, every few ticks, triggers a capture.
//! Announced images are downloaded concurrently with tracking.

use crate::clock::{self, SharedClock};
use crate::device_ops::SharedScopeOps;
use crate::trajectory::TrajectoryPoint;
use crate::Pass;
use chrono::{DateTime, Utc};
use satwatch_origin::{CaptureParameters, ErrorReporter, ImageReady, Notification, OriginError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, sleep_until, timeout_at, Instant, MissedTickBehavior};

/// State of the pass executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassState {
    Idle,
    PrePositioning,
    Tracking,
    Completed,
    Aborted,
}

impl PassState {
    pub fn is_finished(&self) -> bool {
        matches!(self, PassState::Completed | PassState::Aborted)
    }
}

/// Timing and capture settings for pass execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// How long before the pass starts to begin pre-positioning
    pub lead_time_secs: u64,
    /// Longest wait for the pre-position slew to finish
    pub pre_position_timeout_secs: u64,
    pub slew_poll_interval_ms: u64,
    /// Spacing of pointing updates during tracking
    pub tick_interval_ms: u64,
    /// Acknowledgement timeout for each tracking update
    pub positioning_timeout_ms: u64,
    /// Timeout for the other device commands
    pub command_timeout_ms: u64,
    /// Trigger a capture every this many ticks (0 disables captures)
    pub capture_every_ticks: u32,
    /// Minimum spacing between two capture triggers
    pub capture_cooldown_ms: u64,
    /// How long a completed pass waits for outstanding downloads
    pub download_grace_secs: u64,
    /// Each pass stores its images in a directory below this one
    pub image_root: PathBuf,
    pub capture: CaptureParameters,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            lead_time_secs: 45,
            pre_position_timeout_secs: 40,
            slew_poll_interval_ms: 1000,
            tick_interval_ms: 1000,
            positioning_timeout_ms: 1000,
            command_timeout_ms: 5000,
            capture_every_ticks: 1,
            capture_cooldown_ms: 5000,
            download_grace_secs: 60,
            image_root: PathBuf::from("observations"),
            capture: CaptureParameters::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn lead_time(&self) -> Duration {
        Duration::from_secs(self.lead_time_secs)
    }

    pub fn pre_position_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_position_timeout_secs)
    }

    pub fn slew_poll_interval(&self) -> Duration {
        Duration::from_millis(self.slew_poll_interval_ms.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn positioning_timeout(&self) -> Duration {
        Duration::from_millis(self.positioning_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn capture_cooldown(&self) -> Duration {
        Duration::from_millis(self.capture_cooldown_ms)
    }

    pub fn download_grace(&self) -> Duration {
        Duration::from_secs(self.download_grace_secs)
    }
}

/// Cooperative cancellation shared between a session and its executor
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Event emitted by the executor
#[derive(Debug, Clone, Serialize)]
pub enum ExecutorEvent {
    StateChanged { pass_id: String, state: PassState },
    CaptureTriggered { pass_id: String, tick: u64 },
    ImageSaved { pass_id: String, path: PathBuf, bytes: u64 },
    ImageLost { pass_id: String, remote_path: String, error: String },
    Finished(PassReport),
}

/// Outcome of one pass
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass_id: String,
    pub object_id: String,
    pub object_name: String,
    pub state: PassState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ticks: u64,
    pub positioning_commands: u64,
    pub positioning_timeouts: u64,
    /// Whether the mount reported the pre-position slew as finished
    pub slew_confirmed: bool,
    pub captures_triggered: u64,
    pub captures_skipped: u64,
    pub images_announced: u64,
    pub images_saved: u64,
    pub images_lost: u64,
    /// Downloads still running when the report was produced
    pub images_pending: u64,
    pub abort_reason: Option<String>,
}

impl PassReport {
    fn new(pass: &Pass, started_at: DateTime<Utc>) -> Self {
        Self {
            pass_id: pass.id(),
            object_id: pass.object.object_id.clone(),
            object_name: pass.object.name.clone(),
            state: PassState::Idle,
            started_at,
            finished_at: started_at,
            ticks: 0,
            positioning_commands: 0,
            positioning_timeouts: 0,
            slew_confirmed: false,
            captures_triggered: 0,
            captures_skipped: 0,
            images_announced: 0,
            images_saved: 0,
            images_lost: 0,
            images_pending: 0,
            abort_reason: None,
        }
    }
}

#[derive(Default)]
struct DownloadTally {
    saved: AtomicU64,
    lost: AtomicU64,
}

const CANCELLED: &str = "cancelled";

/// Executes passes against a telescope, one at a time
pub struct PassExecutor {
    ops: SharedScopeOps,
    clock: SharedClock,
    config: ExecutorConfig,
    events: broadcast::Sender<ExecutorEvent>,
    state: StdRwLock<PassState>,
    cancel: CancelToken,
    reporter: Option<ErrorReporter>,
}

impl PassExecutor {
    pub fn new(ops: SharedScopeOps, clock: SharedClock, config: ExecutorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            ops,
            clock,
            config,
            events,
            state: StdRwLock::new(PassState::Idle),
            cancel: CancelToken::new(),
            reporter: None,
        }
    }

    /// Forward aborted passes and lost images to the connection's error log
    pub fn with_error_reporter(mut self, reporter: ErrorReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.events.subscribe()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> PassState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Directory receiving the images of `pass`
    pub fn pass_directory(&self, pass: &Pass) -> PathBuf {
        self.config.image_root.join(format!(
            "{}_{}_{}",
            sanitize(&pass.object.name),
            sanitize(&pass.object.object_id),
            pass.start.format("%Y%m%d_%H%M%S")
        ))
    }

    /// Run `pass` to completion or abort; never returns early on a device error
    pub async fn execute(&self, pass: &Pass) -> PassReport {
        let pass_id = pass.id();
        let mut report = PassReport::new(pass, self.clock.now());
        self.set_state(&pass_id, PassState::Idle);

        if self.cancel.is_cancelled() {
            return self.finish(report, PassState::Aborted, Some(CANCELLED.to_string()));
        }
        if self.clock.now() >= pass.end {
            return self.finish(
                report,
                PassState::Aborted,
                Some("pass window already elapsed".to_string()),
            );
        }

        if let Err(reason) = self.pre_position(pass, &mut report).await {
            return self.finish(report, PassState::Aborted, Some(reason));
        }

        let tally = Arc::new(DownloadTally::default());
        let mut downloads = JoinSet::new();
        let outcome = self.track(pass, &mut report, &mut downloads, &tally).await;

        let (state, reason) = match outcome {
            Ok(()) => {
                self.await_downloads(&mut downloads).await;
                (PassState::Completed, None)
            }
            Err(reason) => (PassState::Aborted, Some(reason)),
        };
        // Downloads that outlive the pass keep running and still report their outcome.
        downloads.detach_all();

        report.images_saved = tally.saved.load(Ordering::SeqCst);
        report.images_lost = tally.lost.load(Ordering::SeqCst);
        report.images_pending = report
            .images_announced
            .saturating_sub(report.images_saved + report.images_lost);
        self.finish(report, state, reason)
    }

    // ===== PRE-POSITIONING =====

    async fn pre_position(&self, pass: &Pass, report: &mut PassReport) -> Result<(), String> {
        let pass_id = pass.id();
        self.wait_until(pass.pre_position_at(self.config.lead_time())).await?;
        self.set_state(&pass_id, PassState::PrePositioning);

        let now = self.clock.now();
        let point = if now <= pass.start {
            *pass.trajectory.first()
        } else {
            tracing::warn!("Pass {} already in progress, joining late", pass_id);
            *self.due_point(pass, now)
        };
        tracing::info!(
            "Pre-positioning for {} ({}): az {:.2}° el {:.2}°",
            pass.object.name,
            pass_id,
            point.azimuth_deg,
            point.elevation_deg
        );

        // Sidereal tracking would fight the per-tick pointing updates.
        if let Err(e) = self.ops.set_sidereal_tracking(false).await {
            if e.is_link() {
                return Err(format!("link lost while disabling tracking: {}", e));
            }
            tracing::warn!("Could not disable sidereal tracking: {}", e);
        }

        report.positioning_commands += 1;
        if let Err(e) = self.ops.goto_alt_az(point.target(), self.config.command_timeout()).await {
            if e.is_link() {
                return Err(format!("link lost during pre-position slew: {}", e));
            }
            if e.is_timeout() {
                report.positioning_timeouts += 1;
            }
            tracing::warn!("Pre-position slew not acknowledged: {}; continuing", e);
        }

        report.slew_confirmed = self.await_slew(pass).await?;

        if let Err(e) = self.ops.configure_camera(&self.config.capture).await {
            if e.is_link() {
                return Err(format!("link lost while configuring camera: {}", e));
            }
            tracing::warn!("Camera configuration failed: {}; using current settings", e);
        }
        Ok(())
    }

    /// Poll the mount until the slew finishes, the timeout expires or the pass starts
    async fn await_slew(&self, pass: &Pass) -> Result<bool, String> {
        let now = Instant::now();
        let pass_start = clock::instant_at(&*self.clock, pass.start).max(now);
        let deadline = (now + self.config.pre_position_timeout()).min(pass_start);

        loop {
            match self.ops.is_slew_complete().await {
                Ok(true) => {
                    tracing::info!("Pre-position slew complete");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if e.is_link() => return Err(format!("link lost while waiting for slew: {}", e)),
                Err(e) => tracing::debug!("Slew status unavailable: {}", e),
            }

            let next_poll = Instant::now() + self.config.slew_poll_interval();
            if next_poll > deadline {
                tracing::warn!("Slew not confirmed before tracking start; proceeding");
                return Ok(false);
            }
            tokio::select! {
                _ = sleep_until(next_poll) => {}
                _ = self.cancel.cancelled() => return Err(CANCELLED.to_string()),
            }
        }
    }

    // ===== TRACKING =====

    async fn track(
        &self,
        pass: &Pass,
        report: &mut PassReport,
        downloads: &mut JoinSet<()>,
        tally: &Arc<DownloadTally>,
    ) -> Result<(), String> {
        let pass_id = pass.id();
        let tick = self.config.tick_interval();
        let span = pass.duration();
        let anchor = clock::instant_at(&*self.clock, pass.start);
        let mut ticker = interval_at(anchor, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_capture: Option<Instant> = None;
        let mut images_open = true;
        let mut announced_seq: u32 = 0;

        tokio::select! {
            _ = sleep_until(anchor) => {}
            _ = self.cancel.cancelled() => return Err(CANCELLED.to_string()),
        }
        // Images announced before the start belong to an earlier pass
        let mut images = self.ops.subscribe_images();
        self.set_state(&pass_id, PassState::Tracking);
        tracing::info!("Tracking {} for {:.0}s", pass.object.name, span.as_secs_f64());

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CANCELLED.to_string()),
                scheduled = ticker.tick() => {
                    let offset = scheduled.saturating_duration_since(anchor);
                    if offset > span {
                        break;
                    }
                    let index = (offset.as_millis() / tick.as_millis()) as u64;
                    self.run_tick(pass, index, anchor, report, &mut last_capture).await?;
                }
                notification = images.next(), if images_open => match notification {
                    Some(notification) => {
                        self.start_download(pass, &notification, &mut announced_seq, report, downloads, tally);
                    }
                    None => images_open = false,
                },
            }
        }

        // Announcements that arrived with the final tick
        while let Some(notification) = images.try_next() {
            self.start_download(pass, &notification, &mut announced_seq, report, downloads, tally);
        }
        Ok(())
    }

    async fn run_tick(
        &self,
        pass: &Pass,
        index: u64,
        anchor: Instant,
        report: &mut PassReport,
        last_capture: &mut Option<Instant>,
    ) -> Result<(), String> {
        report.ticks += 1;
        let elapsed = Instant::now().saturating_duration_since(anchor);
        let now = pass.start + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        let point = self.due_point(pass, now);
        tracing::debug!(
            "Tick {}: az {:.3}° el {:.3}°",
            index,
            point.azimuth_deg,
            point.elevation_deg
        );

        report.positioning_commands += 1;
        match self
            .ops
            .goto_alt_az(point.target(), self.config.positioning_timeout())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_link() => return Err(format!("link lost at tick {}: {}", index, e)),
            Err(e @ OriginError::CommandRejected { .. }) => {
                return Err(format!("positioning rejected at tick {}: {}", index, e))
            }
            Err(e) => {
                report.positioning_timeouts += 1;
                tracing::warn!("Positioning at tick {} not acknowledged: {}", index, e);
            }
        }

        let every = u64::from(self.config.capture_every_ticks);
        if every == 0 || index % every != 0 {
            return Ok(());
        }
        if let Some(at) = last_capture {
            if at.elapsed() < self.config.capture_cooldown() {
                return Ok(());
            }
        }
        match self
            .ops
            .trigger_capture(&self.config.capture, self.config.command_timeout())
            .await
        {
            Ok(()) => {
                report.captures_triggered += 1;
                *last_capture = Some(Instant::now());
                let _ = self.events.send(ExecutorEvent::CaptureTriggered {
                    pass_id: report.pass_id.clone(),
                    tick: index,
                });
            }
            Err(e) if e.is_link() => return Err(format!("link lost triggering capture: {}", e)),
            Err(e) => {
                report.captures_skipped += 1;
                tracing::warn!("Capture at tick {} skipped: {}", index, e);
            }
        }
        Ok(())
    }

    fn due_point<'a>(&self, pass: &'a Pass, at: DateTime<Utc>) -> &'a TrajectoryPoint {
        pass.trajectory
            .point_at_or_before(at)
            .unwrap_or_else(|| pass.trajectory.first())
    }

    // ===== IMAGE COLLECTION =====

    fn start_download(
        &self,
        pass: &Pass,
        notification: &Notification,
        announced_seq: &mut u32,
        report: &mut PassReport,
        downloads: &mut JoinSet<()>,
        tally: &Arc<DownloadTally>,
    ) {
        let image = match ImageReady::from_notification(notification) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!("Ignoring malformed image notification: {}", e);
                return;
            }
        };
        if !image.is_sample_capture() {
            tracing::debug!("Ignoring {:?} image {}", image.image_type, image.file_location);
            return;
        }

        *announced_seq += 1;
        report.images_announced += 1;
        let destination = self
            .pass_directory(pass)
            .join(format!("{:04}_{}", announced_seq, sanitize(image.file_name())));

        let ops = self.ops.clone();
        let events = self.events.clone();
        let reporter = self.reporter.clone();
        let tally = tally.clone();
        let pass_id = pass.id();
        downloads.spawn(async move {
            match ops.download_image(&image.file_location, &destination).await {
                Ok(bytes) => {
                    tally.saved.fetch_add(1, Ordering::SeqCst);
                    tracing::info!("Saved {} ({} bytes)", destination.display(), bytes);
                    let _ = events.send(ExecutorEvent::ImageSaved {
                        pass_id,
                        path: destination,
                        bytes,
                    });
                }
                Err(e) => {
                    tally.lost.fetch_add(1, Ordering::SeqCst);
                    tracing::error!("Image {} lost: {}", image.file_location, e);
                    if let Some(reporter) = reporter {
                        reporter.report("download", &format!("{}: {}", image.file_location, e));
                    }
                    let _ = events.send(ExecutorEvent::ImageLost {
                        pass_id,
                        remote_path: image.file_location,
                        error: e.to_string(),
                    });
                }
            }
        });
    }

    async fn await_downloads(&self, downloads: &mut JoinSet<()>) {
        let deadline = Instant::now() + self.config.download_grace();
        loop {
            match timeout_at(deadline, downloads.join_next()).await {
                Ok(Some(Ok(()))) => {}
                Ok(Some(Err(e))) => tracing::error!("Download task failed: {}", e),
                Ok(None) => return,
                Err(_) => {
                    tracing::warn!(
                        "{} download(s) still running after {:?}",
                        downloads.len(),
                        self.config.download_grace()
                    );
                    return;
                }
            }
        }
    }

    // ===== STATE =====

    async fn wait_until(&self, at: DateTime<Utc>) -> Result<(), String> {
        tokio::select! {
            _ = sleep(clock::until(&*self.clock, at)) => Ok(()),
            _ = self.cancel.cancelled() => Err(CANCELLED.to_string()),
        }
    }

    fn set_state(&self, pass_id: &str, state: PassState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        let _ = self.events.send(ExecutorEvent::StateChanged {
            pass_id: pass_id.to_string(),
            state,
        });
    }

    fn finish(&self, mut report: PassReport, state: PassState, reason: Option<String>) -> PassReport {
        report.state = state;
        report.finished_at = self.clock.now();
        report.abort_reason = reason;
        self.set_state(&report.pass_id, state);

        match &report.abort_reason {
            Some(reason) => {
                tracing::error!("Pass {} aborted: {}", report.pass_id, reason);
                if let Some(reporter) = &self.reporter {
                    reporter.report("executor", &format!("pass {} aborted: {}", report.pass_id, reason));
                }
            }
            None => tracing::info!(
                "Pass {} complete: {} ticks, {} captures, {} images saved",
                report.pass_id,
                report.ticks,
                report.captures_triggered,
                report.images_saved
            ),
        }
        let _ = self.events.send(ExecutorEvent::Finished(report.clone()));
        report
    }
}

/// Keep file names portable
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
