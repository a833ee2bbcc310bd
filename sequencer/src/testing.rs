//! Recording scope and pass builders for executor and session tests

use crate::clock::{Clock, MonotonicClock};
use crate::device_ops::ScopeOps;
use crate::trajectory::{Trajectory, TrajectoryPoint};
use crate::{CatalogEntry, Pass};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use satwatch_origin::{
    targets, verbs, AltAzTarget, CaptureParameters, Notification, OriginError, OriginResult, Payload, Subscription,
};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 22, 0, 0).unwrap()
}

/// Pass with one point per second, azimuth and elevation rising by one degree per point
pub(crate) fn linear_pass(object_id: &str, start: DateTime<Utc>, points: i64) -> Pass {
    let points = (0..points)
        .map(|i| {
            TrajectoryPoint::from_degrees(start + chrono::Duration::seconds(i), 100.0 + i as f64, 30.0 + i as f64)
        })
        .collect();
    Pass::new(CatalogEntry::new(object_id, &format!("SAT {}", object_id)), Trajectory::new(points).unwrap())
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Tracking(bool),
    Goto(AltAzTarget),
    SlewStatus,
    ConfigureCamera,
    Capture,
    Download(String, PathBuf),
}

pub(crate) struct RecordingScope {
    clock: Arc<MonotonicClock>,
    calls: Mutex<Vec<(DateTime<Utc>, Call)>>,
    gotos: AtomicUsize,
    /// Failure returned by the n-th goto (1-based)
    goto_failures: Mutex<HashMap<usize, OriginError>>,
    slew_polls: AtomicUsize,
    /// Status poll on which the slew reports complete (None: never)
    slew_done_on_poll: Option<usize>,
    captures: AtomicUsize,
    downloads_fail: AtomicBool,
    image_subscribers: Mutex<Vec<mpsc::UnboundedSender<Notification>>>,
}

impl RecordingScope {
    pub(crate) fn new(clock: Arc<MonotonicClock>) -> Self {
        Self {
            clock,
            calls: Mutex::new(Vec::new()),
            gotos: AtomicUsize::new(0),
            goto_failures: Mutex::new(HashMap::new()),
            slew_polls: AtomicUsize::new(0),
            slew_done_on_poll: Some(2),
            captures: AtomicUsize::new(0),
            downloads_fail: AtomicBool::new(false),
            image_subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn slew_never_completes(mut self) -> Self {
        self.slew_done_on_poll = None;
        self
    }

    pub(crate) fn fail_goto(&self, number: usize, error: OriginError) {
        self.goto_failures.lock().unwrap().insert(number, error);
    }

    /// Every image download fails after being recorded
    pub(crate) fn fail_downloads(&self) {
        self.downloads_fail.store(true, Ordering::SeqCst);
    }

    /// Publish a sample-capture NewImageReady to current subscribers
    pub(crate) fn announce_image(&self, file_location: &str) {
        let mut payload = Payload::new();
        payload.insert("FileLocation".to_string(), json!(file_location));
        payload.insert("ImageType".to_string(), json!("SAMPLE_CAPTURE"));
        let notification = Notification {
            source: targets::IMAGE_SERVER.to_string(),
            event: verbs::NEW_IMAGE_READY.to_string(),
            payload,
        };
        self.image_subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(notification.clone()).is_ok());
    }

    pub(crate) fn calls(&self) -> Vec<(DateTime<Utc>, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn gotos(&self) -> Vec<(DateTime<Utc>, AltAzTarget)> {
        self.calls()
            .into_iter()
            .filter_map(|(at, call)| match call {
                Call::Goto(target) => Some((at, target)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn count(&self, wanted: fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|(_, call)| wanted(call)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push((self.clock.now(), call));
    }
}

#[async_trait]
impl ScopeOps for RecordingScope {
    async fn goto_alt_az(&self, target: AltAzTarget, _timeout: Duration) -> OriginResult<()> {
        self.record(Call::Goto(target));
        let number = self.gotos.fetch_add(1, Ordering::SeqCst) + 1;
        match self.goto_failures.lock().unwrap().remove(&number) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn set_sidereal_tracking(&self, enabled: bool) -> OriginResult<()> {
        self.record(Call::Tracking(enabled));
        Ok(())
    }

    async fn is_slew_complete(&self) -> OriginResult<bool> {
        self.record(Call::SlewStatus);
        let poll = self.slew_polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.slew_done_on_poll.map_or(false, |done| poll >= done))
    }

    async fn configure_camera(&self, _params: &CaptureParameters) -> OriginResult<()> {
        self.record(Call::ConfigureCamera);
        Ok(())
    }

    async fn trigger_capture(&self, _params: &CaptureParameters, _timeout: Duration) -> OriginResult<()> {
        self.record(Call::Capture);
        let number = self.captures.fetch_add(1, Ordering::SeqCst) + 1;
        self.announce_image(&format!("Images/Temp/capture_{}.jpg", number));
        Ok(())
    }

    fn subscribe_images(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.image_subscribers.lock().unwrap().push(tx);
        Subscription::from_channel(verbs::NEW_IMAGE_READY, rx)
    }

    async fn download_image(&self, remote_path: &str, destination: &Path) -> OriginResult<u64> {
        self.record(Call::Download(remote_path.to_string(), destination.to_path_buf()));
        if self.downloads_fail.load(Ordering::SeqCst) {
            return Err(OriginError::Download {
                path: remote_path.to_string(),
                attempts: 3,
                reason: "HTTP 503".to_string(),
            });
        }
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(destination, remote_path.as_bytes())?;
        Ok(remote_path.len() as u64)
    }
}
