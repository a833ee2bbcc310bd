//! Device operations used by the pass executor
//!
//! The executor drives the telescope only through [`ScopeOps`], so passes can be flown
//! against the real client or a stand-in.

use async_trait::async_trait;
use satwatch_origin::{
    AltAzTarget, CaptureParameters, ImageTransfer, OriginCamera, OriginClient, OriginMount, OriginResult,
    Subscription,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ScopeOps: Send + Sync {
    // ===== MOUNT OPERATIONS =====

    /// Point at a horizontal position, waiting at most `timeout` for the acknowledgement
    async fn goto_alt_az(&self, target: AltAzTarget, timeout: Duration) -> OriginResult<()>;

    async fn set_sidereal_tracking(&self, enabled: bool) -> OriginResult<()>;

    async fn is_slew_complete(&self) -> OriginResult<bool>;

    // ===== CAMERA OPERATIONS =====

    async fn configure_camera(&self, params: &CaptureParameters) -> OriginResult<()>;

    async fn trigger_capture(&self, params: &CaptureParameters, timeout: Duration) -> OriginResult<()>;

    /// Image-ready notifications, in arrival order
    fn subscribe_images(&self) -> Subscription;

    // ===== TRANSFER OPERATIONS =====

    /// Fetch an image from the device and store it, returning its size
    async fn download_image(&self, remote_path: &str, destination: &Path) -> OriginResult<u64>;
}

pub type SharedScopeOps = Arc<dyn ScopeOps>;

/// [`ScopeOps`] backed by a connected [`OriginClient`]
pub struct OriginScopeOps {
    mount: OriginMount,
    camera: OriginCamera,
    transfer: ImageTransfer,
}

impl OriginScopeOps {
    pub fn new(client: OriginClient) -> OriginResult<Self> {
        let transfer = ImageTransfer::from_config(client.config())?;
        Ok(Self {
            mount: OriginMount::new(client.clone()),
            camera: OriginCamera::new(client),
            transfer,
        })
    }
}

#[async_trait]
impl ScopeOps for OriginScopeOps {
    async fn goto_alt_az(&self, target: AltAzTarget, timeout: Duration) -> OriginResult<()> {
        self.mount.goto_alt_azm_within(target, timeout).await
    }

    async fn set_sidereal_tracking(&self, enabled: bool) -> OriginResult<()> {
        self.mount.enable_tracking(enabled).await
    }

    async fn is_slew_complete(&self) -> OriginResult<bool> {
        self.mount.is_goto_over().await
    }

    async fn configure_camera(&self, params: &CaptureParameters) -> OriginResult<()> {
        self.camera.set_capture_parameters(params).await
    }

    async fn trigger_capture(&self, params: &CaptureParameters, timeout: Duration) -> OriginResult<()> {
        self.camera
            .clone()
            .with_command_timeout(timeout)
            .run_sample_capture(params)
            .await
    }

    fn subscribe_images(&self) -> Subscription {
        self.camera.subscribe_images()
    }

    async fn download_image(&self, remote_path: &str, destination: &Path) -> OriginResult<u64> {
        self.transfer.download(remote_path, destination).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use satwatch_origin::{MemoryConnector, OriginConfig};

    #[tokio::test]
    async fn test_origin_scope_ops_commands() {
        let mut config = OriginConfig::for_host("memory");
        config.verify_on_connect = false;
        config.heartbeat.enabled = false;
        let (connector, mut acceptor) = MemoryConnector::pair();
        let client = OriginClient::new(Arc::new(connector), config);
        client.connect().await.unwrap();
        let mut device = acceptor.accept().await.unwrap();

        let ops: SharedScopeOps = Arc::new(OriginScopeOps::new(client).unwrap());
        let worker = ops.clone();
        let calls = tokio::spawn(async move {
            worker.set_sidereal_tracking(false).await.unwrap();
            worker
                .trigger_capture(&CaptureParameters::default(), Duration::from_secs(2))
                .await
                .unwrap();
            worker.is_slew_complete().await.unwrap()
        });

        let tracking = device.next_command().await.unwrap();
        assert_eq!(tracking["Command"], "EnableTracking");
        assert_eq!(tracking["Value"], false);
        device.respond(&tracking, Default::default()).await;

        let capture = device.next_command().await.unwrap();
        assert_eq!(capture["Destination"], "TaskController");
        assert_eq!(capture["Command"], "RunSampleCapture");
        assert_eq!(capture["ExposureTime"], 0.5);
        device.respond(&capture, Default::default()).await;

        let status = device.next_command().await.unwrap();
        assert_eq!(status["Command"], "GetStatus");
        let mut payload = satwatch_origin::Payload::new();
        payload.insert("IsGotoOver".to_string(), serde_json::json!(true));
        device.respond(&status, payload).await;

        assert!(calls.await.unwrap());
    }
}
