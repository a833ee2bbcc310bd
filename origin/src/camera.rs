//! Origin camera wrapper
//!
//! Capture configuration, capture triggering and image-ready notifications.

use crate::client::{OriginClient, Subscription};
use crate::error::{OriginError, OriginResult};
use crate::protocol::{targets, to_payload, verbs, Notification, Payload};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Image type reported for captures started by `RunSampleCapture`
pub const SAMPLE_CAPTURE_IMAGE_TYPE: &str = "SAMPLE_CAPTURE";

/// Sensor readout depth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BitDepth {
    Eight,
    Sixteen,
    TwentyFour,
}

impl BitDepth {
    pub fn bits(&self) -> u8 {
        match self {
            BitDepth::Eight => 8,
            BitDepth::Sixteen => 16,
            BitDepth::TwentyFour => 24,
        }
    }
}

impl From<BitDepth> for u8 {
    fn from(depth: BitDepth) -> Self {
        depth.bits()
    }
}

impl TryFrom<u8> for BitDepth {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(BitDepth::Eight),
            16 => Ok(BitDepth::Sixteen),
            24 => Ok(BitDepth::TwentyFour),
            other => Err(format!("unsupported bit depth {}", other)),
        }
    }
}

/// Exposure settings used for every capture of a pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureParameters {
    pub exposure_secs: f64,
    /// Sensor gain, expressed as ISO
    pub iso: u32,
    pub binning: u32,
    pub bit_depth: Option<BitDepth>,
}

impl Default for CaptureParameters {
    fn default() -> Self {
        Self {
            exposure_secs: 0.5,
            iso: 200,
            binning: 1,
            bit_depth: None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct SampleCapture {
    exposure_time: f64,
    #[serde(rename = "ISO")]
    iso: u32,
    binning: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    bit_depth: Option<u8>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CameraSettings {
    exposure: f64,
    #[serde(rename = "ISO")]
    iso: u32,
    binning: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    bit_depth: Option<u8>,
}

impl CaptureParameters {
    /// Payload for `TaskController.RunSampleCapture`
    pub fn capture_payload(&self) -> OriginResult<Payload> {
        to_payload(&SampleCapture {
            exposure_time: self.exposure_secs,
            iso: self.iso,
            binning: self.binning,
            bit_depth: self.bit_depth.map(u8::from),
        })
    }

    /// Payload for `Camera.SetCaptureParameters`
    pub fn settings_payload(&self) -> OriginResult<Payload> {
        to_payload(&CameraSettings {
            exposure: self.exposure_secs,
            iso: self.iso,
            binning: self.binning,
            bit_depth: self.bit_depth.map(u8::from),
        })
    }
}

/// A `NewImageReady` notification
#[derive(Debug, Clone, PartialEq)]
pub struct ImageReady {
    /// Path of the image on the device's HTTP server
    pub file_location: String,
    pub image_type: Option<String>,
}

impl ImageReady {
    pub fn from_notification(notification: &Notification) -> OriginResult<Self> {
        if notification.event != verbs::NEW_IMAGE_READY {
            return Err(OriginError::Protocol(format!(
                "expected {} notification, got {}",
                verbs::NEW_IMAGE_READY,
                notification.event
            )));
        }
        let file_location = notification
            .payload
            .get("FileLocation")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OriginError::Protocol("image notification without FileLocation".to_string()))?
            .to_string();
        let image_type = notification
            .payload
            .get("ImageType")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(Self {
            file_location,
            image_type,
        })
    }

    pub fn is_sample_capture(&self) -> bool {
        self.image_type.as_deref() == Some(SAMPLE_CAPTURE_IMAGE_TYPE)
    }

    /// Last path segment of the device location
    pub fn file_name(&self) -> &str {
        self.file_location
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or(&self.file_location)
    }
}

/// Origin camera device wrapper
#[derive(Clone)]
pub struct OriginCamera {
    client: OriginClient,
    command_timeout: Duration,
}

impl OriginCamera {
    pub fn new(client: OriginClient) -> Self {
        let command_timeout = client.config().timeouts.command_timeout();
        Self {
            client,
            command_timeout,
        }
    }

    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    pub async fn set_capture_parameters(&self, params: &CaptureParameters) -> OriginResult<()> {
        self.client
            .send_command(
                targets::CAMERA,
                verbs::SET_CAPTURE_PARAMETERS,
                params.settings_payload()?,
                self.command_timeout,
            )
            .await?;
        Ok(())
    }

    /// Trigger one capture; the image is announced later by a `NewImageReady` notification
    pub async fn run_sample_capture(&self, params: &CaptureParameters) -> OriginResult<()> {
        self.client
            .send_command(
                targets::TASK_CONTROLLER,
                verbs::RUN_SAMPLE_CAPTURE,
                params.capture_payload()?,
                self.command_timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn camera_info(&self) -> OriginResult<Payload> {
        self.client
            .send_command(targets::CAMERA, verbs::GET_CAMERA_INFO, Payload::new(), self.command_timeout)
            .await
    }

    pub fn subscribe_images(&self) -> Subscription {
        self.client.subscribe(verbs::NEW_IMAGE_READY)
    }
}
