//! Origin mount wrapper
//!
//! Provides typed mount control on top of the protocol client.

use crate::client::OriginClient;
use crate::error::OriginResult;
use crate::protocol::{from_payload, targets, to_payload, verbs, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Horizontal pointing target in the units the device expects
///
/// The mount takes radians. Construct from degrees with [`AltAzTarget::from_degrees`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AltAzTarget {
    #[serde(rename = "Alt")]
    pub alt_rad: f64,
    #[serde(rename = "Azm")]
    pub azm_rad: f64,
}

impl AltAzTarget {
    pub fn from_radians(alt_rad: f64, azm_rad: f64) -> Self {
        Self { alt_rad, azm_rad }
    }

    pub fn from_degrees(alt_deg: f64, azm_deg: f64) -> Self {
        Self {
            alt_rad: alt_deg.to_radians(),
            azm_rad: azm_deg.to_radians(),
        }
    }
}

/// Subset of `Mount.GetStatus` the tracker relies on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct MountStatus {
    pub is_goto_over: bool,
    pub is_tracking: bool,
    pub is_aligned: bool,
    pub battery_level: Option<Value>,
    pub battery_voltage: Option<f64>,
}

#[derive(Serialize)]
struct EnableTracking {
    #[serde(rename = "Value")]
    value: bool,
}

/// Origin mount device wrapper
#[derive(Clone)]
pub struct OriginMount {
    client: OriginClient,
    command_timeout: Duration,
}

impl OriginMount {
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

    /// Start a slew to the given horizontal position
    pub async fn goto_alt_azm(&self, target: AltAzTarget) -> OriginResult<()> {
        self.goto_alt_azm_within(target, self.command_timeout).await
    }

    /// Slew with an explicit command timeout, for time-critical pointing updates
    pub async fn goto_alt_azm_within(&self, target: AltAzTarget, timeout: Duration) -> OriginResult<()> {
        self.client
            .send_command(targets::MOUNT, verbs::GOTO_ALT_AZM, to_payload(&target)?, timeout)
            .await?;
        Ok(())
    }

    /// Enable or disable sidereal tracking
    pub async fn enable_tracking(&self, enabled: bool) -> OriginResult<()> {
        self.client
            .send_command(
                targets::MOUNT,
                verbs::ENABLE_TRACKING,
                to_payload(&EnableTracking { value: enabled })?,
                self.command_timeout,
            )
            .await?;
        Ok(())
    }

    pub async fn status(&self) -> OriginResult<MountStatus> {
        let payload = self
            .client
            .send_command(targets::MOUNT, verbs::GET_STATUS, Payload::new(), self.command_timeout)
            .await?;
        from_payload(payload)
    }

    /// Whether the last slew has finished
    pub async fn is_goto_over(&self) -> OriginResult<bool> {
        Ok(self.status().await?.is_goto_over)
    }
}
