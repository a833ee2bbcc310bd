//! Origin wire protocol
//!
//! Every frame on the mount control endpoint is a flat JSON object. Commands carry a
//! `Destination` subsystem, a `Command` verb and a `SequenceID`; the device answers with a
//! `Response` echoing the sequence id, and pushes `Notification` frames with no id at all.
//! Payload fields sit next to the envelope fields in the same object.

use crate::error::{OriginError, OriginResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source tag the device expects on client commands
pub const SOURCE_TAG: &str = "WebApp";

/// WebSocket path of the mount control endpoint
pub const CONTROL_ENDPOINT_PATH: &str = "/SmartScope-1.0/mountControlEndpoint";

/// Payload object carried alongside the envelope fields
pub type Payload = serde_json::Map<String, Value>;

/// Subsystem names used as `Destination`
pub mod targets {
    pub const MOUNT: &str = "Mount";
    pub const CAMERA: &str = "Camera";
    pub const SYSTEM: &str = "System";
    pub const TASK_CONTROLLER: &str = "TaskController";
    pub const DISK: &str = "Disk";
    pub const ENVIRONMENT: &str = "Environment";
    pub const FOCUSER: &str = "Focuser";
    pub const DEW_HEATER: &str = "DewHeater";
    pub const ORIENTATION_SENSOR: &str = "OrientationSensor";
    pub const IMAGE_SERVER: &str = "ImageServer";
}

/// Verbs and notification event names
pub mod verbs {
    pub const GOTO_ALT_AZM: &str = "GotoAltAzm";
    pub const ENABLE_TRACKING: &str = "EnableTracking";
    pub const GET_STATUS: &str = "GetStatus";
    pub const GET_VERSION: &str = "GetVersion";
    pub const GET_MODEL: &str = "GetModel";
    pub const GET_CAMERA_INFO: &str = "GetCameraInfo";
    pub const SET_CAPTURE_PARAMETERS: &str = "SetCaptureParameters";
    pub const RUN_SAMPLE_CAPTURE: &str = "RunSampleCapture";
    pub const NEW_IMAGE_READY: &str = "NewImageReady";
}

/// Values of the envelope `Type` field
pub mod envelope_types {
    pub const COMMAND: &str = "Command";
    pub const RESPONSE: &str = "Response";
    pub const NOTIFICATION: &str = "Notification";
}

/// A request addressed to one subsystem
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub target: String,
    pub verb: String,
    pub payload: Payload,
    pub correlation_id: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CommandEnvelope<'a> {
    source: &'a str,
    destination: &'a str,
    command: &'a str,
    #[serde(rename = "Type")]
    kind: &'a str,
    #[serde(rename = "SequenceID")]
    sequence_id: u64,
    #[serde(flatten)]
    payload: &'a Payload,
}

impl Command {
    pub fn new(target: &str, verb: &str, payload: Payload, correlation_id: u64) -> Self {
        Self {
            target: target.to_string(),
            verb: verb.to_string(),
            payload,
            correlation_id,
        }
    }

    /// Dotted `Target.Verb` name, used in logs and errors
    pub fn method(&self) -> String {
        format!("{}.{}", self.target, self.verb)
    }

    pub fn to_json(&self) -> OriginResult<String> {
        let envelope = CommandEnvelope {
            source: SOURCE_TAG,
            destination: &self.target,
            command: &self.verb,
            kind: envelope_types::COMMAND,
            sequence_id: self.correlation_id,
            payload: &self.payload,
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

/// The device's answer to one command
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub correlation_id: u64,
    pub result_code: i64,
    pub message: String,
    pub payload: Payload,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

/// An unsolicited event pushed by the device
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub source: String,
    pub event: String,
    pub payload: Payload,
}

/// Raw inbound frame before classification
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(rename = "Type", default)]
    pub kind: Option<String>,
    #[serde(rename = "SequenceID", default)]
    pub sequence_id: Option<u64>,
    #[serde(default)]
    pub error_code: Option<i64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub rest: Payload,
}

impl Envelope {
    pub fn parse(text: &str) -> OriginResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| OriginError::Protocol(format!("malformed envelope: {}", e)))
    }

    pub fn is_notification(&self) -> bool {
        self.kind.as_deref() == Some(envelope_types::NOTIFICATION)
    }

    /// Correlation id, unless this frame is a notification
    pub fn response_id(&self) -> Option<u64> {
        if self.is_notification() {
            None
        } else {
            self.sequence_id
        }
    }

    pub fn into_response(self, correlation_id: u64) -> Response {
        Response {
            correlation_id,
            result_code: self.error_code.unwrap_or(0),
            message: self.error_message.unwrap_or_default(),
            payload: self.rest,
        }
    }

    /// Event name is the `Command` field of a notification
    pub fn into_notification(self) -> Option<Notification> {
        let event = self.command?;
        Some(Notification {
            source: self.source.unwrap_or_default(),
            event,
            payload: self.rest,
        })
    }
}

/// Serialize a typed payload into the flat field map
pub fn to_payload<T: Serialize>(value: &T) -> OriginResult<Payload> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Payload::new()),
        other => Err(OriginError::Serialization(format!(
            "payload must be an object, got {}",
            other
        ))),
    }
}

/// Parse a response payload into a typed value
pub fn from_payload<T: for<'de> Deserialize<'de>>(payload: Payload) -> OriginResult<T> {
    Ok(serde_json::from_value(Value::Object(payload))?)
}
