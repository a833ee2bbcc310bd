//! Link transports
//!
//! A [`Link`] is one live connection to the device, reduced to a pair of channels: text frames
//! going out and frames (or a transport failure) coming in. The inbound channel closing means
//! the link is gone.

use crate::error::{OriginError, OriginResult};
use crate::protocol::{envelope_types, Payload, CONTROL_ENDPOINT_PATH};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Frames buffered in each direction of a link
pub const DEFAULT_LINK_CAPACITY: usize = 256;

/// One established connection
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<OriginResult<String>>,
}

/// Opens links to the device
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> OriginResult<Link>;

    /// Endpoint description for logs
    fn endpoint(&self) -> String;
}

// =============================================================================
// WebSocket
// =============================================================================

/// WebSocket link to the mount control endpoint
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    connect_timeout: Duration,
    capacity: usize,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            capacity: DEFAULT_LINK_CAPACITY,
        }
    }

    /// Connector for the standard control endpoint of a telescope at `host`
    pub fn for_host(host: &str) -> Self {
        Self::new(format!("ws://{}{}", host, CONTROL_ENDPOINT_PATH))
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> OriginResult<Link> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| {
                OriginError::Link(format!(
                    "connection to {} timed out after {:?}",
                    self.url, self.connect_timeout
                ))
            })?
            .map_err(|e| OriginError::Link(format!("failed to connect to {}: {}", self.url, e)))?;

        let (mut sink, mut stream) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(self.capacity);
        let (in_tx, in_rx) = mpsc::channel::<OriginResult<String>>(self.capacity);

        // Writer: ends when the client drops its sender, then closes the socket
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    tracing::warn!("WebSocket write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(Ok(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!("WebSocket {} closed by peer: {:?}", url, frame);
                        break;
                    }
                    Ok(Message::Binary(bytes)) => {
                        tracing::debug!("Ignoring {} byte binary frame from {}", bytes.len(), url);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = in_tx
                            .send(Err(OriginError::Link(format!("WebSocket read failed: {}", e))))
                            .await;
                        break;
                    }
                }
            }
        });

        tracing::info!("WebSocket connected to {}", self.url);
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// In-process connector whose far end is driven through a [`DeviceAcceptor`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<DeviceEnd>,
    reachable: Arc<AtomicBool>,
}

/// Receives the device side of every link opened through a [`MemoryConnector`]
#[derive(Debug)]
pub struct DeviceAcceptor {
    accept_rx: mpsc::UnboundedReceiver<DeviceEnd>,
    reachable: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, DeviceAcceptor) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let reachable = Arc::new(AtomicBool::new(true));
        (
            MemoryConnector {
                accept_tx,
                reachable: reachable.clone(),
            },
            DeviceAcceptor {
                accept_rx,
                reachable,
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> OriginResult<Link> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(OriginError::Link("device unreachable".to_string()));
        }
        let (out_tx, out_rx) = mpsc::channel(DEFAULT_LINK_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(DEFAULT_LINK_CAPACITY);
        self.accept_tx
            .send(DeviceEnd {
                from_client: out_rx,
                to_client: in_tx,
            })
            .map_err(|_| OriginError::Link("device end is gone".to_string()))?;
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}

impl DeviceAcceptor {
    /// Next link opened by the client
    pub async fn accept(&mut self) -> Option<DeviceEnd> {
        self.accept_rx.recv().await
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

/// Device side of an in-memory link. Dropping it drops the link.
#[derive(Debug)]
pub struct DeviceEnd {
    pub from_client: mpsc::Receiver<String>,
    pub to_client: mpsc::Sender<OriginResult<String>>,
}

impl DeviceEnd {
    /// Next command frame sent by the client, parsed as JSON
    pub async fn next_command(&mut self) -> Option<Value> {
        let text = self.from_client.recv().await?;
        serde_json::from_str(&text).ok()
    }

    pub async fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client.send(Ok(text.into())).await.is_ok()
    }

    /// Answer a command with a success response carrying `payload`
    pub async fn respond(&self, command: &Value, payload: Payload) -> bool {
        self.respond_with_code(command, 0, "", payload).await
    }

    pub async fn respond_with_code(
        &self,
        command: &Value,
        code: i64,
        message: &str,
        payload: Payload,
    ) -> bool {
        let mut frame = json!({
            "Source": command["Destination"],
            "Destination": command["Source"],
            "Command": command["Command"],
            "Type": envelope_types::RESPONSE,
            "SequenceID": command["SequenceID"],
            "ErrorCode": code,
            "ErrorMessage": message,
        });
        if let Value::Object(map) = &mut frame {
            map.extend(payload);
        }
        self.send_raw(frame.to_string()).await
    }

    pub async fn notify(&self, source: &str, event: &str, payload: Payload) -> bool {
        let mut frame = json!({
            "Source": source,
            "Destination": "All",
            "Command": event,
            "Type": envelope_types::NOTIFICATION,
        });
        if let Value::Object(map) = &mut frame {
            map.extend(payload);
        }
        self.send_raw(frame.to_string()).await
    }

    /// Report a transport failure to the client, then drop the link
    pub async fn fail(self, reason: &str) {
        let _ = self
            .to_client
            .send(Err(OriginError::Link(reason.to_string())))
            .await;
    }
}
