//! Image retrieval
//!
//! Captured images are announced by path and fetched from the device's HTTP server.

use crate::error::{OriginError, OriginResult};
use crate::OriginConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry configuration for image downloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial delay between retries in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles the delay each time)
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let final_delay = if self.use_jitter {
            // +/- 25%
            capped_delay * rand::thread_rng().gen_range(0.75..1.25)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

struct FetchError {
    retryable: bool,
    reason: String,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        let retryable = err.is_timeout()
            || err.is_connect()
            || err.status().map(is_retryable_status).unwrap_or(false);
        FetchError {
            retryable,
            reason: err.to_string(),
        }
    }
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// HTTP client for the device's image server
#[derive(Debug, Clone)]
pub struct ImageTransfer {
    http: reqwest::Client,
    base_url: String,
    retry: RetryConfig,
}

impl ImageTransfer {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration, retry: RetryConfig) -> OriginResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| OriginError::Io(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry,
        })
    }

    pub fn from_config(config: &OriginConfig) -> OriginResult<Self> {
        let base_url = if config.http_port == crate::DEFAULT_HTTP_PORT {
            format!("http://{}", config.host)
        } else {
            format!("http://{}:{}", config.host, config.http_port)
        };
        Self::new(base_url, config.timeouts.download_timeout(), config.retry.clone())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL for a device path, with a cache-busting timestamp
    pub fn image_url(&self, remote_path: &str, timestamp: i64) -> String {
        format!(
            "{}/{}?t={}",
            self.base_url,
            remote_path.trim_start_matches('/'),
            timestamp
        )
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError {
                retryable: is_retryable_status(status),
                reason: format!("HTTP {}", status),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Fetch an image, retrying transient failures
    pub async fn fetch(&self, remote_path: &str) -> OriginResult<Vec<u8>> {
        let attempts = self.retry.max_attempts.max(1);
        let mut last_reason = String::from("no attempts made");

        for attempt in 0..attempts {
            let url = self.image_url(remote_path, chrono::Utc::now().timestamp());
            match self.fetch_once(&url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    last_reason = e.reason;
                    if !e.retryable {
                        return Err(OriginError::Download {
                            path: remote_path.to_string(),
                            attempts: attempt + 1,
                            reason: last_reason,
                        });
                    }
                    if attempt + 1 < attempts {
                        let delay = self.retry.delay_for_attempt(attempt);
                        tracing::debug!(
                            "Download of {} failed (attempt {}/{}), retrying in {:?}: {}",
                            remote_path,
                            attempt + 1,
                            attempts,
                            delay,
                            last_reason
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(OriginError::Download {
            path: remote_path.to_string(),
            attempts,
            reason: last_reason,
        })
    }

    /// Fetch an image and store it at `destination`, returning the byte count
    pub async fn download(&self, remote_path: &str, destination: &Path) -> OriginResult<u64> {
        let bytes = self.fetch(remote_path).await?;
        write_atomically(destination, &bytes).await?;
        tracing::info!(
            "Saved {} ({} bytes) to {}",
            remote_path,
            bytes.len(),
            destination.display()
        );
        Ok(bytes.len() as u64)
    }
}

/// Write through a temporary sibling so readers never see a partial file
pub async fn write_atomically(destination: &Path, bytes: &[u8]) -> OriginResult<()> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = destination.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);
    tokio::fs::write(&partial, bytes).await?;
    tokio::fs::rename(&partial, destination).await?;
    Ok(())
}
