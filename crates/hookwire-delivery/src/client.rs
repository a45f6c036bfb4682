//! HTTP client for posting payloads to listener URLs.
//!
//! One POST per attempt, no redirects beyond reqwest's default, no
//! authentication and no signature headers. The timeout is fixed for the
//! whole process.

use std::time::{Duration, Instant};

use bytes::Bytes;
use hookwire_core::{MessageId, TaskId};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3;

/// Configuration for the delivery client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied to every request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Treat non-2xx responses as failed attempts.
    pub require_success_status: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            user_agent: concat!("hookwire/", env!("CARGO_PKG_VERSION")).to_string(),
            require_success_status: false,
        }
    }
}

/// A single delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Task being attempted.
    pub task_id: TaskId,
    /// Message the payload belongs to.
    pub message_id: MessageId,
    /// Destination URL.
    pub url: String,
    /// Serialized payload.
    pub body: Bytes,
    /// Content type of the payload.
    pub content_type: &'static str,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Outcome of an attempt that received a response.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Total duration of the request.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

/// HTTP client shared by all delivery attempts of a process.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("timeout must be greater than zero"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs the payload to the listener.
    ///
    /// Any received response counts as delivered unless
    /// `require_success_status` is set.
    ///
    /// # Errors
    ///
    /// - `InvalidUrl` if the URL cannot be parsed
    /// - `Timeout` if no response arrived within the timeout
    /// - `NetworkError` for connection and other transport failures
    /// - `UnsuccessfulStatus` for non-2xx responses when success statuses
    ///   are required
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "webhook_delivery",
            task_id = %request.task_id,
            message_id = %request.message_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let url = reqwest::Url::parse(&request.url)
                .map_err(|e| DeliveryError::invalid_url(&request.url, e.to_string()))?;

            tracing::debug!("sending webhook");
            let start_time = Instant::now();

            let response = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, request.content_type)
                .body(request.body)
                .send()
                .await
                .map_err(|e| {
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        error = %e,
                        "request failed"
                    );
                    if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_builder() {
                        DeliveryError::invalid_url(&request.url, e.to_string())
                    } else if e.is_connect() {
                        DeliveryError::network(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::network(e.to_string())
                    }
                })?;

            let duration = start_time.elapsed();
            let status = response.status();
            let status_code = status.as_u16();

            tracing::debug!(status = status_code, duration_ms = duration.as_millis(), "received response");

            if status.is_success() {
                tracing::info!(status = status_code, "webhook delivered");
            } else if self.config.require_success_status {
                tracing::warn!(status = status_code, "listener rejected webhook");
                return Err(DeliveryError::UnsuccessfulStatus { status_code });
            } else {
                tracing::info!(status = status_code, "webhook delivered with non-2xx status");
            }

            Ok(DeliveryResponse { status_code, duration, is_success: status.is_success() })
        }
        .instrument(span)
        .await
    }
}
