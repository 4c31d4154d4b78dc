//! HTTP delivery to the chat destination.
//!
//! Sends formatted payloads with an enforced timeout and classifies every
//! failure so the queue's retry policy can act on it. Destination
//! credentials are never logged in full.

use std::{fmt, time::Duration};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Result type alias using [`DeliveryError`].
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised while delivering a notification.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Request exceeded the configured timeout.
    #[error("delivery timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request was abandoned.
        timeout_seconds: u64,
    },

    /// Transport-level failure (DNS, connect, TLS).
    #[error("delivery transport error: {message}")]
    Transport {
        /// What failed at the transport level.
        message: String,
    },

    /// Destination answered with a rate limit.
    #[error("destination rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds the destination asked us to wait.
        retry_after_seconds: u64,
    },

    /// Destination answered with a non-2xx status.
    #[error("destination rejected delivery: HTTP {status}")]
    Destination {
        /// HTTP status code returned.
        status: u16,
        /// Response body, captured for diagnostics.
        body: String,
    },

    /// The client itself is misconfigured (bad URL, bad TLS settings).
    #[error("delivery configuration error: {message}")]
    Configuration {
        /// What is misconfigured.
        message: String,
    },
}

impl DeliveryError {
    /// Whether the queue should retry this failure.
    ///
    /// Timeouts, transport errors, rate limits, and destination 5xx are
    /// retryable; other destination rejections and configuration errors
    /// are not.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Transport { .. } | Self::RateLimited { .. } => true,
            Self::Destination { status, .. } => *status >= 500,
            Self::Configuration { .. } => false,
        }
    }
}

/// Per-tenant destination credentials.
///
/// Displayed host-only so the webhook path (which embeds a secret) never
/// reaches the logs.
#[derive(Clone)]
pub struct DestinationCredentials {
    /// Full destination webhook URL, including its secret path.
    pub webhook_url: String,
}

impl DestinationCredentials {
    /// Creates credentials around a webhook URL.
    pub fn new(webhook_url: impl Into<String>) -> Self {
        Self { webhook_url: webhook_url.into() }
    }
}

impl fmt::Debug for DestinationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationCredentials").field("webhook_url", &self.masked()).finish()
    }
}

impl fmt::Display for DestinationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl DestinationCredentials {
    /// Host-only rendering safe for logs.
    pub fn masked(&self) -> String {
        match reqwest::Url::parse(&self.webhook_url) {
            Ok(url) => {
                format!("{}://{}/***", url.scheme(), url.host_str().unwrap_or("unknown"))
            },
            Err(_) => "***".to_string(),
        }
    }
}

/// Options applied to one delivery.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOptions {
    /// Destination channel override.
    pub channel: Option<String>,
    /// Existing thread to reply into.
    pub thread_ref: Option<String>,
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// HTTP status the destination returned.
    pub status_code: u16,
    /// Response body (truncated).
    pub body: String,
    /// Message timestamp parsed from the response, when the destination
    /// returns one; used to seed thread mappings.
    pub message_ts: Option<String>,
    /// Wall-clock duration of the request.
    pub duration: Duration,
}

/// HTTP client for notification delivery.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    timeout: Duration,
}

/// Cap on captured response bodies.
const MAX_BODY_CAPTURE: usize = 4 * 1024;

impl DeliveryClient {
    /// Creates a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Configuration`] when the HTTP client cannot
    /// be built.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("notiq-delivery/0.3")
            .build()
            .map_err(|e| DeliveryError::Configuration {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, timeout })
    }

    /// Sends a formatted payload to the destination.
    ///
    /// `options.thread_ref` and `options.channel` are merged into the
    /// payload so the destination threads and routes the message.
    ///
    /// # Errors
    ///
    /// Returns a classified [`DeliveryError`] on timeout, transport
    /// failure, or non-2xx response.
    pub async fn send(
        &self,
        payload: &Value,
        credentials: &DestinationCredentials,
        options: &DeliveryOptions,
    ) -> Result<DeliveryReceipt> {
        let span = info_span!("notification_delivery", destination = %credentials.masked());

        async move {
            let start = std::time::Instant::now();

            let mut body = payload.clone();
            if let Value::Object(map) = &mut body {
                if let Some(channel) = &options.channel {
                    map.insert("channel".to_string(), Value::String(channel.clone()));
                }
                if let Some(thread_ref) = &options.thread_ref {
                    map.insert("thread_ts".to_string(), Value::String(thread_ref.clone()));
                }
            }

            let response = match self
                .client
                .post(&credentials.webhook_url)
                .json(&body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    warn!(duration_ms = start.elapsed().as_millis() as u64, "delivery timed out");
                    return Err(DeliveryError::Timeout {
                        timeout_seconds: self.timeout.as_secs(),
                    });
                },
                Err(e) if e.is_builder() => {
                    return Err(DeliveryError::Configuration { message: e.to_string() });
                },
                Err(e) => {
                    warn!(error = %e, "delivery transport error");
                    return Err(DeliveryError::Transport { message: e.to_string() });
                },
            };

            let duration = start.elapsed();
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());

            let raw_body = response.bytes().await.unwrap_or_default();
            let body_text = if raw_body.len() > MAX_BODY_CAPTURE {
                format!("{}... (truncated)", String::from_utf8_lossy(&raw_body[..MAX_BODY_CAPTURE]))
            } else {
                String::from_utf8_lossy(&raw_body).into_owned()
            };

            if status == 429 {
                return Err(DeliveryError::RateLimited {
                    retry_after_seconds: retry_after.unwrap_or(60),
                });
            }
            if !(200..300).contains(&status) {
                warn!(status, "destination rejected delivery");
                return Err(DeliveryError::Destination { status, body: body_text });
            }

            // Bot-token style endpoints return the message ts; incoming
            // webhooks just say "ok".
            let message_ts = serde_json::from_slice::<Value>(&raw_body)
                .ok()
                .and_then(|v| {
                    v.get("ts")
                        .or_else(|| v.get("message").and_then(|m| m.get("ts")))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });

            debug!(status, duration_ms = duration.as_millis() as u64, "notification delivered");
            Ok(DeliveryReceipt { status_code: status, body: body_text, message_ts, duration })
        }
        .instrument(span)
        .await
    }
}
