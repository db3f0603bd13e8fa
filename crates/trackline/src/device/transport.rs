//! Record delivery to the ingestion server.
//!
//! The [`TelemetryTransport`] trait is the seam between delivery policy and
//! the wire. [`HttpTransport`] is the production implementation; tests plug in
//! scripted fakes. [`deliver_with_retry`] applies the bounded exponential
//! backoff shared by live sends and queue drains.

use std::time::Duration;

use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::Result;
use crate::record::TelemetryRecord;
use crate::wire::{IngestRequest, IngestResponse};

/// Why a single delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No bearer credential is available; nothing was sent.
    #[error("no credential available")]
    AuthMissing,

    /// The request never produced a response (timeout, refused, reset).
    #[error("network failure: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("server rejected record with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, if any.
        body: String,
    },
}

impl DeliveryError {
    /// Whether another attempt could succeed without outside intervention.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthMissing)
    }
}

/// Sends one record to the ingestion server.
#[async_trait::async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// Make a single delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] describing why the attempt failed.
    async fn send(
        &self,
        record: &TelemetryRecord,
        credential: &str,
    ) -> std::result::Result<IngestResponse, DeliveryError>;
}

/// HTTP transport posting JSON to `{server_url}/telemetry`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport for the given server base URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/telemetry", server_url.trim_end_matches('/')),
        })
    }

    /// Full URL records are posted to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl TelemetryTransport for HttpTransport {
    async fn send(
        &self,
        record: &TelemetryRecord,
        credential: &str,
    ) -> std::result::Result<IngestResponse, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(credential)
            .json(&IngestRequest::from_record(record))
            .send()
            .await
            .map_err(|e| DeliveryError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<IngestResponse>()
                .await
                .map_err(|e| DeliveryError::Network(format!("unreadable response: {e}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per record, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure.
    pub initial_delay: Duration,
    /// Pause between consecutive records in a drain.
    pub throttle: Duration,
}

impl RetryPolicy {
    /// Policy for live sends from the capture path.
    #[must_use]
    pub fn live(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            throttle: Duration::ZERO,
        }
    }

    /// Policy for queue drains.
    #[must_use]
    pub fn drain(max_attempts: u32, initial_delay: Duration, throttle: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            throttle,
        }
    }

    /// Backoff before attempt `attempt + 1`, given `attempt` failures so far.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay.saturating_mul(1 << exponent)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::live(3, Duration::from_millis(1_500))
    }
}

/// Deliver one record, retrying transient failures.
///
/// Returns the server receipt on the first success, or the last error once
/// the attempts are exhausted. [`DeliveryError::AuthMissing`] is returned
/// immediately.
///
/// # Errors
///
/// Returns the error of the final failed attempt.
pub async fn deliver_with_retry<T>(
    transport: &T,
    record: &TelemetryRecord,
    credential: &str,
    policy: &RetryPolicy,
) -> std::result::Result<IngestResponse, DeliveryError>
where
    T: TelemetryTransport + ?Sized,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match transport.send(record, credential).await {
            Ok(receipt) => {
                debug!(record_id = %record.id, attempt, server_id = %receipt.id, "Record delivered");
                return Ok(receipt);
            }
            Err(err) if !err.is_retryable() || attempt >= attempts => {
                warn!(record_id = %record.id, attempt, error = %err, "Delivery failed");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.backoff(attempt);
                debug!(
                    record_id = %record.id,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Delivery attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
