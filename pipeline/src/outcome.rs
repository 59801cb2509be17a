//! Decides whether an attempt on a transaction succeeded.

use crate::message::TransactionMessage;
use crate::transaction::Transaction;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::{Client, connect::HttpConnector};
use rand::Rng;
use std::time::Duration;

const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// Not yet succeeded; schedule another attempt.
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum OutcomeError {
    #[error("verifier is unavailable")]
    Unavailable,
    #[error("invalid verification request: {0}")]
    InvalidRequest(String),
}

#[async_trait]
pub trait OutcomeDecider: Send + Sync {
    /// An `Err` leaves the delivery unacknowledged so the whole attempt is
    /// redelivered; it does not count as a failed attempt.
    async fn decide(&self, tx: &Transaction) -> Result<Outcome, OutcomeError>;
}

/// Placeholder decision: succeeds when a fresh draw from `0..range` equals the
/// correlation id.
#[derive(Debug, Clone)]
pub struct RandomMatch {
    range: u32,
}

impl RandomMatch {
    pub fn new(range: u32) -> Self {
        Self {
            range: range.max(1),
        }
    }
}

impl Default for RandomMatch {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[async_trait]
impl OutcomeDecider for RandomMatch {
    async fn decide(&self, tx: &Transaction) -> Result<Outcome, OutcomeError> {
        let drawn = rand::rng().random_range(0..self.range);
        tracing::debug!(
            transaction_id = %tx.id,
            correlation_id = %tx.correlation_id,
            drawn,
            "drew verification number"
        );

        if drawn.to_string() == tx.correlation_id.as_str() {
            Ok(Outcome::Succeeded)
        } else {
            Ok(Outcome::Failed)
        }
    }
}

/// Asks an external verification service over HTTP.
pub struct HttpVerifier {
    url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpVerifier {
    pub fn new(base_url: &str) -> Self {
        let client =
            Client::builder(hyper_util::rt::TokioExecutor::new()).build(HttpConnector::new());

        Self {
            url: format!("{}/verifications", base_url.trim_end_matches('/')),
            client,
            timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    /// Bounds connect plus response headers. A verifier that does not answer
    /// in time counts as unavailable.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn classify(status: StatusCode) -> Result<Outcome, OutcomeError> {
        if status.is_success() {
            return Ok(Outcome::Succeeded);
        }

        if status >= StatusCode::INTERNAL_SERVER_ERROR
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(OutcomeError::Unavailable);
        }

        Ok(Outcome::Failed)
    }
}

#[async_trait]
impl OutcomeDecider for HttpVerifier {
    async fn decide(&self, tx: &Transaction) -> Result<Outcome, OutcomeError> {
        let body = Full::new(TransactionMessage::from(tx).to_bytes());

        let req = Request::builder()
            .method(Method::POST)
            .uri(&self.url)
            .header("content-type", "application/json")
            .body(body)
            .map_err(|e| OutcomeError::InvalidRequest(e.to_string()))?;

        let response = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| {
                tracing::warn!(
                    url = %self.url,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "verification request timed out"
                );
                OutcomeError::Unavailable
            })?
            .map_err(|e| {
                tracing::warn!(error = %e, url = %self.url, "verification request failed");
                OutcomeError::Unavailable
            })?;

        Self::classify(response.status())
    }
}
