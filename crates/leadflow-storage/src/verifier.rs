//! Client for the external email-verification API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use leadflow_core::EmailValidationStatus;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};

pub const MIN_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct VerifierClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl VerifierClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: Duration::from_secs(20),
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Timeout actually applied to each request.
    pub fn effective_timeout(&self) -> Duration {
        self.timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT)
    }
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("verification request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unreadable verifier response: {0}")]
    Payload(String),
    #[error("verifier is shutting down")]
    Closed,
}

/// Anything that can classify one email address.
#[async_trait]
pub trait EmailVerifier: Send + Sync {
    async fn verify_email(&self, email: &str) -> Result<EmailValidationStatus, VerifyError>;
}

#[derive(Debug, Serialize)]
struct VerifyRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    status: String,
}

/// Maps a response body onto the status vocabulary; unknown words become `Unknown`.
pub fn parse_verdict(body: &[u8]) -> Result<EmailValidationStatus, VerifyError> {
    let response: VerifyResponse =
        serde_json::from_slice(body).map_err(|err| VerifyError::Payload(err.to_string()))?;
    match response.status.parse::<EmailValidationStatus>() {
        Ok(status) => Ok(status),
        Err(err) => {
            warn!(error = %err, "verifier returned an unrecognised status");
            Ok(EmailValidationStatus::Unknown)
        }
    }
}

#[derive(Debug)]
pub struct HttpEmailVerifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpEmailVerifier {
    pub fn new(config: VerifierClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.effective_timeout())
            .build()
            .context("building verifier http client")?;
        let endpoint = format!("{}/verify", config.base_url.trim_end_matches('/'));

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    async fn send_with_retries(&self, email: &str) -> Result<EmailValidationStatus, VerifyError> {
        let mut attempt = 0;
        loop {
            let mut request = self.client.post(&self.endpoint).json(&VerifyRequest { email });
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let retry = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return parse_verdict(&body);
                    }
                    let err = VerifyError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (classify_status(status), err)
                }
                Err(err) => (classify_reqwest_error(&err), VerifyError::Request(err)),
            };

            match retry {
                (RetryDisposition::Retryable, err) if attempt < self.backoff.max_retries => {
                    warn!(attempt, error = %err, "retrying email verification");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl EmailVerifier for HttpEmailVerifier {
    async fn verify_email(&self, email: &str) -> Result<EmailValidationStatus, VerifyError> {
        let _permit = self.limit.acquire().await.map_err(|_| VerifyError::Closed)?;
        let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or_default();
        self.send_with_retries(email)
            .instrument(info_span!("verify_email", domain))
            .await
    }
}
