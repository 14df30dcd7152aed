//! Liveness probing.
//!
//! A [`Prober`] turns an [`Endpoint`] into a [`ProbeResult`]. Two strategies
//! exist: [`DeterministicProber`], which answers from the endpoint id alone,
//! and [`RetryingProber`], which issues real HTTP GETs and retries failures
//! at a fixed interval.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

use crate::config::{Endpoint, EndpointId, HealthcheckConfig, Settings};
use crate::http_client::{HttpClient, HttpError, ReqwestHttpClient};

/// Outcome of probing one endpoint during a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    #[serde(alias = "ID")]
    pub id: EndpointId,
    #[serde(alias = "IsUp")]
    pub is_up: bool,
    #[serde(default, alias = "Error", deserialize_with = "empty_as_none")]
    pub error: Option<String>,
    #[serde(alias = "URL")]
    pub url: String,
    #[serde(alias = "Date")]
    pub checked_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn up(endpoint: &Endpoint) -> Self {
        Self {
            id: endpoint.id,
            is_up: true,
            error: None,
            url: endpoint.url.clone(),
            checked_at: Utc::now(),
        }
    }

    pub fn down(endpoint: &Endpoint, error: impl Into<String>) -> Self {
        Self {
            id: endpoint.id,
            is_up: false,
            error: Some(error.into()),
            url: endpoint.url.clone(),
            checked_at: Utc::now(),
        }
    }
}

// Older state files store "no error" as an empty string.
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult;
}

/// Reports the configured ids as down with a `404` error and everything else
/// as up. Never touches the network.
#[derive(Debug, Clone, Default)]
pub struct DeterministicProber {
    down_ids: HashSet<EndpointId>,
}

impl DeterministicProber {
    pub fn new(down_ids: impl IntoIterator<Item = EndpointId>) -> Self {
        Self {
            down_ids: down_ids.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Prober for DeterministicProber {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        if self.down_ids.contains(&endpoint.id) {
            ProbeResult::down(endpoint, "404")
        } else {
            ProbeResult::up(endpoint)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn from_config(config: &HealthcheckConfig) -> Self {
        if config.try_with_backoff {
            Self::new(config.max_attempts, config.retry_interval())
        } else {
            Self::single_attempt()
        }
    }

    /// Total attempts; at least one request is always made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

enum AttemptFailure {
    Status(u16),
    Transport(String),
}

impl AttemptFailure {
    fn describe(self) -> String {
        match self {
            AttemptFailure::Status(code) => code.to_string(),
            AttemptFailure::Transport(message) => message,
        }
    }
}

/// Live prober: GET the endpoint, retrying non-200 answers and transport
/// errors up to `policy.max_attempts` times with `policy.interval` between
/// attempts.
pub struct RetryingProber {
    http_client: Box<dyn HttpClient>,
    policy: RetryPolicy,
}

impl RetryingProber {
    pub fn new(http_client: Box<dyn HttpClient>, policy: RetryPolicy) -> Self {
        Self {
            http_client,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl Prober for RetryingProber {
    async fn probe(&self, endpoint: &Endpoint) -> ProbeResult {
        let target = endpoint.target();
        let attempts = self.policy.attempts();
        let mut last_failure = None;

        for attempt in 1..=attempts {
            info!(
                endpoint_id = endpoint.id,
                attempt,
                max_attempts = attempts,
                target = %target,
                "fetching endpoint status"
            );

            // A failed request has no response to inspect, so the error arm
            // must be matched before anything reads a status code.
            match self.http_client.get(&target).await {
                Err(err) => {
                    warn!(endpoint_id = endpoint.id, attempt, error = %err, "request failed");
                    last_failure = Some(AttemptFailure::Transport(err.to_string()));
                }
                Ok(response) if response.is_ok() => return ProbeResult::up(endpoint),
                Ok(response) => {
                    warn!(
                        endpoint_id = endpoint.id,
                        attempt,
                        status_code = response.status_code(),
                        "non 200 status code"
                    );
                    last_failure = Some(AttemptFailure::Status(response.status_code()));
                }
            }

            if attempt < attempts {
                time::sleep(self.policy.interval).await;
            }
        }

        let error = last_failure
            .map(AttemptFailure::describe)
            .unwrap_or_default();
        ProbeResult::down(endpoint, error)
    }
}

/// Picks the prober described by `settings`: the deterministic one when
/// `debug.mock_fetch` is set, the live one otherwise.
pub fn from_settings(settings: &Settings) -> Result<Box<dyn Prober>, HttpError> {
    if settings.debug.mock_fetch {
        return Ok(Box::new(DeterministicProber::new(
            settings.debug.mock_down_ids.iter().copied(),
        )));
    }

    let http_client = ReqwestHttpClient::new(settings.healthcheck.http_timeout())?;
    Ok(Box::new(RetryingProber::new(
        Box::new(http_client),
        RetryPolicy::from_config(&settings.healthcheck),
    )))
}
