use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::error::Error as _;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
    /// The request never produced a response (DNS, connect, TLS, timeout...).
    #[error("{0}")]
    Transport(String),
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponse {
    pub status_code: u16,
}

impl HttpResponse {
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Only an exact 200 counts as up; other 2xx codes are treated as failures.
    pub fn is_ok(&self) -> bool {
        self.status_code == 200
    }
}

pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpError::Build)?;

        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| HttpError::Transport(describe(&e)))?;

        Ok(HttpResponse {
            status_code: response.status().as_u16(),
        })
    }
}

/// Flattens the reqwest error chain so the root cause ends up in the stored
/// error descriptor ("error sending request ...: connection refused").
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Status(u16),
    TransportError(String),
}

/// Scripted client for tests and dry runs.
///
/// Each URL owns a queue of outcomes consumed one per call; once a queue is
/// down to its last outcome that outcome repeats forever. Unknown URLs get the
/// default outcome (404 unless overridden).
pub struct MockHttpClient {
    scripts: Mutex<HashMap<String, Vec<MockOutcome>>>,
    calls: Mutex<HashMap<String, usize>>,
    default_outcome: MockOutcome,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            default_outcome: MockOutcome::Status(404),
        }
    }

    pub fn with_response(self, url: &str, status_code: u16) -> Self {
        self.with_sequence(url, vec![MockOutcome::Status(status_code)])
    }

    pub fn with_transport_error(self, url: &str, message: &str) -> Self {
        self.with_sequence(url, vec![MockOutcome::TransportError(message.to_string())])
    }

    pub fn with_sequence(self, url: &str, outcomes: Vec<MockOutcome>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), outcomes);
        self
    }

    pub fn with_default_outcome(mut self, outcome: MockOutcome) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Number of requests issued against `url` so far.
    pub fn call_count(&self, url: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    fn next_outcome(&self, url: &str) -> MockOutcome {
        let mut scripts = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        match scripts.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.remove(0),
            Some(queue) => queue
                .first()
                .cloned()
                .unwrap_or_else(|| self.default_outcome.clone()),
            None => self.default_outcome.clone(),
        }
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_insert(0) += 1;

        match self.next_outcome(url) {
            MockOutcome::Status(status_code) => Ok(HttpResponse { status_code }),
            MockOutcome::TransportError(message) => Err(HttpError::Transport(message)),
        }
    }
}
