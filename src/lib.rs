//! servermon — probes a list of endpoints once per invocation and alerts
//! recipients about endpoints that went down since the previous run.

pub mod config;
pub mod diff;
pub mod http_client;
pub mod monitor;
pub mod notify;
pub mod probe;
pub mod run_state;

pub use config::{Endpoint, EndpointId, Recipient, ServermonConfig};
pub use diff::{classify_new, diff_pass, PassDiff};
pub use http_client::{HttpClient, MockHttpClient, ReqwestHttpClient};
pub use monitor::{HealthMonitor, MonitorError, PassReport};
pub use notify::{AlertBatch, AlertRenderer, LogNotifier, Notifier, SmtpNotifier, WebhookNotifier};
pub use probe::{DeterministicProber, ProbeResult, Prober, RetryPolicy, RetryingProber};
pub use run_state::{open_store, InMemoryStore, JsonFileStore, RunRecord, RunStateStore};
