//! Alert rendering and delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::address::AddressError;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tera::{Context, Tera};
use thiserror::Error;
use tracing::info;

use crate::config::{Recipient, SmtpConfig};
use crate::probe::ProbeResult;

const TEMPLATE_NAME: &str = "alert.html";

const DEFAULT_TEMPLATE: &str = r#"<html>
<body>
{% if kind == "down" -%}
<h2>The following servers have gone down</h2>
{%- else -%}
<h2>The following servers are back up</h2>
{%- endif %}
<p>Check run from {{ run_time_start }} to {{ run_time_end }}.</p>
<table>
  <tr><th>ID</th><th>URL</th><th>Error</th><th>Checked at</th></tr>
{%- for server in servers %}
  <tr><td>{{ server.id }}</td><td>{{ server.url }}</td><td>{% if server.error %}{{ server.error }}{% endif %}</td><td>{{ server.checkedAt }}</td></tr>
{%- endfor %}
</table>
</body>
</html>
"#;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("template error: {0}")]
    Template(#[from] tera::Error),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("delivery rejected with status {status}")]
    Rejected { status: u16 },
    #[error("invalid mail address: {0}")]
    Address(#[from] AddressError),
    #[error("failed to build mail: {0}")]
    Mail(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Down,
    Recovered,
}

/// Endpoints to tell recipients about after one pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertBatch {
    pub kind: AlertKind,
    pub servers: Vec<ProbeResult>,
    pub run_time_start: DateTime<Utc>,
    pub run_time_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertMessage {
    pub from: String,
    pub subject: String,
    pub body: String,
}

pub struct AlertRenderer {
    tera: Tera,
}

impl AlertRenderer {
    pub fn builtin() -> Result<Self, NotifyError> {
        let mut tera = Tera::default();
        tera.add_raw_template(TEMPLATE_NAME, DEFAULT_TEMPLATE)?;
        Ok(Self { tera })
    }

    pub fn from_file(path: &Path) -> Result<Self, NotifyError> {
        let mut tera = Tera::default();
        tera.add_template_file(path, Some(TEMPLATE_NAME))?;
        Ok(Self { tera })
    }

    pub fn render(&self, batch: &AlertBatch) -> Result<String, NotifyError> {
        let context = Context::from_serialize(batch)?;
        Ok(self.tera.render(TEMPLATE_NAME, &context)?)
    }
}

/// Delivers a rendered alert to a single recipient.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, recipient: &Recipient, message: &AlertMessage) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    from: &'a str,
    to: &'a str,
    nicename: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Posts each message as JSON to a relay endpoint (mail gateway, chat hook...).
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, recipient: &Recipient, message: &AlertMessage) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            from: &message.from,
            to: &recipient.email,
            nicename: &recipient.nicename,
            subject: &message.subject,
            body: &message.body,
        };

        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(NotifyError::Rejected {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// Sends each message as an HTML mail through an SMTP relay. The connection
/// must upgrade with STARTTLS before credentials are sent.
pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.hostname)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(timeout))
            .build();
        Ok(Self { transport })
    }

    fn build_message(recipient: &Recipient, message: &AlertMessage) -> Result<Message, NotifyError> {
        let from: Mailbox = message.from.parse()?;
        let name = Some(recipient.nicename.clone()).filter(|n| !n.is_empty());
        let to = Mailbox::new(name, recipient.email.parse()?);

        Ok(Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_HTML)
            .body(message.body.clone())?)
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn deliver(&self, recipient: &Recipient, message: &AlertMessage) -> Result<(), NotifyError> {
        let mail = Self::build_message(recipient, message)?;
        self.transport.send(mail).await?;
        Ok(())
    }
}

/// Only logs what would have been sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, recipient: &Recipient, message: &AlertMessage) -> Result<(), NotifyError> {
        info!(
            to = %recipient.email,
            subject = %message.subject,
            body_len = message.body.len(),
            "alert not sent (log-only notifier)"
        );
        Ok(())
    }
}
