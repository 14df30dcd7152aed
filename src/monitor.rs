use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::ServermonConfig;
use crate::diff::diff_pass;
use crate::notify::{AlertBatch, AlertKind, AlertMessage, AlertRenderer, Notifier, NotifyError};
use crate::probe::{ProbeResult, Prober};
use crate::run_state::{RunRecord, RunStateStore, StateError};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    State(#[from] StateError),
}

/// An alert that never reached anyone because its body failed to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderFailure {
    pub kind: AlertKind,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub email: String,
    pub kind: AlertKind,
    pub error: String,
}

/// Summary of one completed pass.
#[derive(Debug, Clone)]
pub struct PassReport {
    pub run_time_start: DateTime<Utc>,
    pub run_time_end: DateTime<Utc>,
    pub newly_down: Vec<ProbeResult>,
    pub still_down: Vec<ProbeResult>,
    pub recovered: Vec<ProbeResult>,
    pub render_failures: Vec<RenderFailure>,
    pub delivery_failures: Vec<DeliveryFailure>,
}

impl PassReport {
    pub fn is_clean(&self) -> bool {
        self.render_failures.is_empty() && self.delivery_failures.is_empty()
    }
}

pub struct HealthMonitor {
    config: ServermonConfig,
    prober: Box<dyn Prober>,
    store: Box<dyn RunStateStore>,
    notifier: Box<dyn Notifier>,
    renderer: AlertRenderer,
}

impl HealthMonitor {
    pub fn new(
        config: ServermonConfig,
        prober: Box<dyn Prober>,
        store: Box<dyn RunStateStore>,
        notifier: Box<dyn Notifier>,
        renderer: AlertRenderer,
    ) -> Self {
        Self {
            config,
            prober,
            store,
            notifier,
            renderer,
        }
    }

    /// Runs one complete pass: load state, probe, diff, save, notify.
    ///
    /// The new state is saved before any alert is rendered or sent, so a
    /// broken template or a failing recipient never stops run history from
    /// advancing. Render and delivery failures are collected in the report
    /// rather than returned as errors.
    pub async fn run_pass(&self) -> Result<PassReport, MonitorError> {
        info!(endpoints = self.config.endpoints.len(), "loading previous run state");
        let previous = self.store.load().await?;

        let run_time_start = Utc::now();
        let down = self.probe_all().await;
        let run_time_end = Utc::now();
        info!(
            duration_ms = (run_time_end - run_time_start).num_milliseconds(),
            down = down.len(),
            "server check complete"
        );

        let diff = diff_pass(&previous, &down);
        for status in &diff.still_down {
            debug!(endpoint_id = status.id, "already alerted last run, suppressing");
        }
        for status in &diff.newly_down {
            info!(endpoint_id = status.id, url = %status.url, "new failure, alert will be sent");
        }

        self.store
            .save(&RunRecord::new(down, run_time_start, run_time_end))
            .await?;

        let notify = &self.config.settings.notify;
        let mut batches = Vec::new();
        if !diff.newly_down.is_empty() {
            batches.push((AlertKind::Down, diff.newly_down.clone(), &notify.subject));
        }
        if notify.notify_on_recovery && !diff.recovered.is_empty() {
            batches.push((AlertKind::Recovered, diff.recovered.clone(), &notify.recovery_subject));
        }

        let mut render_failures = Vec::new();
        let mut delivery_failures = Vec::new();
        for (kind, servers, subject) in batches {
            let batch = AlertBatch {
                kind,
                servers,
                run_time_start,
                run_time_end,
            };
            match self.message(&batch, subject) {
                Ok(message) => delivery_failures.extend(self.deliver_all(kind, &message).await),
                Err(e) => {
                    error!(?kind, error = %e, "failed to render alert, nobody notified");
                    render_failures.push(RenderFailure {
                        kind,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(PassReport {
            run_time_start,
            run_time_end,
            newly_down: diff.newly_down,
            still_down: diff.still_down,
            recovered: diff.recovered,
            render_failures,
            delivery_failures,
        })
    }

    /// Probes every endpoint in configured order and returns the down results.
    async fn probe_all(&self) -> Vec<ProbeResult> {
        let total = self.config.endpoints.len();
        let concurrency = self.config.settings.healthcheck.concurrency.max(1);

        let results: Vec<ProbeResult> = stream::iter(self.config.endpoints.iter().enumerate())
            .map(|(index, endpoint)| async move {
                info!(
                    index,
                    total,
                    endpoint_id = endpoint.id,
                    url = %endpoint.url,
                    "checking server status"
                );
                let status = self.prober.probe(endpoint).await;
                if status.is_up {
                    info!(endpoint_id = endpoint.id, "server is okay");
                } else {
                    error!(
                        endpoint_id = endpoint.id,
                        error = status.error.as_deref().unwrap_or_default(),
                        "target server has an error"
                    );
                }
                status
            })
            .buffered(concurrency)
            .collect()
            .await;

        results.into_iter().filter(|s| !s.is_up).collect()
    }

    fn message(&self, batch: &AlertBatch, subject: &str) -> Result<AlertMessage, NotifyError> {
        Ok(AlertMessage {
            from: self.config.settings.notify.from.clone(),
            subject: subject.to_string(),
            body: self.renderer.render(batch)?,
        })
    }

    async fn deliver_all(&self, kind: AlertKind, message: &AlertMessage) -> Vec<DeliveryFailure> {
        let mut failures = Vec::new();
        for recipient in self.config.recipients.iter().filter(|r| r.enabled) {
            info!(email = %recipient.email, ?kind, "sending alert");
            if let Err(e) = self.notifier.deliver(recipient, message).await {
                error!(email = %recipient.email, error = %e, "alert delivery failed");
                failures.push(DeliveryFailure {
                    email: recipient.email.clone(),
                    kind,
                    error: e.to_string(),
                });
            }
        }
        failures
    }
}
