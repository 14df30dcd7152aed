use anyhow::{bail, Context, Result};
use clap::Parser;
use servermon::notify::{LogNotifier, Notifier, SmtpNotifier, WebhookNotifier};
use servermon::{open_store, probe, AlertRenderer, HealthMonitor, ServermonConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Check server health and alert on new failures.
#[derive(Debug, Parser)]
#[command(name = "servermon", version)]
struct Cli {
    /// General settings (retry policy, notification, state path)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Endpoint list
    #[arg(short, long, default_value = "servers.toml")]
    servers: PathBuf,

    /// Recipient list
    #[arg(short, long, default_value = "users.toml")]
    users: PathBuf,

    /// Run state file, overrides `[state] path`
    #[arg(long)]
    state: Option<PathBuf>,

    /// Alert template, overrides `[notify] template`
    #[arg(long)]
    template: Option<PathBuf>,

    /// Use the deterministic prober, only log alerts, and leave the state file untouched
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose { "servermon=debug" } else { "servermon=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false).compact())
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<ServermonConfig> {
    let mut config = ServermonConfig::from_files(&cli.config, &cli.servers, &cli.users)
        .context("failed to load configuration")?;
    config.apply_env_overrides()?;

    if let Some(state) = &cli.state {
        config.settings.state.path = state.clone();
    }
    if let Some(template) = &cli.template {
        config.settings.notify.template = Some(template.clone());
    }
    if cli.dry_run {
        config.settings.debug.mock_fetch = true;
    }

    config.validate()?;
    Ok(config)
}

/// SMTP when a relay is configured, else the webhook, else log only.
fn build_notifier(config: &ServermonConfig, dry_run: bool) -> Result<Box<dyn Notifier>> {
    let timeout = config.settings.healthcheck.http_timeout();
    if dry_run {
        return Ok(Box::new(LogNotifier));
    }
    if let Some(smtp) = &config.settings.smtp {
        info!(host = %smtp.hostname, port = smtp.port, "delivering alerts over SMTP");
        return Ok(Box::new(
            SmtpNotifier::new(smtp, timeout).context("failed to set up SMTP transport")?,
        ));
    }
    if let Some(url) = &config.settings.notify.webhook_url {
        info!("delivering alerts to webhook");
        return Ok(Box::new(WebhookNotifier::new(url.as_str(), timeout)?));
    }
    warn!("no SMTP relay or webhook configured, alerts will only be logged");
    Ok(Box::new(LogNotifier))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json);

    info!("loading config");
    let config = load_config(&cli)?;
    config.log_configuration();

    let prober = probe::from_settings(&config.settings).context("failed to build prober")?;
    let store = open_store(&config.settings.state.path, cli.dry_run)
        .await
        .context("failed to open run state")?;
    let renderer = match &config.settings.notify.template {
        Some(path) => AlertRenderer::from_file(path)
            .with_context(|| format!("failed to load alert template {}", path.display()))?,
        None => AlertRenderer::builtin()?,
    };
    let notifier = build_notifier(&config, cli.dry_run)?;

    let monitor = HealthMonitor::new(config, prober, store, notifier, renderer);
    let report = monitor.run_pass().await.context("check pass failed")?;

    info!(
        new = report.newly_down.len(),
        still_down = report.still_down.len(),
        recovered = report.recovered.len(),
        "check pass finished"
    );

    if !report.is_clean() {
        for failure in &report.render_failures {
            warn!(kind = ?failure.kind, error = %failure.error, "alert was not rendered");
        }
        for failure in &report.delivery_failures {
            warn!(email = %failure.email, error = %failure.error, "recipient was not notified");
        }
        bail!(
            "{} alerts failed to render and {} deliveries failed (run state was saved)",
            report.render_failures.len(),
            report.delivery_failures.len()
        );
    }

    Ok(())
}
