use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub type EndpointId = u32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {name}")]
    Env { name: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A monitored endpoint, as listed in `servers.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    #[serde(alias = "ID")]
    pub id: EndpointId,
    #[serde(default, alias = "Label")]
    pub label: String,
    #[serde(alias = "URL")]
    pub url: String,
    #[serde(default, alias = "Protocol", alias = "protocol")]
    pub scheme: String,
}

impl Endpoint {
    /// The address actually requested: `scheme` joined to `url`.
    ///
    /// `scheme` may be given as `https` or `https://`. A `url` that already
    /// starts with a scheme is used as-is.
    pub fn target(&self) -> String {
        if self.scheme.is_empty() || has_scheme(&self.url) {
            return self.url.clone();
        }
        let scheme = self.scheme.trim_end_matches("://");
        format!("{scheme}://{}", self.url)
    }
}

// Only a leading `name://` counts; a `://` later in the path or query does not.
fn has_scheme(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, _)) => {
            scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
        }
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Recipient {
    #[serde(default, alias = "Nicename")]
    pub nicename: String,
    #[serde(alias = "Email")]
    pub email: String,
    #[serde(default, alias = "Enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthcheckConfig {
    #[serde(alias = "TryWithBackoff")]
    pub try_with_backoff: bool,
    pub max_attempts: u32,
    pub retry_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub concurrency: usize,
}

impl HealthcheckConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            try_with_backoff: true,
            max_attempts: 3,
            retry_interval_secs: 60,
            http_timeout_secs: 30,
            concurrency: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    #[serde(alias = "MockFetch")]
    pub mock_fetch: bool,
    pub mock_down_ids: Vec<EndpointId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub from: String,
    pub subject: String,
    pub recovery_subject: String,
    pub template: Option<PathBuf>,
    pub notify_on_recovery: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            from: "servermon@localhost".to_string(),
            subject: "IMPORTANT: Servers have gone down".to_string(),
            recovery_subject: "Servers are back up".to_string(),
            template: None,
            notify_on_recovery: false,
        }
    }
}

/// Mail relay used for alerts. Connections always upgrade with STARTTLS and
/// authenticate with `username`/`password`.
#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(alias = "Hostname")]
    pub hostname: String,
    #[serde(default = "default_smtp_port", alias = "Port")]
    pub port: u16,
    #[serde(alias = "Username")]
    pub username: String,
    #[serde(default, alias = "Password")]
    pub password: String,
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("status.json"),
        }
    }
}

/// Contents of `config.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(alias = "Healthcheck")]
    pub healthcheck: HealthcheckConfig,
    #[serde(alias = "Debug")]
    pub debug: DebugConfig,
    pub notify: NotifyConfig,
    #[serde(alias = "SMTP")]
    pub smtp: Option<SmtpConfig>,
    pub state: StateConfig,
}

#[derive(Debug, Deserialize)]
struct EndpointList {
    #[serde(default, alias = "ServerList")]
    servers: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct RecipientList {
    #[serde(default, alias = "UserList")]
    users: Vec<Recipient>,
}

/// Everything a pass needs, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct ServermonConfig {
    pub settings: Settings,
    pub endpoints: Vec<Endpoint>,
    pub recipients: Vec<Recipient>,
}

impl ServermonConfig {
    pub fn from_files(
        settings_path: &Path,
        servers_path: &Path,
        users_path: &Path,
    ) -> Result<Self, ConfigError> {
        let settings: Settings = read_toml(settings_path)?;
        let endpoints = read_toml::<EndpointList>(servers_path)?.servers;
        let recipients = read_toml::<RecipientList>(users_path)?.users;

        Ok(Self {
            settings,
            endpoints,
            recipients,
        })
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        let healthcheck = &mut self.settings.healthcheck;
        if let Some(attempts) = env_override("SERVERMON_MAX_ATTEMPTS")? {
            healthcheck.max_attempts = attempts;
        }
        if let Some(secs) = env_override("SERVERMON_RETRY_INTERVAL_SECS")? {
            healthcheck.retry_interval_secs = secs;
        }
        if let Some(secs) = env_override("SERVERMON_HTTP_TIMEOUT_SECS")? {
            healthcheck.http_timeout_secs = secs;
        }
        if let Some(path) = env_override::<PathBuf>("SERVERMON_STATE_PATH")? {
            self.settings.state.path = path;
        }
        if let Some(mock) = env_override("SERVERMON_MOCK_FETCH")? {
            self.settings.debug.mock_fetch = mock;
        }
        if let Some(smtp) = self.settings.smtp.as_mut() {
            if let Some(password) = env_override("SERVERMON_SMTP_PASSWORD")? {
                smtp.password = password;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let healthcheck = &self.settings.healthcheck;
        if healthcheck.http_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "HTTP timeout must be greater than 0".to_string(),
            ));
        }

        if healthcheck.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "Probe concurrency must be greater than 0".to_string(),
            ));
        }

        if let Some(smtp) = &self.settings.smtp {
            if smtp.hostname.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "SMTP hostname must not be empty".to_string(),
                ));
            }
            if smtp.port == 0 {
                return Err(ConfigError::Invalid(
                    "SMTP port must be greater than 0".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate endpoint id {}",
                    endpoint.id
                )));
            }
            if endpoint.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {} has an empty url",
                    endpoint.id
                )));
            }
        }

        if let Some(recipient) = self.recipients.iter().find(|r| r.email.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "recipient {:?} has an empty email",
                recipient.nicename
            )));
        }

        Ok(())
    }

    pub fn log_configuration(&self) {
        let healthcheck = &self.settings.healthcheck;
        info!(
            endpoints = self.endpoints.len(),
            recipients = self.recipients.iter().filter(|r| r.enabled).count(),
            try_with_backoff = healthcheck.try_with_backoff,
            max_attempts = healthcheck.max_attempts,
            retry_interval_secs = healthcheck.retry_interval_secs,
            http_timeout_secs = healthcheck.http_timeout_secs,
            concurrency = healthcheck.concurrency,
            mock_fetch = self.settings.debug.mock_fetch,
            state_path = %self.settings.state.path.display(),
            smtp_host = self.settings.smtp.as_ref().map(|s| s.hostname.as_str()),
            webhook = self.settings.notify.webhook_url.is_some(),
            notify_on_recovery = self.settings.notify.notify_on_recovery,
            "servermon configuration loaded"
        );
    }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn env_override<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { name, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn endpoint(id: EndpointId, url: &str, scheme: &str) -> Endpoint {
        Endpoint {
            id,
            label: format!("site-{id}"),
            url: url.to_string(),
            scheme: scheme.to_string(),
        }
    }

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_target_joins_scheme_and_url() {
        assert_eq!(endpoint(1, "example.com", "https").target(), "https://example.com");
        assert_eq!(endpoint(1, "example.com", "http://").target(), "http://example.com");
        assert_eq!(endpoint(1, "http://example.com/health", "https").target(), "http://example.com/health");
        assert_eq!(endpoint(1, "http://example.com", "").target(), "http://example.com");
    }

    #[test]
    fn test_target_ignores_scheme_inside_query() {
        assert_eq!(
            endpoint(1, "example.com/?next=http://x", "https").target(),
            "https://example.com/?next=http://x"
        );
        assert_eq!(
            endpoint(1, "example.com/redirect/https://x", "http").target(),
            "http://example.com/redirect/https://x"
        );
        assert_eq!(
            endpoint(1, "svn+ssh://repo.example.com", "https").target(),
            "svn+ssh://repo.example.com"
        );
    }

    #[test]
    fn test_defaults_match_baseline_behavior() {
        let settings = Settings::default();
        assert!(settings.healthcheck.try_with_backoff);
        assert_eq!(settings.healthcheck.max_attempts, 3);
        assert_eq!(settings.healthcheck.retry_interval(), Duration::from_secs(60));
        assert_eq!(settings.healthcheck.concurrency, 1);
        assert!(!settings.notify.notify_on_recovery);
        assert_eq!(settings.state.path, PathBuf::from("status.json"));
    }

    #[test]
    fn test_from_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_file(
            &dir,
            "config.toml",
            r#"
            [healthcheck]
            max_attempts = 5
            retry_interval_secs = 2

            [debug]
            mock_fetch = true
            mock_down_ids = [196]

            [notify]
            webhook_url = "http://hooks.local/alert"
            notify_on_recovery = true

            [smtp]
            hostname = "smtp.example.com"
            username = "monitor"
            password = "hunter2"
            "#,
        );
        let servers = write_file(
            &dir,
            "servers.toml",
            r#"
            [[servers]]
            id = 1
            label = "Main site"
            url = "example.com"
            scheme = "https"

            [[servers]]
            id = 2
            url = "http://api.example.com/health"
            "#,
        );
        let users = write_file(
            &dir,
            "users.toml",
            r#"
            [[users]]
            nicename = "Ops"
            email = "ops@example.com"
            enabled = true

            [[users]]
            nicename = "Away"
            email = "away@example.com"
            enabled = false

            [[users]]
            nicename = "Unset"
            email = "unset@example.com"
            "#,
        );

        let config = ServermonConfig::from_files(&settings, &servers, &users).unwrap();
        config.validate().unwrap();

        assert_eq!(config.settings.healthcheck.max_attempts, 5);
        assert_eq!(config.settings.healthcheck.http_timeout_secs, 30);
        assert!(config.settings.debug.mock_fetch);
        assert_eq!(config.settings.debug.mock_down_ids, vec![196]);
        assert_eq!(
            config.settings.notify.webhook_url.as_deref(),
            Some("http://hooks.local/alert")
        );
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].target(), "https://example.com");
        assert!(config.recipients[0].enabled);
        assert!(!config.recipients[1].enabled);
        assert!(!config.recipients[2].enabled);

        let smtp = config.settings.smtp.as_ref().unwrap();
        assert_eq!(smtp.hostname, "smtp.example.com");
        assert_eq!(smtp.port, 587);
        assert_eq!(smtp.username, "monitor");
        assert!(!format!("{smtp:?}").contains("hunter2"));
    }

    #[test]
    fn test_smtp_absent_by_default() {
        assert!(Settings::default().smtp.is_none());
    }

    #[test]
    fn test_validate_rejects_empty_smtp_hostname() {
        let mut config = ServermonConfig::default();
        config.settings.smtp = Some(SmtpConfig {
            hostname: String::new(),
            port: 587,
            username: "monitor".to_string(),
            password: "secret".to_string(),
        });
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_legacy_key_names() {
        let dir = tempfile::tempdir().unwrap();
        let settings = write_file(
            &dir,
            "config.toml",
            "[Healthcheck]\nTryWithBackoff = false\n\n[Debug]\nMockFetch = true\n\n[SMTP]\nHostname = \"mail.example.com\"\nPort = 2525\nUsername = \"monitor\"\nPassword = \"secret\"\n",
        );
        let servers = write_file(
            &dir,
            "servers.toml",
            "[[ServerList]]\nID = 196\nLabel = \"Legacy\"\nURL = \"legacy.example.com\"\nProtocol = \"https://\"\n",
        );
        let users = write_file(
            &dir,
            "users.toml",
            "[[UserList]]\nNicename = \"Ops\"\nEmail = \"ops@example.com\"\nEnabled = true\n",
        );

        let config = ServermonConfig::from_files(&settings, &servers, &users).unwrap();

        assert!(!config.settings.healthcheck.try_with_backoff);
        assert!(config.settings.debug.mock_fetch);
        assert_eq!(config.endpoints[0].id, 196);
        assert_eq!(config.endpoints[0].target(), "https://legacy.example.com");
        assert_eq!(config.recipients[0].email, "ops@example.com");
        assert!(config.recipients[0].enabled);
        let smtp = config.settings.smtp.unwrap();
        assert_eq!(smtp.hostname, "mail.example.com");
        assert_eq!(smtp.port, 2525);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let result = ServermonConfig::from_files(&missing, &missing, &missing);
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write_file(&dir, "config.toml", "[healthcheck\nmax_attempts = ");
        let servers = write_file(&dir, "servers.toml", "");
        let users = write_file(&dir, "users.toml", "");
        let result = ServermonConfig::from_files(&bad, &servers, &users);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let config = ServermonConfig {
            endpoints: vec![endpoint(1, "a.example.com", "https"), endpoint(1, "b.example.com", "https")],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_concurrency() {
        let mut config = ServermonConfig::default();
        config.settings.healthcheck.http_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ServermonConfig::default();
        config.settings.healthcheck.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_email() {
        let config = ServermonConfig {
            recipients: vec![Recipient {
                nicename: "Nobody".to_string(),
                email: " ".to_string(),
                enabled: true,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
