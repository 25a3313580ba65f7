use std::env;
use std::env::current_dir;
use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use secrecy::ExposeSecret;
use secrecy::Secret;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;

/// Global configuration, loaded from `configuration/*.yaml` and `APP_*` env
/// vars. See `get_configuration`.
#[derive(Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub email_client: EmailClientSettings,
    pub staging: StagingSettings,
}

/// Server configuration
#[derive(Clone, Deserialize)]
pub struct ApplicationSettings {
    /// Should be localhost on dev machine, 0.0.0.0 on prod
    pub host: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,

    /// Root of the shared upload staging area. Every upload gets its own
    /// subdirectory.
    pub staging_dir: PathBuf,

    /// Ceiling for one multipart form (and therefore for one chunk)
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_upload_bytes: usize,

    /// Number of recipients a single dispatch talks to at once
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub dispatch_concurrency: usize,
}

/// Database configuration. The store is a single SQLite file.
#[derive(Clone, Deserialize)]
pub struct DatabaseSettings {
    pub filename: PathBuf,
    pub create_if_missing: bool,
}

impl DatabaseSettings {
    pub fn connection(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.filename)
            .create_if_missing(self.create_if_missing)
            // sqlite only checks REFERENCES when asked to; the store still checks
            // existence itself before inserting memberships
            .foreign_keys(true)
            // readers don't block the writer, which matters once several requests
            // resolve campaigns while another one creates a campaign
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
    }
}

/// How the SMTP connection is secured
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Implicit TLS, usually port 465
    Wrapper,
    /// Plain connection upgraded with STARTTLS, usually port 587
    Starttls,
    /// No encryption at all; only for local relays
    None,
}

/// SMTP configuration. Host and credentials may be left empty; in that case the
/// server still starts, but every dispatch fails before sending anything.
#[derive(Clone, Deserialize)]
pub struct EmailClientSettings {
    pub host: String,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,

    pub username: String,
    pub password: Secret<String>,

    /// `From` address; defaults to `username`
    pub sender: Option<String>,

    pub tls: SmtpTls,

    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub timeout_milliseconds: u64,
}

impl EmailClientSettings {
    pub fn timeout(&self) -> Duration { Duration::from_millis(self.timeout_milliseconds) }

    /// Names of the settings that must be filled in before anything can be
    /// sent. Empty when the transport is usable.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.username.trim().is_empty() {
            missing.push("username");
        }
        if self.password.expose_secret().is_empty() {
            missing.push("password");
        }
        missing
    }

    pub fn sender_address(&self) -> &str {
        self.sender
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

/// Background sweeper for the staging area
#[derive(Clone, Deserialize)]
pub struct StagingSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub sweep_interval_seconds: u64,

    /// Staged uploads older than this are considered abandoned
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_age_seconds: u64,
}

impl StagingSettings {
    pub fn sweep_interval(&self) -> Duration { Duration::from_secs(self.sweep_interval_seconds) }

    pub fn max_age(&self) -> Duration { Duration::from_secs(self.max_age_seconds) }
}

#[derive(Debug)]
pub enum Environment {
    Local,
    Production,
}

impl Display for Environment {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Environment::Local => "local",
                Environment::Production => "production",
            }
        )
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            e => Err(format!("{e} is not a supported environment; use `local` or `production`")),
        }
    }
}

/// Load yaml configuration files at `<project_root>/configuration`, then apply
/// `APP_*` env var overrides.
///
/// `APP_EMAIL_CLIENT__PASSWORD=hunter2` -> `Settings.email_client.password`
pub fn get_configuration() -> Result<Settings, ConfigError> {
    let cfg_dir = current_dir()
        .map_err(|e| ConfigError::Message(format!("could not get current dir: {e}")))?
        .join("configuration");

    let env: Environment = env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".to_string())
        .try_into()
        .map_err(ConfigError::Message)?;

    let settings = Config::builder()
        .add_source(config::File::from(cfg_dir.join("base.yaml")))
        .add_source(config::File::from(cfg_dir.join(format!("{env}.yaml"))))
        .add_source(
            // env vars are always strings; `serde-aux` takes care of the numbers
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
