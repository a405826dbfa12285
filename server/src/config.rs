use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::refresh::{CronSchedule, RefreshSettings};

/// Application configuration loaded from a TOML file or defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Address and port the HTTP API listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Reference file acquisition.
    #[serde(default)]
    pub refresh: RefreshConfig,
}

/// `[refresh]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RefreshConfig {
    /// Where the reference file is published (gzip `manuf` format).
    #[serde(default = "default_source_url")]
    pub source_url: String,

    /// Local copy the lookup index is built from.
    #[serde(default = "default_destination")]
    pub destination: PathBuf,

    /// Five-field cron expression, evaluated in local time.
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Fail startup if the initial refresh fails instead of serving
    /// whatever is on disk.
    #[serde(default)]
    pub propagate_init_errors: bool,

    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_source_url() -> String {
    "https://www.wireshark.org/download/automated/data/manuf.gz".to_string()
}

fn default_destination() -> PathBuf {
    PathBuf::from("data/manuf.gz")
}

fn default_schedule() -> String {
    // Sundays at 03:00.
    "0 3 * * 0".to_string()
}

fn default_timeout() -> u64 {
    60
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            refresh: RefreshConfig::default(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            source_url: default_source_url(),
            destination: default_destination(),
            schedule: default_schedule(),
            propagate_init_errors: false,
            timeout_secs: default_timeout(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
        let config: AppConfig =
            toml::de::from_str(&contents).with_context(|| format!("invalid config in {path}"))?;
        Ok(config)
    }
}

impl RefreshConfig {
    /// Validate and convert into scheduler settings.
    pub fn settings(&self) -> Result<RefreshSettings> {
        let schedule: CronSchedule = self
            .schedule
            .parse()
            .with_context(|| format!("invalid refresh schedule {:?}", self.schedule))?;

        Ok(RefreshSettings {
            destination: self.destination.clone(),
            source_url: self.source_url.clone(),
            schedule,
            propagate_init_errors: self.propagate_init_errors,
            timeout: Duration::from_secs(self.timeout_secs),
        })
    }
}
