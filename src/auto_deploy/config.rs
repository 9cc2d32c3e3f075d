// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Deployment profile schema.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use super::expand::expand_variables;
use crate::config::{
    DEFAULT_INSTALLER_PATTERN, DEFAULT_MANAGEMENT_URL, DEFAULT_PRODUCT_NAME, DEFAULT_RELEASES_URL,
    DEFAULT_SERVICE_NAME, DeployConfig, RegistrationTimings,
};
use crate::error::{DeployError, Result};
use crate::logging::{LogConfig, LogLevel};

/// A deployment profile as read from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AutoDeployConfig {
    /// Local client layout.
    #[serde(default)]
    pub client: ClientConfig,

    /// Management endpoint and enrollment credential.
    #[serde(default)]
    pub management: ManagementConfig,

    /// Release lookup.
    #[serde(default)]
    pub release: ReleaseConfig,

    /// Registration retry and timing budgets.
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Network prerequisite probes.
    #[serde(default)]
    pub network: NetworkConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[client]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ClientConfig {
    /// Display name matched against uninstall entries.
    pub product_name: String,
    /// Windows service name.
    pub service_name: String,
    /// Client executable. Defaults to the install directory.
    pub executable: Option<PathBuf>,
    /// Client data directory. Defaults to `%ProgramData%\Netbird`.
    pub data_dir: Option<PathBuf>,
    /// Client config file inside the data directory.
    pub config_file_name: String,
    /// Log directory inside the data directory. Kept by a full reset.
    pub log_dir_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            executable: None,
            data_dir: None,
            config_file_name: "config.json".to_string(),
            log_dir_name: "logs".to_string(),
        }
    }
}

/// `[management]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ManagementConfig {
    /// Management server URL.
    pub url: String,

    /// Setup key source: a literal key, `env:VAR`, or `file:path`.
    pub setup_key: Option<String>,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_MANAGEMENT_URL.to_string(),
            setup_key: None,
        }
    }
}

/// `[release]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ReleaseConfig {
    /// Release API base URL.
    pub url: String,

    /// Pin a version instead of following the latest release.
    pub version: Option<String>,

    /// Regex matched against release asset names.
    pub installer_pattern: String,
    /// Release lookup attempts.
    pub max_attempts: u32,
    /// Base delay between lookups; grows linearly.
    pub retry_delay_seconds: u64,
    /// Installer run limit.
    pub installer_timeout_seconds: u64,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELEASES_URL.to_string(),
            version: None,
            installer_pattern: DEFAULT_INSTALLER_PATTERN.to_string(),
            max_attempts: 3,
            retry_delay_seconds: 5,
            installer_timeout_seconds: 15 * 60,
        }
    }
}

/// `[registration]` section. All durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct RegistrationConfig {
    /// Join attempts before giving up.
    pub max_retries: u32,

    /// Check connection prerequisites only instead of full connectivity.
    pub pre_login: bool,

    /// Parse `status --json` output. Needs a client that supports it.
    pub json_status: bool,

    /// Pause before re-checking a failed network.
    pub network_retry_delay: u64,
    /// Daemon readiness wait on an existing install.
    pub daemon_wait: u64,
    /// Daemon readiness wait after a fresh install.
    pub daemon_wait_fresh: u64,
    /// Daemon readiness wait after a service restart.
    pub daemon_wait_after_restart: u64,
    /// Daemon readiness wait after a full reset.
    pub daemon_wait_after_reset: u64,
    /// Service start limit.
    pub service_start_timeout: u64,
    /// Full connectivity verification limit.
    pub verification_timeout: u64,
    /// Pre-login verification limit.
    pub pre_login_timeout: u64,
    /// Status poll interval.
    pub poll_interval: u64,
    /// Single `status` call limit.
    pub status_timeout: u64,
    /// Single `up` call limit.
    pub join_timeout: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        let t = RegistrationTimings::default();
        Self {
            max_retries: 5,
            pre_login: false,
            json_status: false,
            network_retry_delay: t.network_retry_delay.as_secs(),
            daemon_wait: t.daemon_wait.as_secs(),
            daemon_wait_fresh: t.daemon_wait_fresh.as_secs(),
            daemon_wait_after_restart: t.daemon_wait_after_restart.as_secs(),
            daemon_wait_after_reset: t.daemon_wait_after_reset.as_secs(),
            service_start_timeout: t.service_start_timeout.as_secs(),
            verification_timeout: t.verification_timeout.as_secs(),
            pre_login_timeout: t.pre_login_timeout.as_secs(),
            poll_interval: t.poll_interval.as_secs(),
            status_timeout: t.status_timeout.as_secs(),
            join_timeout: t.join_timeout.as_secs(),
        }
    }
}

impl RegistrationConfig {
    fn timings(&self, installer_timeout: Duration) -> RegistrationTimings {
        let secs = Duration::from_secs;
        RegistrationTimings {
            network_retry_delay: secs(self.network_retry_delay),
            daemon_wait_fresh: secs(self.daemon_wait_fresh),
            daemon_wait: secs(self.daemon_wait),
            daemon_wait_after_restart: secs(self.daemon_wait_after_restart),
            daemon_wait_after_reset: secs(self.daemon_wait_after_reset),
            service_start_timeout: secs(self.service_start_timeout),
            verification_timeout: secs(self.verification_timeout),
            pre_login_timeout: secs(self.pre_login_timeout),
            poll_interval: secs(self.poll_interval),
            status_timeout: secs(self.status_timeout),
            join_timeout: secs(self.join_timeout),
            installer_timeout,
        }
    }
}

/// `[network]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct NetworkConfig {
    /// Relay or signal hosts tried on port 443.
    pub relay_hosts: Vec<String>,
    /// Address pinged for internet reachability.
    pub connectivity_anchor: String,
    /// HTTP fallback for internet reachability.
    pub connectivity_probe_url: String,
    /// Server whose `Date` header is the clock reference.
    pub time_reference_url: String,
    /// HTTP request limit.
    pub http_timeout_seconds: u64,
    /// Free space required on the system drive.
    pub min_free_disk_mb: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let d = DeployConfig::default();
        Self {
            relay_hosts: d.relay_hosts,
            connectivity_anchor: d.connectivity_anchor,
            connectivity_probe_url: d.connectivity_probe_url.to_string(),
            time_reference_url: d.time_reference_url.to_string(),
            http_timeout_seconds: d.http_timeout.as_secs(),
            min_free_disk_mb: d.min_free_disk_mb,
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// `error`, `warn`, `info`, `debug`, or `trace`.
    pub level: String,
    /// Log file. Console only when unset.
    pub path: Option<PathBuf>,
    /// Emit JSON lines.
    pub json_format: bool,
    /// Rotate the file at this size.
    pub max_size_mb: u64,
    /// Rotated files to keep.
    pub max_files: u32,

    /// Mirror registration milestones into the Windows Application log.
    pub windows_event_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            path: None,
            json_format: false,
            max_size_mb: 10,
            max_files: 5,
            windows_event_log: true,
        }
    }
}

impl AutoDeployConfig {
    /// Parse a profile from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DeployError::config(format!("Invalid profile: {e}")))
    }

    /// Serialize the profile back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DeployError::config(format!("Cannot serialize profile: {e}")))
    }

    /// Expand `${VAR}` placeholders in every path, URL, and host value.
    pub fn expand_variables(&mut self) {
        let expand_path = |p: &mut Option<PathBuf>| {
            if let Some(path) = p {
                *path = PathBuf::from(expand_variables(&path.to_string_lossy()));
            }
        };
        let expand_str = |s: &mut String| *s = expand_variables(s);

        expand_path(&mut self.client.executable);
        expand_path(&mut self.client.data_dir);
        expand_path(&mut self.logging.path);

        expand_str(&mut self.management.url);
        if let Some(key) = &mut self.management.setup_key {
            expand_str(key);
        }
        expand_str(&mut self.release.url);
        self.network.relay_hosts.iter_mut().for_each(expand_str);
        expand_str(&mut self.network.connectivity_anchor);
        expand_str(&mut self.network.connectivity_probe_url);
        expand_str(&mut self.network.time_reference_url);
    }

    /// Check the profile, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        match Url::parse(&self.management.url) {
            Ok(url) if url.scheme() != "https" => {
                errors.push(format!("management.url must use https: {}", self.management.url));
            }
            Ok(url) if url.host_str().is_none() => {
                errors.push(format!("management.url has no host: {}", self.management.url));
            }
            Ok(_) => {}
            Err(e) => errors.push(format!("management.url is invalid: {e}")),
        }

        if let Some(key) = &self.management.setup_key
            && key.trim().is_empty()
        {
            errors.push("management.setup_key is empty".to_string());
        }

        if let Err(e) = Url::parse(&self.release.url) {
            errors.push(format!("release.url is invalid: {e}"));
        }
        if let Err(e) = regex::Regex::new(&self.release.installer_pattern) {
            errors.push(format!("release.installer_pattern is not a valid regex: {e}"));
        }
        if self.release.max_attempts == 0 {
            errors.push("release.max_attempts must be at least 1".to_string());
        }

        if self.registration.max_retries == 0 {
            errors.push("registration.max_retries must be at least 1".to_string());
        }
        if self.registration.poll_interval == 0 {
            errors.push("registration.poll_interval must be at least 1 second".to_string());
        }

        for (field, value) in [
            ("network.connectivity_probe_url", &self.network.connectivity_probe_url),
            ("network.time_reference_url", &self.network.time_reference_url),
        ] {
            if let Err(e) = Url::parse(value) {
                errors.push(format!("{field} is invalid: {e}"));
            }
        }
        if self.network.http_timeout_seconds == 0 {
            errors.push("network.http_timeout_seconds must be at least 1".to_string());
        }

        if LogLevel::parse(&self.logging.level).is_none() {
            errors.push(format!("logging.level is not recognized: {}", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DeployError::config(format!(
                "Profile validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Build the runtime configuration.
    pub fn to_deploy_config(&self) -> Result<DeployConfig> {
        let installer_timeout = Duration::from_secs(self.release.installer_timeout_seconds);

        let mut builder = DeployConfig::builder()
            .product_name(&self.client.product_name)
            .service_name(&self.client.service_name)
            .config_file_name(&self.client.config_file_name)
            .log_dir_name(&self.client.log_dir_name)
            .management_url(&self.management.url)?
            .releases_url(&self.release.url)?
            .installer_pattern(&self.release.installer_pattern)
            .release_max_attempts(self.release.max_attempts)
            .release_retry_delay(Duration::from_secs(self.release.retry_delay_seconds))
            .max_retries(self.registration.max_retries)
            .timings(self.registration.timings(installer_timeout))
            .relay_hosts(self.network.relay_hosts.clone())
            .connectivity_anchor(&self.network.connectivity_anchor)
            .connectivity_probe_url(&self.network.connectivity_probe_url)?
            .time_reference_url(&self.network.time_reference_url)?
            .http_timeout(Duration::from_secs(self.network.http_timeout_seconds))
            .min_free_disk_mb(self.network.min_free_disk_mb)
            .status_json(self.registration.json_status);

        if let Some(exe) = &self.client.executable {
            builder = builder.client_executable(exe);
        }
        if let Some(dir) = &self.client.data_dir {
            builder = builder.data_dir(dir);
        }
        Ok(builder.build())
    }

    /// Build the log configuration.
    pub fn to_log_config(&self) -> LogConfig {
        let mut config = match &self.logging.path {
            Some(path) => LogConfig::file(path),
            None => LogConfig::stdout(),
        }
        .with_level(LogLevel::parse(&self.logging.level).unwrap_or_default())
        .with_max_size_mb(self.logging.max_size_mb)
        .with_max_files(self.logging.max_files);
        if self.logging.json_format {
            config = config.with_json();
        }
        config
    }

    /// Resolve the configured setup key, if any.
    pub fn setup_key(&self) -> Result<Option<String>> {
        self.management.setup_key.as_deref().map(resolve_setup_key).transpose()
    }
}

/// Resolve a setup key source.
///
/// `env:NAME` reads the environment variable, `file:PATH` reads the first
/// line of a file, and anything else is the key itself.
pub fn resolve_setup_key(source: &str) -> Result<String> {
    let key = if let Some(name) = source.strip_prefix("env:") {
        std::env::var(name)
            .map_err(|_| DeployError::config(format!("Setup key variable {name} is not set")))?
    } else if let Some(path) = source.strip_prefix("file:") {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeployError::config(format!("Cannot read setup key file {path}: {e}")))?;
        content.lines().next().unwrap_or_default().to_string()
    } else {
        source.to_string()
    };

    let key = key.trim();
    if key.is_empty() {
        return Err(DeployError::config("Setup key is empty"));
    }
    Ok(key.to_string())
}
