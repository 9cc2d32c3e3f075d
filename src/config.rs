// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration for deployment components.
//!
//! A single [`DeployConfig`] is built once (directly, through
//! [`DeployConfigBuilder`], or from a TOML profile) and handed to every
//! component constructor. Nothing in the crate reads ambient global state
//! for paths, endpoints, or timing.

use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Management endpoint the vendor client uses when none is given.
pub const DEFAULT_MANAGEMENT_URL: &str = "https://api.netbird.io:443";

/// Release metadata endpoint for the vendor client.
pub const DEFAULT_RELEASES_URL: &str = "https://api.github.com/repos/netbirdio/netbird/releases";

/// Installer asset name pattern for 64-bit Windows MSI packages.
pub const DEFAULT_INSTALLER_PATTERN: &str = r"(?i)^netbird_installer_[0-9][0-9A-Za-z.\-]*_windows_amd64\.msi$";

/// Product name as recorded in uninstall entries.
pub const DEFAULT_PRODUCT_NAME: &str = "NetBird";

/// Windows service name of the client daemon.
pub const DEFAULT_SERVICE_NAME: &str = "NetBird";

/// Configuration shared by every deployment component.
#[derive(Debug, Clone)]
pub struct DeployConfig {
    /// Product display name used when matching uninstall entries.
    pub product_name: String,

    /// Full path of the client executable at the default install location.
    pub client_executable: PathBuf,

    /// Name of the client's Windows service.
    pub service_name: String,

    /// Client data directory holding persisted state.
    pub data_dir: PathBuf,

    /// File name of the connection config inside `data_dir`.
    pub config_file_name: String,

    /// Subdirectory of `data_dir` that survives a full reset.
    pub log_dir_name: String,

    /// Management endpoint to register against.
    pub management_url: Url,

    /// Base URL of the release metadata service.
    pub releases_url: Url,

    /// Regex matched against release asset names to find the installer.
    pub installer_pattern: String,

    /// Hosts probed on TCP 443 as the relay/signal reachability check.
    pub relay_hosts: Vec<String>,

    /// ICMP anchor for the internet reachability check.
    pub connectivity_anchor: String,

    /// HTTP fallback for the internet reachability check (expects 204 or 200).
    pub connectivity_probe_url: Url,

    /// URL whose `Date` header is the clock reference.
    pub time_reference_url: Url,

    /// Per-request HTTP timeout.
    pub http_timeout: Duration,

    /// Timing budgets for the registration state machine.
    pub timings: RegistrationTimings,

    /// Release lookup attempts before giving up.
    pub release_max_attempts: u32,

    /// Base delay between release lookup attempts, multiplied by the attempt number.
    pub release_retry_delay: Duration,

    /// Maximum join attempts per registration run.
    pub max_retries: u32,

    /// Free disk space below which a warning is logged.
    pub min_free_disk_mb: u64,

    /// Read client status as `status --json` instead of the text report.
    pub status_json: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        DeployConfigBuilder::new().build()
    }
}

impl DeployConfig {
    /// Create a new configuration builder.
    pub fn builder() -> DeployConfigBuilder {
        DeployConfigBuilder::new()
    }

    /// Path of the connection config file.
    pub fn config_file_path(&self) -> PathBuf {
        self.data_dir.join(&self.config_file_name)
    }

    /// Path of the log subdirectory.
    pub fn log_dir_path(&self) -> PathBuf {
        self.data_dir.join(&self.log_dir_name)
    }

    /// Host name of the management endpoint.
    pub fn management_host(&self) -> Option<&str> {
        self.management_url.host_str()
    }

    /// Returns true if `url` points at the vendor's default management endpoint.
    pub fn is_default_management_url(url: &Url) -> bool {
        Url::parse(DEFAULT_MANAGEMENT_URL)
            .map(|default| same_endpoint(&default, url))
            .unwrap_or(false)
    }
}

/// Compare two endpoints ignoring case, default ports, and trailing slashes.
pub fn same_endpoint(a: &Url, b: &Url) -> bool {
    let host = |u: &Url| u.host_str().map(|h| h.to_ascii_lowercase());
    let path = |u: &Url| u.path().trim_end_matches('/').to_string();
    a.scheme() == b.scheme()
        && host(a) == host(b)
        && a.port_or_known_default() == b.port_or_known_default()
        && path(a) == path(b)
}

/// Time budgets used by the registration state machine.
///
/// Defaults match what the vendor daemon needs in the field. Tests shrink
/// these or run under a paused clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationTimings {
    /// Sleep before the single network re-check.
    pub network_retry_delay: Duration,
    /// Daemon readiness budget right after a first-time install.
    pub daemon_wait_fresh: Duration,
    /// Daemon readiness budget for an existing install.
    pub daemon_wait: Duration,
    /// Daemon readiness budget after the escalation restart.
    pub daemon_wait_after_restart: Duration,
    /// Daemon readiness budget after a full reset.
    pub daemon_wait_after_reset: Duration,
    /// Budget for the service to report Running after a full reset.
    pub service_start_timeout: Duration,
    /// Full verification budget after a successful join.
    pub verification_timeout: Duration,
    /// Pre-login verification budget.
    pub pre_login_timeout: Duration,
    /// Interval between status polls.
    pub poll_interval: Duration,
    /// Timeout for a single status invocation.
    pub status_timeout: Duration,
    /// Timeout for a single join invocation.
    pub join_timeout: Duration,
    /// Timeout for the package installer.
    pub installer_timeout: Duration,
}

impl Default for RegistrationTimings {
    fn default() -> Self {
        Self {
            network_retry_delay: Duration::from_secs(45),
            daemon_wait_fresh: Duration::from_secs(180),
            daemon_wait: Duration::from_secs(120),
            daemon_wait_after_restart: Duration::from_secs(120),
            daemon_wait_after_reset: Duration::from_secs(90),
            service_start_timeout: Duration::from_secs(60),
            verification_timeout: Duration::from_secs(120),
            pre_login_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            status_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(120),
            installer_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Builder for [`DeployConfig`].
#[derive(Default)]
pub struct DeployConfigBuilder {
    product_name: Option<String>,
    client_executable: Option<PathBuf>,
    service_name: Option<String>,
    data_dir: Option<PathBuf>,
    config_file_name: Option<String>,
    log_dir_name: Option<String>,
    management_url: Option<Url>,
    releases_url: Option<Url>,
    installer_pattern: Option<String>,
    relay_hosts: Option<Vec<String>>,
    connectivity_anchor: Option<String>,
    connectivity_probe_url: Option<Url>,
    time_reference_url: Option<Url>,
    http_timeout: Option<Duration>,
    timings: Option<RegistrationTimings>,
    release_max_attempts: Option<u32>,
    release_retry_delay: Option<Duration>,
    max_retries: Option<u32>,
    min_free_disk_mb: Option<u64>,
    status_json: Option<bool>,
}

impl DeployConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the product display name.
    pub fn product_name(mut self, name: impl Into<String>) -> Self {
        self.product_name = Some(name.into());
        self
    }

    /// Set the client executable path.
    pub fn client_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_executable = Some(path.into());
        self
    }

    /// Set the Windows service name.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the client data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(path.into());
        self
    }

    /// Set the connection config file name.
    pub fn config_file_name(mut self, name: impl Into<String>) -> Self {
        self.config_file_name = Some(name.into());
        self
    }

    /// Set the log subdirectory name.
    pub fn log_dir_name(mut self, name: impl Into<String>) -> Self {
        self.log_dir_name = Some(name.into());
        self
    }

    /// Set the management endpoint.
    pub fn management_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.management_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Set the release metadata base URL.
    pub fn releases_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.releases_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Set the installer asset name pattern.
    pub fn installer_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.installer_pattern = Some(pattern.into());
        self
    }

    /// Set the relay/signal hosts probed for reachability.
    pub fn relay_hosts(mut self, hosts: Vec<String>) -> Self {
        self.relay_hosts = Some(hosts);
        self
    }

    /// Set the ICMP connectivity anchor.
    pub fn connectivity_anchor(mut self, host: impl Into<String>) -> Self {
        self.connectivity_anchor = Some(host.into());
        self
    }

    /// Set the HTTP connectivity probe URL.
    pub fn connectivity_probe_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.connectivity_probe_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Set the clock reference URL.
    pub fn time_reference_url(mut self, url: impl AsRef<str>) -> Result<Self, url::ParseError> {
        self.time_reference_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Set the per-request HTTP timeout.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Set the registration timing budgets.
    pub fn timings(mut self, timings: RegistrationTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    /// Set the number of release lookup attempts.
    pub fn release_max_attempts(mut self, attempts: u32) -> Self {
        self.release_max_attempts = Some(attempts);
        self
    }

    /// Set the base delay between release lookup attempts.
    pub fn release_retry_delay(mut self, delay: Duration) -> Self {
        self.release_retry_delay = Some(delay);
        self
    }

    /// Set the maximum join attempts per registration run.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the free disk space warning threshold.
    pub fn min_free_disk_mb(mut self, mb: u64) -> Self {
        self.min_free_disk_mb = Some(mb);
        self
    }

    /// Read client status in JSON form.
    pub fn status_json(mut self, json: bool) -> Self {
        self.status_json = Some(json);
        self
    }

    /// Build the configuration, filling unset fields with defaults.
    pub fn build(self) -> DeployConfig {
        DeployConfig {
            product_name: self
                .product_name
                .unwrap_or_else(|| DEFAULT_PRODUCT_NAME.to_string()),
            client_executable: self
                .client_executable
                .unwrap_or_else(default_client_executable),
            service_name: self
                .service_name
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            data_dir: self.data_dir.unwrap_or_else(default_data_dir),
            config_file_name: self
                .config_file_name
                .unwrap_or_else(|| "config.json".to_string()),
            log_dir_name: self.log_dir_name.unwrap_or_else(|| "logs".to_string()),
            management_url: self.management_url.unwrap_or_else(default_management_url),
            releases_url: self.releases_url.unwrap_or_else(default_releases_url),
            installer_pattern: self
                .installer_pattern
                .unwrap_or_else(|| DEFAULT_INSTALLER_PATTERN.to_string()),
            relay_hosts: self.relay_hosts.unwrap_or_else(|| {
                vec![
                    "signal.netbird.io".to_string(),
                    "relay.netbird.io".to_string(),
                    "api.netbird.io".to_string(),
                ]
            }),
            connectivity_anchor: self
                .connectivity_anchor
                .unwrap_or_else(|| "8.8.8.8".to_string()),
            connectivity_probe_url: self
                .connectivity_probe_url
                .unwrap_or_else(|| static_url("http://www.gstatic.com/generate_204")),
            time_reference_url: self
                .time_reference_url
                .unwrap_or_else(|| static_url("https://www.google.com")),
            http_timeout: self.http_timeout.unwrap_or(Duration::from_secs(10)),
            timings: self.timings.unwrap_or_default(),
            release_max_attempts: self.release_max_attempts.unwrap_or(3),
            release_retry_delay: self.release_retry_delay.unwrap_or(Duration::from_secs(5)),
            max_retries: self.max_retries.unwrap_or(5),
            min_free_disk_mb: self.min_free_disk_mb.unwrap_or(200),
            status_json: self.status_json.unwrap_or(false),
        }
    }
}

fn default_management_url() -> Url {
    static_url(DEFAULT_MANAGEMENT_URL)
}

fn default_releases_url() -> Url {
    static_url(DEFAULT_RELEASES_URL)
}

fn static_url(s: &str) -> Url {
    Url::parse(s).expect("valid default URL")
}

/// Default client executable under `%ProgramFiles%`.
pub fn default_client_executable() -> PathBuf {
    let base = std::env::var_os("ProgramFiles")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Program Files"));
    base.join("NetBird").join("netbird.exe")
}

/// Default client data directory under `%ProgramData%`.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var_os("ProgramData")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));
    base.join("Netbird")
}
