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

//! Network prerequisite checks.
//!
//! Eight checks run before registration. Five are critical and gate the
//! join; three are advisory and only produce warnings.
//!
//! | Check | Kind |
//! |---|---|
//! | ActiveAdapter | critical |
//! | DefaultGateway | critical |
//! | DnsServersConfigured | critical |
//! | DnsResolution | critical |
//! | InternetConnectivity | critical |
//! | TimeSynchronized | advisory |
//! | NoProxyConfigured | advisory |
//! | RelayReachable | advisory |
//!
//! Adapter and DNS server enumeration can report false negatives on some
//! virtual adapters, so a working lookup or internet probe confirms them
//! after the fact.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::cli::ProcessRunner;
use crate::config::DeployConfig;
use crate::error::Result;
use crate::platform::fileinfo::run_powershell;

/// Maximum tolerated clock skew against the reference server.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Port probed on relay and signal hosts.
pub const RELAY_PORT: u16 = 443;

/// One network prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NetworkCheck {
    /// At least one physical adapter is up.
    ActiveAdapter,
    /// A default route exists.
    DefaultGateway,
    /// Some adapter has DNS servers.
    DnsServersConfigured,
    /// The management host resolves.
    DnsResolution,
    /// The ICMP anchor or HTTP connectivity probe answers.
    InternetConnectivity,
    /// Clock skew against the time reference is within bounds. Advisory.
    TimeSynchronized,
    /// No WinHTTP proxy is set. Advisory.
    NoProxyConfigured,
    /// A relay or signal host accepts TCP on 443. Advisory.
    RelayReachable,
}

impl NetworkCheck {
    /// All checks in execution order.
    pub const ALL: [NetworkCheck; 8] = [
        Self::ActiveAdapter,
        Self::DefaultGateway,
        Self::DnsServersConfigured,
        Self::DnsResolution,
        Self::InternetConnectivity,
        Self::TimeSynchronized,
        Self::NoProxyConfigured,
        Self::RelayReachable,
    ];

    /// Returns true if a failure blocks registration.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ActiveAdapter
                | Self::DefaultGateway
                | Self::DnsServersConfigured
                | Self::DnsResolution
                | Self::InternetConnectivity
        )
    }

    /// Message reported when the check fails.
    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::ActiveAdapter => "No active network adapter",
            Self::DefaultGateway => "No default gateway configured",
            Self::DnsServersConfigured => "No DNS servers configured",
            Self::DnsResolution => "Cannot resolve management server hostname",
            Self::InternetConnectivity => "No internet connectivity",
            Self::TimeSynchronized => "System clock is not synchronized (skew over 5 minutes)",
            Self::NoProxyConfigured => "A proxy is configured; the client may need proxy settings",
            Self::RelayReachable => "No relay or signal host reachable on TCP 443",
        }
    }
}

impl fmt::Display for NetworkCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Results of a prerequisite run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkCheckResult {
    /// Outcome per check.
    pub checks: BTreeMap<NetworkCheck, bool>,
    /// One message per failing critical check.
    pub blocking_issues: Vec<String>,
    /// Advisory failures and probe errors.
    pub warnings: Vec<String>,
}

impl NetworkCheckResult {
    /// Build a result from raw check outcomes, applying cross-confirmation.
    ///
    /// Missing checks count as failed.
    pub fn from_checks(raw: impl IntoIterator<Item = (NetworkCheck, bool)>) -> Self {
        let mut checks: BTreeMap<_, _> = NetworkCheck::ALL.iter().map(|c| (*c, false)).collect();
        checks.extend(raw);
        cross_confirm(&mut checks);

        let mut result = Self {
            checks,
            ..Default::default()
        };
        for check in NetworkCheck::ALL {
            if result.get(check) {
                continue;
            }
            if check.is_critical() {
                result.blocking_issues.push(check.failure_message().to_string());
            } else {
                result.warnings.push(check.failure_message().to_string());
            }
        }
        result
    }

    /// Outcome of one check.
    pub fn get(&self, check: NetworkCheck) -> bool {
        self.checks.get(&check).copied().unwrap_or(false)
    }

    /// Returns true if all critical checks passed.
    pub fn passed(&self) -> bool {
        NetworkCheck::ALL
            .iter()
            .filter(|c| c.is_critical())
            .all(|c| self.get(*c))
    }
}

/// Promote checks implied by stronger evidence.
///
/// A successful lookup proves DNS servers and an adapter; reaching the
/// internet proves an adapter.
pub fn cross_confirm(checks: &mut BTreeMap<NetworkCheck, bool>) {
    let get = |checks: &BTreeMap<NetworkCheck, bool>, c| checks.get(&c).copied().unwrap_or(false);

    if get(checks, NetworkCheck::DnsResolution) {
        checks.insert(NetworkCheck::DnsServersConfigured, true);
        checks.insert(NetworkCheck::ActiveAdapter, true);
    }
    if get(checks, NetworkCheck::InternetConnectivity) {
        checks.insert(NetworkCheck::ActiveAdapter, true);
    }
}

/// Host facilities used by the prerequisite checks.
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    /// At least one adapter is up.
    async fn active_adapter(&self) -> Result<bool>;

    /// A default route exists.
    async fn default_gateway(&self) -> Result<bool>;

    /// At least one interface has DNS servers.
    async fn dns_servers_configured(&self) -> Result<bool>;

    /// `host` resolves to at least one address.
    async fn resolves(&self, host: &str) -> Result<bool>;

    /// A public anchor answers ICMP, or the HTTP probe answers 204/200.
    async fn internet_reachable(&self) -> Result<bool>;

    /// Local clock minus reference time, in seconds. `None` if unknown.
    async fn clock_skew_seconds(&self) -> Result<Option<i64>>;

    /// A system or environment proxy is configured.
    async fn proxy_configured(&self) -> Result<bool>;

    /// TCP connect to `host:port` succeeds within `timeout`.
    async fn tcp_reachable(&self, host: &str, port: u16, timeout: Duration) -> Result<bool>;

    /// `url` returns any HTTP response.
    async fn https_reachable(&self, url: &Url) -> Result<bool>;

    /// Free space on the volume holding `path`, in MiB.
    async fn free_disk_mb(&self, path: &Path) -> Result<Option<u64>>;

    /// Host firewall enabled on any profile.
    async fn firewall_enabled(&self) -> Result<Option<bool>>;
}

/// [`NetworkProbe`] backed by PowerShell cmdlets, sockets and HTTP.
pub struct SystemNetworkProbe {
    runner: Arc<dyn ProcessRunner>,
    http: reqwest::Client,
    anchor: String,
    probe_url: Url,
    time_url: Url,
}

impl SystemNetworkProbe {
    /// Create a probe from the deployment configuration.
    pub fn new(config: &DeployConfig, runner: Arc<dyn ProcessRunner>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(crate::USER_AGENT)
            .build()?;

        Ok(Self {
            runner,
            http,
            anchor: config.connectivity_anchor.clone(),
            probe_url: config.connectivity_probe_url.clone(),
            time_url: config.time_reference_url.clone(),
        })
    }

    async fn count(&self, script: &str) -> Result<u32> {
        let output = run_powershell(self.runner.as_ref(), script, Duration::from_secs(30)).await?;
        Ok(output.stdout.trim().parse().unwrap_or(0))
    }

    async fn ping(&self) -> Result<bool> {
        let args: Vec<String> = if cfg!(windows) {
            vec!["-n", "1", "-w", "3000", self.anchor.as_str()]
        } else {
            vec!["-c", "1", "-W", "3", self.anchor.as_str()]
        }
        .into_iter()
        .map(String::from)
        .collect();

        let output = self
            .runner
            .run(Path::new("ping"), &args, Duration::from_secs(10))
            .await?;
        Ok(output.success())
    }
}

#[async_trait]
impl NetworkProbe for SystemNetworkProbe {
    async fn active_adapter(&self) -> Result<bool> {
        Ok(self
            .count("@(Get-NetAdapter | Where-Object { $_.Status -eq 'Up' }).Count")
            .await?
            > 0)
    }

    async fn default_gateway(&self) -> Result<bool> {
        Ok(self
            .count("@(Get-NetRoute -DestinationPrefix '0.0.0.0/0' -ErrorAction SilentlyContinue).Count")
            .await?
            > 0)
    }

    async fn dns_servers_configured(&self) -> Result<bool> {
        Ok(self
            .count(
                "@(Get-DnsClientServerAddress -AddressFamily IPv4 | \
                 Where-Object { $_.ServerAddresses.Count -gt 0 }).Count",
            )
            .await?
            > 0)
    }

    async fn resolves(&self, host: &str) -> Result<bool> {
        let addrs = tokio::net::lookup_host(format!("{}:{}", host, RELAY_PORT)).await?;
        Ok(addrs.count() > 0)
    }

    async fn internet_reachable(&self) -> Result<bool> {
        match self.ping().await {
            Ok(true) => return Ok(true),
            Ok(false) => debug!(source = "network", anchor = %self.anchor, "ICMP probe failed"),
            Err(e) => debug!(source = "network", "ICMP probe unavailable: {}", e),
        }

        let response = self.http.get(self.probe_url.clone()).send().await?;
        Ok(matches!(response.status().as_u16(), 200 | 204))
    }

    async fn clock_skew_seconds(&self) -> Result<Option<i64>> {
        let response = self.http.head(self.time_url.clone()).send().await?;
        let Some(date) = response
            .headers()
            .get(reqwest::header::DATE)
            .and_then(|v| v.to_str().ok())
        else {
            return Ok(None);
        };

        Ok(chrono::DateTime::parse_from_rfc2822(date)
            .ok()
            .map(|remote| (chrono::Utc::now() - remote.with_timezone(&chrono::Utc)).num_seconds()))
    }

    async fn proxy_configured(&self) -> Result<bool> {
        if env_proxy_configured() {
            return Ok(true);
        }
        if !cfg!(windows) {
            return Ok(false);
        }

        let args = ["winhttp", "show", "proxy"].map(String::from);
        let output = self
            .runner
            .run(Path::new("netsh"), &args, Duration::from_secs(15))
            .await?;
        Ok(winhttp_proxy_configured(&output.stdout))
    }

    async fn tcp_reachable(&self, host: &str, port: u16, timeout: Duration) -> Result<bool> {
        let addr = format!("{}:{}", host, port);
        Ok(matches!(
            tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        ))
    }

    async fn https_reachable(&self, url: &Url) -> Result<bool> {
        match self.http.get(url.clone()).send().await {
            Ok(response) => {
                debug!(source = "network", %url, status = %response.status(), "Endpoint answered");
                Ok(true)
            }
            Err(e) => {
                debug!(source = "network", %url, "Endpoint unreachable: {}", e);
                Ok(false)
            }
        }
    }

    async fn free_disk_mb(&self, path: &Path) -> Result<Option<u64>> {
        let path = path.to_path_buf();
        let free = tokio::task::spawn_blocking(move || free_space_for(&path))
            .await
            .map_err(|e| crate::error::DeployError::platform(format!("Disk query failed: {e}")))?;
        Ok(free.map(|bytes| bytes / (1024 * 1024)))
    }

    async fn firewall_enabled(&self) -> Result<Option<bool>> {
        if !cfg!(windows) {
            return Ok(None);
        }
        Ok(Some(
            self.count("@(Get-NetFirewallProfile | Where-Object { $_.Enabled }).Count")
                .await?
                > 0,
        ))
    }
}

fn env_proxy_configured() -> bool {
    ["HTTPS_PROXY", "HTTP_PROXY", "https_proxy", "http_proxy"]
        .iter()
        .any(|var| std::env::var(var).is_ok_and(|v| !v.trim().is_empty()))
}

/// Parse `netsh winhttp show proxy` output.
pub fn winhttp_proxy_configured(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.contains("proxy server") && !lower.contains("direct access")
}

fn free_space_for(path: &Path) -> Option<u64> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// Runs the prerequisite battery against a [`NetworkProbe`].
pub struct NetworkPrerequisiteChecker {
    probe: Arc<dyn NetworkProbe>,
    management_host: Option<String>,
    relay_hosts: Vec<String>,
    relay_timeout: Duration,
}

impl NetworkPrerequisiteChecker {
    /// Create a checker for the configured management and relay hosts.
    pub fn new(config: &DeployConfig, probe: Arc<dyn NetworkProbe>) -> Self {
        Self {
            probe,
            management_host: config.management_host().map(str::to_string),
            relay_hosts: config.relay_hosts.clone(),
            relay_timeout: Duration::from_secs(5),
        }
    }

    /// Run all eight checks against the configured management host.
    pub async fn check_prerequisites(&self) -> NetworkCheckResult {
        self.check_host(self.management_host.as_deref()).await
    }

    /// Run all eight checks, resolving the host of `management_url`.
    pub async fn check_prerequisites_for(&self, management_url: &Url) -> NetworkCheckResult {
        self.check_host(management_url.host_str()).await
    }

    async fn check_host(&self, management_host: Option<&str>) -> NetworkCheckResult {
        let mut probe_warnings = Vec::new();
        let mut raw = Vec::with_capacity(NetworkCheck::ALL.len());

        for check in NetworkCheck::ALL {
            let outcome = match self.run_check(check, management_host).await {
                Ok(passed) => passed,
                Err(e) => {
                    warn!(source = "network", check = %check, "Check failed to run: {}", e);
                    probe_warnings.push(format!("{check} could not be determined: {e}"));
                    false
                }
            };
            debug!(source = "network", check = %check, passed = outcome);
            raw.push((check, outcome));
        }

        let mut result = NetworkCheckResult::from_checks(raw);
        result.warnings.extend(probe_warnings);

        if result.passed() {
            info!(source = "network", "Network prerequisites passed");
        } else {
            for issue in &result.blocking_issues {
                warn!(source = "network", "{}", issue);
            }
        }
        for warning in &result.warnings {
            debug!(source = "network", "Advisory: {}", warning);
        }
        result
    }

    async fn run_check(&self, check: NetworkCheck, management_host: Option<&str>) -> Result<bool> {
        match check {
            NetworkCheck::ActiveAdapter => self.probe.active_adapter().await,
            NetworkCheck::DefaultGateway => self.probe.default_gateway().await,
            NetworkCheck::DnsServersConfigured => self.probe.dns_servers_configured().await,
            NetworkCheck::DnsResolution => match management_host {
                Some(host) => self.probe.resolves(host).await,
                None => Ok(false),
            },
            NetworkCheck::InternetConnectivity => self.probe.internet_reachable().await,
            NetworkCheck::TimeSynchronized => Ok(self
                .probe
                .clock_skew_seconds()
                .await?
                .is_some_and(|skew| skew.abs() <= MAX_CLOCK_SKEW_SECS)),
            NetworkCheck::NoProxyConfigured => Ok(!self.probe.proxy_configured().await?),
            NetworkCheck::RelayReachable => {
                for host in &self.relay_hosts {
                    if self
                        .probe
                        .tcp_reachable(host, RELAY_PORT, self.relay_timeout)
                        .await
                        .unwrap_or(false)
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// The management endpoint answers HTTPS.
    pub async fn management_reachable(&self, url: &Url) -> bool {
        self.probe.https_reachable(url).await.unwrap_or_else(|e| {
            warn!(source = "network", "Management reachability probe failed: {}", e);
            false
        })
    }

    /// Free space on the volume holding `path`, logged but never fatal.
    pub async fn free_disk_mb(&self, path: &Path) -> Option<u64> {
        match self.probe.free_disk_mb(path).await {
            Ok(free) => free,
            Err(e) => {
                debug!(source = "network", "Disk space query failed: {}", e);
                None
            }
        }
    }

    /// Host firewall state, logged but never fatal.
    pub async fn firewall_enabled(&self) -> Option<bool> {
        self.probe.firewall_enabled().await.unwrap_or_default()
    }
}
