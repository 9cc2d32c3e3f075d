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

//! Post-join verification.
//!
//! The join command can exit 0 without the peer actually coming up, so
//! success is decided by polling `status` until a checklist passes.
//!
//! Two strategies exist:
//!
//! - **Full** ([`VerificationPoller::verify_success`]): six checks, five of
//!   them critical. `HasActiveInterface` is advisory.
//! - **Pre-login** ([`VerificationPoller::verify_pre_login`]): three checks
//!   used before any user has signed in, when the tunnel interface may not
//!   be up yet.

use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::cli::{ClientCli, CommandOutput};

/// Substrings in status output that indicate a failed or unauthenticated peer.
pub const ERROR_MARKERS: &[&str] = &[
    "connection refused",
    "rpc error",
    "needslogin",
    "context deadline exceeded",
    "daemon is not running",
    "failed to connect",
    "login failed",
    "unauthenticated",
];

/// One factor of the full verification checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VerificationCheck {
    /// Management reports `Connected`.
    ManagementConnected,
    /// Signal reports `Connected`.
    SignalConnected,
    /// The peer has a mesh IP.
    HasAssignedAddress,
    /// `status` exited 0 or 1.
    DaemonResponding,
    /// An interface type is reported.
    HasActiveInterface,
    /// No known error marker appears in the output.
    NoErrorMessages,
}

impl VerificationCheck {
    /// All checks in report order.
    pub const ALL: [VerificationCheck; 6] = [
        Self::ManagementConnected,
        Self::SignalConnected,
        Self::HasAssignedAddress,
        Self::DaemonResponding,
        Self::HasActiveInterface,
        Self::NoErrorMessages,
    ];

    /// Returns true if the check must pass for verification to succeed.
    pub fn is_critical(&self) -> bool {
        !matches!(self, Self::HasActiveInterface)
    }
}

impl fmt::Display for VerificationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ManagementConnected => "ManagementConnected",
            Self::SignalConnected => "SignalConnected",
            Self::HasAssignedAddress => "HasAssignedAddress",
            Self::DaemonResponding => "DaemonResponding",
            Self::HasActiveInterface => "HasActiveInterface",
            Self::NoErrorMessages => "NoErrorMessages",
        };
        f.write_str(name)
    }
}

/// Parsed output of one `status` invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Status command exit code, `None` if it could not be run.
    pub exit_code: Option<i32>,
    /// Management service reported connected.
    pub management_connected: bool,
    /// Signal service reported connected.
    pub signal_connected: bool,
    /// Mesh address assigned to this peer.
    pub assigned_address: Option<String>,
    /// Tunnel interface type (kernel or userspace).
    pub interface_type: Option<String>,
    /// Everything the command printed.
    pub raw: String,
}

impl StatusSnapshot {
    /// Snapshot for a status command that could not be executed.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            raw: reason.into(),
            ..Default::default()
        }
    }

    /// Parse status output, accepting both the text and `--json` formats.
    pub fn from_output(output: &CommandOutput) -> Self {
        let trimmed = output.stdout.trim_start();
        let mut snapshot = if trimmed.starts_with('{') {
            serde_json::from_str::<Value>(trimmed)
                .map(|v| Self::from_json(&v))
                .unwrap_or_else(|_| Self::from_text(&output.stdout))
        } else {
            Self::from_text(&output.stdout)
        };
        snapshot.exit_code = Some(output.exit_code);
        snapshot.raw = output.combined();
        snapshot
    }

    fn from_text(text: &str) -> Self {
        let mut snapshot = Self::default();
        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Management" => snapshot.management_connected = value.starts_with("Connected"),
                "Signal" => snapshot.signal_connected = value.starts_with("Connected"),
                "NetBird IP" => snapshot.assigned_address = meaningful(value),
                "Interface type" => snapshot.interface_type = meaningful(value),
                _ => {}
            }
        }
        snapshot
    }

    fn from_json(value: &Value) -> Self {
        let connected = |section: &str| {
            value
                .get(section)
                .and_then(|s| s.get("connected"))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };
        let text = |field: &str| {
            value
                .get(field)
                .and_then(Value::as_str)
                .and_then(meaningful)
        };

        Self {
            management_connected: connected("management"),
            signal_connected: connected("signal"),
            assigned_address: text("netbirdIp"),
            interface_type: text("interfaceType"),
            ..Default::default()
        }
    }

    /// The daemon answered (exit 0 connected, exit 1 disconnected).
    pub fn daemon_responding(&self) -> bool {
        matches!(self.exit_code, Some(0 | 1))
    }

    /// Returns the first error marker found in the output.
    pub fn error_marker(&self) -> Option<&'static str> {
        let lower = self.raw.to_lowercase();
        ERROR_MARKERS.iter().copied().find(|m| lower.contains(m))
    }

    /// Management connected, or a generic `Connected` token anywhere in the output.
    pub fn any_connected(&self) -> bool {
        static RE: OnceLock<Regex> = OnceLock::new();
        let token = RE.get_or_init(|| Regex::new(r"\bConnected\b").expect("valid regex"));
        self.management_connected || token.is_match(&self.raw)
    }
}

fn meaningful(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("n/a") || value == "-" {
        None
    } else {
        Some(value.to_string())
    }
}

/// Outcome of the full six-factor check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationChecklist {
    results: BTreeMap<VerificationCheck, bool>,
}

impl VerificationChecklist {
    /// Evaluate every check against a snapshot.
    pub fn evaluate(snapshot: &StatusSnapshot) -> Self {
        let results = VerificationCheck::ALL
            .iter()
            .map(|check| {
                let passed = match check {
                    VerificationCheck::ManagementConnected => snapshot.management_connected,
                    VerificationCheck::SignalConnected => snapshot.signal_connected,
                    VerificationCheck::HasAssignedAddress => snapshot.assigned_address.is_some(),
                    VerificationCheck::DaemonResponding => snapshot.daemon_responding(),
                    VerificationCheck::HasActiveInterface => snapshot.interface_type.is_some(),
                    VerificationCheck::NoErrorMessages => snapshot.error_marker().is_none(),
                };
                (*check, passed)
            })
            .collect();
        Self { results }
    }

    /// Build a checklist from explicit results; missing checks count as failed.
    pub fn from_results(results: impl IntoIterator<Item = (VerificationCheck, bool)>) -> Self {
        let mut map: BTreeMap<_, _> = VerificationCheck::ALL.iter().map(|c| (*c, false)).collect();
        map.extend(results);
        Self { results: map }
    }

    /// Result of one check.
    pub fn get(&self, check: VerificationCheck) -> bool {
        self.results.get(&check).copied().unwrap_or(false)
    }

    /// Returns true if every critical check passed.
    pub fn passed(&self) -> bool {
        VerificationCheck::ALL
            .iter()
            .filter(|c| c.is_critical())
            .all(|c| self.get(*c))
    }

    /// Checks that did not pass.
    pub fn failing(&self) -> Vec<VerificationCheck> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(c, _)| *c)
            .collect()
    }
}

/// Outcome of the three-factor pre-login check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreLoginChecklist {
    /// `status` exited 0 or 1.
    pub daemon_responding: bool,
    /// Management connected, or a bare `Connected` token.
    pub connected: bool,
    /// No known error marker appears in the output.
    pub no_error_messages: bool,
}

impl PreLoginChecklist {
    /// Evaluate the pre-login checks against a snapshot.
    pub fn evaluate(snapshot: &StatusSnapshot) -> Self {
        Self {
            daemon_responding: snapshot.daemon_responding(),
            connected: snapshot.any_connected(),
            no_error_messages: snapshot.error_marker().is_none(),
        }
    }

    /// Returns true if all three checks passed.
    pub fn passed(&self) -> bool {
        self.daemon_responding && self.connected && self.no_error_messages
    }
}

/// Polls the client status until a checklist passes or time runs out.
#[derive(Clone)]
pub struct VerificationPoller {
    cli: Arc<dyn ClientCli>,
    interval: Duration,
    json_status: bool,
}

impl VerificationPoller {
    /// Create a poller that queries `cli` every `interval`.
    pub fn new(cli: Arc<dyn ClientCli>, interval: Duration) -> Self {
        Self {
            cli,
            interval,
            json_status: false,
        }
    }

    /// Query `status --json` instead of the text format.
    pub fn with_json_status(mut self, json: bool) -> Self {
        self.json_status = json;
        self
    }

    /// Take one status snapshot.
    pub async fn snapshot(&self) -> StatusSnapshot {
        match self.cli.status(true, self.json_status).await {
            Ok(output) => StatusSnapshot::from_output(&output),
            Err(e) => {
                debug!(source = "verify", "Status query failed: {}", e);
                StatusSnapshot::unavailable(e.to_string())
            }
        }
    }

    /// Full verification: poll until the five critical checks pass.
    pub async fn verify_success(&self, timeout: Duration) -> bool {
        info!(
            source = "verify",
            "Verifying connection (timeout {}s)",
            timeout.as_secs()
        );
        let deadline = Instant::now() + timeout;
        let mut last = None;

        loop {
            let snapshot = self.snapshot().await;
            let checklist = VerificationChecklist::evaluate(&snapshot);
            if checklist.passed() {
                if !checklist.get(VerificationCheck::HasActiveInterface) {
                    warn!(source = "verify", "Connected but no active interface reported");
                }
                info!(source = "verify", "Verification passed");
                return true;
            }
            debug!(source = "verify", failing = ?checklist.failing(), "Verification pending");
            last = Some(checklist);

            if Instant::now() + self.interval > deadline {
                break;
            }
            sleep(self.interval).await;
        }

        if let Some(checklist) = last {
            warn!(
                source = "verify",
                failing = ?checklist.failing(),
                "Verification timed out after {}s",
                timeout.as_secs()
            );
        }
        false
    }

    /// Pre-login verification: daemon responding, connected, and no error markers.
    pub async fn verify_pre_login(&self, timeout: Duration) -> bool {
        info!(
            source = "verify",
            "Verifying pre-login connection (timeout {}s)",
            timeout.as_secs()
        );
        let deadline = Instant::now() + timeout;

        loop {
            let snapshot = self.snapshot().await;
            let checklist = PreLoginChecklist::evaluate(&snapshot);
            if checklist.passed() {
                info!(source = "verify", "Pre-login verification passed");
                return true;
            }
            debug!(source = "verify", ?checklist, "Pre-login verification pending");

            if Instant::now() + self.interval > deadline {
                warn!(source = "verify", ?checklist, "Pre-login verification timed out");
                return false;
            }
            sleep(self.interval).await;
        }
    }

    /// Poll plain `status` until the daemon answers with exit code 0 or 1.
    pub async fn wait_for_daemon(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            match self.cli.status(false, false).await {
                Ok(output) if output.exit_code >= 0 && output.exit_code < 2 => {
                    debug!(source = "verify", exit_code = output.exit_code, "Daemon responding");
                    return true;
                }
                Ok(output) => {
                    debug!(source = "verify", exit_code = output.exit_code, "Daemon not ready")
                }
                Err(e) => debug!(source = "verify", "Daemon not ready: {}", e),
            }

            if Instant::now() + self.interval > deadline {
                return false;
            }
            sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use url::Url;

    const CONNECTED: &str = "\
Daemon version: 0.28.4
CLI version: 0.28.4
Management: Connected to https://api.netbird.io:443
Signal: Connected to https://signal.netbird.io:443
Relays: 2/2 Available
FQDN: host.netbird.cloud
NetBird IP: 100.64.0.5/16
Interface type: Kernel
Peers count: 2/3 Connected
";

    const NO_INTERFACE: &str = "\
Management: Connected
Signal: Connected
NetBird IP: 100.64.0.5/16
Interface type: N/A
";

    const DISCONNECTED: &str = "\
Management: Disconnected
Signal: Disconnected
NetBird IP: N/A
Interface type: N/A
";

    struct ScriptedStatus {
        outputs: Mutex<VecDeque<CommandOutput>>,
        calls: Mutex<u32>,
        json_flags: Mutex<Vec<bool>>,
    }

    impl ScriptedStatus {
        fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(0),
                json_flags: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ClientCli for ScriptedStatus {
        async fn up(&self, _key: &str, _url: Option<&Url>) -> Result<CommandOutput> {
            unreachable!("status only")
        }

        async fn down(&self) -> Result<CommandOutput> {
            unreachable!("status only")
        }

        async fn status(&self, _detail: bool, json: bool) -> Result<CommandOutput> {
            *self.calls.lock().unwrap() += 1;
            self.json_flags.lock().unwrap().push(json);
            let mut outputs = self.outputs.lock().unwrap();
            let next = if outputs.len() > 1 {
                outputs.pop_front()
            } else {
                outputs.front().cloned()
            };
            Ok(next.unwrap_or_else(|| CommandOutput::new(2, "", "daemon is not running")))
        }
    }

    #[test]
    fn test_text_snapshot() {
        let snap = StatusSnapshot::from_output(&CommandOutput::new(0, CONNECTED, ""));
        assert!(snap.management_connected);
        assert!(snap.signal_connected);
        assert_eq!(snap.assigned_address.as_deref(), Some("100.64.0.5/16"));
        assert_eq!(snap.interface_type.as_deref(), Some("Kernel"));
        assert!(VerificationChecklist::evaluate(&snap).passed());
    }

    #[test]
    fn test_json_snapshot() {
        let json = r#"{
            "management": {"url": "https://api.netbird.io:443", "connected": true},
            "signal": {"url": "https://signal.netbird.io:443", "connected": true},
            "netbirdIp": "100.64.0.5/16",
            "interfaceType": "Userspace"
        }"#;
        let snap = StatusSnapshot::from_output(&CommandOutput::new(0, json, ""));
        assert!(snap.management_connected);
        assert!(snap.signal_connected);
        assert_eq!(snap.interface_type.as_deref(), Some("Userspace"));
        assert!(VerificationChecklist::evaluate(&snap).passed());
    }

    #[test]
    fn test_missing_interface_is_advisory() {
        let snap = StatusSnapshot::from_output(&CommandOutput::new(0, NO_INTERFACE, ""));
        let checklist = VerificationChecklist::evaluate(&snap);
        assert!(!checklist.get(VerificationCheck::HasActiveInterface));
        assert!(checklist.passed());
        assert_eq!(checklist.failing(), vec![VerificationCheck::HasActiveInterface]);
    }

    #[test]
    fn test_error_marker_fails_verification() {
        let stdout = format!("{CONNECTED}\nStatus: NeedsLogin\n");
        let snap = StatusSnapshot::from_output(&CommandOutput::new(0, stdout, ""));
        assert_eq!(snap.error_marker(), Some("needslogin"));
        assert!(!VerificationChecklist::evaluate(&snap).passed());
    }

    #[test]
    fn test_checklist_from_results() {
        let all_but_interface = VerificationCheck::ALL
            .iter()
            .map(|c| (*c, *c != VerificationCheck::HasActiveInterface));
        assert!(VerificationChecklist::from_results(all_but_interface).passed());

        let missing_signal = VerificationCheck::ALL
            .iter()
            .map(|c| (*c, *c != VerificationCheck::SignalConnected));
        assert!(!VerificationChecklist::from_results(missing_signal).passed());
    }

    #[test]
    fn test_daemon_error_exit_code() {
        let snap = StatusSnapshot::from_output(&CommandOutput::new(2, "", "daemon is not running"));
        assert!(!snap.daemon_responding());
        let pre = PreLoginChecklist::evaluate(&snap);
        assert!(!pre.passed());
    }

    #[test]
    fn test_pre_login_generic_connected_token() {
        let snap = StatusSnapshot::from_output(&CommandOutput::new(0, "Status: Connected\n", ""));
        let pre = PreLoginChecklist::evaluate(&snap);
        assert!(pre.passed());

        let snap = StatusSnapshot::from_output(&CommandOutput::new(1, DISCONNECTED, ""));
        assert!(!PreLoginChecklist::evaluate(&snap).connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_success_after_polls() {
        let cli = ScriptedStatus::new(vec![
            CommandOutput::new(1, DISCONNECTED, ""),
            CommandOutput::new(1, DISCONNECTED, ""),
            CommandOutput::new(0, CONNECTED, ""),
        ]);
        let poller = VerificationPoller::new(cli.clone(), Duration::from_secs(5));
        assert!(poller.verify_success(Duration::from_secs(120)).await);
        assert_eq!(cli.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_status_polling() {
        let json = r#"{"management": {"connected": true}, "signal": {"connected": true},
                       "netbirdIp": "100.64.0.9/16", "interfaceType": "Kernel"}"#;
        let cli = ScriptedStatus::new(vec![CommandOutput::new(0, json, "")]);
        let poller =
            VerificationPoller::new(cli.clone(), Duration::from_secs(5)).with_json_status(true);
        assert!(poller.verify_success(Duration::from_secs(30)).await);
        assert_eq!(*cli.json_flags.lock().unwrap(), vec![true]);

        let cli = ScriptedStatus::new(vec![CommandOutput::new(0, CONNECTED, "")]);
        let poller = VerificationPoller::new(cli.clone(), Duration::from_secs(5));
        assert!(poller.verify_success(Duration::from_secs(30)).await);
        assert_eq!(*cli.json_flags.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_success_times_out() {
        let cli = ScriptedStatus::new(vec![CommandOutput::new(1, DISCONNECTED, "")]);
        let poller = VerificationPoller::new(cli.clone(), Duration::from_secs(5));
        assert!(!poller.verify_success(Duration::from_secs(20)).await);
        assert_eq!(cli.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_daemon() {
        let cli = ScriptedStatus::new(vec![
            CommandOutput::new(2, "", "daemon is not running"),
            CommandOutput::new(1, DISCONNECTED, ""),
        ]);
        let poller = VerificationPoller::new(cli.clone(), Duration::from_secs(5));
        assert!(poller.wait_for_daemon(Duration::from_secs(60)).await);
        assert_eq!(cli.calls(), 2);

        let cli = ScriptedStatus::new(vec![CommandOutput::new(3, "", "")]);
        let poller = VerificationPoller::new(cli, Duration::from_secs(5));
        assert!(!poller.wait_for_daemon(Duration::from_secs(10)).await);
    }
}
