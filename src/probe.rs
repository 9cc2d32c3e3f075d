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

//! Installed client detection.
//!
//! Three strategies are tried in order and the first one that yields a
//! version wins:
//!
//! 1. The default install path, asking the binary for its version.
//! 2. The uninstall registry (64-bit view, then 32-bit view).
//! 3. The service registry's binary path.
//!
//! A registry entry whose executable is missing or unversioned is a broken
//! install and is reported as not installed without trying strategy 3, so
//! the caller reinstalls over it.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cli::ProcessRunner;
use crate::config::DeployConfig;
use crate::platform::fileinfo::file_version;
use crate::platform::registry::{UninstallRegistry, WindowsUninstallRegistry, find_product};
use crate::platform::service::{ServiceControl, parse_service_binary_path};

/// Arguments tried, in order, to make the client print its version.
pub const VERSION_ARGS: [&str; 4] = ["version", "--version", "-v", "status"];

/// What is installed right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledState {
    /// Installed client version.
    pub version: Option<String>,
    /// Path of the client executable.
    pub executable_path: Option<PathBuf>,
}

impl InstalledState {
    /// Nothing installed.
    pub fn not_installed() -> Self {
        Self::default()
    }

    /// Returns true if a version was found.
    pub fn is_installed(&self) -> bool {
        self.version.is_some()
    }

    /// The detected executable, or `default` when none was found.
    pub fn executable_or<'a>(&'a self, default: &'a Path) -> &'a Path {
        self.executable_path.as_deref().unwrap_or(default)
    }
}

fn version_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"^v?(\d+\.\d+\.\d+(?:\.\d+)?)$",
            r"(?i)(?:daemon|cli)?\s*version[:\s]+v?(\d+\.\d+\.\d+)",
            r"(?i)netbird\s+v?(\d+\.\d+\.\d+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    })
}

/// Return the version from the first output line matching a known pattern.
pub fn parse_version_output(output: &str) -> Option<String> {
    output.lines().map(str::trim).find_map(|line| {
        version_patterns()
            .iter()
            .find_map(|re| re.captures(line).map(|c| c[1].to_string()))
    })
}

/// Detects the installed client.
pub struct InstalledStateProbe {
    runner: Arc<dyn ProcessRunner>,
    services: Arc<dyn ServiceControl>,
    registry: Arc<dyn UninstallRegistry>,
    default_executable: PathBuf,
    executable_name: String,
    product_name: String,
    service_name: String,
    command_timeout: Duration,
}

impl InstalledStateProbe {
    /// Create a probe for the configured product.
    pub fn new(
        config: &DeployConfig,
        runner: Arc<dyn ProcessRunner>,
        services: Arc<dyn ServiceControl>,
    ) -> Self {
        let executable_name = config
            .client_executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "netbird.exe".to_string());

        Self {
            runner,
            services,
            registry: Arc::new(WindowsUninstallRegistry),
            default_executable: config.client_executable.clone(),
            executable_name,
            product_name: config.product_name.clone(),
            service_name: config.service_name.clone(),
            command_timeout: Duration::from_secs(15),
        }
    }

    /// Read uninstall entries from `registry` instead of the local machine.
    pub fn with_registry(mut self, registry: Arc<dyn UninstallRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Detect the installed version and executable.
    pub async fn probe(&self) -> InstalledState {
        if let Some(state) = self.probe_executable(&self.default_executable).await {
            info!(source = "probe", version = ?state.version, "Found client at default path");
            return state;
        }

        match find_product(self.registry.as_ref(), &self.product_name).await {
            Ok(Some(entry)) if entry.display_version.is_some() => {
                let located = match entry.executable(&self.executable_name) {
                    Some(exe) => self.probe_executable(&exe).await,
                    None => None,
                };
                return match located {
                    Some(state) => {
                        info!(source = "probe", version = ?state.version, "Found client via uninstall registry");
                        state
                    }
                    None => {
                        warn!(
                            source = "probe",
                            registry_version = ?entry.display_version,
                            "Registry lists the client but its executable is missing or unversioned"
                        );
                        InstalledState::not_installed()
                    }
                };
            }
            Ok(_) => debug!(source = "probe", "No uninstall registry entry"),
            Err(e) => warn!(source = "probe", "Uninstall registry query failed: {}", e),
        }

        match self.services.binary_path(&self.service_name).await {
            Ok(Some(raw)) => {
                if let Some(exe) = parse_service_binary_path(&raw)
                    && let Some(state) = self.probe_executable(&exe).await
                {
                    info!(source = "probe", version = ?state.version, "Found client via service registration");
                    return state;
                }
            }
            Ok(None) => debug!(source = "probe", "Client service not registered"),
            Err(e) => debug!(source = "probe", "Service query failed: {}", e),
        }

        info!(source = "probe", "Client not installed");
        InstalledState::not_installed()
    }

    /// Ask an executable for its version, falling back to file metadata.
    async fn probe_executable(&self, path: &Path) -> Option<InstalledState> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return None;
        }

        let version = match self.version_from_cli(path).await {
            Some(v) => Some(v),
            None => file_version(self.runner.as_ref(), path).await.ok().flatten(),
        }?;

        Some(InstalledState {
            version: Some(version),
            executable_path: Some(path.to_path_buf()),
        })
    }

    async fn version_from_cli(&self, path: &Path) -> Option<String> {
        for arg in VERSION_ARGS {
            match self
                .runner
                .run(path, &[arg.to_string()], self.command_timeout)
                .await
            {
                Ok(output) => {
                    if let Some(version) = parse_version_output(&output.combined()) {
                        return Some(version);
                    }
                }
                Err(e) => debug!(source = "probe", arg, "Version query failed: {}", e),
            }
        }
        None
    }
}
