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

//! Client installation and updates.
//!
//! [`Deployer`] compares the installed client with the release service and
//! installs the MSI package when the client is missing or out of date.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::cli::{ProcessRunner, TokioProcessRunner};
use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::platform::service::WindowsServiceControl;
use crate::probe::{InstalledState, InstalledStateProbe};
use crate::version::{ReleaseClient, ReleaseInfo, compare_versions};

/// Installer exit code for success with a pending reboot.
pub const EXIT_REBOOT_REQUIRED: i32 = 3010;

/// Installs a downloaded package.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Install `package`, returning the installer's exit code.
    async fn install(&self, package: &Path) -> Result<i32>;
}

/// [`PackageInstaller`] that runs `msiexec` silently.
pub struct MsiInstaller {
    runner: Arc<dyn ProcessRunner>,
    timeout: Duration,
}

impl MsiInstaller {
    /// Run `msiexec` through `runner`, killing it after `timeout`.
    pub fn new(runner: Arc<dyn ProcessRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }
}

/// Arguments for a silent all-users install without reboot.
pub fn msiexec_args(package: &Path) -> Vec<String> {
    vec![
        "/i".to_string(),
        package.to_string_lossy().into_owned(),
        "/qn".to_string(),
        "/norestart".to_string(),
        "ALLUSERS=1".to_string(),
    ]
}

#[async_trait]
impl PackageInstaller for MsiInstaller {
    async fn install(&self, package: &Path) -> Result<i32> {
        info!(source = "install", package = %package.display(), "Running installer");
        let output = self
            .runner
            .run(Path::new("msiexec"), &msiexec_args(package), self.timeout)
            .await?;
        Ok(output.exit_code)
    }
}

/// What [`Deployer::ensure_installed`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Installed version is current; nothing changed.
    AlreadyCurrent,
    /// The client was installed for the first time.
    Installed,
    /// An older client was replaced.
    Updated,
    /// Installed, but Windows needs a reboot to finish.
    RebootRequired,
}

impl InstallOutcome {
    /// Returns true if a package was installed.
    pub fn changed(&self) -> bool {
        !matches!(self, Self::AlreadyCurrent)
    }
}

/// Result of an install run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// What the run did.
    pub outcome: InstallOutcome,
    /// State before the run.
    pub previous: InstalledState,
    /// State after the run.
    pub current: InstalledState,
}

impl InstallReport {
    /// The client was not present before this run and has been installed.
    pub fn is_fresh_install(&self) -> bool {
        !self.previous.is_installed() && self.outcome.changed()
    }
}

/// Installs or updates the client.
pub struct Deployer {
    releases: ReleaseClient,
    probe: InstalledStateProbe,
    installer: Arc<dyn PackageInstaller>,
    http: reqwest::Client,
    download_dir: PathBuf,
}

impl Deployer {
    /// Create a deployer from its collaborators.
    pub fn new(
        config: &DeployConfig,
        probe: InstalledStateProbe,
        installer: Arc<dyn PackageInstaller>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            releases: ReleaseClient::new(config)?,
            probe,
            installer,
            http,
            download_dir: std::env::temp_dir(),
        })
    }

    /// Wire the deployer to the real release service, registry and `msiexec`.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
        let probe = InstalledStateProbe::new(config, runner.clone(), Arc::new(WindowsServiceControl));
        let installer = Arc::new(MsiInstaller::new(runner, config.timings.installer_timeout));
        Self::new(config, probe, installer)
    }

    /// Download packages into `dir` instead of the system temp directory.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// The release client used for lookups.
    pub fn releases(&self) -> &ReleaseClient {
        &self.releases
    }

    /// Detect the installed client.
    pub async fn installed(&self) -> InstalledState {
        self.probe.probe().await
    }

    /// Install `target_version` (or the latest release) unless it is already current.
    ///
    /// With `force`, the package is installed even when the versions match.
    pub async fn ensure_installed(
        &self,
        target_version: Option<&str>,
        force: bool,
    ) -> Result<InstallReport> {
        let previous = self.probe.probe().await;
        let release = self.releases.fetch_release(target_version).await;

        let (Some(version), Some(url)) = (release.version.as_deref(), release.download_url.as_deref())
        else {
            return self.no_release(previous, &release, target_version);
        };

        if let Some(installed) = previous.version.as_deref()
            && !force
            && !compare_versions(installed, version)
        {
            info!(source = "install", installed, available = version, "Client is current");
            return Ok(InstallReport {
                outcome: InstallOutcome::AlreadyCurrent,
                current: previous.clone(),
                previous,
            });
        }

        let package = self.download_dir.join(format!("netbird_installer_{version}.msi"));
        self.download(url, &package).await?;
        let exit_code = self.installer.install(&package).await;

        if let Err(e) = tokio::fs::remove_file(&package).await {
            debug!(source = "install", "Could not remove package: {}", e);
        }

        let outcome = match exit_code? {
            0 if previous.is_installed() => InstallOutcome::Updated,
            0 => InstallOutcome::Installed,
            EXIT_REBOOT_REQUIRED => InstallOutcome::RebootRequired,
            code => return Err(DeployError::install(code)),
        };

        let current = self.probe.probe().await;
        info!(
            source = "install",
            ?outcome,
            from = ?previous.version,
            to = ?current.version,
            "Installation finished"
        );
        if !current.is_installed() {
            warn!(source = "install", "Installer succeeded but the client was not detected");
        }

        Ok(InstallReport {
            outcome,
            previous,
            current,
        })
    }

    fn no_release(
        &self,
        previous: InstalledState,
        release: &ReleaseInfo,
        target_version: Option<&str>,
    ) -> Result<InstallReport> {
        if previous.is_installed() && target_version.is_none() {
            warn!(
                source = "install",
                installed = ?previous.version,
                "Release lookup failed, keeping installed client"
            );
            return Ok(InstallReport {
                outcome: InstallOutcome::AlreadyCurrent,
                current: previous.clone(),
                previous,
            });
        }

        let what = target_version.unwrap_or("latest");
        Err(DeployError::release_unavailable(match &release.version {
            Some(v) => format!("release {v} has no installer asset"),
            None => format!("release {what} not found"),
        }))
    }

    /// Stream `url` into `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        info!(source = "install", url, "Downloading installer");
        let mut response = self.http.get(url).send().await?.error_for_status()?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(DeployError::release_unavailable(format!(
                "downloaded installer from {url} is empty"
            )));
        }
        debug!(source = "install", bytes = written, path = %dest.display(), "Download complete");
        Ok(())
    }
}
