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

//! Control of the client's Windows service.
//!
//! [`ServiceControl`] is the seam the resetter, orchestrator, and probe use
//! to stop, start, and inspect the client daemon's service. The production
//! implementation talks to the Service Control Manager through
//! `windows-service`; SCM calls block, so each one runs on the blocking pool.
//!
//! # Service States
//!
//! - `NotInstalled` - No service with that name exists
//! - `Stopped` / `StartPending` / `StopPending` / `Running`
//! - `ContinuePending` / `PausePending` / `Paused`

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{DeployError, Result};

/// State of a Windows service as reported by the SCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// No service with the requested name is registered.
    NotInstalled,
    /// Service is not running.
    Stopped,
    /// Service is starting up.
    StartPending,
    /// Service is stopping.
    StopPending,
    /// Service is running.
    Running,
    /// Service is resuming from paused state.
    ContinuePending,
    /// Service is pausing.
    PausePending,
    /// Service is paused.
    Paused,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotInstalled => "not installed",
            Self::Stopped => "stopped",
            Self::StartPending => "start pending",
            Self::StopPending => "stop pending",
            Self::Running => "running",
            Self::ContinuePending => "continue pending",
            Self::PausePending => "pause pending",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Operations on a named Windows service.
#[async_trait]
pub trait ServiceControl: Send + Sync {
    /// Current state of the service.
    async fn status(&self, name: &str) -> Result<ServiceStatus>;

    /// Start the service. Starting a running service is not an error.
    async fn start(&self, name: &str) -> Result<()>;

    /// Stop the service. Stopping a stopped service is not an error.
    async fn stop(&self, name: &str) -> Result<()>;

    /// Raw binary path (command line) registered for the service, if any.
    async fn binary_path(&self, name: &str) -> Result<Option<String>>;
}

/// Poll until the service reports `target` or `timeout` elapses.
pub async fn wait_for_status(
    control: &dyn ServiceControl,
    name: &str,
    target: ServiceStatus,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match control.status(name).await {
            Ok(status) if status == target => return true,
            Ok(status) => debug!(source = "service", service = name, %status, "Waiting for service state {}", target),
            Err(e) => debug!(source = "service", service = name, "Service status query failed: {}", e),
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}

/// Stop then start the service, waiting for it to come back up.
///
/// A failed stop is logged and the start is attempted anyway.
pub async fn restart_service(
    control: &dyn ServiceControl,
    name: &str,
    timeout: Duration,
) -> Result<()> {
    if let Err(e) = control.stop(name).await {
        warn!(source = "service", service = name, "Stop before restart failed: {}", e);
    }
    wait_for_status(
        control,
        name,
        ServiceStatus::Stopped,
        Duration::from_secs(15).min(timeout),
        Duration::from_secs(1),
    )
    .await;

    control.start(name).await?;
    if wait_for_status(control, name, ServiceStatus::Running, timeout, Duration::from_secs(2)).await
    {
        Ok(())
    } else {
        Err(DeployError::timeout(
            format!("service {name} to reach running"),
            timeout.as_secs(),
        ))
    }
}

/// Extract the executable from a service command line.
///
/// Handles quoted paths (`"C:\Program Files\NetBird\netbird.exe" service run`)
/// and bare paths (`C:\NetBird\netbird.exe service run`). A bare path with
/// spaces is cut at the first `.exe`.
pub fn parse_service_binary_path(raw: &str) -> Option<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(rest) = raw.strip_prefix('"') {
        let end = rest.find('"')?;
        let path = &rest[..end];
        return (!path.is_empty()).then(|| PathBuf::from(path));
    }

    let lower = raw.to_ascii_lowercase();
    if let Some(pos) = lower.find(".exe") {
        return Some(PathBuf::from(&raw[..pos + 4]));
    }

    raw.split_whitespace().next().map(PathBuf::from)
}

/// [`ServiceControl`] backed by the Windows Service Control Manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsServiceControl;

#[cfg(windows)]
mod scm {
    use super::ServiceStatus;
    use crate::error::{DeployError, Result};
    use windows_service::service::{ServiceAccess, ServiceState};
    use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};

    const ERROR_SERVICE_ALREADY_RUNNING: i32 = 1056;
    const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
    const ERROR_SERVICE_NOT_ACTIVE: i32 = 1062;

    fn os_code(e: &windows_service::Error) -> Option<i32> {
        match e {
            windows_service::Error::Winapi(io) => io.raw_os_error(),
            _ => None,
        }
    }

    fn open(
        name: &str,
        access: ServiceAccess,
    ) -> Result<Option<windows_service::service::Service>> {
        let manager = ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
            .map_err(|e| {
                DeployError::platform(format!("Failed to open service manager: {}", e))
            })?;

        match manager.open_service(name, access) {
            Ok(service) => Ok(Some(service)),
            Err(e) if os_code(&e) == Some(ERROR_SERVICE_DOES_NOT_EXIST) => Ok(None),
            Err(e) => Err(DeployError::platform(format!(
                "Failed to open service {}: {}",
                name, e
            ))),
        }
    }

    pub fn status(name: &str) -> Result<ServiceStatus> {
        let Some(service) = open(name, ServiceAccess::QUERY_STATUS)? else {
            return Ok(ServiceStatus::NotInstalled);
        };
        let status = service
            .query_status()
            .map_err(|e| DeployError::platform(format!("Failed to query status: {}", e)))?;

        Ok(match status.current_state {
            ServiceState::Stopped => ServiceStatus::Stopped,
            ServiceState::StartPending => ServiceStatus::StartPending,
            ServiceState::StopPending => ServiceStatus::StopPending,
            ServiceState::Running => ServiceStatus::Running,
            ServiceState::ContinuePending => ServiceStatus::ContinuePending,
            ServiceState::PausePending => ServiceStatus::PausePending,
            ServiceState::Paused => ServiceStatus::Paused,
        })
    }

    pub fn start(name: &str) -> Result<()> {
        let service = open(name, ServiceAccess::START)?
            .ok_or_else(|| DeployError::platform(format!("Service {} is not installed", name)))?;
        match service.start(&[] as &[&str]) {
            Ok(()) => Ok(()),
            Err(e) if os_code(&e) == Some(ERROR_SERVICE_ALREADY_RUNNING) => Ok(()),
            Err(e) => Err(DeployError::platform(format!(
                "Failed to start service: {}",
                e
            ))),
        }
    }

    pub fn stop(name: &str) -> Result<()> {
        let service = open(name, ServiceAccess::STOP)?
            .ok_or_else(|| DeployError::platform(format!("Service {} is not installed", name)))?;
        match service.stop() {
            Ok(_) => Ok(()),
            Err(e) if os_code(&e) == Some(ERROR_SERVICE_NOT_ACTIVE) => Ok(()),
            Err(e) => Err(DeployError::platform(format!(
                "Failed to stop service: {}",
                e
            ))),
        }
    }

    pub fn binary_path(name: &str) -> Result<Option<String>> {
        let Some(service) = open(name, ServiceAccess::QUERY_CONFIG)? else {
            return Ok(None);
        };
        let config = service
            .query_config()
            .map_err(|e| DeployError::platform(format!("Failed to query config: {}", e)))?;
        Ok(Some(config.executable_path.to_string_lossy().into_owned()))
    }
}

#[cfg(windows)]
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeployError::platform(format!("Service task failed: {}", e)))?
}

#[cfg(windows)]
#[async_trait]
impl ServiceControl for WindowsServiceControl {
    async fn status(&self, name: &str) -> Result<ServiceStatus> {
        let name = name.to_string();
        blocking(move || scm::status(&name)).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        let owned = name.to_string();
        blocking(move || scm::start(&owned)).await?;
        tracing::info!(source = "service", "Service '{}' start requested", name);
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let owned = name.to_string();
        blocking(move || scm::stop(&owned)).await?;
        tracing::info!(source = "service", "Service '{}' stop requested", name);
        Ok(())
    }

    async fn binary_path(&self, name: &str) -> Result<Option<String>> {
        let name = name.to_string();
        blocking(move || scm::binary_path(&name)).await
    }
}

#[cfg(not(windows))]
#[async_trait]
impl ServiceControl for WindowsServiceControl {
    async fn status(&self, _name: &str) -> Result<ServiceStatus> {
        Err(DeployError::platform("Service status requires Windows"))
    }

    async fn start(&self, _name: &str) -> Result<()> {
        Err(DeployError::platform("Service start requires Windows"))
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Err(DeployError::platform("Service stop requires Windows"))
    }

    async fn binary_path(&self, _name: &str) -> Result<Option<String>> {
        Err(DeployError::platform("Service configuration requires Windows"))
    }
}
