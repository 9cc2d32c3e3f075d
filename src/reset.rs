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

//! Local client state reset.
//!
//! A partial reset removes only the connection config so the next join
//! starts from scratch. A full reset clears the whole data directory except
//! the log subdirectory.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DeployConfig;
use crate::platform::service::{ServiceControl, ServiceStatus, wait_for_status};

/// Clears persisted client state.
#[async_trait]
pub trait StateReset: Send + Sync {
    /// Reset client state; returns false if the reset did not complete.
    async fn reset(&self, full: bool) -> bool;
}

/// [`StateReset`] that stops the service, deletes files and starts it again.
pub struct StateResetter {
    services: Arc<dyn ServiceControl>,
    service_name: String,
    data_dir: PathBuf,
    config_file: PathBuf,
    log_dir_name: String,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl StateResetter {
    /// Create a resetter for the configured data directory and service.
    pub fn new(config: &DeployConfig, services: Arc<dyn ServiceControl>) -> Self {
        Self {
            services,
            service_name: config.service_name.clone(),
            data_dir: config.data_dir.clone(),
            config_file: config.config_file_path(),
            log_dir_name: config.log_dir_name.clone(),
            start_timeout: config.timings.service_start_timeout,
            stop_timeout: Duration::from_secs(15),
        }
    }

    async fn stop_service(&self) {
        if let Err(e) = self.services.stop(&self.service_name).await {
            warn!(source = "reset", service = %self.service_name, "Failed to stop service: {}", e);
            return;
        }
        if !wait_for_status(
            self.services.as_ref(),
            &self.service_name,
            ServiceStatus::Stopped,
            self.stop_timeout,
            Duration::from_secs(1),
        )
        .await
        {
            warn!(source = "reset", service = %self.service_name, "Service did not stop in time");
        }
    }

    async fn delete_config_file(&self) -> bool {
        match remove_path(&self.config_file).await {
            Ok(()) => {
                debug!(source = "reset", path = %self.config_file.display(), "Removed connection config");
                true
            }
            Err(e) => {
                warn!(
                    source = "reset",
                    path = %self.config_file.display(),
                    "Failed to remove connection config: {}", e
                );
                false
            }
        }
    }

    async fn clear_data_dir(&self) -> bool {
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) => {
                warn!(source = "reset", "Cannot read data directory: {}", e);
                return false;
            }
        };

        let mut ok = true;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(source = "reset", "Cannot list data directory: {}", e);
                    return false;
                }
            };

            if entry
                .file_name()
                .to_string_lossy()
                .eq_ignore_ascii_case(&self.log_dir_name)
            {
                continue;
            }

            let path = entry.path();
            if let Err(e) = remove_path(&path).await {
                warn!(source = "reset", path = %path.display(), "Failed to remove: {}", e);
                ok = false;
            }
        }
        ok
    }
}

#[async_trait]
impl StateReset for StateResetter {
    async fn reset(&self, full: bool) -> bool {
        let mode = if full { "full" } else { "partial" };
        info!(source = "reset", mode, data_dir = %self.data_dir.display(), "Resetting client state");

        self.stop_service().await;

        let deleted = if full {
            self.clear_data_dir().await
        } else {
            self.delete_config_file().await
        };

        if let Err(e) = self.services.start(&self.service_name).await {
            warn!(source = "reset", service = %self.service_name, "Failed to start service: {}", e);
        }

        if !deleted {
            return false;
        }

        if full
            && !wait_for_status(
                self.services.as_ref(),
                &self.service_name,
                ServiceStatus::Running,
                self.start_timeout,
                Duration::from_secs(2),
            )
            .await
        {
            warn!(source = "reset", service = %self.service_name, "Service not running after reset");
            return false;
        }

        info!(source = "reset", mode, "Client state reset");
        true
    }
}

async fn remove_path(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
