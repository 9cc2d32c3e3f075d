// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Profile discovery and loading.

use std::path::{Path, PathBuf};
use tracing::debug;

use super::config::AutoDeployConfig;
use crate::error::{DeployError, Result};

/// Environment variable naming an explicit profile path.
pub const CONFIG_ENV_VAR: &str = "NETBIRD_DEPLOY_CONFIG";

/// Locates, parses, expands, and validates a deployment profile.
///
/// Lookup order:
///
/// 1. Path given with [`ConfigLoader::with_path`]
/// 2. Path in the `NETBIRD_DEPLOY_CONFIG` environment variable
/// 3. `%PROGRAMDATA%\NetBird Deploy\config.toml`
/// 4. `netbird-deploy/config.toml` under the user config directory
/// 5. `netbird-deploy.toml` in the working directory
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    expand_variables: bool,
    validate: bool,
    env_var_name: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Loader with discovery, variable expansion, and validation enabled.
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            expand_variables: true,
            validate: true,
            env_var_name: CONFIG_ENV_VAR.to_string(),
        }
    }

    /// Load from this path and skip discovery.
    pub fn with_path(mut self, path: impl AsRef<Path>) -> Self {
        self.explicit_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Expand `${VAR}` placeholders after parsing.
    pub fn with_expand_variables(mut self, expand: bool) -> Self {
        self.expand_variables = expand;
        self
    }

    /// Validate the profile after loading.
    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Read the explicit path from a different environment variable.
    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var_name = name.into();
        self
    }

    /// Find and load the profile.
    pub fn load(&self) -> Result<AutoDeployConfig> {
        let path = self.find_config_file()?;
        debug!(source = "config", path = %path.display(), "Loading deployment profile");
        let content = std::fs::read_to_string(&path)
            .map_err(|e| DeployError::config(format!("Cannot read {}: {e}", path.display())))?;
        self.load_from_str(&content)
    }

    /// Load a profile from TOML text.
    pub fn load_from_str(&self, content: &str) -> Result<AutoDeployConfig> {
        let mut config = AutoDeployConfig::from_toml(content)?;
        if self.expand_variables {
            config.expand_variables();
        }
        if self.validate {
            config.validate()?;
        }
        Ok(config)
    }

    /// Resolve the profile path without reading it.
    pub fn find_config_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.explicit_path {
            return existing(path, "Profile");
        }

        if let Ok(value) = std::env::var(&self.env_var_name)
            && !value.is_empty()
        {
            return existing(Path::new(&value), &format!("Profile from {}", self.env_var_name));
        }

        let candidates = self.get_search_paths();
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                let searched: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                DeployError::config(format!(
                    "No profile found. Searched:\n  - {}",
                    searched.join("\n  - ")
                ))
            })
    }

    /// Standard profile locations, highest priority first.
    pub fn get_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(program_data) = std::env::var_os("ProgramData") {
            paths.push(
                PathBuf::from(program_data)
                    .join("NetBird Deploy")
                    .join("config.toml"),
            );
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("netbird-deploy").join("config.toml"));
        }
        paths.push(PathBuf::from("netbird-deploy.toml"));

        paths
    }

    /// Returns true if discovery finds a profile.
    pub fn config_exists(&self) -> bool {
        self.find_config_file().is_ok()
    }
}

fn existing(path: &Path, what: &str) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(DeployError::config(format!(
            "{what} not found: {}",
            path.display()
        )))
    }
}

const DEFAULT_PROFILE: &str = r#"# NetBird deployment profile
#
# Values may use ${COMPUTERNAME}, ${PROGRAMDATA}, ${PROGRAMFILES}, or any
# environment variable.

[client]
# executable = "${PROGRAMFILES}\\NetBird\\netbird.exe"
# data_dir = "${PROGRAMDATA}\\Netbird"
service_name = "NetBird"

[management]
# Must be https. Self-hosted deployments point this at their own server.
url = "https://api.netbird.io:443"

# Setup key source: the key itself, "env:VARIABLE", or "file:PATH".
setup_key = "env:NETBIRD_SETUP_KEY"

[release]
# Pin a client version instead of tracking the latest release.
# version = "0.28.4"
max_attempts = 3
retry_delay_seconds = 5

[registration]
max_retries = 5
# Check prerequisites only; for hosts that complete login interactively.
pre_login = false
# Parse `netbird status --json` instead of the text report.
json_status = false
verification_timeout = 120

[network]
relay_hosts = ["signal.netbird.io", "relay.netbird.io", "api.netbird.io"]
min_free_disk_mb = 200

[logging]
level = "info"
# path = "${PROGRAMDATA}\\NetBird Deploy\\deploy.log"
json_format = false
windows_event_log = true
"#;

/// Write a commented starter profile, creating parent directories.
pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| DeployError::config(format!("Cannot create {}: {e}", parent.display())))?;
    }
    std::fs::write(path, DEFAULT_PROFILE)
        .map_err(|e| DeployError::config(format!("Cannot write {}: {e}", path.display())))
}
