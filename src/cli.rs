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

//! External process execution and the vendor client CLI.
//!
//! [`ProcessRunner`] is the one seam through which this crate launches
//! programs (the client executable, `msiexec`, `reg`, `sc`, `powershell`).
//! [`ClientCli`] narrows that to the client commands the deployment flow
//! needs: `up`, `down` and `status`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (`-1` when terminated by a signal).
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Create an output record.
    pub fn new(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the process exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for pattern matching over everything printed.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Launches external programs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args`, killing it if it outlives `timeout`.
    async fn run(&self, program: &Path, args: &[String], timeout: Duration)
    -> Result<CommandOutput>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!(source = "cli", program = %program.display(), ?args, "Executing");

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(DeployError::process(format!(
                    "Failed to launch {}: {e}",
                    program.display()
                )));
            }
            Err(_) => {
                return Err(DeployError::timeout(
                    format!("{} {}", program.display(), args.join(" ")),
                    timeout.as_secs(),
                ));
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Commands of the vendor client used during deployment.
#[async_trait]
pub trait ClientCli: Send + Sync {
    /// Join the mesh with a setup key, optionally against a custom management endpoint.
    async fn up(&self, setup_key: &str, management_url: Option<&Url>) -> Result<CommandOutput>;

    /// Disconnect from the mesh.
    async fn down(&self) -> Result<CommandOutput>;

    /// Query connection status.
    async fn status(&self, detail: bool, json: bool) -> Result<CommandOutput>;
}

/// Build the argument list for the join command.
///
/// The management URL is passed only when it differs from the vendor default.
pub fn up_args(setup_key: &str, management_url: Option<&Url>) -> Vec<String> {
    let mut args = vec![
        "up".to_string(),
        "--setup-key".to_string(),
        setup_key.to_string(),
    ];
    if let Some(url) = management_url
        && !DeployConfig::is_default_management_url(url)
    {
        args.push("--management-url".to_string());
        args.push(url.as_str().trim_end_matches('/').to_string());
    }
    args
}

/// Build the argument list for the status command.
pub fn status_args(detail: bool, json: bool) -> Vec<String> {
    let mut args = vec!["status".to_string()];
    if detail {
        args.push("--detail".to_string());
    }
    if json {
        args.push("--json".to_string());
    }
    args
}

/// Mask a setup key for logging, keeping only a short prefix.
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("{prefix}****")
    }
}

/// [`ClientCli`] that runs the installed client executable.
#[derive(Clone)]
pub struct VendorCli {
    runner: Arc<dyn ProcessRunner>,
    executable: PathBuf,
    status_timeout: Duration,
    join_timeout: Duration,
}

impl VendorCli {
    /// Create a CLI wrapper for the executable named in `config`.
    pub fn new(config: &DeployConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            executable: config.client_executable.clone(),
            status_timeout: config.timings.status_timeout,
            join_timeout: config.timings.join_timeout,
        }
    }

    /// Use a different executable path (e.g. one found through the service registry).
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = path.into();
        self
    }

    /// Path of the wrapped executable.
    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

#[async_trait]
impl ClientCli for VendorCli {
    async fn up(&self, setup_key: &str, management_url: Option<&Url>) -> Result<CommandOutput> {
        let args = up_args(setup_key, management_url);
        debug!(
            source = "cli",
            setup_key = %mask_secret(setup_key),
            custom_management = args.len() > 3,
            "Running join command"
        );
        self.runner
            .run(&self.executable, &args, self.join_timeout)
            .await
    }

    async fn down(&self) -> Result<CommandOutput> {
        self.runner
            .run(&self.executable, &["down".to_string()], self.status_timeout)
            .await
    }

    async fn status(&self, detail: bool, json: bool) -> Result<CommandOutput> {
        self.runner
            .run(&self.executable, &status_args(detail, json), self.status_timeout)
            .await
    }
}
