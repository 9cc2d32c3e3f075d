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

//! # netbird-deploy
//!
//! Unattended deployment of the NetBird mesh VPN client on Windows endpoints.
//!
//! The crate installs or updates the client from its release feed, registers
//! the endpoint with a management server using a setup key, and confirms the
//! peer actually connected. It is meant to run under device-management
//! tooling with no operator present, so every stage retries, classifies
//! failures, and applies a bounded recovery step before giving up.
//!
//! ## Components
//!
//! - [`version`]: release lookup and version comparison
//! - [`probe`]: detect the installed client and its version
//! - [`network`]: network prerequisite checks before registration
//! - [`reset`]: clear persisted client state
//! - [`registration`]: the registration state machine
//! - [`verify`]: status polling and connectivity verification
//! - [`recovery`]: error classification and the recovery table
//! - [`install`]: MSI download and installation
//!
//! ## Quick Start
//!
//! ```no_run
//! use netbird_deploy::{DeployConfig, RegistrationOrchestrator, RegistrationRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DeployConfig::builder()
//!         .management_url("https://netbird.example.com:33073")?
//!         .build();
//!
//!     let orchestrator = RegistrationOrchestrator::from_config(&config)?;
//!     let request = RegistrationRequest::new("SETUP-KEY", config.management_url.clone())
//!         .fresh_install(true);
//!
//!     let report = orchestrator.run(&request).await;
//!     println!("registered: {} after {} attempt(s)", report.success, report.attempts);
//!     Ok(())
//! }
//! ```
//!
//! ## Cargo Features
//!
//! - `auto-deploy` (default): TOML deployment profiles and the
//!   `netbird-deploy` binary

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod install;
pub mod logging;
pub mod network;
pub mod platform;
pub mod probe;
pub mod recovery;
pub mod registration;
pub mod reset;
pub mod verify;
pub mod version;

#[cfg(feature = "auto-deploy")]
pub mod auto_deploy;

// Re-export main types at crate root for convenience
pub use cli::{ClientCli, CommandOutput, ProcessRunner, TokioProcessRunner, VendorCli};
pub use config::{DeployConfig, DeployConfigBuilder, RegistrationTimings};
pub use error::{DeployError, RegistrationError, Result};
pub use install::{Deployer, InstallOutcome, InstallReport};
pub use network::{NetworkCheck, NetworkCheckResult, NetworkPrerequisiteChecker};
pub use probe::{InstalledState, InstalledStateProbe};
pub use recovery::{ErrorCategory, RecoveryAction, RecoveryKind};
pub use registration::{
    RegistrationOrchestrator, RegistrationReport, RegistrationRequest, RegistrationState,
};
pub use reset::{StateReset, StateResetter};
pub use verify::{VerificationChecklist, VerificationPoller};
pub use version::{ReleaseClient, ReleaseInfo};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User-Agent string for HTTP requests.
pub const USER_AGENT: &str = concat!("netbird-deploy/", env!("CARGO_PKG_VERSION"));
