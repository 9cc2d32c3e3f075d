// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! TOML deployment profiles.
//!
//! A profile describes one fleet's client layout, management endpoint,
//! setup key source, and retry budgets. Device-management tooling drops
//! the profile on each endpoint and runs `netbird-deploy deploy`.
//!
//! # Example Profile
//!
//! ```toml
//! [management]
//! url = "https://netbird.example.com:33073"
//! setup_key = "file:${PROGRAMDATA}\\NetBird Deploy\\setup.key"
//!
//! [release]
//! version = "0.28.4"
//!
//! [registration]
//! max_retries = 5
//! pre_login = false
//!
//! [logging]
//! level = "info"
//! path = "${PROGRAMDATA}\\NetBird Deploy\\deploy.log"
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use netbird_deploy::auto_deploy::ConfigLoader;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let profile = ConfigLoader::new().load()?;
//! let config = profile.to_deploy_config()?;
//! let setup_key = profile.setup_key()?;
//! # let _ = (config, setup_key);
//! # Ok(())
//! # }
//! ```

mod config;
mod expand;
mod loader;

pub use config::{
    AutoDeployConfig, ClientConfig, LoggingConfig, ManagementConfig, NetworkConfig,
    RegistrationConfig, ReleaseConfig, resolve_setup_key,
};
pub use expand::{expand_variables, has_placeholders};
pub use loader::{CONFIG_ENV_VAR, ConfigLoader, write_default_config};
