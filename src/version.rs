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

//! Release metadata lookup and version comparison.
//!
//! [`ReleaseClient`] asks the release service for the latest release or a
//! pinned tag and picks the Windows MSI asset out of it.
//!
//! # Retry Policy
//!
//! - Up to `release_max_attempts` attempts (default 3), sleeping
//!   `release_retry_delay × attempt` between them.
//! - A 404 for a pinned tag ends the lookup after one request: the tag does
//!   not exist and asking again will not create it.
//! - A release without a matching installer asset is retried as well, since
//!   assets are uploaded after the release is published. When the budget
//!   runs out the version is returned without a download URL.

use regex::Regex;
use serde::Deserialize;
use std::cmp::Ordering;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};

/// Release metadata for one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseInfo {
    /// Release version without a leading `v`.
    pub version: Option<String>,
    /// Download URL of the installer asset.
    pub download_url: Option<String>,
}

impl ReleaseInfo {
    /// A lookup that found nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if both a version and an installer URL are known.
    pub fn is_installable(&self) -> bool {
        self.version.is_some() && self.download_url.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Client for the release metadata service.
#[derive(Debug, Clone)]
pub struct ReleaseClient {
    http: reqwest::Client,
    releases_url: Url,
    asset_pattern: Regex,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ReleaseClient {
    /// Create a release client from the deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the installer pattern is not a valid regex or the
    /// HTTP client cannot be built.
    pub fn new(config: &DeployConfig) -> Result<Self> {
        let asset_pattern = Regex::new(&config.installer_pattern).map_err(|e| {
            DeployError::config(format!("Invalid installer pattern: {e}"))
        })?;

        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .user_agent(crate::USER_AGENT)
            .build()?;

        Ok(Self {
            http,
            releases_url: config.releases_url.clone(),
            asset_pattern,
            max_attempts: config.release_max_attempts.max(1),
            retry_delay: config.release_retry_delay,
        })
    }

    /// Endpoint for the latest release or a specific tag.
    pub fn release_endpoint(&self, target_version: Option<&str>) -> Result<Url> {
        let base = self.releases_url.as_str().trim_end_matches('/');
        let url = match target_version {
            Some(version) => format!("{}/tags/v{}", base, normalize_version(version)),
            None => format!("{}/latest", base),
        };
        Ok(Url::parse(&url)?)
    }

    /// Look up a release, returning an empty [`ReleaseInfo`] when nothing usable was found.
    pub async fn fetch_release(&self, target_version: Option<&str>) -> ReleaseInfo {
        let endpoint = match self.release_endpoint(target_version) {
            Ok(url) => url,
            Err(e) => {
                warn!(source = "version", "Invalid release endpoint: {}", e);
                return ReleaseInfo::empty();
            }
        };

        let mut found_version = None;

        for attempt in 1..=self.max_attempts {
            debug!(source = "version", %endpoint, attempt, "Querying release metadata");

            match self.fetch_once(&endpoint).await {
                Ok(release) => {
                    let version = normalize_version(&release.tag_name);
                    if let Some(url) = self.select_asset(&release.assets) {
                        info!(source = "version", version = %version, "Found installer asset");
                        return ReleaseInfo {
                            version: Some(version),
                            download_url: Some(url),
                        };
                    }
                    warn!(
                        source = "version",
                        version = %version,
                        assets = release.assets.len(),
                        "Release has no installer asset yet"
                    );
                    found_version = Some(version);
                }
                Err(e) if target_version.is_some() && e.is_not_found() => {
                    warn!(
                        source = "version",
                        target = target_version.unwrap_or_default(),
                        "Requested release does not exist"
                    );
                    return ReleaseInfo::empty();
                }
                Err(e) => {
                    warn!(
                        source = "version",
                        "Release lookup attempt {}/{} failed: {}", attempt, self.max_attempts, e
                    );
                }
            }

            if attempt < self.max_attempts {
                let delay = self.retry_delay * attempt;
                debug!(source = "version", "Retrying in {} seconds", delay.as_secs());
                sleep(delay).await;
            }
        }

        ReleaseInfo {
            version: found_version,
            download_url: None,
        }
    }

    async fn fetch_once(&self, endpoint: &Url) -> Result<ReleaseResponse> {
        let response = self
            .http
            .get(endpoint.clone())
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeployError::release_service(status.as_u16(), body));
        }

        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    fn select_asset(&self, assets: &[ReleaseAsset]) -> Option<String> {
        assets
            .iter()
            .find(|a| self.asset_pattern.is_match(&a.name))
            .map(|a| a.browser_download_url.clone())
    }
}

/// Strip surrounding whitespace and a leading `v`.
pub fn normalize_version(version: &str) -> String {
    let trimmed = version.trim();
    trimmed
        .strip_prefix(['v', 'V'])
        .unwrap_or(trimmed)
        .to_string()
}

/// Parse a dotted-integer version, ignoring pre-release and build suffixes.
pub fn parse_version(version: &str) -> Option<Vec<u64>> {
    let normalized = normalize_version(version);
    let core = normalized
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    if core.is_empty() {
        return None;
    }
    core.split('.').map(|part| part.parse::<u64>().ok()).collect()
}

/// Returns true if `candidate` is strictly newer than `current`.
///
/// Components compare numerically and missing components count as zero, so
/// `0.9.10` is newer than `0.9.9` and `1.0` equals `1.0.0`. If either side
/// does not parse, the candidate is assumed newer.
pub fn compare_versions(current: &str, candidate: &str) -> bool {
    let (Some(a), Some(b)) = (parse_version(current), parse_version(candidate)) else {
        return true;
    };

    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match y.cmp(&x) {
            Ordering::Greater => return true,
            Ordering::Less => return false,
            Ordering::Equal => {}
        }
    }
    false
}
