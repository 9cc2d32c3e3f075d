//! Integration test utilities and helpers
//!
//! Mock release service built on wiremock, plus in-memory stand-ins for the
//! client CLI, service manager, and network probe.

pub mod fakes;

use netbird_deploy::config::DeployConfigBuilder;
use netbird_deploy::DeployConfig;
use serde_json::{Value, json};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Release metadata path served by the mock.
pub const RELEASES_PATH: &str = "/repos/netbirdio/netbird/releases";

/// Installer asset name for a version.
pub fn installer_name(version: &str) -> String {
    format!("netbird_installer_{version}_windows_amd64.msi")
}

/// Mock release service for integration tests
pub struct MockReleaseServer {
    server: MockServer,
}

impl MockReleaseServer {
    /// Start a new mock release service
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Base URL of the release metadata endpoint
    pub fn releases_url(&self) -> String {
        format!("{}{}", self.server.uri(), RELEASES_PATH)
    }

    /// Download URL for an asset served by this mock
    pub fn download_url(&self, asset: &str) -> String {
        format!("{}/download/{}", self.server.uri(), asset)
    }

    /// Get a reference to the inner MockServer for custom mocking
    pub fn inner(&self) -> &MockServer {
        &self.server
    }

    /// Configuration pointing at this mock with no retry delay
    pub fn config(&self) -> DeployConfigBuilder {
        DeployConfig::builder()
            .releases_url(self.releases_url())
            .expect("Valid URL")
            .release_retry_delay(Duration::ZERO)
            .release_max_attempts(3)
    }

    /// Release metadata document listing `assets`
    pub fn release_body(&self, version: &str, assets: &[String]) -> Value {
        let assets: Vec<Value> = assets
            .iter()
            .map(|name| json!({ "name": name, "browser_download_url": self.download_url(name) }))
            .collect();
        json!({ "tag_name": format!("v{version}"), "name": version, "assets": assets })
    }

    /// Mock the latest release with a Windows installer asset
    pub async fn mock_latest(&self, version: &str) {
        let body = self.release_body(
            version,
            &[
                format!("netbird_{version}_linux_amd64.tar.gz"),
                installer_name(version),
            ],
        );
        Mock::given(method("GET"))
            .and(path(format!("{RELEASES_PATH}/latest")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Mock a tagged release with a Windows installer asset
    pub async fn mock_tag(&self, version: &str) {
        let body = self.release_body(version, &[installer_name(version)]);
        Mock::given(method("GET"))
            .and(path(format!("{RELEASES_PATH}/tags/v{version}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&self.server)
            .await;
    }

    /// Mock a missing tag, expecting exactly `calls` requests
    pub async fn mock_tag_not_found(&self, version: &str, calls: u64) {
        Mock::given(method("GET"))
            .and(path(format!("{RELEASES_PATH}/tags/v{version}")))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "Not Found" })))
            .expect(calls)
            .mount(&self.server)
            .await;
    }

    /// Mock the installer download, expecting exactly `calls` requests
    pub async fn mock_download(&self, version: &str, calls: u64) {
        Mock::given(method("GET"))
            .and(path(format!("/download/{}", installer_name(version))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"MSI-PACKAGE".to_vec()))
            .expect(calls)
            .mount(&self.server)
            .await;
    }
}
