//! Integration tests for release metadata lookup

use crate::integration::{MockReleaseServer, RELEASES_PATH, installer_name};
use netbird_deploy::version::ReleaseClient;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

#[tokio::test]
async fn test_latest_release_lookup() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;

    let client = ReleaseClient::new(&mock.config().build()).expect("Valid config");
    let release = client.fetch_release(None).await;

    assert_eq!(release.version.as_deref(), Some("0.29.0"));
    assert_eq!(
        release.download_url.as_deref(),
        Some(mock.download_url(&installer_name("0.29.0")).as_str())
    );
    assert!(release.is_installable());
}

#[tokio::test]
async fn test_targeted_lookup_strips_v_prefix() {
    let mock = MockReleaseServer::start().await;
    mock.mock_tag("0.28.4").await;

    let client = ReleaseClient::new(&mock.config().build()).expect("Valid config");
    let release = client.fetch_release(Some("v0.28.4")).await;

    assert_eq!(release.version.as_deref(), Some("0.28.4"));
    assert!(release.is_installable());
}

#[tokio::test]
async fn test_targeted_not_found_is_queried_once() {
    let mock = MockReleaseServer::start().await;
    mock.mock_tag_not_found("9.9.9", 1).await;

    let client = ReleaseClient::new(&mock.config().release_max_attempts(5).build())
        .expect("Valid config");
    let release = client.fetch_release(Some("9.9.9")).await;

    assert!(release.version.is_none());
    assert!(release.download_url.is_none());
    // The mock verifies the single request when dropped
}

#[tokio::test]
async fn test_release_without_installer_asset() {
    let mock = MockReleaseServer::start().await;
    let body = mock.release_body("0.29.1", &["netbird_0.29.1_darwin_arm64.tar.gz".to_string()]);
    Mock::given(method("GET"))
        .and(path(format!("{RELEASES_PATH}/latest")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(3)
        .mount(mock.inner())
        .await;

    let client = ReleaseClient::new(&mock.config().build()).expect("Valid config");
    let release = client.fetch_release(None).await;

    assert_eq!(release.version.as_deref(), Some("0.29.1"));
    assert!(release.download_url.is_none());
    assert!(!release.is_installable());
}

#[tokio::test]
async fn test_transient_server_error_is_retried() {
    let mock = MockReleaseServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{RELEASES_PATH}/latest")))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
        .up_to_n_times(1)
        .mount(mock.inner())
        .await;
    mock.mock_latest("0.29.0").await;

    let client = ReleaseClient::new(&mock.config().build()).expect("Valid config");
    let release = client.fetch_release(None).await;

    assert!(release.is_installable());
}

#[tokio::test]
async fn test_rate_limited_lookup_gives_up() {
    let mock = MockReleaseServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{RELEASES_PATH}/latest")))
        .respond_with(
            ResponseTemplate::new(403)
                .set_body_json(json!({ "message": "API rate limit exceeded" })),
        )
        .expect(2)
        .mount(mock.inner())
        .await;

    let client = ReleaseClient::new(&mock.config().release_max_attempts(2).build())
        .expect("Valid config");
    let release = client.fetch_release(None).await;

    assert_eq!(release.version, None);
    assert!(!release.is_installable());
}
