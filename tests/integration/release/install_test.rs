//! Integration tests for client installation and updates

use crate::integration::MockReleaseServer;
use crate::integration::fakes::{FakeMachine, RecordingServices};
use netbird_deploy::install::{Deployer, InstallOutcome};
use netbird_deploy::probe::InstalledStateProbe;
use netbird_deploy::DeployError;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::method;
use wiremock::{Mock, ResponseTemplate};

struct Setup {
    dir: TempDir,
    machine: Arc<FakeMachine>,
    deployer: Deployer,
}

fn setup(
    mock: &MockReleaseServer,
    installed: Option<&str>,
    next_version: &str,
    exit_code: i32,
) -> Setup {
    let dir = TempDir::new().unwrap();
    let executable = dir.path().join("netbird.exe");
    let config = mock.config().client_executable(&executable).build();

    let machine = Arc::new(
        FakeMachine::new(executable, installed, next_version).with_installer_exit_code(exit_code),
    );
    let probe = InstalledStateProbe::new(&config, machine.clone(), Arc::new(RecordingServices::default()));
    let deployer = Deployer::new(&config, probe, machine.clone())
        .expect("Valid config")
        .with_download_dir(dir.path());

    Setup {
        dir,
        machine,
        deployer,
    }
}

fn leftover_packages(dir: &TempDir) -> usize {
    std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".msi"))
        .count()
}

#[tokio::test]
async fn test_fresh_install() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;
    mock.mock_download("0.29.0", 1).await;

    let setup = setup(&mock, None, "0.29.0", 0);
    let report = setup.deployer.ensure_installed(None, false).await.expect("Install failed");

    assert_eq!(report.outcome, InstallOutcome::Installed);
    assert!(report.is_fresh_install());
    assert_eq!(report.current.version.as_deref(), Some("0.29.0"));
    assert_eq!(setup.machine.installed_packages(), vec![11]);
    assert_eq!(leftover_packages(&setup.dir), 0);
}

#[tokio::test]
async fn test_current_client_is_left_alone() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;
    mock.mock_download("0.29.0", 0).await;

    let setup = setup(&mock, Some("0.29.0"), "0.29.0", 0);
    let report = setup.deployer.ensure_installed(None, false).await.expect("Install failed");

    assert_eq!(report.outcome, InstallOutcome::AlreadyCurrent);
    assert!(!report.is_fresh_install());
    assert!(setup.machine.installed_packages().is_empty());
}

#[tokio::test]
async fn test_force_reinstalls_current_client() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;
    mock.mock_download("0.29.0", 1).await;

    let setup = setup(&mock, Some("0.29.0"), "0.29.0", 0);
    let report = setup.deployer.ensure_installed(None, true).await.expect("Install failed");

    assert_eq!(report.outcome, InstallOutcome::Updated);
    assert!(!report.is_fresh_install());
}

#[tokio::test]
async fn test_older_client_is_updated() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;
    mock.mock_download("0.29.0", 1).await;

    let setup = setup(&mock, Some("0.9.10"), "0.29.0", 0);
    let report = setup.deployer.ensure_installed(None, false).await.expect("Install failed");

    assert_eq!(report.outcome, InstallOutcome::Updated);
    assert_eq!(report.previous.version.as_deref(), Some("0.9.10"));
    assert_eq!(report.current.version.as_deref(), Some("0.29.0"));
}

#[tokio::test]
async fn test_reboot_required_counts_as_installed() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;
    mock.mock_download("0.29.0", 1).await;

    let setup = setup(&mock, None, "0.29.0", 3010);
    let report = setup.deployer.ensure_installed(None, false).await.expect("Install failed");

    assert_eq!(report.outcome, InstallOutcome::RebootRequired);
    assert!(report.is_fresh_install());
    assert!(report.current.is_installed());
}

#[tokio::test]
async fn test_installer_failure() {
    let mock = MockReleaseServer::start().await;
    mock.mock_latest("0.29.0").await;
    mock.mock_download("0.29.0", 1).await;

    let setup = setup(&mock, None, "0.29.0", 1603);
    let err = setup.deployer.ensure_installed(None, false).await.unwrap_err();

    assert!(matches!(err, DeployError::Install { exit_code: 1603 }));
    assert_eq!(leftover_packages(&setup.dir), 0);
}

#[tokio::test]
async fn test_pinned_version_missing() {
    let mock = MockReleaseServer::start().await;
    mock.mock_tag_not_found("0.1.0", 1).await;

    let setup = setup(&mock, Some("0.29.0"), "0.1.0", 0);
    let err = setup
        .deployer
        .ensure_installed(Some("0.1.0"), false)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployError::ReleaseUnavailable(_)));
    assert!(setup.machine.installed_packages().is_empty());
}

#[tokio::test]
async fn test_lookup_outage_keeps_installed_client() {
    let mock = MockReleaseServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(mock.inner())
        .await;

    let setup = setup(&mock, Some("0.28.4"), "0.29.0", 0);
    let report = setup.deployer.ensure_installed(None, false).await.expect("Install failed");

    assert_eq!(report.outcome, InstallOutcome::AlreadyCurrent);
    assert_eq!(report.current.version.as_deref(), Some("0.28.4"));
}

#[tokio::test]
async fn test_lookup_outage_without_client_fails() {
    let mock = MockReleaseServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(mock.inner())
        .await;

    let setup = setup(&mock, None, "0.29.0", 0);
    let err = setup.deployer.ensure_installed(None, false).await.unwrap_err();

    assert!(matches!(err, DeployError::ReleaseUnavailable(_)));
}
