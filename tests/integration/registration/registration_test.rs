//! Integration tests for the registration state machine with a real state resetter

use crate::integration::fakes::{InstalledClient, RecordingServices, ScriptedClient, StaticNetwork};
use netbird_deploy::cli::{ClientCli, CommandOutput, VendorCli};
use netbird_deploy::config::DeployConfig;
use netbird_deploy::error::RegistrationError;
use netbird_deploy::network::NetworkPrerequisiteChecker;
use netbird_deploy::probe::InstalledState;
use netbird_deploy::recovery::{ErrorCategory, RecoveryKind};
use netbird_deploy::registration::{
    RegistrationEvent, RegistrationEventHandler, RegistrationOrchestrator, RegistrationRequest,
    RegistrationState,
};
use netbird_deploy::reset::StateResetter;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use url::Url;

const SETUP_KEY: &str = "4F2B9C1E-0D7A-4E55-9B1C-2A6F8E3D5C70";

#[derive(Default)]
struct CollectingHandler {
    events: Mutex<Vec<RegistrationEvent>>,
}

impl RegistrationEventHandler for CollectingHandler {
    fn handle_event(&self, event: RegistrationEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl CollectingHandler {
    fn recoveries(&self) -> Vec<RecoveryKind> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RegistrationEvent::RecoveryStarted { action } => Some(action.kind),
                _ => None,
            })
            .collect()
    }

    fn resets(&self) -> Vec<(bool, bool)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RegistrationEvent::StateReset { full, success } => Some((*full, *success)),
                _ => None,
            })
            .collect()
    }
}

struct Endpoint {
    dir: TempDir,
    config: DeployConfig,
    services: Arc<RecordingServices>,
    events: Arc<CollectingHandler>,
}

impl Endpoint {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = DeployConfig::builder()
            .data_dir(dir.path())
            .management_url("https://netbird.example.com:33073")
            .expect("Valid URL")
            .build();
        std::fs::create_dir(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs").join("client.log"), "previous run").unwrap();

        Self {
            dir,
            config,
            services: Arc::new(RecordingServices::default()),
            events: Arc::new(CollectingHandler::default()),
        }
    }

    fn with_registration(self, management_url: &str) -> Self {
        let config = format!(r#"{{"ManagementURL": "{management_url}", "WgIface": "wt0"}}"#);
        std::fs::write(self.config.config_file_path(), config).unwrap();
        std::fs::write(self.dir.path().join("state.json"), "{}").unwrap();
        self
    }

    fn orchestrator(&self, cli: Arc<dyn ClientCli>, network: StaticNetwork) -> RegistrationOrchestrator {
        let checker = NetworkPrerequisiteChecker::new(&self.config, Arc::new(network));
        let resetter = Arc::new(StateResetter::new(&self.config, self.services.clone()));
        RegistrationOrchestrator::new(&self.config, cli, self.services.clone(), checker, resetter)
            .with_event_handler(self.events.clone())
    }

    fn request(&self) -> RegistrationRequest {
        RegistrationRequest::new(SETUP_KEY, self.config.management_url.clone())
    }
}

#[tokio::test(start_paused = true)]
async fn test_fresh_install_registers_first_try() {
    let endpoint = Endpoint::new();
    let cli = Arc::new(ScriptedClient::new(vec![CommandOutput::new(0, "Connected", "")]));
    let orchestrator = endpoint.orchestrator(cli.clone(), StaticNetwork::default());

    let report = orchestrator.run(&endpoint.request().fresh_install(true)).await;

    assert!(report.success);
    assert_eq!(report.attempts, 1);
    assert_eq!(report.final_state, RegistrationState::Done(true));
    assert_eq!(cli.keys(), vec![SETUP_KEY]);
    assert_eq!(endpoint.events.resets(), vec![(true, true)]);
    assert!(endpoint.dir.path().join("logs").join("client.log").exists());
}

#[tokio::test(start_paused = true)]
async fn test_deadline_then_success_waits_longer() {
    let endpoint = Endpoint::new();
    let cli = Arc::new(ScriptedClient::new(vec![
        CommandOutput::new(1, "", "rpc error: code = DeadlineExceeded desc = context deadline exceeded"),
        CommandOutput::new(0, "Connected", ""),
    ]));
    let orchestrator = endpoint.orchestrator(cli.clone(), StaticNetwork::default());

    let report = orchestrator.run(&endpoint.request()).await;

    assert!(report.success);
    assert_eq!(report.attempts, 2);
    assert_eq!(cli.up_calls(), 2);
    assert_eq!(endpoint.events.recoveries(), vec![RecoveryKind::WaitLonger]);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_deadline_escalates_to_partial_reset() {
    let endpoint = Endpoint::new().with_registration("https://netbird.example.com:33073");
    let cli = Arc::new(ScriptedClient::new(vec![
        CommandOutput::new(1, "", "context deadline exceeded"),
        CommandOutput::new(1, "", "context deadline exceeded"),
        CommandOutput::new(0, "Connected", ""),
    ]));
    let orchestrator = endpoint.orchestrator(cli.clone(), StaticNetwork::default());

    let report = orchestrator.run(&endpoint.request()).await;

    assert!(report.success);
    assert_eq!(report.attempts, 3);
    assert_eq!(
        endpoint.events.recoveries(),
        vec![RecoveryKind::WaitLonger, RecoveryKind::PartialReset]
    );
    assert!(!endpoint.config.config_file_path().exists());
    assert!(endpoint.dir.path().join("state.json").exists());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_setup_key_stops_immediately() {
    let endpoint = Endpoint::new();
    let cli = Arc::new(ScriptedClient::new(vec![CommandOutput::new(
        1,
        "",
        "rpc error: code = PermissionDenied desc = invalid setup key",
    )]));
    let orchestrator = endpoint.orchestrator(cli.clone(), StaticNetwork::default());

    let report = orchestrator.run(&endpoint.request().with_max_retries(5)).await;

    assert!(!report.success);
    assert_eq!(cli.up_calls(), 1);
    match report.error {
        Some(RegistrationError::RegistrationAttemptFailed { attempts, reason }) => {
            assert_eq!(attempts, 1);
            assert!(reason.contains(ErrorCategory::InvalidSetupKey.as_str()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_offline_host_spends_no_attempts() {
    let endpoint = Endpoint::new();
    let cli = Arc::new(ScriptedClient::new(vec![CommandOutput::new(0, "Connected", "")]));
    let network = StaticNetwork {
        online: false,
        management_reachable: false,
    };
    let orchestrator = endpoint.orchestrator(cli.clone(), network);

    let report = orchestrator.run(&endpoint.request()).await;

    assert!(!report.success);
    assert_eq!(report.attempts, 0);
    assert_eq!(cli.up_calls(), 0);
    assert!(matches!(report.error, Some(RegistrationError::NetworkUnavailable(_))));
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_registration_blocks_register() {
    let endpoint = Endpoint::new().with_registration("https://old-mgmt.example.org:443");
    let cli = Arc::new(ScriptedClient::new(vec![CommandOutput::new(0, "Connected", "")]));
    let orchestrator = endpoint.orchestrator(cli.clone(), StaticNetwork::default());

    let report = orchestrator.run(&endpoint.request()).await;

    assert!(!report.success);
    assert_eq!(cli.up_calls(), 0);
    assert!(matches!(report.error, Some(RegistrationError::PrerequisiteFailed(_))));
    assert!(endpoint.config.config_file_path().exists());
}

#[tokio::test(start_paused = true)]
async fn test_migration_replaces_conflicting_registration() {
    let endpoint = Endpoint::new().with_registration("https://old-mgmt.example.org:443");
    let cli = Arc::new(ScriptedClient::new(vec![CommandOutput::new(0, "Connected", "")]));
    let orchestrator = endpoint.orchestrator(cli.clone(), StaticNetwork::default());

    let target = Url::parse("https://netbird.example.com:33073").unwrap();
    assert!(orchestrator.migrate(SETUP_KEY, &target, 3).await);

    assert_eq!(cli.up_calls(), 1);
    assert!(!endpoint.config.config_file_path().exists());
    assert!(!endpoint.dir.path().join("state.json").exists());
    assert!(endpoint.dir.path().join("logs").join("client.log").exists());
    assert_eq!(endpoint.events.resets(), vec![(true, true)]);
    assert!(endpoint.services.calls().starts_with(&["stop", "start"]));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_management_is_prerequisite_failure() {
    let endpoint = Endpoint::new();
    let cli = Arc::new(ScriptedClient::new(vec![CommandOutput::new(0, "Connected", "")]));
    let network = StaticNetwork {
        online: true,
        management_reachable: false,
    };
    let orchestrator = endpoint.orchestrator(cli.clone(), network);

    let report = orchestrator.run(&endpoint.request()).await;

    assert!(!report.success);
    assert_eq!(cli.up_calls(), 0);
    assert!(matches!(report.error, Some(RegistrationError::PrerequisiteFailed(_))));
}

#[tokio::test(start_paused = true)]
async fn test_client_outside_default_location() {
    let endpoint = Endpoint::new();
    let executable = endpoint.dir.path().join("apps").join("netbird.exe");
    let installed = InstalledState {
        version: Some("0.29.0".to_string()),
        executable_path: Some(executable.clone()),
    };
    assert_ne!(executable, endpoint.config.client_executable);

    let runner = Arc::new(InstalledClient::new(&executable));
    let cli = VendorCli::new(&endpoint.config, runner.clone())
        .with_executable(installed.executable_or(&endpoint.config.client_executable));
    let orchestrator = endpoint.orchestrator(Arc::new(cli), StaticNetwork::default());

    let report = orchestrator.run(&endpoint.request()).await;

    assert!(report.success);
    assert_eq!(report.attempts, 1);
    let launches = runner.launches();
    assert!(!launches.is_empty());
    assert!(launches.iter().all(|p| *p == executable));
}
