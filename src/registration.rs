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

//! Registration state machine.
//!
//! Joining the mesh is sequenced as an explicit state machine:
//!
//! ```text
//! Start -> NetworkCheck -> DaemonReadinessWait -> PrereqValidation
//!       -> StateClear -> Attempt(1..=max) -> Done(success | failure)
//! ```
//!
//! Each state runs one stage and reports a [`StepOutcome`]; [`transition`]
//! maps the pair to the next state. Between failed attempts the recovery
//! table in [`crate::recovery`] picks an action from the failure category
//! and how often that category has been seen.
//!
//! # Example
//!
//! ```no_run
//! use netbird_deploy::config::DeployConfig;
//! use netbird_deploy::registration::RegistrationOrchestrator;
//!
//! # async fn example() -> netbird_deploy::error::Result<()> {
//! let config = DeployConfig::default();
//! let orchestrator = RegistrationOrchestrator::from_config(&config)?;
//! let _joined = orchestrator
//!     .register("SETUP-KEY", &config.management_url, 5, false)
//!     .await;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cli::{ClientCli, ProcessRunner, TokioProcessRunner, VendorCli, mask_secret};
use crate::config::{DeployConfig, RegistrationTimings, same_endpoint};
use crate::error::{DeployError, RegistrationError, Result};
use crate::network::{NetworkPrerequisiteChecker, SystemNetworkProbe};
use crate::platform::eventlog::{EventData, EventId, EventLog};
use crate::platform::service::{ServiceControl, WindowsServiceControl, restart_service};
use crate::recovery::{ErrorCategory, RecoveryAction, RecoveryKind, classify, recovery_action};
use crate::reset::{StateReset, StateResetter};
use crate::verify::VerificationPoller;

/// Daemon readiness budget for the wait-and-verify recovery action.
pub const WAIT_AND_VERIFY_BUDGET: Duration = Duration::from_secs(30);

/// Longest stderr excerpt carried into errors and events.
const DETAIL_LIMIT: usize = 300;

/// Stage of a registration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// Nothing has run yet.
    Start,
    /// Network prerequisites, re-checked once on failure.
    NetworkCheck,
    /// Waiting for the client daemon to answer `status`.
    DaemonReadinessWait,
    /// Management reachability and conflicting-registration checks.
    PrereqValidation,
    /// Partial or full state reset before the first join.
    StateClear,
    /// Join attempt number (1-based).
    Attempt(u32),
    /// Terminal state.
    Done(bool),
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attempt(n) => write!(f, "Attempt({n})"),
            Self::Done(true) => write!(f, "Done(success)"),
            Self::Done(false) => write!(f, "Done(failure)"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Move to the next stage.
    Proceed,
    /// The attempt joined and verified.
    Succeeded,
    /// The attempt failed and recovery ran; try again if attempts remain.
    Retry,
    /// Stop with an error.
    Fatal(RegistrationError),
}

/// Next state for `state` after `outcome`, with at most `max_attempts` joins.
pub fn transition(
    state: RegistrationState,
    outcome: &StepOutcome,
    max_attempts: u32,
) -> RegistrationState {
    use RegistrationState::*;

    if let Done(_) = state {
        return state;
    }
    if let StepOutcome::Fatal(_) = outcome {
        return Done(false);
    }

    match (state, outcome) {
        (Start, _) => NetworkCheck,
        (NetworkCheck, _) => DaemonReadinessWait,
        (DaemonReadinessWait, _) => PrereqValidation,
        (PrereqValidation, _) => StateClear,
        (StateClear, _) => Attempt(1),
        (Attempt(_), StepOutcome::Succeeded) => Done(true),
        (Attempt(n), _) if n < max_attempts => Attempt(n + 1),
        (Attempt(_), _) => Done(false),
        (Done(_), _) => state,
    }
}

/// Outcome of one join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAttemptResult {
    /// The join command succeeded and verification passed.
    pub success: bool,
    /// Failure category, `None` on success.
    pub error_category: Option<ErrorCategory>,
    /// Output captured from the join command.
    pub raw_stderr: String,
}

impl RegistrationAttemptResult {
    fn succeeded(output: String) -> Self {
        Self {
            success: true,
            error_category: None,
            raw_stderr: output,
        }
    }

    fn failed(category: ErrorCategory, output: String) -> Self {
        Self {
            success: false,
            error_category: Some(category),
            raw_stderr: output,
        }
    }
}

/// Parameters of one registration run.
#[derive(Debug, Clone)]
pub struct RegistrationRequest {
    /// Setup key presented to the management server.
    pub setup_key: String,
    /// Management endpoint to join.
    pub management_url: Url,
    /// Join attempts allowed.
    pub max_retries: u32,
    /// The client was installed by this deployment.
    pub is_fresh_install: bool,
    /// Moving from another management server; waives the conflict check.
    pub migration: bool,
}

impl RegistrationRequest {
    /// Request with the default retry budget.
    pub fn new(setup_key: impl Into<String>, management_url: Url) -> Self {
        Self {
            setup_key: setup_key.into(),
            management_url,
            max_retries: 5,
            is_fresh_install: false,
            migration: false,
        }
    }

    /// Cap the number of join attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Mark the run as following a first-time install.
    ///
    /// Fresh installs wait longer for the daemon and tolerate a failed reset.
    pub fn fresh_install(mut self, fresh: bool) -> Self {
        self.is_fresh_install = fresh;
        self
    }

    /// Re-register an existing install against a different management server.
    pub fn migration(mut self, migration: bool) -> Self {
        self.migration = migration;
        self
    }
}

/// How a registration run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    /// Overall result.
    pub success: bool,
    /// Join attempts made.
    pub attempts: u32,
    /// Terminal state.
    pub final_state: RegistrationState,
    /// Error that ended a failed run.
    pub error: Option<RegistrationError>,
}

/// Events emitted during registration.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    /// A run started.
    Started {
        /// Target management endpoint.
        management_url: String,
        /// Fresh install run.
        fresh_install: bool,
    },

    /// A stage is about to run.
    StateEntered(RegistrationState),

    /// Advisory network findings.
    NetworkAdvisory {
        /// Warning messages.
        warnings: Vec<String>,
    },

    /// A join attempt failed.
    AttemptFailed {
        /// Attempt number (1-based).
        attempt: u32,
        /// Failure category.
        category: ErrorCategory,
        /// Output excerpt.
        detail: String,
    },

    /// A recovery action is starting.
    RecoveryStarted {
        /// The action.
        action: RecoveryAction,
    },

    /// Client state was reset.
    StateReset {
        /// Whole data directory cleared.
        full: bool,
        /// Reset completed.
        success: bool,
    },

    /// Registration joined and verified.
    Succeeded {
        /// Attempts used.
        attempts: u32,
        /// Management endpoint joined.
        management_url: String,
    },

    /// Registration ended without success.
    Failed {
        /// Reason.
        error: RegistrationError,
        /// Management endpoint targeted.
        management_url: String,
    },
}

/// Handler for registration events.
///
/// Implement this trait to receive notifications about registration progress.
pub trait RegistrationEventHandler: Send + Sync {
    /// Handle a registration event.
    fn handle_event(&self, event: RegistrationEvent);
}

/// Records registration milestones in the Windows Event Log.
pub struct EventLogHandler {
    log: EventLog,
}

impl EventLogHandler {
    /// Write events to `log`.
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl RegistrationEventHandler for EventLogHandler {
    fn handle_event(&self, event: RegistrationEvent) {
        let result = match event {
            RegistrationEvent::Started { management_url, .. } => self.log.log_info(
                EventId::REGISTRATION_STARTED,
                "NetBird registration started",
                Some(&EventData {
                    management_url: Some(management_url),
                    ..Default::default()
                }),
            ),
            RegistrationEvent::NetworkAdvisory { warnings } => self.log.log_warning(
                EventId::NETWORK_ADVISORY,
                "Network advisory checks reported issues",
                Some(&EventData {
                    context: Some(warnings.join("; ")),
                    ..Default::default()
                }),
            ),
            RegistrationEvent::AttemptFailed {
                attempt,
                category,
                detail,
            } => self.log.log_warning(
                EventId::REGISTRATION_RETRY,
                &format!("Registration attempt failed ({category})"),
                Some(&EventData {
                    attempt: Some(attempt),
                    error_details: Some(detail),
                    ..Default::default()
                }),
            ),
            RegistrationEvent::StateReset { full, success } => {
                self.log.log_state_reset(full, success)
            }
            RegistrationEvent::Succeeded { management_url, .. } => {
                self.log.log_registration(true, &management_url, "")
            }
            RegistrationEvent::Failed {
                error: RegistrationError::NetworkUnavailable(detail),
                management_url,
            } => self.log.log_error(
                EventId::NETWORK_UNAVAILABLE,
                "Network unavailable for registration",
                Some(&EventData::with_error(&detail, Some(&management_url))),
            ),
            RegistrationEvent::Failed {
                error,
                management_url,
            } => self
                .log
                .log_registration(false, &management_url, &error.to_string()),
            RegistrationEvent::StateEntered(_) | RegistrationEvent::RecoveryStarted { .. } => {
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!(source = "registration", "Event log write failed: {}", e);
        }
    }
}

#[derive(Default)]
struct RunContext {
    attempts: u32,
    category_counts: HashMap<ErrorCategory, u32>,
    last_failure: Option<RegistrationAttemptResult>,
    error: Option<RegistrationError>,
}

/// Sequences network checks, state reset, join attempts and verification.
pub struct RegistrationOrchestrator {
    cli: Arc<dyn ClientCli>,
    services: Arc<dyn ServiceControl>,
    checker: NetworkPrerequisiteChecker,
    resetter: Arc<dyn StateReset>,
    poller: VerificationPoller,
    timings: RegistrationTimings,
    service_name: String,
    config_file: PathBuf,
    data_dir: PathBuf,
    min_free_disk_mb: u64,
    pre_login: bool,
    events: Option<Arc<dyn RegistrationEventHandler>>,
}

impl RegistrationOrchestrator {
    /// Create an orchestrator from its collaborators.
    pub fn new(
        config: &DeployConfig,
        cli: Arc<dyn ClientCli>,
        services: Arc<dyn ServiceControl>,
        checker: NetworkPrerequisiteChecker,
        resetter: Arc<dyn StateReset>,
    ) -> Self {
        let poller = VerificationPoller::new(cli.clone(), config.timings.poll_interval)
            .with_json_status(config.status_json);
        Self {
            cli,
            services,
            checker,
            resetter,
            poller,
            timings: config.timings.clone(),
            service_name: config.service_name.clone(),
            config_file: config.config_file_path(),
            data_dir: config.data_dir.clone(),
            min_free_disk_mb: config.min_free_disk_mb,
            pre_login: false,
            events: None,
        }
    }

    /// Wire the orchestrator to the real client, service manager and network.
    pub fn from_config(config: &DeployConfig) -> Result<Self> {
        Self::for_executable(config, &config.client_executable)
    }

    /// Like [`from_config`](Self::from_config), driving the client at `executable`.
    ///
    /// Use the path reported by the installed-state probe when the client
    /// lives outside the default install location.
    pub fn for_executable(config: &DeployConfig, executable: &Path) -> Result<Self> {
        let runner: Arc<dyn ProcessRunner> = Arc::new(TokioProcessRunner);
        let services: Arc<dyn ServiceControl> = Arc::new(WindowsServiceControl);
        let cli = Arc::new(VendorCli::new(config, runner.clone()).with_executable(executable));
        let probe = Arc::new(SystemNetworkProbe::new(config, runner)?);
        let checker = NetworkPrerequisiteChecker::new(config, probe);
        let resetter = Arc::new(StateResetter::new(config, services.clone()));
        Ok(Self::new(config, cli, services, checker, resetter))
    }

    /// Verify with the three-check pre-login strategy instead of the full one.
    pub fn with_pre_login_verification(mut self, pre_login: bool) -> Self {
        self.pre_login = pre_login;
        self
    }

    /// Receive registration events.
    pub fn with_event_handler(mut self, handler: Arc<dyn RegistrationEventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    /// Join the mesh, returning true once the peer is verified connected.
    pub async fn register(
        &self,
        setup_key: &str,
        management_url: &Url,
        max_retries: u32,
        is_fresh_install: bool,
    ) -> bool {
        let request = RegistrationRequest::new(setup_key, management_url.clone())
            .with_max_retries(max_retries)
            .fresh_install(is_fresh_install);
        self.run(&request).await.success
    }

    /// Move an existing install to a new management server.
    ///
    /// The prior registration is cleared with a full reset.
    pub async fn migrate(&self, setup_key: &str, management_url: &Url, max_retries: u32) -> bool {
        let request = RegistrationRequest::new(setup_key, management_url.clone())
            .with_max_retries(max_retries)
            .migration(true);
        self.run(&request).await.success
    }

    /// Run the state machine to completion.
    pub async fn run(&self, request: &RegistrationRequest) -> RegistrationReport {
        let max_attempts = request.max_retries.max(1);
        let mut ctx = RunContext::default();
        let mut state = RegistrationState::Start;

        info!(
            source = "registration",
            management_url = %request.management_url,
            setup_key = %mask_secret(&request.setup_key),
            fresh_install = request.is_fresh_install,
            migration = request.migration,
            max_attempts,
            "Starting registration"
        );
        self.emit(RegistrationEvent::Started {
            management_url: request.management_url.to_string(),
            fresh_install: request.is_fresh_install,
        });

        let success = loop {
            if let RegistrationState::Done(success) = state {
                break success;
            }
            self.emit(RegistrationEvent::StateEntered(state));
            debug!(source = "registration", %state, "Entering state");

            let outcome = self.step(state, request, max_attempts, &mut ctx).await;

            if let StepOutcome::Fatal(err) = &outcome {
                ctx.error = Some(err.clone());
            }
            state = transition(state, &outcome, max_attempts);
        };

        let error = if success {
            None
        } else {
            ctx.error.take().or_else(|| Some(exhausted_error(&ctx)))
        };

        match &error {
            None => {
                info!(source = "registration", attempts = ctx.attempts, "Registration succeeded");
                self.emit(RegistrationEvent::Succeeded {
                    attempts: ctx.attempts,
                    management_url: request.management_url.to_string(),
                });
            }
            Some(err) => {
                error!(source = "registration", attempts = ctx.attempts, "Registration failed: {}", err);
                self.emit(RegistrationEvent::Failed {
                    error: err.clone(),
                    management_url: request.management_url.to_string(),
                });
            }
        }

        RegistrationReport {
            success,
            attempts: ctx.attempts,
            final_state: state,
            error,
        }
    }

    async fn step(
        &self,
        state: RegistrationState,
        request: &RegistrationRequest,
        max_attempts: u32,
        ctx: &mut RunContext,
    ) -> StepOutcome {
        match state {
            RegistrationState::Start | RegistrationState::Done(_) => StepOutcome::Proceed,
            RegistrationState::NetworkCheck => self.network_stage(request).await,
            RegistrationState::DaemonReadinessWait => self.daemon_stage(request).await,
            RegistrationState::PrereqValidation => self.prereq_stage(request).await,
            RegistrationState::StateClear => self.state_clear_stage(request).await,
            RegistrationState::Attempt(n) => {
                self.attempt_stage(request, n, max_attempts, ctx).await
            }
        }
    }

    async fn network_stage(&self, request: &RegistrationRequest) -> StepOutcome {
        let mut result = self.checker.check_prerequisites_for(&request.management_url).await;
        if !result.passed() {
            warn!(
                source = "registration",
                issues = ?result.blocking_issues,
                "Network prerequisites failed, re-checking in {}s",
                self.timings.network_retry_delay.as_secs()
            );
            sleep(self.timings.network_retry_delay).await;
            result = self.checker.check_prerequisites_for(&request.management_url).await;
        }

        if !result.passed() {
            return StepOutcome::Fatal(RegistrationError::NetworkUnavailable(
                result.blocking_issues.join("; "),
            ));
        }

        if !result.warnings.is_empty() {
            for w in &result.warnings {
                warn!(source = "registration", "Network advisory: {}", w);
            }
            self.emit(RegistrationEvent::NetworkAdvisory {
                warnings: result.warnings,
            });
        }
        StepOutcome::Proceed
    }

    async fn daemon_stage(&self, request: &RegistrationRequest) -> StepOutcome {
        let budget = if request.is_fresh_install {
            self.timings.daemon_wait_fresh
        } else {
            self.timings.daemon_wait
        };

        if self.poller.wait_for_daemon(budget).await {
            return StepOutcome::Proceed;
        }

        warn!(
            source = "registration",
            "Daemon not responding after {}s, restarting service",
            budget.as_secs()
        );
        if let Err(e) = restart_service(
            self.services.as_ref(),
            &self.service_name,
            self.timings.service_start_timeout,
        )
        .await
        {
            warn!(source = "registration", "Service restart failed: {}", e);
        }

        let retry_budget = self.timings.daemon_wait_after_restart;
        if self.poller.wait_for_daemon(retry_budget).await {
            return StepOutcome::Proceed;
        }

        StepOutcome::Fatal(RegistrationError::DaemonNotReady {
            waited_seconds: (budget + retry_budget).as_secs(),
        })
    }

    async fn prereq_stage(&self, request: &RegistrationRequest) -> StepOutcome {
        if !self.checker.management_reachable(&request.management_url).await {
            return StepOutcome::Fatal(RegistrationError::PrerequisiteFailed(format!(
                "Management server {} is not reachable",
                request.management_url
            )));
        }

        match read_registered_management_url(&self.config_file).await {
            Some(existing) if !same_endpoint(&existing, &request.management_url) => {
                if request.migration {
                    info!(
                        source = "registration",
                        %existing,
                        "Existing registration will be replaced by migration"
                    );
                } else {
                    return StepOutcome::Fatal(RegistrationError::PrerequisiteFailed(format!(
                        "Client is already registered with {existing}"
                    )));
                }
            }
            Some(_) => debug!(source = "registration", "Existing registration matches target"),
            None => {}
        }

        match self.checker.free_disk_mb(&self.data_dir).await {
            Some(free) if free < self.min_free_disk_mb => warn!(
                source = "registration",
                free_mb = free,
                "Low disk space on client data volume"
            ),
            Some(free) => debug!(source = "registration", free_mb = free, "Disk space ok"),
            None => {}
        }
        if let Some(enabled) = self.checker.firewall_enabled().await {
            info!(source = "registration", firewall_enabled = enabled, "Host firewall state");
        }

        StepOutcome::Proceed
    }

    async fn state_clear_stage(&self, request: &RegistrationRequest) -> StepOutcome {
        let full = request.is_fresh_install || request.migration;
        let ok = self.reset(full).await;

        if !ok {
            if request.is_fresh_install {
                warn!(source = "registration", "State reset failed on fresh install, continuing");
            } else {
                return StepOutcome::Fatal(RegistrationError::ResetFailed);
            }
        }

        if full
            && !self
                .poller
                .wait_for_daemon(self.timings.daemon_wait_after_reset)
                .await
        {
            warn!(source = "registration", "Daemon slow to return after reset");
        }
        StepOutcome::Proceed
    }

    async fn attempt_stage(
        &self,
        request: &RegistrationRequest,
        attempt: u32,
        max_attempts: u32,
        ctx: &mut RunContext,
    ) -> StepOutcome {
        ctx.attempts = attempt;
        info!(source = "registration", "Join attempt {}/{}", attempt, max_attempts);

        let result = self.attempt(request).await;
        if result.success {
            return StepOutcome::Succeeded;
        }

        let category = result.error_category.unwrap_or(ErrorCategory::Unknown);
        let detail = excerpt(&result.raw_stderr);
        warn!(source = "registration", attempt, %category, "Join attempt failed: {}", detail);
        self.emit(RegistrationEvent::AttemptFailed {
            attempt,
            category,
            detail: detail.clone(),
        });
        ctx.last_failure = Some(result);

        if attempt >= max_attempts {
            return StepOutcome::Retry;
        }

        let seen = ctx.category_counts.entry(category).or_insert(0);
        *seen += 1;
        let action = recovery_action(category, *seen);

        if action.gives_up() {
            warn!(source = "registration", %category, "Giving up: {}", action.description);
            return StepOutcome::Fatal(RegistrationError::RegistrationAttemptFailed {
                attempts: attempt,
                reason: format!("{category}: {}", action.description),
            });
        }

        info!(
            source = "registration",
            kind = ?action.kind,
            wait_seconds = action.wait_seconds,
            "Recovery: {}",
            action.description
        );
        self.emit(RegistrationEvent::RecoveryStarted {
            action: action.clone(),
        });

        if let Err(reason) = self.execute_recovery(&action, request).await {
            return StepOutcome::Fatal(RegistrationError::RegistrationAttemptFailed {
                attempts: attempt,
                reason: format!("Recovery failed: {reason}"),
            });
        }

        sleep(Duration::from_secs(action.wait_seconds)).await;
        StepOutcome::Retry
    }

    /// Run the join command once and verify the result.
    async fn attempt(&self, request: &RegistrationRequest) -> RegistrationAttemptResult {
        let output = match self
            .cli
            .up(&request.setup_key, Some(&request.management_url))
            .await
        {
            Ok(output) => output,
            Err(DeployError::Timeout { operation, seconds }) => {
                return RegistrationAttemptResult::failed(
                    ErrorCategory::DeadlineExceeded,
                    format!("join timed out after {seconds}s: {operation}"),
                );
            }
            Err(e) => {
                let text = e.to_string();
                return RegistrationAttemptResult::failed(classify(&text), text);
            }
        };

        let combined = output.combined();
        if !output.success() {
            return RegistrationAttemptResult::failed(classify(&combined), combined);
        }

        let verified = if self.pre_login {
            self.poller
                .verify_pre_login(self.timings.pre_login_timeout)
                .await
        } else {
            self.poller
                .verify_success(self.timings.verification_timeout)
                .await
        };

        if verified {
            RegistrationAttemptResult::succeeded(combined)
        } else {
            RegistrationAttemptResult::failed(ErrorCategory::VerificationFailed, combined)
        }
    }

    async fn execute_recovery(
        &self,
        action: &RecoveryAction,
        request: &RegistrationRequest,
    ) -> std::result::Result<(), String> {
        match action.kind {
            RecoveryKind::WaitLonger | RecoveryKind::None => Ok(()),
            RecoveryKind::PartialReset => self
                .reset(false)
                .await
                .then_some(())
                .ok_or_else(|| "partial reset failed".to_string()),
            RecoveryKind::FullReset => self
                .reset(true)
                .await
                .then_some(())
                .ok_or_else(|| "full reset failed".to_string()),
            RecoveryKind::RestartService => restart_service(
                self.services.as_ref(),
                &self.service_name,
                self.timings.service_start_timeout,
            )
            .await
            .map_err(|e| format!("service restart failed: {e}")),
            RecoveryKind::WaitAndVerify => self
                .poller
                .wait_for_daemon(WAIT_AND_VERIFY_BUDGET)
                .await
                .then_some(())
                .ok_or_else(|| "daemon did not respond".to_string()),
            RecoveryKind::TestConnectivity => {
                let result = self
                    .checker
                    .check_prerequisites_for(&request.management_url)
                    .await;
                if result.passed() {
                    Ok(())
                } else {
                    Err(format!(
                        "connectivity re-test failed: {}",
                        result.blocking_issues.join("; ")
                    ))
                }
            }
        }
    }

    async fn reset(&self, full: bool) -> bool {
        let success = self.resetter.reset(full).await;
        self.emit(RegistrationEvent::StateReset { full, success });
        success
    }

    fn emit(&self, event: RegistrationEvent) {
        if let Some(handler) = &self.events {
            handler.handle_event(event);
        }
    }
}

fn exhausted_error(ctx: &RunContext) -> RegistrationError {
    match &ctx.last_failure {
        Some(f) if f.error_category == Some(ErrorCategory::VerificationFailed) => {
            RegistrationError::VerificationFailed {
                attempts: ctx.attempts,
            }
        }
        Some(f) => RegistrationError::RegistrationAttemptFailed {
            attempts: ctx.attempts,
            reason: format!(
                "{}: {}",
                f.error_category.unwrap_or(ErrorCategory::Unknown),
                excerpt(&f.raw_stderr)
            ),
        },
        None => RegistrationError::RegistrationAttemptFailed {
            attempts: ctx.attempts,
            reason: "no attempts made".to_string(),
        },
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(DETAIL_LIMIT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Management URL recorded in the client's connection config, if any.
///
/// Accepts the URL as a string or as a `{Scheme, Host, Path}` object, under
/// either `ManagementUrl` or `ManagementURL`.
pub async fn read_registered_management_url(config_file: &std::path::Path) -> Option<Url> {
    let contents = tokio::fs::read_to_string(config_file).await.ok()?;
    let value: Value = match serde_json::from_str(&contents) {
        Ok(v) => v,
        Err(e) => {
            debug!(source = "registration", "Unreadable client config: {}", e);
            return None;
        }
    };
    parse_management_url(&value)
}

fn parse_management_url(config: &Value) -> Option<Url> {
    let field = config.as_object()?.iter().find_map(|(k, v)| {
        k.eq_ignore_ascii_case("ManagementUrl").then_some(v)
    })?;

    match field {
        Value::String(s) if !s.trim().is_empty() => Url::parse(s.trim()).ok(),
        Value::Object(parts) => {
            let get = |name: &str| {
                parts
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .and_then(|(_, v)| v.as_str())
                    .unwrap_or_default()
            };
            let (scheme, host) = (get("Scheme"), get("Host"));
            if scheme.is_empty() || host.is_empty() {
                return None;
            }
            Url::parse(&format!("{}://{}{}", scheme, host, get("Path"))).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::CommandOutput;
    use crate::network::NetworkProbe;
    use crate::platform::service::ServiceStatus;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const CONNECTED: &str = "Management: Connected\nSignal: Connected\n\
                             NetBird IP: 100.64.0.9/16\nInterface type: Kernel\n";
    const DISCONNECTED: &str = "Management: Disconnected\nSignal: Disconnected\n";

    struct FakeCli {
        up_results: Mutex<Vec<CommandOutput>>,
        status: Mutex<CommandOutput>,
        connect_on_up: bool,
        up_calls: AtomicU32,
    }

    impl FakeCli {
        fn new(up: Vec<CommandOutput>, status: CommandOutput) -> Arc<Self> {
            Arc::new(Self {
                up_results: Mutex::new(up),
                status: Mutex::new(status),
                connect_on_up: false,
                up_calls: AtomicU32::new(0),
            })
        }

        fn connecting() -> Arc<Self> {
            Arc::new(Self {
                up_results: Mutex::new(vec![CommandOutput::new(0, "Connected", "")]),
                status: Mutex::new(CommandOutput::new(1, DISCONNECTED, "")),
                connect_on_up: true,
                up_calls: AtomicU32::new(0),
            })
        }

        fn up_calls(&self) -> u32 {
            self.up_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ClientCli for FakeCli {
        async fn up(&self, _key: &str, _url: Option<&Url>) -> Result<CommandOutput> {
            self.up_calls.fetch_add(1, Ordering::SeqCst);
            if self.connect_on_up {
                *self.status.lock().unwrap() = CommandOutput::new(0, CONNECTED, "");
            }
            let mut results = self.up_results.lock().unwrap();
            Ok(if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            })
        }

        async fn down(&self) -> Result<CommandOutput> {
            Ok(CommandOutput::new(0, "", ""))
        }

        async fn status(&self, _detail: bool, _json: bool) -> Result<CommandOutput> {
            Ok(self.status.lock().unwrap().clone())
        }
    }

    struct FakeServices {
        fail_start: bool,
    }

    #[async_trait]
    impl ServiceControl for FakeServices {
        async fn status(&self, _n: &str) -> Result<ServiceStatus> {
            Ok(ServiceStatus::Running)
        }
        async fn start(&self, _n: &str) -> Result<()> {
            if self.fail_start {
                Err(DeployError::platform("access denied"))
            } else {
                Ok(())
            }
        }
        async fn stop(&self, _n: &str) -> Result<()> {
            Ok(())
        }
        async fn binary_path(&self, _n: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    /// Healthy unless `healthy` is false or the current check round is one
    /// of the first `failing_rounds`. A round starts with the adapter check.
    struct FakeNetwork {
        healthy: bool,
        failing_rounds: u32,
        checks: AtomicU32,
    }

    impl FakeNetwork {
        fn up(&self) -> bool {
            self.healthy && self.checks.load(Ordering::SeqCst) > self.failing_rounds
        }
    }

    #[async_trait]
    impl NetworkProbe for FakeNetwork {
        async fn active_adapter(&self) -> Result<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.up())
        }
        async fn default_gateway(&self) -> Result<bool> {
            Ok(self.up())
        }
        async fn dns_servers_configured(&self) -> Result<bool> {
            Ok(self.up())
        }
        async fn resolves(&self, _host: &str) -> Result<bool> {
            Ok(self.up())
        }
        async fn internet_reachable(&self) -> Result<bool> {
            Ok(self.up())
        }
        async fn clock_skew_seconds(&self) -> Result<Option<i64>> {
            Ok(Some(0))
        }
        async fn proxy_configured(&self) -> Result<bool> {
            Ok(false)
        }
        async fn tcp_reachable(&self, _h: &str, _p: u16, _t: Duration) -> Result<bool> {
            Ok(true)
        }
        async fn https_reachable(&self, _url: &Url) -> Result<bool> {
            Ok(self.healthy)
        }
        async fn free_disk_mb(&self, _path: &Path) -> Result<Option<u64>> {
            Ok(Some(50_000))
        }
        async fn firewall_enabled(&self) -> Result<Option<bool>> {
            Ok(None)
        }
    }

    struct FakeReset {
        succeeds: bool,
        calls: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl StateReset for FakeReset {
        async fn reset(&self, full: bool) -> bool {
            self.calls.lock().unwrap().push(full);
            self.succeeds
        }
    }

    struct Harness {
        _dir: TempDir,
        config: DeployConfig,
        network: Arc<FakeNetwork>,
        reset: Arc<FakeReset>,
        fail_service_start: bool,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let config = DeployConfig::builder().data_dir(dir.path()).build();
            Self {
                _dir: dir,
                config,
                network: Arc::new(FakeNetwork {
                    healthy: true,
                    failing_rounds: 0,
                    checks: AtomicU32::new(0),
                }),
                reset: Arc::new(FakeReset {
                    succeeds: true,
                    calls: Mutex::new(Vec::new()),
                }),
                fail_service_start: false,
            }
        }

        fn orchestrator(&self, cli: Arc<FakeCli>) -> RegistrationOrchestrator {
            let checker = NetworkPrerequisiteChecker::new(&self.config, self.network.clone());
            RegistrationOrchestrator::new(
                &self.config,
                cli,
                Arc::new(FakeServices {
                    fail_start: self.fail_service_start,
                }),
                checker,
                self.reset.clone(),
            )
        }

        fn request(&self) -> RegistrationRequest {
            RegistrationRequest::new("A1B2C3D4-SETUP-KEY", self.config.management_url.clone())
        }
    }

    fn failing_up(stderr: &str) -> Vec<CommandOutput> {
        vec![CommandOutput::new(1, "", stderr)]
    }

    #[test]
    fn test_transition_happy_path() {
        use RegistrationState::*;
        let mut state = Start;
        let mut seen = vec![state];
        while !matches!(state, Attempt(_)) {
            state = transition(state, &StepOutcome::Proceed, 3);
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![Start, NetworkCheck, DaemonReadinessWait, PrereqValidation, StateClear, Attempt(1)]
        );
        assert_eq!(transition(Attempt(1), &StepOutcome::Succeeded, 3), Done(true));
    }

    #[test]
    fn test_transition_attempt_bounds() {
        use RegistrationState::*;
        assert_eq!(transition(Attempt(2), &StepOutcome::Retry, 3), Attempt(3));
        assert_eq!(transition(Attempt(3), &StepOutcome::Retry, 3), Done(false));
        assert_eq!(
            transition(StateClear, &StepOutcome::Fatal(RegistrationError::ResetFailed), 3),
            Done(false)
        );
        assert_eq!(transition(Done(true), &StepOutcome::Retry, 3), Done(true));
    }

    #[test]
    fn test_parse_management_url_forms() {
        let v: Value = serde_json::from_str(r#"{"ManagementUrl": "https://mgmt.example.com:443"}"#).unwrap();
        assert_eq!(parse_management_url(&v).unwrap().host_str(), Some("mgmt.example.com"));

        let v: Value = serde_json::from_str(
            r#"{"ManagementURL": {"Scheme": "https", "Host": "api.netbird.io:443", "Path": ""}}"#,
        )
        .unwrap();
        assert_eq!(parse_management_url(&v).unwrap().as_str(), "https://api.netbird.io/");

        let v: Value = serde_json::from_str(r#"{"WireguardPort": 51820}"#).unwrap();
        assert!(parse_management_url(&v).is_none());
    }

    #[test]
    fn test_excerpt_truncates() {
        let long = "x".repeat(DETAIL_LIMIT + 50);
        assert!(excerpt(&long).ends_with("..."));
        assert_eq!(excerpt("  short \n"), "short");
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_first_attempt() {
        let h = Harness::new();
        let cli = FakeCli::connecting();
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert!(report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.final_state, RegistrationState::Done(true));
        assert_eq!(cli.up_calls(), 1);
        assert_eq!(*h.reset.calls.lock().unwrap(), vec![false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_setup_key_gives_up_immediately() {
        let h = Harness::new();
        let cli = FakeCli::new(
            failing_up("rpc error: code = PermissionDenied desc = invalid setup key"),
            CommandOutput::new(1, DISCONNECTED, ""),
        );
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert!(!report.success);
        assert_eq!(cli.up_calls(), 1);
        assert!(matches!(
            report.error,
            Some(RegistrationError::RegistrationAttemptFailed { attempts: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_error_bounded_by_max_retries() {
        let h = Harness::new();
        let cli = FakeCli::new(
            failing_up("dial tcp: lookup api.netbird.io: no such host"),
            CommandOutput::new(1, DISCONNECTED, ""),
        );
        let request = h.request().with_max_retries(3);
        let report = h.orchestrator(cli.clone()).run(&request).await;
        assert!(!report.success);
        assert_eq!(cli.up_calls(), 3);
        assert_eq!(report.attempts, 3);
        assert!(matches!(
            report.error,
            Some(RegistrationError::RegistrationAttemptFailed { attempts: 3, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_failure_asymmetry() {
        let mut h = Harness::new();
        h.reset = Arc::new(FakeReset {
            succeeds: false,
            calls: Mutex::new(Vec::new()),
        });

        let cli = FakeCli::connecting();
        let fresh = h.request().fresh_install(true);
        let report = h.orchestrator(cli.clone()).run(&fresh).await;
        assert!(report.success);
        assert_eq!(cli.up_calls(), 1);
        assert_eq!(h.reset.calls.lock().unwrap()[0], true);

        let cli = FakeCli::connecting();
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert!(!report.success);
        assert_eq!(report.error, Some(RegistrationError::ResetFailed));
        assert_eq!(report.attempts, 0);
        assert_eq!(cli.up_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_unavailable_spends_no_attempts() {
        let mut h = Harness::new();
        h.network = Arc::new(FakeNetwork {
            healthy: false,
            failing_rounds: 0,
            checks: AtomicU32::new(0),
        });
        let cli = FakeCli::connecting();
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert!(!report.success);
        assert!(matches!(report.error, Some(RegistrationError::NetworkUnavailable(_))));
        assert_eq!(cli.up_calls(), 0);
        assert_eq!(h.network.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_recovers_on_recheck() {
        let mut h = Harness::new();
        h.network = Arc::new(FakeNetwork {
            healthy: true,
            failing_rounds: 1,
            checks: AtomicU32::new(0),
        });
        let cli = FakeCli::connecting();
        let started = tokio::time::Instant::now();

        let report = h.orchestrator(cli.clone()).run(&h.request()).await;

        assert!(report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(cli.up_calls(), 1);
        assert_eq!(h.network.checks.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= h.config.timings.network_retry_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_login_verification_through_register() {
        let h = Harness::new();
        let status = CommandOutput::new(0, "Daemon status: Connected\n", "");

        let cli = FakeCli::new(vec![CommandOutput::new(0, "", "")], status.clone());
        assert!(
            h.orchestrator(cli.clone())
                .with_pre_login_verification(true)
                .register("A1B2C3D4-SETUP-KEY", &h.config.management_url, 1, false)
                .await
        );
        assert_eq!(cli.up_calls(), 1);

        let cli = FakeCli::new(vec![CommandOutput::new(0, "", "")], status);
        assert!(
            !h.orchestrator(cli.clone())
                .register("A1B2C3D4-SETUP-KEY", &h.config.management_url, 1, false)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_escalates_to_full_reset_then_gives_up() {
        struct Recoveries(Mutex<Vec<RecoveryKind>>);
        impl RegistrationEventHandler for Recoveries {
            fn handle_event(&self, event: RegistrationEvent) {
                if let RegistrationEvent::RecoveryStarted { action } = event {
                    self.0.lock().unwrap().push(action.kind);
                }
            }
        }

        let h = Harness::new();
        let cli = FakeCli::new(
            failing_up("rpc error: code = DeadlineExceeded desc = context deadline exceeded"),
            CommandOutput::new(1, DISCONNECTED, ""),
        );
        let recoveries = Arc::new(Recoveries(Mutex::new(Vec::new())));
        let report = h
            .orchestrator(cli.clone())
            .with_event_handler(recoveries.clone())
            .run(&h.request().with_max_retries(5))
            .await;

        assert!(!report.success);
        assert_eq!(cli.up_calls(), 4);
        assert_eq!(report.attempts, 4);
        assert!(matches!(
            report.error,
            Some(RegistrationError::RegistrationAttemptFailed { attempts: 4, .. })
        ));
        assert_eq!(
            *recoveries.0.lock().unwrap(),
            vec![
                RecoveryKind::WaitLonger,
                RecoveryKind::PartialReset,
                RecoveryKind::FullReset
            ]
        );
        assert_eq!(*h.reset.calls.lock().unwrap(), vec![false, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recovery_aborts() {
        let mut h = Harness::new();
        h.fail_service_start = true;
        let cli = FakeCli::new(
            failing_up("dial tcp 127.0.0.1:41731: connect: connection refused"),
            CommandOutput::new(1, DISCONNECTED, ""),
        );
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert!(!report.success);
        assert_eq!(cli.up_calls(), 2);
        match report.error {
            Some(RegistrationError::RegistrationAttemptFailed { attempts, reason }) => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("service restart failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unverified_join_is_demoted() {
        let h = Harness::new();
        let cli = FakeCli::new(
            vec![CommandOutput::new(0, "Connected", "")],
            CommandOutput::new(1, DISCONNECTED, ""),
        );
        let request = h.request().with_max_retries(2);
        let report = h.orchestrator(cli.clone()).run(&request).await;
        assert!(!report.success);
        assert_eq!(cli.up_calls(), 2);
        assert_eq!(
            report.error,
            Some(RegistrationError::VerificationFailed { attempts: 2 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_daemon_not_ready_is_fatal() {
        let h = Harness::new();
        let cli = FakeCli::new(
            vec![CommandOutput::new(0, "", "")],
            CommandOutput::new(2, "", "daemon is not running"),
        );
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert_eq!(
            report.error,
            Some(RegistrationError::DaemonNotReady { waited_seconds: 240 })
        );
        assert_eq!(cli.up_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_registration() {
        let h = Harness::new();
        std::fs::write(
            h.config.config_file_path(),
            r#"{"ManagementUrl": "https://old-mgmt.example.com:443"}"#,
        )
        .unwrap();

        let cli = FakeCli::connecting();
        let report = h.orchestrator(cli.clone()).run(&h.request()).await;
        assert!(matches!(report.error, Some(RegistrationError::PrerequisiteFailed(_))));
        assert_eq!(cli.up_calls(), 0);

        let cli = FakeCli::connecting();
        let orchestrator = h.orchestrator(cli.clone());
        assert!(
            orchestrator
                .migrate("A1B2C3D4-SETUP-KEY", &h.config.management_url, 3)
                .await
        );
        assert_eq!(h.reset.calls.lock().unwrap().last(), Some(&true));
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_registration_is_not_a_conflict() {
        let h = Harness::new();
        std::fs::write(
            h.config.config_file_path(),
            r#"{"ManagementUrl": "https://API.netbird.io:443/"}"#,
        )
        .unwrap();
        let cli = FakeCli::connecting();
        assert!(
            h.orchestrator(cli)
                .register("A1B2C3D4-SETUP-KEY", &h.config.management_url, 5, false)
                .await
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_emitted() {
        struct Collect(Mutex<Vec<String>>);
        impl RegistrationEventHandler for Collect {
            fn handle_event(&self, event: RegistrationEvent) {
                let name = match event {
                    RegistrationEvent::Started { .. } => "started",
                    RegistrationEvent::Succeeded { .. } => "succeeded",
                    RegistrationEvent::StateReset { .. } => "reset",
                    _ => return,
                };
                self.0.lock().unwrap().push(name.to_string());
            }
        }

        let h = Harness::new();
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let orchestrator = h
            .orchestrator(FakeCli::connecting())
            .with_event_handler(handler.clone());
        assert!(orchestrator.run(&h.request()).await.success);
        assert_eq!(
            *handler.0.lock().unwrap(),
            vec!["started", "reset", "succeeded"]
        );
    }
}
