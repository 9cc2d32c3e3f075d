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

//! NetBird Deployment Command-Line Tool
//!
//! Installs, registers, and verifies the NetBird client on Windows endpoints.
//! Designed to run unattended from device-management tooling.
//!
//! # Usage
//!
//! ```text
//! netbird-deploy [OPTIONS] <COMMAND>
//!
//! Commands:
//!   install   Install or update the client
//!   register  Register this endpoint with a management server
//!   deploy    Install or update, then register
//!   migrate   Move an installed client to a new management server
//!   status    Show client connection status
//!   verify    Wait until the client is verified connected
//!   reset     Clear local client state
//!   check     Check network prerequisites
//!   release   Look up a client release
//!   config    Profile management
//!
//! Options:
//!   -c, --config <PATH>    Path to deployment profile
//!   -v, --verbose          Enable verbose output
//!   -q, --quiet            Suppress non-error output
//!       --dry-run          Show what would happen without making changes
//!       --log-file <PATH>  Write logs to a rotating file
//!       --json-logs        Emit logs as JSON
//! ```
//!
//! # Examples
//!
//! ```bash
//! # Install the latest client and register with a setup key from the environment
//! netbird-deploy deploy --setup-key env:NETBIRD_SETUP_KEY
//!
//! # Register against a self-hosted management server
//! netbird-deploy register --setup-key file:C:\keys\nb.key --management-url https://nb.example.com
//!
//! # Check network prerequisites
//! netbird-deploy check
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use netbird_deploy::auto_deploy::{
    AutoDeployConfig, ConfigLoader, resolve_setup_key, write_default_config,
};
use netbird_deploy::cli::{ClientCli, ProcessRunner, TokioProcessRunner, VendorCli};
use netbird_deploy::config::DeployConfig;
use netbird_deploy::install::{Deployer, InstallOutcome, InstallReport};
use netbird_deploy::logging::{LogLevel, init_logging};
use netbird_deploy::network::{NetworkCheck, NetworkPrerequisiteChecker, SystemNetworkProbe};
use netbird_deploy::platform::{self, EventLog, WindowsServiceControl};
use netbird_deploy::probe::InstalledStateProbe;
use netbird_deploy::registration::{
    EventLogHandler, RegistrationOrchestrator, RegistrationReport, RegistrationRequest,
};
use netbird_deploy::reset::{StateReset, StateResetter};
use netbird_deploy::verify::{
    PreLoginChecklist, VerificationCheck, VerificationChecklist, VerificationPoller,
};
use netbird_deploy::version::{ReleaseClient, compare_versions};

type CmdResult = Result<(), Box<dyn std::error::Error>>;

/// NetBird Deployment Command-Line Tool
#[derive(Parser)]
#[command(name = "netbird-deploy")]
#[command(author = "U.S. Federal Government")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Install, register, and verify NetBird clients", long_about = None)]
struct Cli {
    /// Path to deployment profile
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show what would happen without making changes
    #[arg(long, global = true)]
    dry_run: bool,

    /// Write logs to a rotating file
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install or update the client
    Install {
        /// Client version to install (default: latest)
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        /// Reinstall even if the installed version is current
        #[arg(short, long)]
        force: bool,
    },

    /// Register this endpoint with a management server
    Register {
        #[command(flatten)]
        target: RegistrationArgs,

        /// Join attempts before giving up
        #[arg(long)]
        max_retries: Option<u32>,

        /// Treat the client as freshly installed
        #[arg(long)]
        fresh: bool,

        /// Verify connection prerequisites only
        #[arg(long)]
        pre_login: bool,
    },

    /// Install or update, then register
    Deploy {
        #[command(flatten)]
        target: RegistrationArgs,

        /// Client version to install (default: latest)
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,

        /// Reinstall even if the installed version is current
        #[arg(short, long)]
        force: bool,

        /// Verify connection prerequisites only
        #[arg(long)]
        pre_login: bool,
    },

    /// Move an installed client to a new management server
    Migrate {
        #[command(flatten)]
        target: RegistrationArgs,
    },

    /// Show client connection status
    Status {
        /// Output format
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Wait until the client is verified connected
    Verify {
        /// Timeout in seconds (default: from profile)
        #[arg(long)]
        timeout: Option<u64>,

        /// Verify connection prerequisites only
        #[arg(long)]
        pre_login: bool,
    },

    /// Clear local client state
    Reset {
        /// Clear the whole data directory, not just the connection config
        #[arg(long)]
        full: bool,
    },

    /// Check network prerequisites
    Check,

    /// Look up a client release
    Release {
        /// Version to look up (default: latest)
        #[arg(long, value_name = "VERSION")]
        version: Option<String>,
    },

    /// Profile management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Args)]
struct RegistrationArgs {
    /// Setup key: the key itself, env:VAR, or file:PATH
    #[arg(long, value_name = "KEY")]
    setup_key: Option<String>,

    /// Management server URL
    #[arg(long, value_name = "URL")]
    management_url: Option<String>,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate the deployment profile
    Validate,

    /// Display the effective profile
    Show {
        /// Output format
        #[arg(long, default_value = "toml")]
        format: ConfigFormat,
    },

    /// Generate a starter profile
    Init {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum ConfigFormat {
    #[default]
    Toml,
    Json,
}

/// Profile and runtime configuration for one invocation.
struct Context {
    profile: AutoDeployConfig,
    config: DeployConfig,
}

impl Context {
    fn load(cli: &Cli) -> Result<Self, Box<dyn std::error::Error>> {
        let profile = load_profile(cli)?;
        let config = profile.to_deploy_config()?;
        Ok(Self { profile, config })
    }

    fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::new(TokioProcessRunner)
    }

    fn probe(&self) -> InstalledStateProbe {
        InstalledStateProbe::new(&self.config, self.runner(), Arc::new(WindowsServiceControl))
    }

    /// The installed client's executable, or the configured default path.
    async fn client_executable(&self) -> PathBuf {
        let installed = self.probe().probe().await;
        installed
            .executable_or(&self.config.client_executable)
            .to_path_buf()
    }

    fn vendor_cli(&self, executable: &Path) -> Arc<dyn ClientCli> {
        Arc::new(VendorCli::new(&self.config, self.runner()).with_executable(executable))
    }

    async fn poller(&self) -> VerificationPoller {
        let executable = self.client_executable().await;
        VerificationPoller::new(self.vendor_cli(&executable), self.config.timings.poll_interval)
            .with_json_status(self.config.status_json)
    }

    fn management_url(&self, args: &RegistrationArgs) -> Result<Url, Box<dyn std::error::Error>> {
        match &args.management_url {
            Some(url) => Ok(Url::parse(url)?),
            None => Ok(self.config.management_url.clone()),
        }
    }

    fn setup_key(&self, args: &RegistrationArgs) -> Result<String, Box<dyn std::error::Error>> {
        if let Some(source) = &args.setup_key {
            return Ok(resolve_setup_key(source)?);
        }
        self.profile
            .setup_key()?
            .ok_or_else(|| "No setup key given. Use --setup-key or set management.setup_key.".into())
    }

    fn orchestrator(
        &self,
        pre_login: bool,
        executable: &Path,
    ) -> Result<RegistrationOrchestrator, Box<dyn std::error::Error>> {
        let mut orchestrator = RegistrationOrchestrator::for_executable(&self.config, executable)?
            .with_pre_login_verification(pre_login || self.profile.registration.pre_login);
        if let Some(log) = self.event_log() {
            orchestrator = orchestrator.with_event_handler(Arc::new(EventLogHandler::new(log)));
        }
        Ok(orchestrator)
    }

    fn event_log(&self) -> Option<EventLog> {
        if !self.profile.logging.windows_event_log {
            return None;
        }
        match EventLog::open() {
            Ok(log) => Some(log),
            Err(e) => {
                tracing::warn!("Event log unavailable: {}", e);
                None
            }
        }
    }
}

fn load_profile(cli: &Cli) -> Result<AutoDeployConfig, Box<dyn std::error::Error>> {
    let mut loader = ConfigLoader::new();
    if let Some(ref path) = cli.config {
        loader = loader.with_path(path);
        return Ok(loader.load()?);
    }
    if loader.config_exists() {
        Ok(loader.load()?)
    } else {
        Ok(AutoDeployConfig::default())
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let context = match &cli.command {
        Commands::Config { .. } => None,
        _ => match Context::load(&cli) {
            Ok(context) => Some(context),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let mut log_config = context
        .as_ref()
        .map(|c| c.profile.to_log_config())
        .unwrap_or_default();
    if cli.quiet {
        log_config = log_config.with_level(LogLevel::Error);
    } else if cli.verbose {
        log_config = log_config.with_level(LogLevel::Debug);
    }
    if let Some(ref path) = cli.log_file {
        log_config.path = Some(path.clone());
    }
    if cli.json_logs {
        log_config = log_config.with_json();
    }
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run_command(&cli, context)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_command(cli: &Cli, context: Option<Context>) -> CmdResult {
    let Some(ctx) = context else {
        return match &cli.command {
            Commands::Config { action } => cmd_config(cli, action),
            _ => Err("Configuration not loaded".into()),
        };
    };

    match &cli.command {
        Commands::Install { version, force } => {
            cmd_install(cli, &ctx, version.as_deref(), *force).await.map(|_| ())
        }
        Commands::Register {
            target,
            max_retries,
            fresh,
            pre_login,
        } => cmd_register(cli, &ctx, target, *max_retries, *fresh, *pre_login).await,
        Commands::Deploy {
            target,
            version,
            force,
            pre_login,
        } => cmd_deploy(cli, &ctx, target, version.as_deref(), *force, *pre_login).await,
        Commands::Migrate { target } => cmd_migrate(cli, &ctx, target).await,
        Commands::Status { format } => cmd_status(&ctx, *format).await,
        Commands::Verify { timeout, pre_login } => cmd_verify(&ctx, *timeout, *pre_login).await,
        Commands::Reset { full } => cmd_reset(cli, &ctx, *full).await,
        Commands::Check => cmd_check(&ctx).await,
        Commands::Release { version } => cmd_release(&ctx, version.as_deref()).await,
        Commands::Config { action } => cmd_config(cli, action),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

fn warn_if_not_elevated() {
    if platform::is_windows() && !platform::is_elevated() {
        println!("[WARN] Not running elevated; service and install operations will likely fail");
    }
}

async fn cmd_install(
    cli: &Cli,
    ctx: &Context,
    version: Option<&str>,
    force: bool,
) -> Result<Option<InstallReport>, Box<dyn std::error::Error>> {
    let target = version.or(ctx.profile.release.version.as_deref());
    let deployer = Deployer::from_config(&ctx.config)?;

    if cli.dry_run {
        let installed = deployer.installed().await;
        let release = deployer.releases().fetch_release(target).await;
        println!("DRY RUN: Would install client");
        println!("  Installed: {}", installed.version.as_deref().unwrap_or("none"));
        println!("  Available: {}", release.version.as_deref().unwrap_or("none"));
        println!("  Package:   {}", release.download_url.as_deref().unwrap_or("none"));
        println!("  Force:     {}", force);
        return Ok(None);
    }

    warn_if_not_elevated();
    let report = deployer.ensure_installed(target, force).await?;
    let version = report.current.version.as_deref().unwrap_or("unknown");
    match report.outcome {
        InstallOutcome::AlreadyCurrent => println!("[OK] Client {} is current", version),
        InstallOutcome::Installed => println!("[OK] Installed client {}", version),
        InstallOutcome::Updated => println!(
            "[OK] Updated client {} -> {}",
            report.previous.version.as_deref().unwrap_or("unknown"),
            version
        ),
        InstallOutcome::RebootRequired => {
            println!("[OK] Installed client {} (reboot required)", version)
        }
    }

    if report.outcome.changed()
        && let Some(log) = ctx.event_log()
        && let Err(e) = log.log_installed(version, report.outcome == InstallOutcome::Updated)
    {
        tracing::warn!("Failed to record install event: {}", e);
    }
    Ok(Some(report))
}

fn print_report(report: &RegistrationReport, management_url: &Url) -> CmdResult {
    if report.success {
        println!(
            "[OK] Registered with {} after {} attempt(s)",
            management_url, report.attempts
        );
        return Ok(());
    }
    let reason = report
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown failure".to_string());
    println!("[FAIL] {}", reason);
    Err(format!("Registration failed: {}", reason).into())
}

async fn cmd_register(
    cli: &Cli,
    ctx: &Context,
    target: &RegistrationArgs,
    max_retries: Option<u32>,
    fresh: bool,
    pre_login: bool,
) -> CmdResult {
    let management_url = ctx.management_url(target)?;
    let setup_key = ctx.setup_key(target)?;
    let max_retries = max_retries.unwrap_or(ctx.config.max_retries);

    if cli.dry_run {
        println!("DRY RUN: Would register this endpoint");
        println!("  Management URL: {}", management_url);
        println!("  Setup key:      {}", netbird_deploy::cli::mask_secret(&setup_key));
        println!("  Max retries:    {}", max_retries);
        println!("  Fresh install:  {}", fresh);
        return Ok(());
    }

    warn_if_not_elevated();
    let request = RegistrationRequest::new(setup_key, management_url.clone())
        .with_max_retries(max_retries)
        .fresh_install(fresh);
    let executable = ctx.client_executable().await;
    let report = ctx.orchestrator(pre_login, &executable)?.run(&request).await;
    print_report(&report, &management_url)
}

async fn cmd_deploy(
    cli: &Cli,
    ctx: &Context,
    target: &RegistrationArgs,
    version: Option<&str>,
    force: bool,
    pre_login: bool,
) -> CmdResult {
    let management_url = ctx.management_url(target)?;
    let setup_key = ctx.setup_key(target)?;

    let Some(install) = cmd_install(cli, ctx, version, force).await? else {
        println!("DRY RUN: Would then register with {}", management_url);
        return Ok(());
    };
    if !install.current.is_installed() {
        println!("[FAIL] Client not detected after install");
        return Err("Client not installed".into());
    }

    let request = RegistrationRequest::new(setup_key, management_url.clone())
        .with_max_retries(ctx.config.max_retries)
        .fresh_install(install.is_fresh_install());
    let executable = install.current.executable_or(&ctx.config.client_executable);
    let report = ctx.orchestrator(pre_login, executable)?.run(&request).await;
    print_report(&report, &management_url)
}

async fn cmd_migrate(cli: &Cli, ctx: &Context, target: &RegistrationArgs) -> CmdResult {
    let management_url = ctx.management_url(target)?;
    let setup_key = ctx.setup_key(target)?;

    if cli.dry_run {
        println!("DRY RUN: Would migrate to {}", management_url);
        println!("  Local client state would be fully reset");
        return Ok(());
    }

    warn_if_not_elevated();
    let request = RegistrationRequest::new(setup_key, management_url.clone())
        .with_max_retries(ctx.config.max_retries)
        .migration(true);
    let executable = ctx.client_executable().await;
    let report = ctx
        .orchestrator(ctx.profile.registration.pre_login, &executable)?
        .run(&request)
        .await;
    print_report(&report, &management_url)
}

async fn cmd_status(ctx: &Context, format: OutputFormat) -> CmdResult {
    let snapshot = ctx.poller().await.snapshot().await;
    let checklist = VerificationChecklist::evaluate(&snapshot);

    match format {
        OutputFormat::Json => {
            let checks: serde_json::Map<String, serde_json::Value> = VerificationCheck::ALL
                .iter()
                .map(|c| (c.to_string(), checklist.get(*c).into()))
                .collect();
            let json = serde_json::json!({
                "exitCode": snapshot.exit_code,
                "managementConnected": snapshot.management_connected,
                "signalConnected": snapshot.signal_connected,
                "assignedAddress": snapshot.assigned_address,
                "interfaceType": snapshot.interface_type,
                "checks": checks,
                "connected": checklist.passed(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => {
            println!("Client Status");
            println!("=============");
            println!();
            println!("Daemon responding: {}", snapshot.daemon_responding());
            println!("Management:        {}", connected_label(snapshot.management_connected));
            println!("Signal:            {}", connected_label(snapshot.signal_connected));
            println!(
                "Address:           {}",
                snapshot.assigned_address.as_deref().unwrap_or("-")
            );
            println!(
                "Interface:         {}",
                snapshot.interface_type.as_deref().unwrap_or("-")
            );
            println!();
            for check in VerificationCheck::ALL {
                println!("{} {}", mark(checklist.get(check), check.is_critical()), check);
            }
        }
    }

    if checklist.passed() {
        Ok(())
    } else {
        Err("Client is not connected".into())
    }
}

fn connected_label(connected: bool) -> &'static str {
    if connected { "Connected" } else { "Disconnected" }
}

fn mark(passed: bool, critical: bool) -> &'static str {
    match (passed, critical) {
        (true, _) => "[OK]",
        (false, true) => "[FAIL]",
        (false, false) => "[WARN]",
    }
}

async fn cmd_verify(ctx: &Context, timeout: Option<u64>, pre_login: bool) -> CmdResult {
    let pre_login = pre_login || ctx.profile.registration.pre_login;
    let default_timeout = if pre_login {
        ctx.config.timings.pre_login_timeout
    } else {
        ctx.config.timings.verification_timeout
    };
    let timeout = timeout.map(Duration::from_secs).unwrap_or(default_timeout);
    let poller = ctx.poller().await;

    let verified = if pre_login {
        poller.verify_pre_login(timeout).await
    } else {
        poller.verify_success(timeout).await
    };

    if verified {
        println!("[OK] Client verified");
        return Ok(());
    }

    let snapshot = poller.snapshot().await;
    println!("[FAIL] Client not verified within {}s", timeout.as_secs());
    if pre_login {
        let checklist = PreLoginChecklist::evaluate(&snapshot);
        println!("  Daemon responding: {}", checklist.daemon_responding);
        println!("  Connected:         {}", checklist.connected);
        println!("  No error messages: {}", checklist.no_error_messages);
    } else {
        for check in VerificationChecklist::evaluate(&snapshot).failing() {
            println!("  Failing: {}", check);
        }
    }
    Err("Verification failed".into())
}

async fn cmd_reset(cli: &Cli, ctx: &Context, full: bool) -> CmdResult {
    let target = if full {
        ctx.config.data_dir.clone()
    } else {
        ctx.config.config_file_path()
    };

    if cli.dry_run {
        println!("DRY RUN: Would reset client state");
        println!("  Mode:   {}", if full { "full" } else { "partial" });
        println!("  Target: {}", target.display());
        if full {
            println!("  Kept:   {}", ctx.config.log_dir_path().display());
        }
        return Ok(());
    }

    warn_if_not_elevated();
    let resetter = StateResetter::new(&ctx.config, Arc::new(WindowsServiceControl));
    let ok = resetter.reset(full).await;

    if let Some(log) = ctx.event_log()
        && let Err(e) = log.log_state_reset(full, ok)
    {
        tracing::warn!("Failed to record reset event: {}", e);
    }

    if ok {
        println!("[OK] Client state reset");
        Ok(())
    } else {
        println!("[FAIL] Client state reset incomplete");
        Err("Reset failed".into())
    }
}

async fn cmd_check(ctx: &Context) -> CmdResult {
    let probe = Arc::new(SystemNetworkProbe::new(&ctx.config, ctx.runner())?);
    let checker = NetworkPrerequisiteChecker::new(&ctx.config, probe);

    println!("Network Prerequisites");
    println!("=====================");
    println!();
    println!("Management: {}", ctx.config.management_url);
    println!();

    let result = checker.check_prerequisites_for(&ctx.config.management_url).await;
    for check in NetworkCheck::ALL {
        println!("{} {}", mark(result.get(check), check.is_critical()), check);
    }

    print!("Management endpoint... ");
    if checker.management_reachable(&ctx.config.management_url).await {
        println!("[OK]");
    } else {
        println!("[FAIL]");
    }

    match checker.free_disk_mb(&ctx.config.data_dir).await {
        Some(mb) if mb < ctx.config.min_free_disk_mb => {
            println!("[WARN] Low disk space: {} MB free", mb)
        }
        Some(mb) => println!("[OK] {} MB free", mb),
        None => println!("[WARN] Free disk space unknown"),
    }

    match checker.firewall_enabled().await {
        Some(true) => println!("[OK] Firewall enabled"),
        Some(false) => println!("[WARN] Firewall disabled"),
        None => println!("[WARN] Firewall state unknown"),
    }

    println!();
    for warning in &result.warnings {
        println!("Warning: {}", warning);
    }
    if result.passed() {
        println!("Network prerequisites met.");
        Ok(())
    } else {
        for issue in &result.blocking_issues {
            println!("Blocking: {}", issue);
        }
        Err("Network prerequisites not met".into())
    }
}

async fn cmd_release(ctx: &Context, version: Option<&str>) -> CmdResult {
    let target = version.or(ctx.profile.release.version.as_deref());
    let releases = ReleaseClient::new(&ctx.config)?;
    let release = releases.fetch_release(target).await;
    let installed = ctx.probe().probe().await;

    println!("Release:   {}", release.version.as_deref().unwrap_or("not found"));
    println!("Package:   {}", release.download_url.as_deref().unwrap_or("none"));
    println!("Installed: {}", installed.version.as_deref().unwrap_or("none"));

    if let (Some(current), Some(available)) = (installed.version.as_deref(), release.version.as_deref()) {
        if compare_versions(current, available) {
            println!("Update available.");
        } else {
            println!("Installed client is current.");
        }
    }

    if release.is_installable() {
        Ok(())
    } else {
        Err("No installable release found".into())
    }
}

fn cmd_config(cli: &Cli, action: &ConfigAction) -> CmdResult {
    match action {
        ConfigAction::Validate => {
            let mut loader = ConfigLoader::new().with_validate(false);
            if let Some(ref path) = cli.config {
                loader = loader.with_path(path);
            }

            println!("Validating profile...");
            let profile = match loader.load() {
                Ok(profile) => profile,
                Err(e) => {
                    println!("Failed to load profile:");
                    println!("  {}", e);
                    return Err("Failed to load profile".into());
                }
            };
            if let Err(e) = profile.validate() {
                println!("{}", e);
                return Err("Validation failed".into());
            }
            if let Err(e) = profile.setup_key() {
                println!("[WARN] {}", e);
            }

            println!("Profile is valid.");
            println!();
            println!("Summary:");
            println!("  Management URL: {}", profile.management.url);
            println!(
                "  Client version: {}",
                profile.release.version.as_deref().unwrap_or("latest")
            );
            println!("  Max retries:    {}", profile.registration.max_retries);
            println!("  Pre-login:      {}", profile.registration.pre_login);
        }
        ConfigAction::Show { format } => {
            let mut loader = ConfigLoader::new();
            if let Some(ref path) = cli.config {
                loader = loader.with_path(path);
            }
            let profile = loader.load()?;
            match format {
                ConfigFormat::Toml => println!("{}", profile.to_toml()?),
                ConfigFormat::Json => println!("{}", serde_json::to_string_pretty(&profile)?),
            }
        }
        ConfigAction::Init { output, force } => {
            let output_path = output
                .clone()
                .or_else(|| cli.config.clone())
                .unwrap_or_else(|| PathBuf::from("netbird-deploy.toml"));

            if output_path.exists() && !*force {
                return Err(format!(
                    "File already exists: {}. Use --force to overwrite.",
                    output_path.display()
                )
                .into());
            }

            if cli.dry_run {
                println!("DRY RUN: Would create profile");
                println!("  Path: {}", output_path.display());
                return Ok(());
            }

            write_default_config(&output_path)?;
            println!("[OK] Created {}", output_path.display());
        }
    }
    Ok(())
}
