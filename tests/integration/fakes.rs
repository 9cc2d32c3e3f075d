//! In-memory stand-ins for host facilities.

use async_trait::async_trait;
use netbird_deploy::cli::{ClientCli, CommandOutput, ProcessRunner};
use netbird_deploy::install::PackageInstaller;
use netbird_deploy::network::NetworkProbe;
use netbird_deploy::platform::{ServiceControl, ServiceStatus};
use netbird_deploy::{DeployError, Result};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use url::Url;

/// Status output of a fully connected peer.
pub const CONNECTED: &str = "Daemon version: 0.29.0\nCLI version: 0.29.0\n\
                             Management: Connected\nSignal: Connected\n\
                             NetBird IP: 100.64.0.17/16\nInterface type: Kernel\n";

/// Status output of a daemon that has not joined yet.
pub const DISCONNECTED: &str = "Management: Disconnected\nSignal: Disconnected\n\
                                NetBird IP: N/A\nInterface type: N/A\n";

/// Client CLI that replays scripted `up` results.
///
/// Once an `up` call succeeds, `status` reports a connected peer.
pub struct ScriptedClient {
    up_results: Mutex<Vec<CommandOutput>>,
    status: Mutex<CommandOutput>,
    up_calls: AtomicU32,
    keys: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(up_results: Vec<CommandOutput>) -> Self {
        Self {
            up_results: Mutex::new(up_results),
            status: Mutex::new(CommandOutput::new(1, DISCONNECTED, "")),
            up_calls: AtomicU32::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn up_calls(&self) -> u32 {
        self.up_calls.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientCli for ScriptedClient {
    async fn up(&self, setup_key: &str, _management_url: Option<&Url>) -> Result<CommandOutput> {
        self.up_calls.fetch_add(1, Ordering::SeqCst);
        self.keys.lock().unwrap().push(setup_key.to_string());

        let mut results = self.up_results.lock().unwrap();
        let output = if results.len() > 1 {
            results.remove(0)
        } else {
            results[0].clone()
        };
        if output.success() {
            *self.status.lock().unwrap() = CommandOutput::new(0, CONNECTED, "");
        }
        Ok(output)
    }

    async fn down(&self) -> Result<CommandOutput> {
        Ok(CommandOutput::new(0, "Disconnected", ""))
    }

    async fn status(&self, _detail: bool, _json: bool) -> Result<CommandOutput> {
        Ok(self.status.lock().unwrap().clone())
    }
}

/// Process runner for a client installed at one path only.
///
/// Launching any other program fails the way a missing executable does.
/// `up` always joins; afterwards `status` reports a connected peer.
pub struct InstalledClient {
    executable: PathBuf,
    joined: AtomicBool,
    launches: Mutex<Vec<PathBuf>>,
}

impl InstalledClient {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            joined: AtomicBool::new(false),
            launches: Mutex::new(Vec::new()),
        }
    }

    /// Every program the runner was asked to start.
    pub fn launches(&self) -> Vec<PathBuf> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for InstalledClient {
    async fn run(&self, program: &Path, args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        self.launches.lock().unwrap().push(program.to_path_buf());
        if program != self.executable {
            return Err(DeployError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("program not found: {}", program.display()),
            )));
        }

        match args.first().map(String::as_str) {
            Some("up") => {
                self.joined.store(true, Ordering::SeqCst);
                Ok(CommandOutput::new(0, "Connected", ""))
            }
            Some("status") if self.joined.load(Ordering::SeqCst) => {
                Ok(CommandOutput::new(0, CONNECTED, ""))
            }
            Some("status") => Ok(CommandOutput::new(1, DISCONNECTED, "")),
            _ => Ok(CommandOutput::new(0, "", "")),
        }
    }
}

/// Service manager that records calls and always reaches the requested state.
#[derive(Default)]
pub struct RecordingServices {
    state: Mutex<Option<ServiceStatus>>,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingServices {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceControl for RecordingServices {
    async fn status(&self, _name: &str) -> Result<ServiceStatus> {
        Ok(self.state.lock().unwrap().unwrap_or(ServiceStatus::Running))
    }

    async fn start(&self, _name: &str) -> Result<()> {
        self.calls.lock().unwrap().push("start");
        *self.state.lock().unwrap() = Some(ServiceStatus::Running);
        Ok(())
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        self.calls.lock().unwrap().push("stop");
        *self.state.lock().unwrap() = Some(ServiceStatus::Stopped);
        Ok(())
    }

    async fn binary_path(&self, _name: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Network probe with a healthy host by default.
pub struct StaticNetwork {
    pub online: bool,
    pub management_reachable: bool,
}

impl Default for StaticNetwork {
    fn default() -> Self {
        Self {
            online: true,
            management_reachable: true,
        }
    }
}

#[async_trait]
impl NetworkProbe for StaticNetwork {
    async fn active_adapter(&self) -> Result<bool> {
        Ok(self.online)
    }
    async fn default_gateway(&self) -> Result<bool> {
        Ok(self.online)
    }
    async fn dns_servers_configured(&self) -> Result<bool> {
        Ok(self.online)
    }
    async fn resolves(&self, _host: &str) -> Result<bool> {
        Ok(self.online)
    }
    async fn internet_reachable(&self) -> Result<bool> {
        Ok(self.online)
    }
    async fn clock_skew_seconds(&self) -> Result<Option<i64>> {
        Ok(Some(2))
    }
    async fn proxy_configured(&self) -> Result<bool> {
        Ok(false)
    }
    async fn tcp_reachable(&self, _host: &str, _port: u16, _timeout: Duration) -> Result<bool> {
        Ok(self.online)
    }
    async fn https_reachable(&self, _url: &Url) -> Result<bool> {
        Ok(self.management_reachable)
    }
    async fn free_disk_mb(&self, _path: &Path) -> Result<Option<u64>> {
        Ok(Some(20_000))
    }
    async fn firewall_enabled(&self) -> Result<Option<bool>> {
        Err(DeployError::platform("firewall query unsupported"))
    }
}

/// A machine with (optionally) the client installed.
///
/// Answers version queries for the client executable and acts as the package
/// installer, dropping a new executable on success.
pub struct FakeMachine {
    executable: PathBuf,
    version: Mutex<Option<String>>,
    next_version: String,
    installer_exit_code: i32,
    packages: Mutex<Vec<u64>>,
}

impl FakeMachine {
    pub fn new(executable: PathBuf, installed: Option<&str>, next_version: &str) -> Self {
        if installed.is_some() {
            std::fs::write(&executable, b"MZ").unwrap();
        }
        Self {
            executable,
            version: Mutex::new(installed.map(str::to_string)),
            next_version: next_version.to_string(),
            installer_exit_code: 0,
            packages: Mutex::new(Vec::new()),
        }
    }

    pub fn with_installer_exit_code(mut self, code: i32) -> Self {
        self.installer_exit_code = code;
        self
    }

    /// Sizes of the packages handed to the installer.
    pub fn installed_packages(&self) -> Vec<u64> {
        self.packages.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessRunner for FakeMachine {
    async fn run(&self, program: &Path, _args: &[String], _timeout: Duration) -> Result<CommandOutput> {
        if program == self.executable
            && let Some(version) = self.version.lock().unwrap().clone()
        {
            return Ok(CommandOutput::new(0, version, ""));
        }
        Ok(CommandOutput::new(1, "", "not found"))
    }
}

#[async_trait]
impl PackageInstaller for FakeMachine {
    async fn install(&self, package: &Path) -> Result<i32> {
        let size = std::fs::metadata(package)?.len();
        self.packages.lock().unwrap().push(size);

        if matches!(self.installer_exit_code, 0 | 3010) {
            std::fs::write(&self.executable, b"MZ")?;
            *self.version.lock().unwrap() = Some(self.next_version.clone());
        }
        Ok(self.installer_exit_code)
    }
}
