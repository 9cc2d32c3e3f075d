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

//! Logging setup for deployment runs.
//!
//! All components log through `tracing` with a `source` field naming the
//! component. This module installs the subscriber:
//!
//! - Stdout or a size-rotated log file
//! - Plain text or JSON lines
//! - `RUST_LOG` overrides the configured level
//!
//! # Configuration
//!
//! ```toml
//! [logging]
//! level = "info"
//! path = "C:\\ProgramData\\NetBird Deploy\\logs\\deploy.log"
//! json_format = false
//! max_size_mb = 10
//! max_files = 5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use netbird_deploy::logging::{LogConfig, LogLevel, init_logging};
//!
//! let config = LogConfig::file("C:\\ProgramData\\NetBird Deploy\\logs\\deploy.log")
//!     .with_level(LogLevel::Debug);
//! init_logging(&config)?;
//! # Ok::<(), netbird_deploy::DeployError>(())
//! ```

use crate::error::{DeployError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Log level for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Most verbose - all messages.
    Trace = 0,
    /// Debug information.
    Debug = 1,
    /// Informational messages.
    #[default]
    Info = 2,
    /// Warnings.
    Warn = 3,
    /// Errors only.
    Error = 4,
}

impl LogLevel {
    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Get the level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    /// Equivalent `tracing` level.
    pub fn to_tracing(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level to output.
    pub level: LogLevel,
    /// Path to log file (None for stdout).
    pub path: Option<PathBuf>,
    /// Use JSON format for log entries.
    pub json_format: bool,
    /// Maximum log file size in bytes before rotation.
    pub max_size_bytes: u64,
    /// Maximum number of rotated log files to keep.
    pub max_files: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            path: None,
            json_format: false,
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}

impl LogConfig {
    /// Create a new config for file logging.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    /// Create a new config for stdout logging.
    pub fn stdout() -> Self {
        Self::default()
    }

    /// Set the log level.
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    /// Enable JSON format.
    pub fn with_json(mut self) -> Self {
        self.json_format = true;
        self
    }

    /// Set max file size (in MB).
    pub fn with_max_size_mb(mut self, mb: u64) -> Self {
        self.max_size_bytes = mb * 1024 * 1024;
        self
    }

    /// Set max rotated files.
    pub fn with_max_files(mut self, count: u32) -> Self {
        self.max_files = count;
        self
    }
}

struct RotatingFile {
    path: PathBuf,
    file: File,
    current_size: u64,
    max_size_bytes: u64,
    max_files: u32,
}

impl RotatingFile {
    fn rotate(&mut self) -> io::Result<()> {
        let oldest = rotated_name(&self.path, self.max_files);
        let _ = fs::remove_file(&oldest);

        for i in (1..self.max_files).rev() {
            let _ = fs::rename(rotated_name(&self.path, i), rotated_name(&self.path, i + 1));
        }

        if self.max_files > 0 {
            fs::rename(&self.path, rotated_name(&self.path, 1))?;
        }

        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.current_size = 0;
        Ok(())
    }
}

fn rotated_name(path: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), index))
}

/// Size-rotated log file usable as a `tracing-subscriber` writer.
///
/// When a write would push the file past `max_size_bytes`, the file is
/// renamed to `<path>.1`, older rotations shift up by one, and anything past
/// `<path>.<max_files>` is removed.
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

impl RotatingFileWriter {
    /// Open (or create) the log file, creating parent directories.
    pub fn open(path: impl AsRef<Path>, max_size_bytes: u64, max_files: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(DeployError::Io)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(DeployError::Io)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile {
                path,
                file,
                current_size,
                max_size_bytes,
                max_files,
            })),
        })
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;

        if inner.current_size > 0
            && inner.current_size + buf.len() as u64 > inner.max_size_bytes
        {
            inner.rotate()?;
        }

        inner.file.write_all(buf)?;
        inner.current_size += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| io::Error::other("log writer lock poisoned"))?;
        inner.file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Install the global `tracing` subscriber described by `config`.
///
/// `RUST_LOG`, when set, replaces the configured level.
///
/// # Errors
///
/// Returns an error if the log file cannot be opened or a global subscriber
/// is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_lowercase()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = match (&config.path, config.json_format) {
        (Some(path), json) => {
            let writer =
                RotatingFileWriter::open(path, config.max_size_bytes, config.max_files)?;
            let builder = builder.with_writer(writer).with_ansi(false);
            if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            }
        }
        (None, true) => builder.json().try_init(),
        (None, false) => builder.try_init(),
    };

    result.map_err(|e| DeployError::config(format!("Failed to install log subscriber: {e}")))
}
