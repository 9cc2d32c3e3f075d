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

//! Windows Event Log sink for deployment milestones.
//!
//! Fleet tooling (Intune, RMM agents, SIEM forwarders) reads the Application
//! log, so installs, registrations and failures are recorded there under the
//! "NetBird Deploy" source in addition to the regular `tracing` output.
//!
//! # Event Categories
//!
//! - **1000-1099**: Informational (install completed, registration completed)
//! - **2000-2099**: Warnings (reboot required, retry scheduled)
//! - **3000-3099**: Errors (install failed, registration failed)
//! - **4000-4099**: Audit (client state reset)
//!
//! On platforms without an event log, events are forwarded to `tracing`.

use crate::error::Result;
use std::fmt;

#[cfg(windows)]
use crate::error::DeployError;

/// Event source name for the Windows Event Log.
pub const EVENT_SOURCE: &str = "NetBird Deploy";

/// Event ID constants, grouped by category range.
#[allow(non_snake_case)]
pub mod EventId {
    // Informational events (1000-1099)
    /// Deployment run started.
    pub const DEPLOY_STARTED: u32 = 1000;
    /// Client package installed.
    pub const INSTALL_COMPLETED: u32 = 1010;
    /// Client package updated.
    pub const UPDATE_COMPLETED: u32 = 1011;
    /// Client already at the requested version.
    pub const ALREADY_CURRENT: u32 = 1012;
    /// Registration started.
    pub const REGISTRATION_STARTED: u32 = 1020;
    /// Registration completed and verified.
    pub const REGISTRATION_COMPLETED: u32 = 1021;
    /// Migration to a new management endpoint completed.
    pub const MIGRATION_COMPLETED: u32 = 1030;

    // Warning events (2000-2099)
    /// Installer requested a reboot.
    pub const REBOOT_REQUIRED: u32 = 2000;
    /// Advisory network check failed.
    pub const NETWORK_ADVISORY: u32 = 2010;
    /// Registration attempt failed, retry scheduled.
    pub const REGISTRATION_RETRY: u32 = 2020;

    // Error events (3000-3099)
    /// Package installation failed.
    pub const INSTALL_FAILED: u32 = 3000;
    /// Registration failed.
    pub const REGISTRATION_FAILED: u32 = 3001;
    /// Network prerequisites failed.
    pub const NETWORK_UNAVAILABLE: u32 = 3010;

    // Audit events (4000-4099)
    /// Client state was reset.
    pub const STATE_RESET: u32 = 4000;
}

/// Event type/severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational event.
    Information,
    /// Warning event.
    Warning,
    /// Error event.
    Error,
    /// Audit success.
    AuditSuccess,
    /// Audit failure.
    AuditFailure,
}

impl EventType {
    /// Get the Windows event type value.
    #[cfg(windows)]
    pub fn to_windows_type(self) -> u16 {
        match self {
            Self::Information => 4,   // EVENTLOG_INFORMATION_TYPE
            Self::Warning => 2,       // EVENTLOG_WARNING_TYPE
            Self::Error => 1,         // EVENTLOG_ERROR_TYPE
            Self::AuditSuccess => 8,  // EVENTLOG_AUDIT_SUCCESS
            Self::AuditFailure => 16, // EVENTLOG_AUDIT_FAILURE
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Information => write!(f, "Information"),
            Self::Warning => write!(f, "Warning"),
            Self::Error => write!(f, "Error"),
            Self::AuditSuccess => write!(f, "Audit Success"),
            Self::AuditFailure => write!(f, "Audit Failure"),
        }
    }
}

/// Structured event data appended to the event description.
#[derive(Debug, Clone, Default)]
pub struct EventData {
    /// Client version involved.
    pub version: Option<String>,
    /// Management endpoint.
    pub management_url: Option<String>,
    /// Attempt number.
    pub attempt: Option<u32>,
    /// Error message or details.
    pub error_details: Option<String>,
    /// Additional context.
    pub context: Option<String>,
}

impl EventData {
    /// Event data carrying a client version.
    pub fn with_version(version: &str) -> Self {
        Self {
            version: Some(version.to_string()),
            ..Default::default()
        }
    }

    /// Event data for an error.
    pub fn with_error(error: &str, management_url: Option<&str>) -> Self {
        Self {
            error_details: Some(error.to_string()),
            management_url: management_url.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    /// Format as a multi-line string for event description.
    pub fn format_description(&self) -> String {
        let mut parts = Vec::new();

        if let Some(ref version) = self.version {
            parts.push(format!("Version: {}", version));
        }
        if let Some(ref url) = self.management_url {
            parts.push(format!("Management: {}", url));
        }
        if let Some(attempt) = self.attempt {
            parts.push(format!("Attempt: {}", attempt));
        }
        if let Some(ref err) = self.error_details {
            parts.push(format!("Details: {}", err));
        }
        if let Some(ref ctx) = self.context {
            parts.push(format!("Context: {}", ctx));
        }

        parts.join("\n")
    }
}

/// Windows Event Log handle.
pub struct EventLog {
    source: String,
    #[cfg(windows)]
    handle: windows::Win32::Foundation::HANDLE,
}

// SAFETY: an event source handle may be used from any thread; ReportEventW
// serializes internally and the handle is only closed in Drop.
#[cfg(windows)]
unsafe impl Send for EventLog {}
#[cfg(windows)]
unsafe impl Sync for EventLog {}

impl EventLog {
    /// Open the event log with the default source.
    pub fn open() -> Result<Self> {
        Self::open_source(EVENT_SOURCE)
    }

    /// Open the event log with a custom source.
    pub fn open_source(source: &str) -> Result<Self> {
        #[cfg(windows)]
        {
            use std::ffi::OsStr;
            use std::os::windows::ffi::OsStrExt;
            use windows::Win32::System::EventLog::RegisterEventSourceW;

            let wide_source: Vec<u16> = OsStr::new(source)
                .encode_wide()
                .chain(std::iter::once(0))
                .collect();

            let handle = unsafe {
                RegisterEventSourceW(
                    windows::core::PCWSTR::null(),
                    windows::core::PCWSTR(wide_source.as_ptr()),
                )
            };

            match handle {
                Ok(h) if !h.is_invalid() => Ok(Self {
                    source: source.to_string(),
                    handle: h,
                }),
                _ => Err(DeployError::platform(format!(
                    "Failed to register event source: {}",
                    source
                ))),
            }
        }

        #[cfg(not(windows))]
        {
            Ok(Self {
                source: source.to_string(),
            })
        }
    }

    /// Source name events are recorded under.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Log an event.
    pub fn log_event(
        &self,
        event_id: u32,
        event_type: EventType,
        message: &str,
        data: Option<&EventData>,
    ) -> Result<()> {
        #[cfg(windows)]
        {
            use std::ffi::OsStr;
            use std::os::windows::ffi::OsStrExt;
            use windows::Win32::System::EventLog::{REPORT_EVENT_TYPE, ReportEventW};

            let full_message = match data {
                Some(d) => format!("{}\n\n{}", message, d.format_description()),
                None => message.to_string(),
            };

            let wide_message: Vec<u16> = OsStr::new(&full_message)
                .encode_wide()
                .chain(std::iter::once(0))
                .collect();

            let strings = [windows::core::PCWSTR(wide_message.as_ptr())];

            let result = unsafe {
                ReportEventW(
                    self.handle,
                    REPORT_EVENT_TYPE(event_type.to_windows_type()),
                    0,
                    event_id,
                    None,
                    0,
                    Some(&strings),
                    None,
                )
            };

            result.map_err(|e| {
                DeployError::platform(format!("Failed to report event {}: {}", event_id, e))
            })
        }

        #[cfg(not(windows))]
        {
            let data_str = data.map(|d| d.format_description()).unwrap_or_default();

            match event_type {
                EventType::Error | EventType::AuditFailure => tracing::error!(
                    source = %self.source,
                    event_id = event_id,
                    event_type = %event_type,
                    data = %data_str,
                    "{}", message
                ),
                EventType::Warning => tracing::warn!(
                    source = %self.source,
                    event_id = event_id,
                    event_type = %event_type,
                    data = %data_str,
                    "{}", message
                ),
                _ => tracing::info!(
                    source = %self.source,
                    event_id = event_id,
                    event_type = %event_type,
                    data = %data_str,
                    "{}", message
                ),
            }

            Ok(())
        }
    }

    /// Log an informational event.
    pub fn log_info(&self, event_id: u32, message: &str, data: Option<&EventData>) -> Result<()> {
        self.log_event(event_id, EventType::Information, message, data)
    }

    /// Log a warning event.
    pub fn log_warning(
        &self,
        event_id: u32,
        message: &str,
        data: Option<&EventData>,
    ) -> Result<()> {
        self.log_event(event_id, EventType::Warning, message, data)
    }

    /// Log an error event.
    pub fn log_error(&self, event_id: u32, message: &str, data: Option<&EventData>) -> Result<()> {
        self.log_event(event_id, EventType::Error, message, data)
    }

    /// Log a completed install or update.
    pub fn log_installed(&self, version: &str, updated: bool) -> Result<()> {
        let (id, message) = if updated {
            (EventId::UPDATE_COMPLETED, "NetBird client updated")
        } else {
            (EventId::INSTALL_COMPLETED, "NetBird client installed")
        };
        self.log_info(id, message, Some(&EventData::with_version(version)))
    }

    /// Log a registration outcome.
    pub fn log_registration(&self, success: bool, management_url: &str, detail: &str) -> Result<()> {
        if success {
            let data = EventData {
                management_url: Some(management_url.to_string()),
                ..Default::default()
            };
            self.log_info(
                EventId::REGISTRATION_COMPLETED,
                "NetBird registration completed and verified",
                Some(&data),
            )
        } else {
            self.log_error(
                EventId::REGISTRATION_FAILED,
                "NetBird registration failed",
                Some(&EventData::with_error(detail, Some(management_url))),
            )
        }
    }

    /// Log a client state reset as an audit event.
    pub fn log_state_reset(&self, full: bool, success: bool) -> Result<()> {
        let message = if full {
            "NetBird client state fully reset"
        } else {
            "NetBird connection config reset"
        };
        let event_type = if success {
            EventType::AuditSuccess
        } else {
            EventType::AuditFailure
        };
        self.log_event(EventId::STATE_RESET, event_type, message, None)
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        #[cfg(windows)]
        {
            use windows::Win32::System::EventLog::DeregisterEventSource;
            unsafe {
                let _ = DeregisterEventSource(self.handle);
            }
        }
    }
}
