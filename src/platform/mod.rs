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

//! Windows platform adapters.
//!
//! Narrow wrappers over the OS facilities the deployment flow touches:
//!
//! - **Service control**: start, stop, and query the client service through
//!   the Service Control Manager ([`service`]).
//! - **Uninstall registry**: product entries in the native and WOW64 views
//!   ([`registry`]).
//! - **File metadata**: binary `FileVersion` resources ([`fileinfo`]).
//! - **Event Log**: deployment milestones in the Application log
//!   ([`eventlog`]).
//!
//! Every adapter compiles on all targets. Off Windows the SCM adapter
//! returns platform errors and the event log forwards to `tracing`, which
//! keeps the orchestration logic testable anywhere.

pub mod eventlog;
pub mod fileinfo;
pub mod registry;
pub mod service;

pub use eventlog::{EventData, EventId, EventLog, EventType};
pub use registry::{RegistryView, UninstallEntry, UninstallRegistry, WindowsUninstallRegistry};
pub use service::{ServiceControl, ServiceStatus, WindowsServiceControl};

/// Check if this code is running on a Windows system.
#[inline]
pub fn is_windows() -> bool {
    cfg!(windows)
}

/// Check if the current process has administrator privileges.
///
/// Installing packages, controlling services, and deleting client state all
/// require elevation.
#[cfg(windows)]
pub fn is_elevated() -> bool {
    use std::mem::MaybeUninit;
    use windows::Win32::Security::{
        GetTokenInformation, TOKEN_ELEVATION, TOKEN_QUERY, TokenElevation,
    };
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

    unsafe {
        let mut token = windows::Win32::Foundation::HANDLE::default();
        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token).is_err() {
            return false;
        }

        let mut elevation = MaybeUninit::<TOKEN_ELEVATION>::uninit();
        let mut size = 0u32;

        let result = GetTokenInformation(
            token,
            TokenElevation,
            Some(elevation.as_mut_ptr() as *mut _),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut size,
        );

        let _ = windows::Win32::Foundation::CloseHandle(token);

        result.is_ok() && elevation.assume_init().TokenIsElevated != 0
    }
}

/// Elevation cannot be determined off Windows; report not elevated.
#[cfg(not(windows))]
pub fn is_elevated() -> bool {
    false
}
