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

//! Join failure classification and the recovery table.
//!
//! Both halves are data: [`CLASSIFICATION_RULES`] maps stderr phrases to an
//! [`ErrorCategory`] in priority order, and [`RECOVERY_TABLE`] maps a
//! category and its 1-based attempt counter to a [`RecoveryAction`].
//!
//! | Category | 1 | 2 | 3 | 4+ |
//! |---|---|---|---|---|
//! | DeadlineExceeded | wait 30s | partial reset, 30s | full reset, 45s | give up |
//! | ConnectionRefused | wait 30s | restart service, 15s | full reset, 45s | give up |
//! | VerificationFailed | wait and verify, 45s | partial reset, 30s | full reset, 45s | give up |
//! | InvalidSetupKey | give up | | | |
//! | NetworkError | wait 60s | test connectivity, 30s | give up | give up |
//! | other | wait 30s | wait 30s | wait 30s | wait 30s |

use std::fmt;

/// Why a join attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The management call timed out.
    DeadlineExceeded,
    /// The daemon or management endpoint refused the connection.
    ConnectionRefused,
    /// Generic transport failure.
    NetworkError,
    /// The setup key was rejected.
    InvalidSetupKey,
    /// The join command succeeded but the peer never came up.
    VerificationFailed,
    /// Anything else.
    Unknown,
}

impl ErrorCategory {
    /// Returns the category name as shown in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::ConnectionRefused => "ConnectionRefused",
            Self::NetworkError => "NetworkError",
            Self::InvalidSetupKey => "InvalidSetupKey",
            Self::VerificationFailed => "VerificationFailed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stderr phrases and the category they indicate, highest priority first.
///
/// Matching is case-insensitive substring search. The setup key rules come
/// first because the management server wraps key rejections in RPC errors
/// that also mention transport details.
pub const CLASSIFICATION_RULES: &[(&str, ErrorCategory)] = &[
    ("invalid setup key", ErrorCategory::InvalidSetupKey),
    ("setup key is invalid", ErrorCategory::InvalidSetupKey),
    ("setup key expired", ErrorCategory::InvalidSetupKey),
    ("setup key usage limit", ErrorCategory::InvalidSetupKey),
    ("permissiondenied", ErrorCategory::InvalidSetupKey),
    ("deadline exceeded", ErrorCategory::DeadlineExceeded),
    ("deadlineexceeded", ErrorCategory::DeadlineExceeded),
    ("connection refused", ErrorCategory::ConnectionRefused),
    ("no such host", ErrorCategory::NetworkError),
    ("network is unreachable", ErrorCategory::NetworkError),
    ("i/o timeout", ErrorCategory::NetworkError),
    ("connection reset", ErrorCategory::NetworkError),
    ("tls handshake", ErrorCategory::NetworkError),
    ("unavailable", ErrorCategory::NetworkError),
    ("dial tcp", ErrorCategory::NetworkError),
];

/// Classify join command output.
pub fn classify(output: &str) -> ErrorCategory {
    let lower = output.to_lowercase();
    CLASSIFICATION_RULES
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// What to do between two join attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryKind {
    /// Sleep and retry.
    WaitLonger,
    /// Delete the connection config and restart the service.
    PartialReset,
    /// Delete all client state except logs and restart the service.
    FullReset,
    /// Restart the client service.
    RestartService,
    /// Wait for the daemon to answer status queries.
    WaitAndVerify,
    /// Re-run the network prerequisite battery.
    TestConnectivity,
    /// Give up.
    None,
}

/// A recovery step looked up from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    /// Action to perform.
    pub kind: RecoveryKind,
    /// Human-readable description for logs.
    pub description: String,
    /// Seconds to sleep after the action.
    pub wait_seconds: u64,
}

impl RecoveryAction {
    /// Returns true if this action ends the attempt loop.
    pub fn gives_up(&self) -> bool {
        self.kind == RecoveryKind::None
    }
}

/// One cell of [`RECOVERY_TABLE`].
#[derive(Debug, Clone, Copy)]
pub struct RecoveryStep {
    /// Action to take.
    pub kind: RecoveryKind,
    /// Log text for the action.
    pub description: &'static str,
    /// Delay before the next attempt.
    pub wait_seconds: u64,
}

const fn step(kind: RecoveryKind, description: &'static str, wait_seconds: u64) -> RecoveryStep {
    RecoveryStep {
        kind,
        description,
        wait_seconds,
    }
}

const GIVE_UP: RecoveryStep = step(RecoveryKind::None, "Giving up", 0);

/// Applied to categories without a row.
pub const DEFAULT_STEP: RecoveryStep =
    step(RecoveryKind::WaitLonger, "Waiting before retry", 30);

/// Recovery steps per category; the last step of a row covers later attempts.
pub const RECOVERY_TABLE: &[(ErrorCategory, &[RecoveryStep])] = &[
    (
        ErrorCategory::DeadlineExceeded,
        &[
            step(RecoveryKind::WaitLonger, "Waiting for management to respond", 30),
            step(RecoveryKind::PartialReset, "Clearing connection config", 30),
            step(RecoveryKind::FullReset, "Clearing all client state", 45),
            GIVE_UP,
        ],
    ),
    (
        ErrorCategory::ConnectionRefused,
        &[
            step(RecoveryKind::WaitLonger, "Waiting for daemon to accept connections", 30),
            step(RecoveryKind::RestartService, "Restarting client service", 15),
            step(RecoveryKind::FullReset, "Clearing all client state", 45),
            GIVE_UP,
        ],
    ),
    (
        ErrorCategory::VerificationFailed,
        &[
            step(RecoveryKind::WaitAndVerify, "Waiting for daemon and re-verifying", 45),
            step(RecoveryKind::PartialReset, "Clearing connection config", 30),
            step(RecoveryKind::FullReset, "Clearing all client state", 45),
            step(RecoveryKind::None, "Manual intervention required", 0),
        ],
    ),
    (ErrorCategory::InvalidSetupKey, &[step(RecoveryKind::None, "Setup key rejected", 0)]),
    (
        ErrorCategory::NetworkError,
        &[
            step(RecoveryKind::WaitLonger, "Waiting for network", 60),
            step(RecoveryKind::TestConnectivity, "Re-testing connectivity", 30),
            GIVE_UP,
        ],
    ),
];

/// Look up the recovery action for a category's `attempt`-th failure (1-based).
pub fn recovery_action(category: ErrorCategory, attempt: u32) -> RecoveryAction {
    let row = RECOVERY_TABLE
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, steps)| *steps);

    let step = match row {
        Some(steps) if !steps.is_empty() => {
            let index = (attempt.max(1) as usize - 1).min(steps.len() - 1);
            steps[index]
        }
        _ => DEFAULT_STEP,
    };

    RecoveryAction {
        kind: step.kind,
        description: step.description.to_string(),
        wait_seconds: step.wait_seconds,
    }
}
