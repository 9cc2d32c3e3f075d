// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Binary file-version metadata and PowerShell helpers.

use std::path::Path;
use std::time::Duration;

use crate::cli::{CommandOutput, ProcessRunner};
use crate::error::Result;

/// Run a PowerShell script non-interactively.
pub async fn run_powershell(
    runner: &dyn ProcessRunner,
    script: &str,
    timeout: Duration,
) -> Result<CommandOutput> {
    let args = vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
        script.to_string(),
    ];
    runner.run(Path::new("powershell"), &args, timeout).await
}

/// Quote a value as a PowerShell single-quoted literal.
pub fn ps_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Read the `FileVersion` resource of a binary.
///
/// Returns `None` when the file has no version resource.
pub async fn file_version(runner: &dyn ProcessRunner, path: &Path) -> Result<Option<String>> {
    let script = format!(
        "(Get-Item -LiteralPath {}).VersionInfo.FileVersion",
        ps_literal(&path.to_string_lossy())
    );
    let output = run_powershell(runner, &script, Duration::from_secs(30)).await?;
    if !output.success() {
        return Ok(None);
    }
    Ok(normalize_file_version(&output.stdout))
}

/// Trim a `FileVersion` string down to its dotted-numeric prefix.
///
/// Windows version resources often read `0.28.4.0` or `0.28.4 (build abc)`.
pub fn normalize_file_version(raw: &str) -> Option<String> {
    let token = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let numeric: String = token
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let numeric = numeric.trim_end_matches('.');
    if numeric.is_empty() || !numeric.contains('.') {
        return None;
    }

    let mut parts: Vec<&str> = numeric.split('.').collect();
    while parts.len() > 3 && parts.last() == Some(&"0") {
        parts.pop();
    }
    Some(parts.join("."))
}
