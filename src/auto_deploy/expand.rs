// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! `${VAR}` expansion for profile values.

use regex::{Captures, Regex};
use std::sync::OnceLock;

fn placeholder() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"))
}

/// Replace `${NAME}` placeholders with machine values.
///
/// Recognized names:
///
/// - `${COMPUTERNAME}` - host name
/// - `${PROGRAMDATA}` - machine-wide data directory
/// - `${PROGRAMFILES}` - program install directory
/// - `${LOCALAPPDATA}` - per-user local data directory
/// - `${TEMP}` / `${TMP}` - temporary directory
/// - `${HOME}` / `${USERPROFILE}` - home directory
///
/// Any other name is looked up in the process environment. Placeholders
/// that resolve to nothing are left as written.
///
/// ```
/// use netbird_deploy::auto_deploy::expand_variables;
///
/// let key_file = expand_variables("${PROGRAMDATA}\\NetBird Deploy\\setup.key");
/// assert!(key_file.ends_with("setup.key"));
/// ```
pub fn expand_variables(input: &str) -> String {
    placeholder()
        .replace_all(input, |caps: &Captures<'_>| {
            resolve(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Returns true if `input` still contains an unresolved placeholder.
pub fn has_placeholders(input: &str) -> bool {
    placeholder().is_match(input)
}

fn resolve(name: &str) -> Option<String> {
    let value = match name.to_ascii_uppercase().as_str() {
        "COMPUTERNAME" => computer_name(),
        "PROGRAMDATA" => env("ProgramData").or_else(|| windows_default(r"C:\ProgramData")),
        "PROGRAMFILES" => env("ProgramFiles").or_else(|| windows_default(r"C:\Program Files")),
        "LOCALAPPDATA" => {
            env("LOCALAPPDATA").or_else(|| dirs::data_local_dir().map(|p| p.display().to_string()))
        }
        "TEMP" | "TMP" => Some(std::env::temp_dir().display().to_string()),
        "HOME" | "USERPROFILE" => dirs::home_dir().map(|p| p.display().to_string()),
        _ => None,
    };
    value.or_else(|| env(name))
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn computer_name() -> Option<String> {
    env("COMPUTERNAME").or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| h.split('.').next().unwrap_or_default().to_string())
            .filter(|h| !h.is_empty())
    })
}

fn windows_default(path: &str) -> Option<String> {
    cfg!(windows).then(|| path.to_string())
}
