// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Uninstall registry enumeration.
//!
//! Product entries live under `HKLM\...\CurrentVersion\Uninstall` in both
//! the native (64-bit) and WOW64 (32-bit) registry views. They are read with
//! the registry API; off Windows the adapter reports no entries.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;

/// Uninstall key path under `HKEY_LOCAL_MACHINE`.
pub const UNINSTALL_KEY: &str = r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall";

/// Registry view to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryView {
    /// 64-bit view.
    Native,
    /// 32-bit view on 64-bit Windows.
    Wow64,
}

/// One product entry from the uninstall registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UninstallEntry {
    /// Full registry key of the entry.
    pub key: String,
    /// `DisplayName` value.
    pub display_name: Option<String>,
    /// `DisplayVersion` value.
    pub display_version: Option<String>,
    /// `InstallLocation` value.
    pub install_location: Option<PathBuf>,
}

impl UninstallEntry {
    /// Returns true if the display name contains `product` (case-insensitive).
    pub fn matches_product(&self, product: &str) -> bool {
        let product = product.to_lowercase();
        self.display_name
            .as_deref()
            .is_some_and(|name| name.to_lowercase().contains(&product))
    }

    /// Executable expected under the install location.
    pub fn executable(&self, file_name: &str) -> Option<PathBuf> {
        self.install_location
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.join(file_name))
    }
}

/// Normalize a raw `InstallLocation` value.
///
/// Installers write it quoted, with a trailing separator, or empty.
pub fn clean_install_location(raw: &str) -> Option<PathBuf> {
    let cleaned = raw.trim().trim_matches('"').trim_end_matches(['\\', '/']);
    if cleaned.is_empty() {
        None
    } else {
        Some(PathBuf::from(cleaned))
    }
}

/// Source of uninstall registry entries.
#[async_trait]
pub trait UninstallRegistry: Send + Sync {
    /// All entries in one view. A missing uninstall key yields an empty list.
    async fn entries(&self, view: RegistryView) -> Result<Vec<UninstallEntry>>;
}

/// Find the first entry for `product` in the native view, then the WOW64 view.
pub async fn find_product(
    registry: &dyn UninstallRegistry,
    product: &str,
) -> Result<Option<UninstallEntry>> {
    for view in [RegistryView::Native, RegistryView::Wow64] {
        let entries = registry.entries(view).await?;
        if let Some(entry) = entries.into_iter().find(|e| e.matches_product(product)) {
            tracing::debug!(source = "registry", ?view, key = %entry.key, "Uninstall entry found");
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// [`UninstallRegistry`] over the local machine hive.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowsUninstallRegistry;

#[cfg(windows)]
mod native {
    use super::{RegistryView, UNINSTALL_KEY, UninstallEntry, clean_install_location};
    use crate::error::{DeployError, Result};
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_NO_MORE_ITEMS, ERROR_SUCCESS};
    use windows::Win32::System::Registry::{
        HKEY, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WOW64_32KEY, KEY_WOW64_64KEY, REG_SAM_FLAGS,
        RRF_RT_REG_SZ, RegCloseKey, RegEnumKeyExW, RegGetValueW, RegOpenKeyExW,
    };
    use windows::core::{PCWSTR, PWSTR};

    fn wstr(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    fn sam_flag(view: RegistryView) -> REG_SAM_FLAGS {
        match view {
            RegistryView::Native => KEY_WOW64_64KEY,
            RegistryView::Wow64 => KEY_WOW64_32KEY,
        }
    }

    struct KeyGuard(HKEY);

    impl Drop for KeyGuard {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.0);
            }
        }
    }

    fn enumerate_subkeys(hkey: HKEY) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut index = 0u32;
        loop {
            let mut buf = [0u16; 256];
            let mut len = buf.len() as u32;
            let status = unsafe {
                RegEnumKeyExW(
                    hkey,
                    index,
                    PWSTR(buf.as_mut_ptr()),
                    &mut len,
                    None,
                    PWSTR::null(),
                    None,
                    None,
                )
            };
            if status == ERROR_NO_MORE_ITEMS {
                break;
            }
            if status != ERROR_SUCCESS {
                return Err(DeployError::platform(format!(
                    "RegEnumKeyExW failed: status={}",
                    status.0
                )));
            }
            if len > 0 {
                names.push(String::from_utf16_lossy(&buf[..len as usize]));
            }
            index += 1;
        }
        Ok(names)
    }

    /// Read a string value from `subkey`; absent or non-string values are `None`.
    fn read_string(root: HKEY, subkey: &str, name: &str) -> Option<String> {
        let subkey_w = wstr(subkey);
        let name_w = wstr(name);
        unsafe {
            let mut size_bytes = 0u32;
            let status = RegGetValueW(
                root,
                PCWSTR(subkey_w.as_ptr()),
                PCWSTR(name_w.as_ptr()),
                RRF_RT_REG_SZ,
                None,
                None,
                Some(&mut size_bytes),
            );
            if status != ERROR_SUCCESS || size_bytes < 2 {
                return None;
            }

            let mut buffer = vec![0u16; (size_bytes as usize).div_ceil(2)];
            let status = RegGetValueW(
                root,
                PCWSTR(subkey_w.as_ptr()),
                PCWSTR(name_w.as_ptr()),
                RRF_RT_REG_SZ,
                None,
                Some(buffer.as_mut_ptr() as *mut _),
                Some(&mut size_bytes),
            );
            if status != ERROR_SUCCESS {
                return None;
            }
            buffer.truncate(size_bytes as usize / 2);
            while buffer.last() == Some(&0) {
                buffer.pop();
            }
            let value = String::from_utf16_lossy(&buffer);
            (!value.trim().is_empty()).then(|| value.trim().to_string())
        }
    }

    pub fn read_view(view: RegistryView) -> Result<Vec<UninstallEntry>> {
        let path = wstr(UNINSTALL_KEY);
        let mut root = HKEY::default();
        let status = unsafe {
            RegOpenKeyExW(
                HKEY_LOCAL_MACHINE,
                PCWSTR(path.as_ptr()),
                0,
                KEY_READ | sam_flag(view),
                &mut root,
            )
        };
        if status == ERROR_FILE_NOT_FOUND {
            return Ok(Vec::new());
        }
        if status != ERROR_SUCCESS {
            return Err(DeployError::platform(format!(
                "RegOpenKeyExW failed for uninstall key: status={}",
                status.0
            )));
        }
        let root = KeyGuard(root);

        let entries = enumerate_subkeys(root.0)?
            .into_iter()
            .map(|name| UninstallEntry {
                key: format!(r"HKEY_LOCAL_MACHINE\{}\{}", UNINSTALL_KEY, name),
                display_name: read_string(root.0, &name, "DisplayName"),
                display_version: read_string(root.0, &name, "DisplayVersion"),
                install_location: read_string(root.0, &name, "InstallLocation")
                    .and_then(|v| clean_install_location(&v)),
            })
            .collect();
        Ok(entries)
    }
}

#[cfg(windows)]
#[async_trait]
impl UninstallRegistry for WindowsUninstallRegistry {
    async fn entries(&self, view: RegistryView) -> Result<Vec<UninstallEntry>> {
        tokio::task::spawn_blocking(move || native::read_view(view))
            .await
            .map_err(|e| crate::error::DeployError::platform(format!("Registry task failed: {}", e)))?
    }
}

#[cfg(not(windows))]
#[async_trait]
impl UninstallRegistry for WindowsUninstallRegistry {
    async fn entries(&self, _view: RegistryView) -> Result<Vec<UninstallEntry>> {
        Ok(Vec::new())
    }
}
