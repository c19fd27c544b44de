//! System resource checks run before creating large memory regions.
//!
//! Region creation does not verify available memory by itself; a failed
//! huge allocation surfaces much later as a crash. Callers list resources
//! to verify up front: filesystem paths (free space via `statvfs`-style
//! queries) and `/proc/meminfo` keys such as `MemFree` or `MemAvailable`.

use std::fs;
use std::path::Path;

use thiserror::Error;

/// Errors from resource verification.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Stats for the resource could not be obtained.
    #[error("can not get stats for {resource}")]
    Unavailable {
        /// Resource as written in the configuration.
        resource: String,
    },

    /// Not enough space on the resource.
    #[error("not enough space on {resource}: {free} bytes free, {required} required")]
    Insufficient {
        /// Resource as written in the configuration.
        resource: String,
        /// Free bytes reported.
        free: u64,
        /// Bytes required.
        required: u64,
    },
}

/// Free bytes on the filesystem containing `path`.
pub fn filesystem_free_bytes(path: &Path) -> Option<u64> {
    // fs4-style statvfs without an extra dependency: /proc exposes
    // nothing useful here, so go through libc statvfs directly.
    let c_path = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated path, st is a zeroed
    // out-parameter of the correct type.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
    if rc != 0 {
        return None;
    }
    Some(st.f_bavail as u64 * st.f_frsize as u64)
}

/// Free bytes reported by `/proc/meminfo` for `keyword` (e.g. `MemFree`).
pub fn meminfo_free_bytes(keyword: &str) -> Option<u64> {
    if !is_simple_keyword(keyword) {
        return None;
    }
    let content = fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        let Some(rest) = line.strip_prefix(keyword) else {
            continue;
        };
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let mut it = rest.split_whitespace();
        let value: u64 = it.next()?.parse().ok()?;
        // meminfo values are in kB
        return Some(value * 1024);
    }
    None
}

/// Keywords are restricted to letters, digits, parentheses and
/// underscores before touching /proc.
fn is_simple_keyword(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '(' || c == ')' || c == '_')
}

/// Verify every resource in a comma-separated list can hold `required`
/// bytes. Entries containing `/` are filesystem paths, everything else a
/// meminfo keyword. Returns the first failure.
pub fn check_resources(list: &str, required: u64) -> Result<(), ResourceError> {
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let free = if entry.contains('/') {
            filesystem_free_bytes(Path::new(entry))
        } else {
            meminfo_free_bytes(entry)
        };
        match free {
            None => {
                return Err(ResourceError::Unavailable {
                    resource: entry.to_string(),
                })
            }
            Some(free) if free < required => {
                return Err(ResourceError::Insufficient {
                    resource: entry.to_string(),
                    free,
                    required,
                });
            }
            Some(free) => {
                tracing::info!(resource = entry, free_bytes = free, "resource check passed");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_memtotal_is_readable() {
        // MemTotal is always present on Linux.
        let total = meminfo_free_bytes("MemTotal");
        assert!(total.is_some());
        assert!(total.unwrap() > 0);
    }

    #[test]
    fn suspicious_keyword_is_rejected() {
        assert!(meminfo_free_bytes("../etc/passwd").is_none());
        assert!(meminfo_free_bytes("").is_none());
    }

    #[test]
    fn filesystem_root_has_stats() {
        assert!(filesystem_free_bytes(Path::new("/")).is_some());
    }

    #[test]
    fn empty_list_passes() {
        assert!(check_resources("", 1 << 40).is_ok());
        assert!(check_resources(" , ", 1 << 40).is_ok());
    }

    #[test]
    fn huge_requirement_fails() {
        // No machine running this suite has an exabyte free anywhere.
        assert!(check_resources("/", 1 << 60).is_err());
    }
}
