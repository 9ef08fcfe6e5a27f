use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{ManagerError, Result};

/// Derive a catalog key from a display name.
///
/// Lowercases, collapses every run of non-alphanumeric characters into a
/// single `_` and trims the ends. A bare `/` becomes `root` so the root
/// mount of a dynamic disk sensor gets a stable key.
pub fn name_to_key(name: &str) -> Result<String> {
    if name == "/" {
        return Ok("root".to_string());
    }

    let mut key = String::with_capacity(name.len());
    let mut pending_separator = false;

    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !key.is_empty() {
                key.push('_');
            }
            pending_separator = false;
            key.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    if key.is_empty() {
        return Err(ManagerError::NameKey);
    }

    Ok(key)
}

/// Wall-clock seconds since the unix epoch.
pub fn timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_to_key_basic() {
        assert_eq!(name_to_key("Free Memory").unwrap(), "free_memory");
        assert_eq!(name_to_key("CPU Load").unwrap(), "cpu_load");
        assert_eq!(name_to_key("already_a_key").unwrap(), "already_a_key");
    }

    #[test]
    fn test_name_to_key_collapses_runs() {
        assert_eq!(name_to_key("a -- b").unwrap(), "a_b");
        assert_eq!(name_to_key("  padded  ").unwrap(), "padded");
        assert_eq!(name_to_key("/home").unwrap(), "home");
        assert_eq!(name_to_key("/var/log").unwrap(), "var_log");
    }

    #[test]
    fn test_name_to_key_root_mount() {
        assert_eq!(name_to_key("/").unwrap(), "root");
    }

    #[test]
    fn test_name_to_key_empty() {
        assert!(name_to_key("").is_err());
        assert!(name_to_key("---").is_err());
    }
}
