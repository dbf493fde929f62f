//! Flag/env/default resolution shared by the hub and agent binaries.

use std::env;
use std::path::PathBuf;

pub const ENV_SESSION_ID: &str = "COHORT_SESSION_ID";
pub const ENV_HUB_ADDR: &str = "COHORT_HUB_ADDR";
pub const ENV_HUB_URL: &str = "COHORT_HUB_URL";
pub const ENV_WORKSPACE: &str = "COHORT_WORKSPACE";
pub const ENV_LOG_DIR: &str = "COHORT_LOG_DIR";
pub const ENV_LOG_LEVEL: &str = "COHORT_LOG_LEVEL";

/// Directory (relative to the workspace) holding hub state and logs.
pub const STATE_DIR: &str = ".cohort";

pub fn parse_bool_env(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_true(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => parse_bool_env(&value).unwrap_or(false),
        Err(_) => false,
    }
}

/// Returns the first non-blank of flag, environment variable.
pub fn flag_or_env(flag: &str, key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

pub fn resolve_session_id(flag: &str) -> String {
    flag_or_env(flag, ENV_SESSION_ID).unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

pub fn derive_port(session_id: &str) -> u16 {
    let mut hash: u32 = 2166136261;
    for byte in session_id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    42000 + (hash % 2000) as u16
}

pub fn default_hub_addr(session_id: &str) -> String {
    format!("127.0.0.1:{}", derive_port(session_id))
}

pub fn resolve_addr(session_id: &str, addr_flag: &str) -> String {
    flag_or_env(addr_flag, ENV_HUB_ADDR).unwrap_or_else(|| default_hub_addr(session_id))
}

pub fn resolve_workspace(flag: &str) -> PathBuf {
    if let Some(value) = flag_or_env(flag, ENV_WORKSPACE) {
        return PathBuf::from(value);
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub fn resolve_log_dir(flag: &str) -> String {
    flag_or_env(flag, ENV_LOG_DIR).unwrap_or_else(|| format!("{STATE_DIR}/logs"))
}

/// Level used when `RUST_LOG` is not set.
pub fn resolve_log_level(debug: bool) -> String {
    if debug {
        return "debug".to_string();
    }
    flag_or_env("", ENV_LOG_LEVEL).unwrap_or_else(|| "info".to_string())
}
