//! Default paths for rollcalld components
//!
//! Paths are user-writable by default (no root required):
//! - Config: `$XDG_CONFIG_HOME/rollcall/config.toml` or `~/.config/rollcall/config.toml`
//! - Socket: `$XDG_RUNTIME_DIR/rollcalld/rollcalld.sock` or `/tmp/rollcalld-$USER/rollcalld.sock`
//! - Data: `$XDG_DATA_HOME/rollcalld` or `~/.local/share/rollcalld`
//! - Logs: `$XDG_STATE_HOME/rollcalld` or `~/.local/state/rollcalld`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const ROLLCALL_SOCKET_ENV: &str = "ROLLCALL_SOCKET";

/// Environment variable for overriding the data directory
pub const ROLLCALL_DATA_DIR_ENV: &str = "ROLLCALL_DATA_DIR";

const SOCKET_FILENAME: &str = "rollcalld.sock";
const APP_DIR: &str = "rollcalld";
const CONFIG_DIR: &str = "rollcall";

fn home_join(parts: &[&str]) -> Option<PathBuf> {
    let home = std::env::var("HOME").ok()?;
    let mut path = PathBuf::from(home);
    for part in parts {
        path.push(part);
    }
    Some(path)
}

/// Default configuration file location.
pub fn default_config_path() -> PathBuf {
    let dir = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| home_join(&[".config"]))
        .unwrap_or_else(|| PathBuf::from("/etc"));
    dir.join(CONFIG_DIR).join("config.toml")
}

/// Get the default socket path.
///
/// Order of precedence:
/// 1. `$ROLLCALL_SOCKET`
/// 2. `$XDG_RUNTIME_DIR/rollcalld/rollcalld.sock`
/// 3. `/tmp/rollcalld-$USER/rollcalld.sock`
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(ROLLCALL_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Socket path ignoring `$ROLLCALL_SOCKET`; used for config defaults.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Get the default data directory (`$ROLLCALL_DATA_DIR` wins).
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(ROLLCALL_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

/// Data directory ignoring `$ROLLCALL_DATA_DIR`; used for config defaults.
pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    home_join(&[".local", "share", APP_DIR])
        .unwrap_or_else(|| PathBuf::from("/tmp").join(APP_DIR).join("data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_contains_app_name() {
        let path = socket_path_without_env();
        assert!(path.to_string_lossy().contains("rollcalld"));
        assert!(path.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn config_path_is_toml() {
        let path = default_config_path();
        assert!(path.ends_with("rollcall/config.toml"));
    }

    #[test]
    fn data_dir_is_namespaced() {
        assert!(data_dir_without_env().to_string_lossy().contains("rollcalld"));
    }
}
