//! Path utilities for tuber
//!
//! Handles XDG Base Directory specification compliance for config,
//! state and runtime directories.

use std::path::PathBuf;

use directories::ProjectDirs;

/// Application identifier for XDG directories
const APP_NAME: &str = "tuber";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APP_NAME)
}

/// Default Unix socket path for a `unix` listener
///
/// Location: `$XDG_RUNTIME_DIR/tuber/tuber.sock` or `/tmp/tuber-$UID/tuber.sock`
pub fn socket_path() -> PathBuf {
    runtime_dir().join("tuber.sock")
}

/// Get the runtime directory
///
/// Location: `$XDG_RUNTIME_DIR/tuber` or `/tmp/tuber-$UID`
pub fn runtime_dir() -> PathBuf {
    if let Ok(xdg_runtime) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg_runtime).join(APP_NAME)
    } else {
        // SAFETY: getuid() is always safe to call
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/{}-{}", APP_NAME, uid))
    }
}

/// Get the configuration directory
///
/// Location: `$XDG_CONFIG_HOME/tuber` or `~/.config/tuber`
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| home_dir().join(".config").join(APP_NAME))
}

/// Get the main configuration file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Get the state directory
///
/// Location: `$XDG_STATE_HOME/tuber` or `~/.local/state/tuber`
pub fn state_dir() -> PathBuf {
    project_dirs()
        .and_then(|p| p.state_dir().map(|d| d.to_path_buf()))
        .unwrap_or_else(|| home_dir().join(".local").join("state").join(APP_NAME))
}

/// Get the log directory
pub fn log_dir() -> PathBuf {
    state_dir().join("log")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_in_config_dir() {
        assert_eq!(config_file().parent(), Some(config_dir().as_path()));
        assert!(config_file().ends_with("config.toml"));
    }

    #[test]
    fn test_socket_in_runtime_dir() {
        assert!(socket_path().starts_with(runtime_dir()));
    }

    #[test]
    fn test_log_dir_under_state_dir() {
        assert!(log_dir().starts_with(state_dir()));
    }

    #[test]
    fn test_paths_mention_app_name() {
        let cfg = config_dir();
        assert!(cfg.to_string_lossy().contains(APP_NAME));
    }
}
