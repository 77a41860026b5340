//! tuber-utils: Common utilities shared across tuber crates
//!
//! This crate provides:
//! - Unified error types ([`TuberError`], [`Result`])
//! - Logging infrastructure ([`init_logging`], [`LogConfig`])
//! - XDG-compliant path utilities ([`paths`] module)

pub mod error;
pub mod logging;
pub mod paths;

// Re-export main types at crate root for convenience
pub use error::{Result, TuberError};
pub use logging::{init_logging, init_logging_with_config, LogConfig, LogOutput};

pub use paths::{config_dir, config_file, log_dir, runtime_dir, socket_path, state_dir};
