//! Default configuration values
//!
//! These are embedded in the binary and used when no config file exists.

/// Default configuration as TOML (for reference/documentation)
pub const DEFAULT_CONFIG_TOML: &str = r##"
# tuber configuration

[net]
# The first session id handed out is session_start_id + 1
session_start_id = 0
# Maximum concurrent sessions (0 means 50000)
connect_limit = 50000
# Deadline for each frame read or write; 0 disables it
idle_timeout_secs = 30
max_frame_size = 1048576
event_queue_capacity = 1024
send_queue_capacity = 32

[[listeners]]
network = "tcp"
addr = "0.0.0.0:10086"

[logging]
# Overridden by TUBER_LOG
filter = "info"
"##;
