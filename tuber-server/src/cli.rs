//! Command-line argument parsing for tuber-server

use std::path::PathBuf;

use clap::Parser;

/// tuber-server - framed stream echo server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file
    ///
    /// Defaults to config.toml in the tuber config directory; built-in
    /// defaults apply when that file does not exist.
    #[arg(long, short = 'c', env = "TUBER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address (tcp://host:port or unix:///path), repeatable
    ///
    /// Replaces the listeners from the configuration file.
    #[arg(long, short = 'l')]
    pub listen: Vec<String>,

    /// Maximum concurrent sessions
    #[arg(long)]
    pub connect_limit: Option<usize>,

    /// Print the default configuration and exit
    #[arg(long, default_value_t = false)]
    pub print_default_config: bool,
}

impl Args {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["tuber-server"]);
        assert!(args.listen.is_empty());
        assert!(args.connect_limit.is_none());
        assert!(!args.print_default_config);
    }

    #[test]
    fn test_repeated_listen() {
        let args = Args::parse_from([
            "tuber-server",
            "--listen",
            "tcp://127.0.0.1:1",
            "-l",
            "unix:///tmp/t.sock",
            "--connect-limit",
            "10",
        ]);
        assert_eq!(args.listen, vec!["tcp://127.0.0.1:1", "unix:///tmp/t.sock"]);
        assert_eq!(args.connect_limit, Some(10));
    }
}
