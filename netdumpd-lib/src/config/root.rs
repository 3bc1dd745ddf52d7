use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use super::timeout::TimeoutConfig;
use crate::wire::NETDUMP_PORT;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// IPv4 address the herald listener binds to
    /// Default: 0.0.0.0
    #[serde(default = "default_listen")]
    pub listen: Ipv4Addr,
    /// UDP port clients dump to
    /// Default: 20023
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory receiving info.<host>.<n> / vmcore.<host>.<n> pairs
    /// Must exist and be a directory
    /// Default: /var/crash
    #[serde(default = "default_dump_dir")]
    pub dump_dir: PathBuf,
    /// Executable invoked when a session ends, with arguments
    /// (reason, ip, hostname, infofile, corefile)
    /// Default: None
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// PID file path written by the daemon binary
    /// Default: None
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    /// Stay in the foreground and default logging to debug level
    /// Default: false
    #[serde(default)]
    pub foreground: bool,
    /// Timeout configuration
    #[serde(default)]
    pub timeout: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: default_listen(),
            port: default_port(),
            dump_dir: default_dump_dir(),
            script: None,
            pidfile: None,
            foreground: false,
            timeout: TimeoutConfig::default(),
        }
    }
}

fn default_listen() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_port() -> u16 {
    NETDUMP_PORT
}

fn default_dump_dir() -> PathBuf {
    PathBuf::from("/var/crash")
}
