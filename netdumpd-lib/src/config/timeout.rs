use serde::Deserialize;

/// Timeout configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    /// Seconds of silence after which a session is declared dead
    /// Default: 600
    #[serde(default = "default_client_secs")]
    pub client_secs: u64,
    /// Interval between idle-session sweeps, in seconds
    /// Default: 10
    #[serde(default = "default_sweep_secs")]
    pub sweep_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig { client_secs: default_client_secs(), sweep_secs: default_sweep_secs() }
    }
}

fn default_client_secs() -> u64 {
    600
}

fn default_sweep_secs() -> u64 {
    10
}
