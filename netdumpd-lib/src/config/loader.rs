use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{NetdumpError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<Config> {
    let txt = fs::read_to_string(p)
        .map_err(|e| NetdumpError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: Config = toml::from_str(&txt)
        .map_err(|e| NetdumpError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

/// Check a configuration after defaults and overrides have been applied.
pub fn validate_config(cfg: &Config) -> Result<()> {
    let meta = fs::metadata(&cfg.dump_dir).map_err(|e| {
        NetdumpError::Config(format!("Dump directory {}: {e}", cfg.dump_dir.display()))
    })?;
    if !meta.is_dir() {
        return Err(NetdumpError::Config(format!(
            "Dump directory {} is not a directory",
            cfg.dump_dir.display()
        )));
    }

    if cfg.timeout.client_secs == 0 {
        return Err(NetdumpError::Config("client timeout must be nonzero".to_string()));
    }
    if cfg.timeout.sweep_secs == 0 {
        return Err(NetdumpError::Config("sweep interval must be nonzero".to_string()));
    }

    if let Some(script) = &cfg.script {
        if !script.exists() {
            return Err(NetdumpError::Config(format!(
                "Notification script not found: {}",
                script.display()
            )));
        }
    }

    Ok(())
}
