#![forbid(unsafe_code)]

use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use netdumpd_lib::{config, server, Config, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Receive kernel crash dumps streamed over UDP")]
struct Cli {
    /// IPv4 address to listen on for dump heralds
    #[arg(short = 'a', long = "address", value_name = "IPV4")]
    address: Option<Ipv4Addr>,

    /// Directory receiving dump artifacts
    #[arg(short = 'd', long = "dumpdir", value_name = "DIR")]
    dumpdir: Option<PathBuf>,

    /// Executable run when a dump session ends
    #[arg(short = 'i', long = "script", value_name = "FILE")]
    script: Option<PathBuf>,

    /// PID file path
    #[arg(short = 'P', long = "pidfile", value_name = "FILE")]
    pidfile: Option<PathBuf>,

    /// Stay in the foreground and log at debug level
    #[arg(short = 'D', long = "foreground")]
    foreground: bool,

    /// TOML configuration file; flags override its values
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let cfg = match build_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("netdumpd: {err}");
            std::process::exit(1);
        }
    };
    init_tracing(cfg.foreground);

    let pidfile = cfg.pidfile.clone();
    if let Some(path) = &pidfile {
        if let Err(err) = write_pidfile(path) {
            error!(path = %path.display(), %err, "failed to write PID file");
            std::process::exit(1);
        }
    }

    info!(
        listen = %cfg.listen,
        port = cfg.port,
        dir = %cfg.dump_dir.display(),
        "starting netdumpd"
    );
    let outcome = server::run(Arc::new(cfg)).await;

    if let Some(path) = &pidfile {
        if let Err(err) = fs::remove_file(path) {
            warn!(path = %path.display(), %err, "failed to remove PID file");
        }
    }

    if let Err(err) = outcome {
        error!(%err, "daemon exited with error");
        std::process::exit(1);
    }
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_from_path(path)?,
        None => Config::default(),
    };
    if let Some(address) = cli.address {
        cfg.listen = address;
    }
    if let Some(dumpdir) = &cli.dumpdir {
        cfg.dump_dir = dumpdir.clone();
    }
    if let Some(script) = &cli.script {
        cfg.script = Some(script.clone());
    }
    if let Some(pidfile) = &cli.pidfile {
        cfg.pidfile = Some(pidfile.clone());
    }
    if cli.foreground {
        cfg.foreground = true;
    }
    config::validate_config(&cfg)?;
    Ok(cfg)
}

fn init_tracing(foreground: bool) {
    let default_filter = if foreground { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

fn write_pidfile(path: &Path) -> io::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
}
