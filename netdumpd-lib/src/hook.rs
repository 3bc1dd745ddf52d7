//! Fire-and-forget notification hook run at session termination.

use std::net::Ipv4Addr;
use std::path::Path;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::session::Outcome;

/// Spawn the notification script with positional arguments
/// `(reason, ip, hostname, infofile, corefile)`. The child's exit status is
/// never inspected; a spawn failure is logged and otherwise ignored.
pub fn notify(
    script: Option<&Path>,
    outcome: Outcome,
    peer: Ipv4Addr,
    hostname: &str,
    info_path: &Path,
    core_path: &Path,
) {
    let Some(script) = script else { return };

    let mut cmd = Command::new(script);
    cmd.arg(outcome.as_str())
        .arg(peer.to_string())
        .arg(hostname)
        .arg(info_path)
        .arg(core_path);

    match cmd.spawn() {
        Ok(_child) => {
            debug!(script = %script.display(), reason = outcome.as_str(), peer = %peer, "notification hook spawned");
        }
        Err(e) => {
            warn!(script = %script.display(), error = %e, "failed to spawn notification hook");
        }
    }
}
