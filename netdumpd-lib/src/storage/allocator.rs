//! Per-host allocation of `(info, vmcore)` output file pairs.

use std::fs::File;
use std::io;

use thiserror::Error;
use tracing::warn;

use super::dir::DumpDir;

/// Upper bound on dumps kept per host; slot numbers run `0..MAX_DUMPS`.
pub const MAX_DUMPS: u32 = 256;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("no free dump slot for host {host}")]
    NoSlot { host: String },
}

/// An exclusively created file pair owned by one dump session.
#[derive(Debug)]
pub struct DumpPair {
    pub info: File,
    pub core: File,
    pub info_name: String,
    pub core_name: String,
}

/// Reserve the smallest slot `n` for which both `info.<host>.<n>` and
/// `vmcore.<host>.<n>` can be created exclusively. When the info file is
/// created but the core file cannot be, the info file is unlinked again so
/// the two numbers stay in lockstep. Errors other than already-exists are
/// logged and the scan continues.
pub fn reserve(dir: &DumpDir, host: &str) -> Result<DumpPair, AllocError> {
    for n in 0..MAX_DUMPS {
        let info_name = format!("info.{host}.{n}");
        let info = match dir.create_exclusive(&info_name) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                warn!(host = %host, file = %info_name, error = %e, "info file creation failed");
                continue;
            }
        };

        let core_name = format!("vmcore.{host}.{n}");
        match dir.create_exclusive(&core_name) {
            Ok(core) => return Ok(DumpPair { info, core, info_name, core_name }),
            Err(e) => {
                if e.kind() != io::ErrorKind::AlreadyExists {
                    warn!(host = %host, file = %core_name, error = %e, "core file creation failed");
                }
                if let Err(e) = dir.remove(&info_name) {
                    warn!(file = %info_name, error = %e, "orphaned info file left behind");
                }
            }
        }
    }
    Err(AllocError::NoSlot { host: host.to_string() })
}
