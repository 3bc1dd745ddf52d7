//! Handle to the dump directory.
//!
//! Every file the daemon touches is named relative to this handle; nothing
//! outside the directory is ever opened.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Path, PathBuf};

const DUMP_FILE_MODE: u32 = 0o600;

#[derive(Debug)]
pub struct DumpDir {
    root: PathBuf,
}

impl DumpDir {
    /// Open an existing directory for dump storage.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let root = path.as_ref().to_path_buf();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(io::Error::other(format!("{} is not a directory", root.display())));
        }
        Ok(DumpDir { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create `name` exclusively with mode 0600; fails if it already exists.
    pub fn create_exclusive(&self, name: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(DUMP_FILE_MODE)
            .open(self.join(name))
    }

    pub fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.join(name))
    }

    /// Point `link` at `target`, replacing any previous link. A missing old
    /// link is not an error.
    pub fn replace_symlink(&self, target: &str, link: &str) -> io::Result<()> {
        match fs::remove_file(self.join(link)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        symlink(target, self.join(link))
    }
}
