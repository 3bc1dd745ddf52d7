//! Contiguity-aware write coalescer for the core image.
//!
//! The dumping kernel streams mostly sequential offsets, so payloads are
//! accumulated in a fixed buffer and written with one positional write per
//! run. A chunk that is not contiguous with the buffered run, or that would
//! overflow the buffer, forces the run to disk first.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Coalescing buffer capacity.
pub const BUF_SIZE: usize = 128 * 1024;

#[derive(Debug)]
pub struct WriteCoalescer {
    buf: Vec<u8>,
    run_offset: u64,
}

impl WriteCoalescer {
    pub fn new() -> Self {
        WriteCoalescer { buf: Vec::with_capacity(BUF_SIZE), run_offset: 0 }
    }

    /// File offset of the first buffered byte; everything below it has been
    /// written out.
    pub fn run_offset(&self) -> u64 {
        self.run_offset
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Accept one core chunk. Flushes the current run first when the chunk
    /// would overflow the buffer or does not extend the run contiguously.
    pub fn accept(&mut self, core: &File, offset: u64, payload: &[u8]) -> io::Result<()> {
        let discontiguous =
            !self.buf.is_empty() && self.run_offset + self.buf.len() as u64 != offset;
        if self.buf.len() + payload.len() > BUF_SIZE || discontiguous {
            self.flush(core)?;
        }
        if self.buf.is_empty() {
            self.run_offset = offset;
        }
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    /// Write the buffered run at its absolute offset and empty the buffer.
    pub fn flush(&mut self, core: &File) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        core.write_all_at(&self.buf, self.run_offset)?;
        self.run_offset += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

impl Default for WriteCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn core_file(dir: &tempfile::TempDir) -> File {
        File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("core"))
            .expect("create core file")
    }

    fn contents(dir: &tempfile::TempDir) -> Vec<u8> {
        fs::read(dir.path().join("core")).expect("read core file")
    }

    #[test]
    fn sequential_chunks_stay_buffered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_file(&dir);
        let mut coalescer = WriteCoalescer::new();

        coalescer.accept(&core, 0, &[0xAA; 100]).expect("accept");
        coalescer.accept(&core, 100, &[0xBB; 100]).expect("accept");
        assert_eq!(coalescer.buffered(), 200);
        assert_eq!(contents(&dir).len(), 0);

        coalescer.flush(&core).expect("flush");
        assert_eq!(coalescer.buffered(), 0);
        assert_eq!(coalescer.run_offset(), 200);

        let bytes = contents(&dir);
        assert_eq!(&bytes[..100], &[0xAA; 100]);
        assert_eq!(&bytes[100..200], &[0xBB; 100]);
    }

    #[test]
    fn discontinuity_flushes_previous_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_file(&dir);
        let mut coalescer = WriteCoalescer::new();

        coalescer.accept(&core, 0, &[0xAA; 64]).expect("accept");
        coalescer.accept(&core, 256, &[0xCC; 64]).expect("accept");

        // The first run hit the disk; the second is still buffered.
        assert_eq!(contents(&dir).len(), 64);
        assert_eq!(coalescer.run_offset(), 256);
        assert_eq!(coalescer.buffered(), 64);

        coalescer.accept(&core, 64, &[0xBB; 64]).expect("accept");
        coalescer.flush(&core).expect("flush");

        let bytes = contents(&dir);
        assert_eq!(&bytes[0..64], &[0xAA; 64]);
        assert_eq!(&bytes[64..128], &[0xBB; 64]);
        assert_eq!(&bytes[256..320], &[0xCC; 64]);
    }

    #[test]
    fn capacity_overflow_flushes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_file(&dir);
        let mut coalescer = WriteCoalescer::new();

        let chunk = vec![0x11; 1456];
        let mut offset = 0u64;
        while coalescer.buffered() + chunk.len() <= BUF_SIZE {
            coalescer.accept(&core, offset, &chunk).expect("accept");
            offset += chunk.len() as u64;
        }
        assert_eq!(contents(&dir).len(), 0);

        // One more chunk no longer fits and forces the buffered run out.
        coalescer.accept(&core, offset, &chunk).expect("accept");
        assert_eq!(contents(&dir).len() as u64, offset);
        assert_eq!(coalescer.buffered(), chunk.len());
    }

    #[test]
    fn zero_offset_full_payload_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_file(&dir);
        let mut coalescer = WriteCoalescer::new();

        coalescer.accept(&core, 0, &[0x7F; 1456]).expect("accept");
        assert_eq!(coalescer.run_offset(), 0);
        assert_eq!(coalescer.buffered(), 1456);
    }

    #[test]
    fn overlapping_retransmit_last_write_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let core = core_file(&dir);
        let mut coalescer = WriteCoalescer::new();

        coalescer.accept(&core, 0, &[0xAA; 64]).expect("accept");
        // Retransmit of the same range with different content.
        coalescer.accept(&core, 0, &[0xBB; 64]).expect("accept");
        coalescer.flush(&core).expect("flush");

        assert_eq!(&contents(&dir)[..64], &[0xBB; 64]);
    }
}
