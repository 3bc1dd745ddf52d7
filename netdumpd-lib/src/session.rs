//! Per-client dump session: protocol state, artifact files, ack discipline.
//!
//! A session owns its connected socket, both output files, and the write
//! coalescer. It is created on a herald, fed datagrams by the event loop,
//! and destroyed on FINISHED, timeout, write failure, or daemon shutdown.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::storage::{DumpDir, DumpPair, WriteCoalescer};
use crate::wire::{self, Datagram, KernelDumpHeader, MsgType};

/// A progress line is logged once per this many received core bytes.
const PROGRESS_INTERVAL: u64 = 16 * 1024 * 1024;

/// Why a session ended. The string form is the reason handed to the
/// notification hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Timeout,
    Error,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Timeout => "timeout",
            Outcome::Error => "error",
        }
    }
}

/// What the event loop should do with the session after a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Done(Outcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingKdh,
    Streaming,
}

pub struct Session {
    peer: SocketAddrV4,
    hostname: String,
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
    info: BufWriter<File>,
    core: File,
    info_name: String,
    core_name: String,
    coalescer: WriteCoalescer,
    phase: Phase,
    any_data_received: bool,
    last_activity: Instant,
    bytes_received: u64,
    next_progress: u64,
    failure: Option<String>,
}

impl Session {
    pub fn new(
        peer: SocketAddrV4,
        hostname: String,
        socket: Arc<UdpSocket>,
        reader: JoinHandle<()>,
        pair: DumpPair,
    ) -> Self {
        Session {
            peer,
            hostname,
            socket,
            reader,
            info: BufWriter::new(pair.info),
            core: pair.core,
            info_name: pair.info_name,
            core_name: pair.core_name,
            coalescer: WriteCoalescer::new(),
            phase: Phase::AwaitingKdh,
            any_data_received: false,
            last_activity: Instant::now(),
            bytes_received: 0,
            next_progress: PROGRESS_INTERVAL,
            failure: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn info_name(&self) -> &str {
        &self.info_name
    }

    pub fn core_name(&self) -> &str {
        &self.core_name
    }

    /// Distinguishes a retransmitted herald from a client that rebooted and
    /// started a new dump.
    pub fn any_data_received(&self) -> bool {
        self.any_data_received
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Send the four-byte ack for `sequence` on the connected socket. A full
    /// send buffer is tolerated; the client retransmits on silence.
    pub fn ack(&self, sequence: u32) {
        match self.socket.try_send(&wire::encode_ack(sequence)) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!(peer = %self.peer, sequence, "ack deferred to client retransmit");
            }
            Err(e) => {
                debug!(peer = %self.peer, sequence, error = %e, "ack send failed");
            }
        }
    }

    /// Process one datagram received on the session socket.
    pub fn handle_datagram(&mut self, dir: &DumpDir, datagram: &Datagram<'_>) -> SessionStatus {
        self.last_activity = Instant::now();
        match datagram.kind {
            MsgType::Herald => self.handle_herald(datagram),
            MsgType::Kdh => self.handle_kdh(datagram),
            MsgType::VmCore => self.handle_vmcore(datagram),
            MsgType::Finished => self.handle_finished(dir, datagram),
        }
    }

    /// A herald on the connected flow is a retransmit as long as no data has
    /// arrived. Once data flowed it announces a new dump; the current one is
    /// retired and the client's retransmit reaches the listener afresh.
    fn handle_herald(&mut self, datagram: &Datagram<'_>) -> SessionStatus {
        if self.any_data_received {
            warn!(peer = %self.peer, "herald on active session, retiring current dump");
            return SessionStatus::Done(Outcome::Timeout);
        }
        debug!(peer = %self.peer, sequence = datagram.sequence, "herald retransmit");
        self.ack(datagram.sequence);
        SessionStatus::Active
    }

    fn handle_kdh(&mut self, datagram: &Datagram<'_>) -> SessionStatus {
        let kdh = match KernelDumpHeader::parse(datagram.payload) {
            Ok(kdh) => kdh,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "bad kernel dump header");
                return SessionStatus::Active;
            }
        };
        if !kdh.parity_ok {
            warn!(peer = %self.peer, "kernel dump header parity check failed");
        }
        if let Err(e) = self.write_kdh_info(&kdh) {
            error!(peer = %self.peer, error = %e, "info file write failed");
            self.failure = Some(format!("info file write failed: {e}"));
            return SessionStatus::Done(Outcome::Error);
        }
        self.any_data_received = true;
        if self.phase == Phase::AwaitingKdh {
            self.phase = Phase::Streaming;
            info!(
                peer = %self.peer,
                host = %self.hostname,
                panic = %kdh.panic_string,
                dump_length = kdh.dump_length,
                "dump metadata received, streaming core"
            );
        }
        self.ack(datagram.sequence);
        SessionStatus::Active
    }

    fn handle_vmcore(&mut self, datagram: &Datagram<'_>) -> SessionStatus {
        if let Err(e) = self.coalescer.accept(&self.core, datagram.offset, datagram.payload) {
            let at = self.coalescer.run_offset();
            error!(peer = %self.peer, offset = at, error = %e, "core write failed");
            self.failure = Some(format!("write failed at offset {at}: {e}"));
            return SessionStatus::Done(Outcome::Error);
        }
        self.any_data_received = true;
        self.bytes_received += datagram.payload.len() as u64;
        if self.bytes_received >= self.next_progress {
            info!(
                peer = %self.peer,
                host = %self.hostname,
                received = self.bytes_received,
                "dump progress"
            );
            self.next_progress += PROGRESS_INTERVAL;
        }
        self.ack(datagram.sequence);
        SessionStatus::Active
    }

    /// Flush, make the core durable, repoint the `.last` symlinks, and only
    /// then ack. A symlink failure is logged but never undoes the dump.
    fn handle_finished(&mut self, dir: &DumpDir, datagram: &Datagram<'_>) -> SessionStatus {
        if let Err(e) = self.coalescer.flush(&self.core).and_then(|()| self.core.sync_all()) {
            let at = self.coalescer.run_offset();
            error!(peer = %self.peer, offset = at, error = %e, "final core flush failed");
            self.failure = Some(format!("write failed at offset {at}: {e}"));
            return SessionStatus::Done(Outcome::Error);
        }

        let links = [
            (self.core_name.clone(), format!("vmcore.{}.last", self.hostname)),
            (self.info_name.clone(), format!("info.{}.last", self.hostname)),
        ];
        for (target, link) in &links {
            if let Err(e) = dir.replace_symlink(target, link) {
                warn!(link = %link, target = %target, error = %e, "symlink commit failed");
            }
        }

        self.ack(datagram.sequence);
        SessionStatus::Done(Outcome::Success)
    }

    fn write_kdh_info(&mut self, kdh: &KernelDumpHeader) -> io::Result<()> {
        writeln!(self.info, "Dump from {} [{}]", kdh.hostname, self.peer.ip())?;
        writeln!(self.info, "Architecture: {} (version {})", kdh.architecture, kdh.architecture_version)?;
        writeln!(self.info, "Dump length: {} bytes", kdh.dump_length)?;
        writeln!(self.info, "Block size: {} bytes", kdh.block_size)?;
        writeln!(self.info, "Dump time: {}", kdh.dump_time)?;
        writeln!(self.info, "OS version: {}", kdh.version_string)?;
        writeln!(self.info, "Panic: {}", kdh.panic_string)?;
        writeln!(self.info, "Header parity: {}", if kdh.parity_ok { "Ok" } else { "Fail" })?;
        self.info.flush()
    }

    /// Record the final outcome in the info file. Called exactly once, right
    /// before the session is dropped. A timed-out session keeps whatever
    /// core data it buffered.
    pub fn finish(&mut self, outcome: Outcome) {
        if outcome == Outcome::Timeout {
            if let Err(e) = self.coalescer.flush(&self.core) {
                warn!(peer = %self.peer, error = %e, "could not flush partial core");
            }
        }
        let line = match outcome {
            Outcome::Success => "dump complete",
            Outcome::Timeout => "client timed out",
            Outcome::Error => self.failure.as_deref().unwrap_or("session failed"),
        };
        if let Err(e) = writeln!(self.info, "{line}").and_then(|()| self.info.flush()) {
            warn!(peer = %self.peer, error = %e, "could not record session outcome");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
