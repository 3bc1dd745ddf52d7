//! Single-threaded event loop: herald listener, per-session dispatch,
//! timeout sweeping, and signal-driven shutdown.
//!
//! The listening socket only ever sees heralds (and strays); once a session
//! exists, the kernel routes the client's datagrams to the session's
//! connected socket, which shares the service port and is bound to the
//! destination address the client dumped to. Acks therefore leave from the
//! address and port the client expects.

use std::collections::HashMap;
use std::io::{self, IoSliceMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket as StdUdpSocket};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{self, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::dns;
use crate::hook;
use crate::session::{Outcome, Session, SessionStatus};
use crate::storage::{self, DumpDir};
use crate::wire::{self, MsgType};

/// Receive-buffer size hint applied to every session socket.
const RECV_BUFFER_HINT: usize = 128 * 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("bind {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },

    #[error("dump directory {}: {source}", .path.display())]
    DumpDir { path: PathBuf, source: io::Error },

    #[error("signal handler setup failed: {0}")]
    Signal(io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

enum Event {
    Datagram { peer: Ipv4Addr, bytes: Vec<u8> },
}

struct Daemon {
    config: Arc<Config>,
    dir: DumpDir,
    sessions: HashMap<Ipv4Addr, Session>,
    events_tx: mpsc::UnboundedSender<Event>,
}

/// Run the daemon until SIGINT or SIGTERM. Every session still active at
/// shutdown is driven through the timeout path so the hook fires for it.
pub async fn run(config: Arc<Config>) -> Result<(), ServeError> {
    let dir = DumpDir::open(&config.dump_dir)
        .map_err(|e| ServeError::DumpDir { path: config.dump_dir.clone(), source: e })?;

    let addr = SocketAddr::from((config.listen, config.port));
    let listener = bind_listener(addr).map_err(|e| ServeError::Bind { addr, source: e })?;
    socket::setsockopt(&listener, sockopt::Ipv4PacketInfo, &true)
        .map_err(|e| ServeError::Io(io::Error::from(e)))?;
    let listener = AsyncFd::new(listener)?;

    let mut sigterm = signal(SignalKind::terminate()).map_err(ServeError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(ServeError::Signal)?;

    let mut sweep = tokio::time::interval(Duration::from_secs(config.timeout.sweep_secs));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut daemon = Daemon { config, dir, sessions: HashMap::new(), events_tx };

    info!(addr = %addr, dir = %daemon.dir.path().display(), "listening for dump heralds");

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            ready = listener.readable() => {
                match ready {
                    Ok(mut guard) => daemon.drain_heralds(&mut guard),
                    Err(e) => warn!(error = %e, "listener readiness failed"),
                }
            }
            Some(event) = events_rx.recv() => daemon.handle_event(event),
            _ = sweep.tick() => daemon.sweep_idle(),
        }
    }

    daemon.shutdown();
    Ok(())
}

impl Daemon {
    /// Herald path: receive every queued datagram on the listening socket
    /// together with its destination address, then hand each to session
    /// lookup/creation.
    fn drain_heralds(&mut self, guard: &mut AsyncFdReadyGuard<'_, StdUdpSocket>) {
        let mut buf = [0u8; wire::MAX_DATAGRAM + 1];
        loop {
            match recv_with_dst(guard.get_inner(), &mut buf) {
                Ok(Some((len, peer, dst))) => self.handle_herald(&buf[..len], peer, dst),
                Ok(None) => {
                    guard.clear_ready();
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "herald receive failed");
                    guard.clear_ready();
                    return;
                }
            }
        }
    }

    fn handle_herald(&mut self, bytes: &[u8], peer: SocketAddrV4, dst: Option<Ipv4Addr>) {
        let datagram = match wire::parse(bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(peer = %peer, error = %e, "malformed datagram on listener dropped");
                return;
            }
        };
        if datagram.kind != MsgType::Herald {
            debug!(peer = %peer, kind = ?datagram.kind, "non-herald datagram on listener ignored");
            return;
        }
        if !datagram.payload.is_empty() {
            let path = String::from_utf8_lossy(datagram.payload);
            debug!(peer = %peer, path = %path.trim_end_matches('\0'), "herald announced dump path");
        }

        let ip = *peer.ip();
        let mut stale = false;
        if let Some(existing) = self.sessions.get(&ip) {
            if !existing.any_data_received() {
                debug!(peer = %peer, sequence = datagram.sequence, "herald retransmit before any data");
                existing.ack(datagram.sequence);
                return;
            }
            stale = true;
        }
        if stale {
            warn!(peer = %peer, "new herald while a dump is active, retiring previous session");
            self.retire(ip, Outcome::Timeout);
        }

        match self.create_session(peer, dst) {
            Ok(session) => {
                info!(
                    peer = %peer,
                    host = %session.hostname(),
                    info = %session.info_name(),
                    core = %session.core_name(),
                    "dump session started"
                );
                session.ack(datagram.sequence);
                self.sessions.insert(ip, session);
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "session creation failed, herald unacknowledged");
            }
        }
    }

    /// Build a session in the order that lets RAII unwind any prefix:
    /// resolve, connect a socket, reserve the file pair, start the reader.
    fn create_session(
        &self,
        peer: SocketAddrV4,
        dst: Option<Ipv4Addr>,
    ) -> crate::error::Result<Session> {
        let ip = *peer.ip();
        let hostname = dns::short_hostname(ip);
        let local = dst.unwrap_or_else(|| {
            debug!(peer = %peer, "herald carried no destination address, using bind address");
            self.config.listen
        });
        let socket = make_session_socket(local, self.config.port, peer)?;
        let socket = Arc::new(UdpSocket::from_std(socket)?);
        let pair = storage::reserve(&self.dir, &hostname)?;
        let reader = spawn_reader(socket.clone(), ip, self.events_tx.clone());
        Ok(Session::new(peer, hostname, socket, reader, pair))
    }

    fn handle_event(&mut self, event: Event) {
        let Event::Datagram { peer, bytes } = event;
        let dir = &self.dir;
        let Some(session) = self.sessions.get_mut(&peer) else {
            trace!(peer = %peer, "datagram for retired session dropped");
            return;
        };
        let datagram = match wire::parse(&bytes) {
            Ok(d) => d,
            Err(e) => {
                warn!(peer = %peer, error = %e, "malformed datagram dropped");
                return;
            }
        };
        match session.handle_datagram(dir, &datagram) {
            SessionStatus::Active => {}
            SessionStatus::Done(outcome) => self.retire(peer, outcome),
        }
    }

    fn sweep_idle(&mut self) {
        let limit = Duration::from_secs(self.config.timeout.client_secs);
        let now = Instant::now();
        let expired: Vec<Ipv4Addr> = self
            .sessions
            .iter()
            .filter(|(_, session)| now.duration_since(session.last_activity()) > limit)
            .map(|(ip, _)| *ip)
            .collect();
        for peer in expired {
            warn!(peer = %peer, "client timed out");
            self.retire(peer, Outcome::Timeout);
        }
    }

    /// Remove a session, record its outcome, and fire the notification hook.
    /// Dropping the session closes its files and stops its reader task.
    fn retire(&mut self, peer: Ipv4Addr, outcome: Outcome) {
        let Some(mut session) = self.sessions.remove(&peer) else { return };
        session.finish(outcome);
        info!(
            peer = %peer,
            host = %session.hostname(),
            outcome = outcome.as_str(),
            "session ended"
        );
        hook::notify(
            self.config.script.as_deref(),
            outcome,
            peer,
            session.hostname(),
            &self.dir.join(session.info_name()),
            &self.dir.join(session.core_name()),
        );
    }

    fn shutdown(&mut self) {
        let peers: Vec<Ipv4Addr> = self.sessions.keys().copied().collect();
        for peer in peers {
            self.retire(peer, Outcome::Timeout);
        }
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Session sockets share this port, bound to specific local addresses.
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Connected per-session socket, bound to the destination address the
/// client dumped to so acks originate where the client expects them. The
/// connected four-tuple outranks the wildcard listener in UDP delivery.
fn make_session_socket(
    local: Ipv4Addr,
    port: u16,
    peer: SocketAddrV4,
) -> io::Result<StdUdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_HINT) {
        warn!(peer = %peer, error = %e, "could not size session receive buffer");
    }
    socket.bind(&SockAddr::from(SocketAddr::from(SocketAddrV4::new(local, port))))?;
    socket.connect(&SockAddr::from(SocketAddr::V4(peer)))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Forward datagrams from a session socket into the event loop. Ends when
/// the socket errors out or the session (and loop) went away.
fn spawn_reader(
    socket: Arc<UdpSocket>,
    peer: Ipv4Addr,
    tx: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; wire::MAX_DATAGRAM + 1];
        loop {
            match socket.recv(&mut buf).await {
                Ok(len) => {
                    let bytes = buf[..len].to_vec();
                    if tx.send(Event::Datagram { peer, bytes }).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "session socket receive failed");
                    return;
                }
            }
        }
    })
}

/// One nonblocking receive on the listening socket, returning the datagram
/// length, the sender, and the destination address delivered as ancillary
/// data. `Ok(None)` means the socket has drained.
fn recv_with_dst(
    socket: &StdUdpSocket,
    buf: &mut [u8],
) -> io::Result<Option<(usize, SocketAddrV4, Option<Ipv4Addr>)>> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!(libc::in_pktinfo);
    let (len, address, dst) = match socket::recvmsg::<SockaddrIn>(
        socket.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg),
        MsgFlags::empty(),
    ) {
        Ok(msg) => {
            let mut dst = None;
            match msg.cmsgs() {
                Ok(cmsgs) => {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::Ipv4PacketInfo(info) = cmsg {
                            dst = Some(Ipv4Addr::from(info.ipi_addr.s_addr.to_ne_bytes()));
                        }
                    }
                }
                Err(e) => debug!(error = %e, "herald control data unavailable"),
            }
            (msg.bytes, msg.address, dst)
        }
        Err(Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(io::Error::from(e)),
    };
    let Some(address) = address else {
        debug!("datagram without sender address dropped");
        return Ok(None);
    };
    Ok(Some((len, SocketAddrV4::new(address.ip(), address.port()), dst)))
}
