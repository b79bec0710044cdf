//! Socket-backed transport: TCP for connections, UDP for discovery.
//!
//! Both sockets are bound on the same port.
//!
//! # Reliable-ordered channel (TCP)
//!
//! Every payload is framed as a 4-byte big-endian length followed by the
//! payload bytes.  The first frame a client sends is its connection request.
//! The connection thread queues a [`TransportEvent::ConnectionRequest`] and
//! parks until the server answers through [`Transport::accept`] or
//! [`Transport::reject`]:
//!
//! - accept: the thread registers the write half under the new peer handle,
//!   queues `PeerConnected`, and forwards every further frame as
//!   `DataReceived` until the stream closes.
//! - reject: the thread writes the rejection payload as one frame and closes.
//!
//! # Unconnected channel (UDP)
//!
//! Datagrams start with a 1-byte kind tag: [`UNCONNECTED_BROADCAST_TAG`] for
//! discovery probes, [`UNCONNECTED_BASIC_TAG`] for everything else.  Outgoing
//! unconnected datagrams (discovery acks) are tagged as basic.
//!
//! # Threads
//!
//! All socket I/O happens on dedicated threads so no [`Transport`] method
//! blocks.  The listener and UDP loops use short timeouts and check the
//! shared `running` flag on every wake-up.  Each connected peer gets a reader
//! thread and a writer thread; [`Transport::send_reliable_ordered`] only
//! pushes onto the writer's bounded queue, and a peer whose queue is full is
//! disconnected.
//!
//! # Limits
//!
//! - At most `max_pending_connections` streams may be between accept and the
//!   server's answer; further connects are closed immediately.
//! - The connection request must arrive completely within the handshake
//!   timeout, measured from accept.
//! - Events are handed over on a bounded channel.  Connection threads wait
//!   for room; datagrams that find the channel full are dropped.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use companion_core::{ConnectionRequestId, PeerHandle};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::application::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, UnconnectedKind,
};

/// Kind tag of a broadcast discovery probe datagram.
pub const UNCONNECTED_BROADCAST_TAG: u8 = 0x01;
/// Kind tag of any other unconnected datagram.
pub const UNCONNECTED_BASIC_TAG: u8 = 0x02;
/// Largest frame accepted on the reliable channel.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;
/// Capacity of the event channel between the I/O threads and `poll_event`.
pub const EVENT_QUEUE_CAPACITY: usize = 256;
/// Frames that may wait for a peer's writer thread before the peer is dropped.
pub const PEER_SEND_QUEUE: usize = 64;

/// Default time a freshly accepted TCP stream has to send its whole request.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default cap on streams that have not been accepted or rejected yet.
pub const DEFAULT_MAX_PENDING_CONNECTIONS: usize = 64;
/// Wake-up interval of the listener and UDP loops.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const UDP_READ_TIMEOUT: Duration = Duration::from_millis(500);
/// A single socket write stalled this long fails and closes the peer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

enum Decision {
    Accept(PeerHandle),
    Reject(Vec<u8>),
}

/// Outbound half of a connected peer.
struct PeerWriter {
    frames: mpsc::Sender<Vec<u8>>,
    stream: TcpStream,
}

impl PeerWriter {
    fn close(&self) {
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

/// State shared between the transport handle and its I/O threads.
struct Shared {
    running: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
    pending: Mutex<HashMap<ConnectionRequestId, oneshot::Sender<Decision>>>,
    peers: Mutex<HashMap<PeerHandle, PeerWriter>>,
    next_request: AtomicU64,
    next_peer: AtomicU64,
    pending_connections: AtomicUsize,
    max_pending_connections: usize,
    handshake_timeout: Duration,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<ConnectionRequestId, oneshot::Sender<Decision>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<PeerHandle, PeerWriter>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Queues `event`, waiting for room; returns `false` once the server side
    /// is gone.
    fn emit(&self, event: TransportEvent) -> bool {
        self.events_tx.blocking_send(event).is_ok()
    }

    /// Queues `event` if there is room.  Returns `false` once the server side
    /// is gone; a full queue drops the event and still returns `true`.
    fn offer(&self, event: TransportEvent) -> bool {
        match self.events_tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!("event queue full; dropping {event:?}");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// A claimed pre-handshake slot, released when dropped.
struct PendingSlot(Arc<Shared>);

impl PendingSlot {
    /// Claims a slot, or returns `None` when all are taken.
    fn claim(shared: &Arc<Shared>) -> Option<Self> {
        let previous = shared.pending_connections.fetch_add(1, Ordering::AcqRel);
        if previous >= shared.max_pending_connections {
            shared.pending_connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self(Arc::clone(shared)))
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.0.pending_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Running {
    port: u16,
    shared: Arc<Shared>,
    events_rx: mpsc::Receiver<TransportEvent>,
    udp: UdpSocket,
    threads: Vec<JoinHandle<()>>,
}

/// A [`Transport`] over plain TCP and UDP sockets.
pub struct SocketTransport {
    bind_address: IpAddr,
    handshake_timeout: Duration,
    max_pending_connections: usize,
    inner: Option<Running>,
}

impl SocketTransport {
    pub fn new(bind_address: IpAddr) -> Self {
        Self {
            bind_address,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_pending_connections: DEFAULT_MAX_PENDING_CONNECTIONS,
            inner: None,
        }
    }

    /// Sets how long a new stream may take to deliver its connection request.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets how many streams may wait for an answer at the same time.
    pub fn with_max_pending_connections(mut self, max: usize) -> Self {
        self.max_pending_connections = max;
        self
    }

    fn running(&self) -> Result<&Running, TransportError> {
        self.inner.as_ref().ok_or(TransportError::NotRunning)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Transport for SocketTransport {
    fn start(&mut self, port: u16) -> Result<u16, TransportError> {
        if let Some(running) = &self.inner {
            return Ok(running.port);
        }

        let addr = SocketAddr::new(self.bind_address, port);
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::BindFailed { addr, source })?;
        let port = listener.local_addr()?.port();
        let udp_addr = SocketAddr::new(self.bind_address, port);
        let udp = UdpSocket::bind(udp_addr).map_err(|source| TransportError::BindFailed {
            addr: udp_addr,
            source,
        })?;
        udp.set_broadcast(true)?;
        udp.set_read_timeout(Some(UDP_READ_TIMEOUT))?;
        listener.set_nonblocking(true)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            events_tx,
            pending: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
            next_peer: AtomicU64::new(1),
            pending_connections: AtomicUsize::new(0),
            max_pending_connections: self.max_pending_connections,
            handshake_timeout: self.handshake_timeout,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_thread = std::thread::Builder::new()
            .name("companion-accept".to_string())
            .spawn(move || accept_loop(listener, accept_shared))?;

        let udp_reader = udp.try_clone()?;
        let udp_shared = Arc::clone(&shared);
        let udp_thread = std::thread::Builder::new()
            .name("companion-discovery".to_string())
            .spawn(move || unconnected_loop(udp_reader, udp_shared))?;

        info!("companion transport listening on TCP/UDP {}", udp_addr);
        self.inner = Some(Running {
            port,
            shared,
            events_rx,
            udp,
            threads: vec![accept_thread, udp_thread],
        });
        Ok(port)
    }

    fn stop(&mut self) {
        let Some(mut running) = self.inner.take() else {
            return;
        };
        running.shared.running.store(false, Ordering::Relaxed);
        // Dropping the decision senders releases connection threads still
        // waiting for an answer.
        running.shared.pending().clear();
        for (_, writer) in running.shared.peers().drain() {
            writer.close();
        }
        running.events_rx.close();
        for thread in running.threads.drain(..) {
            if thread.join().is_err() {
                error!("companion transport thread panicked");
            }
        }
        info!("companion transport stopped");
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.inner.as_mut()?.events_rx.try_recv().ok()
    }

    fn accept(&mut self, request: ConnectionRequestId) -> Result<PeerHandle, TransportError> {
        let shared = &self.running()?.shared;
        let sender = shared
            .pending()
            .remove(&request)
            .ok_or(TransportError::UnknownRequest(request))?;
        let peer = PeerHandle(shared.next_peer.fetch_add(1, Ordering::Relaxed));
        sender
            .send(Decision::Accept(peer))
            .map_err(|_| TransportError::UnknownRequest(request))?;
        Ok(peer)
    }

    fn reject(
        &mut self,
        request: ConnectionRequestId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let shared = &self.running()?.shared;
        let sender = shared
            .pending()
            .remove(&request)
            .ok_or(TransportError::UnknownRequest(request))?;
        sender
            .send(Decision::Reject(payload.to_vec()))
            .map_err(|_| TransportError::UnknownRequest(request))
    }

    fn send_reliable_ordered(
        &mut self,
        peer: PeerHandle,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        check_frame_len(payload.len(), io::ErrorKind::InvalidInput)?;
        let running = self.running()?;
        let mut peers = running.shared.peers();
        let writer = peers.get(&peer).ok_or(TransportError::UnknownPeer(peer))?;
        match writer.frames.try_send(payload.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("{peer} is not reading; disconnecting");
                if let Some(writer) = peers.remove(&peer) {
                    writer.close();
                }
                Err(TransportError::SendQueueFull(peer))
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::UnknownPeer(peer)),
        }
    }

    fn send_unconnected(
        &mut self,
        remote: SocketAddr,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let running = self.running()?;
        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(UNCONNECTED_BASIC_TAG);
        datagram.extend_from_slice(payload);
        running.udp.send_to(&datagram, remote)?;
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerHandle) {
        let Some(running) = &self.inner else {
            return;
        };
        if let Some(writer) = running.shared.peers().remove(&peer) {
            writer.close();
        }
    }

    fn local_port(&self) -> Option<u16> {
        self.inner.as_ref().map(|running| running.port)
    }
}

// ── I/O threads ───────────────────────────────────────────────────────────────

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.is_running() {
        match listener.accept() {
            Ok((stream, remote)) => {
                let Some(slot) = PendingSlot::claim(&shared) else {
                    warn!("too many pending connections; closing {remote}");
                    stream.shutdown(Shutdown::Both).ok();
                    continue;
                };
                let conn_shared = Arc::clone(&shared);
                let spawned = std::thread::Builder::new()
                    .name(format!("companion-conn-{remote}"))
                    .spawn(move || connection_loop(stream, remote, conn_shared, slot));
                if let Err(e) = spawned {
                    error!("failed to spawn connection thread for {remote}: {e}");
                }
            }
            Err(e) if is_timeout_error(&e) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                warn!("accept error: {e}");
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("companion accept loop stopped");
}

/// Runs the handshake of one stream.  `slot` is released once the server has
/// answered.
fn connection_loop(
    stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<Shared>,
    slot: PendingSlot,
) {
    let deadline = Instant::now() + shared.handshake_timeout;

    if let Err(e) = configure_handshake_stream(&stream) {
        warn!("failed to configure connection from {remote}: {e}");
        return;
    }

    let payload = match read_frame_before(&stream, deadline) {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            debug!("{remote} closed before sending a connect request");
            return;
        }
        Err(e) => {
            debug!("no connect request from {remote}: {e}");
            stream.shutdown(Shutdown::Both).ok();
            return;
        }
    };

    let request = ConnectionRequestId(shared.next_request.fetch_add(1, Ordering::Relaxed));
    let (decision_tx, decision_rx) = oneshot::channel();
    shared.pending().insert(request, decision_tx);
    if !shared.emit(TransportEvent::ConnectionRequest {
        request,
        remote,
        payload,
    }) {
        shared.pending().remove(&request);
        return;
    }

    let decision = decision_rx.blocking_recv();
    drop(slot);
    match decision {
        Ok(Decision::Accept(peer)) => serve_peer(stream, peer, &shared),
        Ok(Decision::Reject(payload)) => {
            if let Err(e) = write_frame(&stream, &payload) {
                debug!("failed to deliver rejection to {remote}: {e}");
            }
            stream.shutdown(Shutdown::Both).ok();
        }
        // Transport stopped before the request was answered.
        Err(_) => {
            stream.shutdown(Shutdown::Both).ok();
        }
    }
}

fn serve_peer(stream: TcpStream, peer: PeerHandle, shared: &Shared) {
    let (writer_stream, control_stream) = match (stream.try_clone(), stream.try_clone()) {
        (Ok(writer), Ok(control)) => (writer, control),
        (Err(e), _) | (_, Err(e)) => {
            warn!("failed to clone stream for {peer}: {e}");
            stream.shutdown(Shutdown::Both).ok();
            return;
        }
    };
    if let Err(e) = stream.set_read_timeout(None) {
        warn!("failed to clear read timeout for {peer}: {e}");
    }

    let (frames_tx, frames_rx) = mpsc::channel(PEER_SEND_QUEUE);
    let spawned = std::thread::Builder::new()
        .name(format!("companion-write-{peer}"))
        .spawn(move || writer_loop(writer_stream, peer, frames_rx));
    if let Err(e) = spawned {
        error!("failed to spawn writer thread for {peer}: {e}");
        stream.shutdown(Shutdown::Both).ok();
        return;
    }

    shared.peers().insert(
        peer,
        PeerWriter {
            frames: frames_tx,
            stream: control_stream,
        },
    );
    if !shared.emit(TransportEvent::PeerConnected { peer }) {
        if let Some(writer) = shared.peers().remove(&peer) {
            writer.close();
        }
        return;
    }

    let mut reason = loop {
        match read_frame(&stream) {
            Ok(Some(payload)) => {
                if !shared.emit(TransportEvent::DataReceived { peer, payload }) {
                    break DisconnectReason::ServerStopped;
                }
            }
            Ok(None) => break DisconnectReason::RemoteClosed,
            Err(e) => {
                debug!("{peer} read error: {e}");
                break DisconnectReason::ConnectionReset;
            }
        }
    };

    // The entry is already gone if the server closed the connection itself.
    match shared.peers().remove(&peer) {
        // Dropping the queue sender ends the writer thread.
        Some(writer) => writer.close(),
        None => {
            reason = if shared.is_running() {
                DisconnectReason::LocalDisconnect
            } else {
                DisconnectReason::ServerStopped
            };
        }
    }
    shared.emit(TransportEvent::PeerDisconnected { peer, reason });
}

/// Drains one peer's outbound queue onto its socket.
fn writer_loop(stream: TcpStream, peer: PeerHandle, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(frame) = frames.blocking_recv() {
        if let Err(e) = write_frame(&stream, &frame) {
            debug!("{peer} write error: {e}");
            stream.shutdown(Shutdown::Both).ok();
            break;
        }
    }
    debug!("{peer} writer stopped");
}

fn unconnected_loop(socket: UdpSocket, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 2048];

    while shared.is_running() {
        let (len, remote) = match socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                error!("unconnected recv error: {e}");
                continue;
            }
        };

        let Some((&tag, payload)) = buf[..len].split_first() else {
            continue;
        };
        let kind = match tag {
            UNCONNECTED_BROADCAST_TAG => UnconnectedKind::Broadcast,
            UNCONNECTED_BASIC_TAG => UnconnectedKind::Basic,
            other => {
                debug!("dropping datagram with unknown tag 0x{other:02X} from {remote}");
                continue;
            }
        };
        let event = TransportEvent::UnconnectedMessage {
            remote,
            kind,
            payload: payload.to_vec(),
        };
        if !shared.offer(event) {
            break;
        }
    }
    debug!("companion unconnected loop stopped");
}

// ── Framing helpers ───────────────────────────────────────────────────────────

fn configure_handshake_stream(stream: &TcpStream) -> io::Result<()> {
    // Accepted sockets may inherit the listener's non-blocking mode.
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))
}

fn check_frame_len(len: usize, kind: io::ErrorKind) -> io::Result<()> {
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            kind,
            format!("frame of {len} bytes exceeds {MAX_FRAME_SIZE}"),
        ));
    }
    Ok(())
}

/// Writes one length-prefixed frame.
pub fn write_frame(mut stream: &TcpStream, payload: &[u8]) -> io::Result<()> {
    check_frame_len(payload.len(), io::ErrorKind::InvalidInput)?;
    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)
}

/// Reads one length-prefixed frame.  `Ok(None)` means the peer closed the
/// stream cleanly at a frame boundary.
pub fn read_frame(mut stream: &TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(header) as usize;
    check_frame_len(len, io::ErrorKind::InvalidData)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Like [`read_frame`], but the whole frame must arrive before `deadline`.
fn read_frame_before(stream: &TcpStream, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match read_exact_before(stream, &mut header, deadline) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(header) as usize;
    check_frame_len(len, io::ErrorKind::InvalidData)?;
    let mut payload = vec![0u8; len];
    read_exact_before(stream, &mut payload, deadline)?;
    Ok(Some(payload))
}

fn read_exact_before(
    mut stream: &TcpStream,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "handshake deadline passed",
            ));
        }
        stream.set_read_timeout(Some(remaining))?;
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted || is_timeout_error(&e) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Returns `true` for OS timeout / would-block errors that should be retried.
fn is_timeout_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
