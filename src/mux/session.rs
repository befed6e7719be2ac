//! Sessions: one physical link multiplexing many virtual streams
//!
//! A [`Session`] owns one authenticated byte-stream link (plain TCP or any
//! wrapped transport) and demultiplexes frames into per-stream queues. All
//! outbound frames are serialized through a single writer lock; the port
//! table mapping stream ids to sinks is guarded by its own lock that is
//! never held across I/O.
//!
//! Created by the AUTH/RESULT handshake, destroyed when the link errors,
//! a protocol violation is detected or the peer is judged dead; teardown
//! closes every live stream exactly once.

use std::collections::HashMap;
use std::mem;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use super::conn::{Conn, ConnShared};
use super::dns;
use super::frame::{Frame, ReplyCode};
use super::ping::{ping_delay, Liveness, LivenessVerdict};
use super::{
    MuxError, DEFAULT_WINDOW, DIAL_TIMEOUT, DNS_TIMEOUT, HANDSHAKE_TIMEOUT, INBOUND_QUEUE_CHUNKS,
    PING_INTERVAL,
};
use crate::proxy::relay;
use crate::transport::Dialer;

/// Username -> password table consulted during the AUTH handshake.
/// An empty table means open access.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
}

impl CredentialStore {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Accept everyone
    pub fn open_access() -> Self {
        Self::default()
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        if self.users.is_empty() {
            return true;
        }
        self.users.get(username).map(String::as_str) == Some(password)
    }
}

/// Per-session tuning knobs, injected at construction
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Per-stream send window ceiling
    pub window_max: u32,
    /// Base liveness probe interval
    pub ping_interval: Duration,
    /// Deadline for SYN/RESULT round trips and outbound dials
    pub dial_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            window_max: DEFAULT_WINDOW,
            ping_interval: PING_INTERVAL,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

/// One live stream's entry in the port table
struct StreamSlot {
    data_tx: mpsc::Sender<Bytes>,
    shared: Arc<ConnShared>,
    /// Present while our SYN is unanswered
    result_tx: Option<oneshot::Sender<ReplyCode>>,
}

enum PortSlot {
    Stream(StreamSlot),
    /// A DNS query awaiting its response payload
    Dns(oneshot::Sender<Bytes>),
}

/// Stream-id space: each id maps to at most one live sink
struct PortTable {
    slots: HashMap<u16, PortSlot>,
    /// Last assigned id; allocation searches forward from here
    next_id: u16,
}

impl PortTable {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 0,
        }
    }

    /// Hand out the next free id after the last assignment, wrapping around
    /// and skipping the reserved id 0.
    fn next_free_id(&mut self) -> Result<u16, MuxError> {
        if self.slots.len() >= u16::MAX as usize {
            return Err(MuxError::StreamIdsExhausted);
        }
        let start = self.next_id;
        let mut id = start;
        loop {
            id = id.wrapping_add(1);
            if id == 0 {
                id = 1;
            }
            if !self.slots.contains_key(&id) {
                self.next_id = id;
                return Ok(id);
            }
            if id == start {
                return Err(MuxError::StreamIdsExhausted);
            }
        }
    }
}

/// Bytes-per-second counter: accumulates, then a 1 s ticker converts the
/// accumulated count into the published rate.
pub(crate) struct RateCounter {
    bytes: AtomicU64,
    rate: AtomicU64,
}

impl RateCounter {
    fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            rate: AtomicU64::new(0),
        }
    }

    pub(crate) fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    fn decay(&self) {
        let bytes = self.bytes.swap(0, Ordering::Relaxed);
        self.rate.store(bytes, Ordering::Relaxed);
    }

    fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }
}

/// Diagnostics for one live stream
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub id: u16,
    pub address: String,
}

/// State shared by the session handle, its tasks and its streams
pub(crate) struct SessionShared {
    peer: String,
    config: SessionConfig,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    ports: Mutex<PortTable>,
    liveness: Liveness,
    read_rate: RateCounter,
    write_rate: RateCounter,
    closed: AtomicBool,
    game_over: AtomicBool,
    close_notify: Notify,
    dialer: Arc<dyn Dialer>,
}

impl SessionShared {
    /// Serialize one frame onto the link. The writer lock guarantees two
    /// concurrent senders never interleave partial frames.
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let buf = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        drop(writer);
        self.write_rate.add(buf.len() as u64);
        Ok(())
    }

    /// Free a stream id. Removal drops the slot's inbound sender, which
    /// ends the stream's read side once drained.
    pub(crate) fn release_stream(&self, id: u16) {
        let removed = self.ports.lock().unwrap().slots.remove(&id);
        if removed.is_some() {
            trace!("Stream {} released", id);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_game_over(&self) {
        self.game_over.store(true, Ordering::SeqCst);
    }

    /// Force the underlying link closed without tearing down session state;
    /// used against suspected half-open TCP so the reader unblocks with an
    /// error and normal teardown takes over.
    async fn shutdown_link(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Full teardown: idempotent. Closes every live stream exactly once,
    /// wakes pending dial/DNS waiters and closes the link.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let slots: Vec<PortSlot> = {
            let mut ports = self.ports.lock().unwrap();
            mem::take(&mut ports.slots).into_values().collect()
        };
        let live = slots.len();
        for slot in slots {
            match slot {
                PortSlot::Stream(stream) => stream.shared.close_remote(),
                // Dropping the sender wakes the waiter with an error
                PortSlot::Dns(_) => {}
            }
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.close_notify.notify_waiters();
        info!("Session to {} closed ({} streams torn down)", self.peer, live);
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.close_notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a close between the
            // check and the await cannot be missed
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Dispatch one inbound frame. `Err` means the frame was fatal to the
    /// session (protocol violation); per-stream problems stay local.
    async fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<(), MuxError> {
        match frame {
            Frame::Data { stream_id, payload } => {
                let sink = {
                    let ports = self.ports.lock().unwrap();
                    match ports.slots.get(&stream_id) {
                        Some(PortSlot::Stream(slot)) => Some(slot.data_tx.clone()),
                        _ => None,
                    }
                };
                match sink {
                    Some(tx) => {
                        // A failed send means the stream died between lookup
                        // and delivery; at most this frame is dropped.
                        if tx.send(payload).await.is_err() {
                            trace!("Dropping data for closing stream {}", stream_id);
                        }
                    }
                    None => trace!("Data for unknown stream {}", stream_id),
                }
                Ok(())
            }
            Frame::Ack { stream_id, window } => {
                let conn = {
                    let ports = self.ports.lock().unwrap();
                    match ports.slots.get(&stream_id) {
                        Some(PortSlot::Stream(slot)) => Some(Arc::clone(&slot.shared)),
                        _ => None,
                    }
                };
                if let Some(conn) = conn {
                    conn.window.release(window);
                }
                Ok(())
            }
            Frame::Result { stream_id, code } => {
                let pending = {
                    let mut ports = self.ports.lock().unwrap();
                    match ports.slots.get_mut(&stream_id) {
                        Some(PortSlot::Stream(slot)) => slot.result_tx.take(),
                        _ => None,
                    }
                };
                match pending {
                    Some(tx) => {
                        let _ = tx.send(code);
                    }
                    None => trace!("RESULT for unknown or established stream {}", stream_id),
                }
                Ok(())
            }
            Frame::Syn { stream_id, address } => self.handle_syn(stream_id, address).await,
            Frame::Fin { stream_id } | Frame::Rst { stream_id } => {
                let slot = self.ports.lock().unwrap().slots.remove(&stream_id);
                match slot {
                    Some(PortSlot::Stream(stream)) => stream.shared.close_remote(),
                    Some(PortSlot::Dns(_)) => {}
                    None => trace!("FIN for unknown stream {}", stream_id),
                }
                Ok(())
            }
            Frame::Ping { .. } => {
                // Our own probe coming back acknowledged needs no answer;
                // a fresh probe from the peer gets an immediate ack.
                if !self.liveness.take_outstanding() {
                    self.send_frame(&Frame::Ping { stream_id: 0 }).await?;
                }
                Ok(())
            }
            Frame::Dns { stream_id, payload } => self.handle_dns(stream_id, payload).await,
            Frame::Auth { .. } => Err(MuxError::UnexpectedFrame("AUTH")),
        }
    }

    /// Peer wants a new stream: claim its id, dial the target
    /// asynchronously, answer with RESULT either way.
    async fn handle_syn(self: &Arc<Self>, stream_id: u16, address: String) -> Result<(), MuxError> {
        let placeholder = {
            let mut ports = self.ports.lock().unwrap();
            if stream_id == 0 || ports.slots.contains_key(&stream_id) {
                None
            } else {
                let (data_tx, data_rx) = mpsc::channel(INBOUND_QUEUE_CHUNKS);
                let shared = Arc::new(ConnShared::new(
                    stream_id,
                    address.clone(),
                    self.config.window_max,
                    Arc::clone(self),
                ));
                ports.slots.insert(
                    stream_id,
                    PortSlot::Stream(StreamSlot {
                        data_tx,
                        shared: Arc::clone(&shared),
                        result_tx: None,
                    }),
                );
                Some((shared, data_rx))
            }
        };

        let Some((shared, data_rx)) = placeholder else {
            // Peer bug, not fatal to the link; the existing stream is untouched
            warn!("SYN for occupied stream id {}", stream_id);
            return self
                .send_frame(&Frame::Result {
                    stream_id,
                    code: ReplyCode::IdExists,
                })
                .await;
        };

        let session = Arc::clone(self);
        let dialer = Arc::clone(&self.dialer);
        let dial_timeout = self.config.dial_timeout;
        tokio::spawn(async move {
            match timeout(dial_timeout, dialer.dial(&address)).await {
                Ok(Ok(target)) => {
                    if session
                        .send_frame(&Frame::Result {
                            stream_id,
                            code: ReplyCode::Ok,
                        })
                        .await
                        .is_err()
                    {
                        shared.close_remote();
                        return;
                    }
                    info!("Stream {} connected to {}", stream_id, address);
                    let conn = Conn::new(shared, data_rx);
                    let (up, down) = relay::splice(conn, target).await;
                    debug!("Stream {} finished ({} up / {} down bytes)", stream_id, up, down);
                }
                Ok(Err(e)) => {
                    warn!("Stream {} failed to connect to {}: {}", stream_id, address, e);
                    let _ = session
                        .send_frame(&Frame::Result {
                            stream_id,
                            code: ReplyCode::ConnFailed,
                        })
                        .await;
                    shared.close_remote();
                }
                Err(_) => {
                    warn!("Stream {} dial to {} timed out", stream_id, address);
                    let _ = session
                        .send_frame(&Frame::Result {
                            stream_id,
                            code: ReplyCode::ConnFailed,
                        })
                        .await;
                    shared.close_remote();
                }
            }
        });
        Ok(())
    }

    /// DNS frame: a response routes to the waiting slot like DATA; a query
    /// resolves locally and is answered on the same stream id.
    async fn handle_dns(self: &Arc<Self>, stream_id: u16, payload: Bytes) -> Result<(), MuxError> {
        let waiter = {
            let mut ports = self.ports.lock().unwrap();
            if matches!(ports.slots.get(&stream_id), Some(PortSlot::Dns(_))) {
                match ports.slots.remove(&stream_id) {
                    Some(PortSlot::Dns(tx)) => Some(tx),
                    _ => unreachable!(),
                }
            } else {
                None
            }
        };
        if let Some(tx) = waiter {
            let _ = tx.send(payload);
            return Ok(());
        }

        let name = dns::decode_query(&payload)?;
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let addrs = dns::resolve(&name).await;
            debug!("Resolved {} to {} address(es)", name, addrs.len());
            let _ = session
                .send_frame(&Frame::Dns {
                    stream_id,
                    payload: dns::encode_response(&addrs),
                })
                .await;
        });
        Ok(())
    }
}

/// Handle to one multiplexed session. Cheap to clone; all clones share the
/// same underlying link.
#[derive(Clone)]
pub struct Session {
    pub(crate) shared: Arc<SessionShared>,
}

impl Session {
    /// Build a session over an already-authenticated link and start its
    /// tasks: the read-dispatch loop, the liveness ticker and the rate
    /// decay ticker.
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        dialer: Arc<dyn Dialer>,
        peer: String,
        config: SessionConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(SessionShared {
            peer,
            config,
            writer: tokio::sync::Mutex::new(Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>),
            ports: Mutex::new(PortTable::new()),
            liveness: Liveness::new(),
            read_rate: RateCounter::new(),
            write_rate: RateCounter::new(),
            closed: AtomicBool::new(false),
            game_over: AtomicBool::new(false),
            close_notify: Notify::new(),
            dialer,
        });

        Self::spawn_dispatch(Arc::clone(&shared), Box::new(reader));
        Self::spawn_liveness(Arc::clone(&shared));
        Self::spawn_rate_decay(Arc::clone(&shared));

        Self { shared }
    }

    fn spawn_dispatch(shared: Arc<SessionShared>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    res = Frame::read_from(&mut reader) => match res {
                        Ok(frame) => frame,
                        Err(MuxError::Io(e))
                            if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                        {
                            debug!("Peer {} disconnected", shared.peer);
                            break;
                        }
                        Err(e) => {
                            error!("Session to {} failed: {}", shared.peer, e);
                            break;
                        }
                    },
                    _ = shared.wait_closed() => break,
                };

                shared.liveness.observe();
                shared.read_rate.add(frame.wire_len() as u64);
                trace!("Received {} frame for stream {}", frame.kind(), frame.stream_id());

                if let Err(e) = shared.handle_frame(frame).await {
                    error!("Fatal frame on session to {}: {}", shared.peer, e);
                    break;
                }
            }
            shared.close().await;
        });
    }

    fn spawn_liveness(shared: Arc<SessionShared>) {
        tokio::spawn(async move {
            loop {
                let delay = ping_delay(shared.config.ping_interval);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.wait_closed() => break,
                }
                if shared.is_closed() {
                    break;
                }
                match shared.liveness.tick() {
                    LivenessVerdict::Quiet => {}
                    LivenessVerdict::SendPing => {
                        shared.liveness.mark_outstanding();
                        let _ = shared.send_frame(&Frame::Ping { stream_id: 0 }).await;
                    }
                    LivenessVerdict::CloseLink => {
                        warn!(
                            "Peer {} silent for {} checks, forcing link closed",
                            shared.peer,
                            shared.liveness.missed()
                        );
                        shared.shutdown_link().await;
                    }
                    LivenessVerdict::GameOver => {
                        error!("Peer {} unresponsive for too long, giving up", shared.peer);
                        shared.set_game_over();
                        shared.close().await;
                        break;
                    }
                }
            }
        });
    }

    fn spawn_rate_decay(shared: Arc<SessionShared>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shared.wait_closed() => break,
                }
                shared.read_rate.decay();
                shared.write_rate.decay();
            }
        });
    }

    /// Open a virtual connection to `address` through this session:
    /// allocate an id, send SYN, wait for the peer's RESULT.
    pub async fn dial(&self, address: &str) -> Result<Conn, MuxError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let (data_tx, data_rx) = mpsc::channel(INBOUND_QUEUE_CHUNKS);
        let conn_shared = {
            let mut ports = shared.ports.lock().unwrap();
            let id = ports.next_free_id()?;
            let conn_shared = Arc::new(ConnShared::new(
                id,
                address.to_string(),
                shared.config.window_max,
                Arc::clone(shared),
            ));
            ports.slots.insert(
                id,
                PortSlot::Stream(StreamSlot {
                    data_tx,
                    shared: Arc::clone(&conn_shared),
                    result_tx: Some(result_tx),
                }),
            );
            conn_shared
        };

        let id = conn_shared.id;
        debug!("Dialing {} on stream {}", address, id);
        if let Err(e) = shared
            .send_frame(&Frame::Syn {
                stream_id: id,
                address: address.to_string(),
            })
            .await
        {
            conn_shared.close_remote();
            return Err(e);
        }

        match timeout(shared.config.dial_timeout, result_rx).await {
            Err(_) => {
                conn_shared.close_remote();
                // The peer may still answer later; reset its side so the
                // abandoned stream does not linger there
                let _ = shared.send_frame(&Frame::Rst { stream_id: id }).await;
                Err(MuxError::Timeout("dial"))
            }
            // The slot was dropped by session teardown
            Ok(Err(_)) => Err(MuxError::SessionClosed),
            Ok(Ok(ReplyCode::Ok)) => Ok(Conn::new(conn_shared, data_rx)),
            Ok(Ok(code)) => {
                conn_shared.close_remote();
                Err(MuxError::DialRefused(code))
            }
        }
    }

    /// Ask the peer to resolve a hostname. The waiting slot is removed even
    /// if the remote never answers.
    pub async fn dns_query(&self, name: &str) -> Result<Vec<IpAddr>, MuxError> {
        let shared = &self.shared;
        if shared.is_closed() {
            return Err(MuxError::SessionClosed);
        }

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut ports = shared.ports.lock().unwrap();
            let id = ports.next_free_id()?;
            ports.slots.insert(id, PortSlot::Dns(tx));
            id
        };

        if let Err(e) = shared
            .send_frame(&Frame::Dns {
                stream_id: id,
                payload: dns::encode_query(name),
            })
            .await
        {
            shared.release_stream(id);
            return Err(e);
        }

        match timeout(DNS_TIMEOUT, rx).await {
            Err(_) => {
                shared.release_stream(id);
                Err(MuxError::Timeout("dns"))
            }
            Ok(Err(_)) => Err(MuxError::SessionClosed),
            Ok(Ok(payload)) => {
                let addrs = dns::decode_response(&payload)?;
                if addrs.is_empty() {
                    Err(MuxError::DnsFailed(name.to_string()))
                } else {
                    Ok(addrs)
                }
            }
        }
    }

    /// Number of live virtual connections (the session's load)
    pub fn conn_count(&self) -> usize {
        let ports = self.shared.ports.lock().unwrap();
        ports
            .slots
            .values()
            .filter(|slot| matches!(slot, PortSlot::Stream(_)))
            .count()
    }

    /// Live streams with their target addresses (diagnostics)
    pub fn streams(&self) -> Vec<StreamStatus> {
        let ports = self.shared.ports.lock().unwrap();
        ports
            .slots
            .iter()
            .filter_map(|(&id, slot)| match slot {
                PortSlot::Stream(stream) => Some(StreamStatus {
                    id,
                    address: stream.shared.address.clone(),
                }),
                PortSlot::Dns(_) => None,
            })
            .collect()
    }

    /// Remote endpoint description
    pub fn peer(&self) -> &str {
        &self.shared.peer
    }

    /// Inbound bytes per second over the last interval
    pub fn read_rate(&self) -> u64 {
        self.shared.read_rate.rate()
    }

    /// Outbound bytes per second over the last interval
    pub fn write_rate(&self) -> u64 {
        self.shared.write_rate.rate()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether liveness gave up on this session for good; a game-over
    /// session must not be automatically replaced.
    pub fn is_game_over(&self) -> bool {
        self.shared.game_over.load(Ordering::SeqCst)
    }

    /// Tear the session down (idempotent)
    pub async fn close(&self) {
        self.shared.close().await;
    }

    /// Resolve once the session is fully torn down
    pub async fn wait_closed(&self) {
        self.shared.wait_closed().await;
    }

    /// Identity comparison for pool bookkeeping
    pub(crate) fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Client side of the handshake: send AUTH on stream 0, expect RESULT(Ok).
/// The whole exchange is bounded by the handshake timeout; callers drop the
/// link on any error.
pub async fn client_handshake<S>(
    stream: &mut S,
    username: &str,
    password: &str,
) -> Result<(), MuxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, async {
        let auth = Frame::Auth {
            stream_id: 0,
            username: username.to_string(),
            password: password.to_string(),
        };
        stream.write_all(&auth.encode()).await?;
        stream.flush().await?;

        match Frame::read_from(stream).await? {
            Frame::Result {
                code: ReplyCode::Ok,
                ..
            } => Ok(()),
            Frame::Result { .. } => Err(MuxError::AuthFailed),
            frame => Err(MuxError::UnexpectedFrame(frame.kind())),
        }
    })
    .await
    .map_err(|_| MuxError::Timeout("handshake"))?
}

/// Server side of the handshake: expect AUTH, validate, reply RESULT.
/// Returns the authenticated username.
pub async fn server_handshake<S>(
    stream: &mut S,
    credentials: &CredentialStore,
) -> Result<String, MuxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(HANDSHAKE_TIMEOUT, async {
        match Frame::read_from(stream).await? {
            Frame::Auth {
                username, password, ..
            } => {
                if credentials.verify(&username, &password) {
                    stream
                        .write_all(
                            &Frame::Result {
                                stream_id: 0,
                                code: ReplyCode::Ok,
                            }
                            .encode(),
                        )
                        .await?;
                    stream.flush().await?;
                    Ok(username)
                } else {
                    let _ = stream
                        .write_all(
                            &Frame::Result {
                                stream_id: 0,
                                code: ReplyCode::AuthFailed,
                            }
                            .encode(),
                        )
                        .await;
                    let _ = stream.flush().await;
                    Err(MuxError::AuthFailed)
                }
            }
            frame => Err(MuxError::UnexpectedFrame(frame.kind())),
        }
    })
    .await
    .map_err(|_| MuxError::Timeout("handshake"))?
}
