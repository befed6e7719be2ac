//! Virtual connections
//!
//! A [`Conn`] is one logical byte stream multiplexed inside a session. It
//! owns a private inbound queue fed by the session's dispatch loop and an
//! outbound [`Window`] replenished by peer ACKs. Writes are chunked, gated
//! by the window and serialized through the session's single writer; reads
//! drain the inbound queue and batch-acknowledge consumed bytes back to the
//! peer.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::trace;

use super::frame::Frame;
use super::session::SessionShared;
use super::window::Window;
use super::{MuxError, ACK_BATCH, ACK_DELAY, CHUNK_MAX, CHUNK_MIN};

/// State shared between the two halves of a [`Conn`] and its session's port
/// table.
pub(crate) struct ConnShared {
    pub(crate) id: u16,
    pub(crate) address: String,
    pub(crate) window: Arc<Window>,
    pub(crate) session: Arc<SessionShared>,
    /// Guards teardown: whoever swaps this first runs the close sequence
    closed: AtomicBool,
    /// Consumed-but-unacknowledged inbound bytes
    pending_ack: AtomicU32,
}

impl ConnShared {
    pub(crate) fn new(id: u16, address: String, window_max: u32, session: Arc<SessionShared>) -> Self {
        Self {
            id,
            address,
            window: Arc::new(Window::new(window_max)),
            session,
            closed: AtomicBool::new(false),
            pending_ack: AtomicU32::new(0),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Locally initiated teardown: runs at most once across all triggers.
    /// Sends exactly one FIN, poisons the window and frees the stream id.
    pub(crate) async fn close_local(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("Closing stream {}", self.id);
        self.window.close();
        self.session.release_stream(self.id);
        let _ = self
            .session
            .send_frame(&Frame::Fin { stream_id: self.id })
            .await;
    }

    /// Peer- or session-initiated teardown: the far side already knows, so
    /// no FIN goes out. Idempotent against `close_local`.
    pub(crate) fn close_remote(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("Stream {} closed by peer", self.id);
        self.window.close();
        self.session.release_stream(self.id);
    }

    /// Account consumed inbound bytes; flushes an ACK early once the batch
    /// threshold is reached.
    async fn note_consumed(&self, n: u32) {
        let pending = self.pending_ack.fetch_add(n, Ordering::Relaxed) + n;
        if pending >= ACK_BATCH {
            self.flush_acks().await;
        }
    }

    /// Send one ACK carrying everything consumed since the last flush
    pub(crate) async fn flush_acks(&self) {
        let delta = self.pending_ack.swap(0, Ordering::Relaxed);
        if delta == 0 {
            return;
        }
        let _ = self
            .session
            .send_frame(&Frame::Ack {
                stream_id: self.id,
                window: delta,
            })
            .await;
    }
}

/// Read half of a virtual connection
pub struct ConnReader {
    shared: Arc<ConnShared>,
    incoming: mpsc::Receiver<Bytes>,
    leftover: Bytes,
}

impl ConnReader {
    /// Pull bytes from the inbound queue.
    ///
    /// Returns 0 once the stream is closed and the queue is drained.
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        if self.leftover.is_empty() {
            match self.incoming.recv().await {
                Some(chunk) => self.leftover = chunk,
                None => return 0,
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        self.shared.note_consumed(n as u32).await;
        n
    }
}

/// Write half of a virtual connection
#[derive(Clone)]
pub struct ConnWriter {
    shared: Arc<ConnShared>,
}

impl ConnWriter {
    /// Write `data` to the stream.
    ///
    /// Large writes are split into randomized chunks so a single busy
    /// stream does not monopolize the link; each chunk waits for window
    /// budget before it is framed. Returns a closed-stream error if the
    /// window is poisoned mid-write; progress already flushed stays
    /// flushed.
    pub async fn write(&self, data: &[u8]) -> Result<usize, MuxError> {
        let mut sent = 0;
        while sent < data.len() {
            let goal = (data.len() - sent).min(chunk_size());
            let granted = self.shared.window.acquire(goal as u32).await;
            if granted == 0 {
                return Err(MuxError::StreamClosed);
            }
            let chunk = Bytes::copy_from_slice(&data[sent..sent + granted as usize]);
            self.shared
                .session
                .send_frame(&Frame::Data {
                    stream_id: self.shared.id,
                    payload: chunk,
                })
                .await?;
            sent += granted as usize;
        }
        Ok(sent)
    }

    /// Close the whole connection (both directions)
    pub async fn close(&self) {
        self.shared.close_local().await;
    }
}

/// One multiplexed logical stream.
///
/// Split into halves for use in a bidirectional relay.
pub struct Conn {
    reader: ConnReader,
    writer: ConnWriter,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl Conn {
    /// Assemble a connection and start its delayed-ACK flusher.
    pub(crate) fn new(shared: Arc<ConnShared>, incoming: mpsc::Receiver<Bytes>) -> Self {
        let flusher = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(ACK_DELAY).await;
                if flusher.is_closed() {
                    break;
                }
                flusher.flush_acks().await;
            }
        });

        Self {
            reader: ConnReader {
                shared: Arc::clone(&shared),
                incoming,
                leftover: Bytes::new(),
            },
            writer: ConnWriter { shared },
        }
    }

    /// Stream id within the owning session
    pub fn id(&self) -> u16 {
        self.writer.shared.id
    }

    /// The dialed target address (diagnostics)
    pub fn address(&self) -> &str {
        &self.writer.shared.address
    }

    /// See [`ConnReader::read`]
    pub async fn read(&mut self, buf: &mut [u8]) -> usize {
        self.reader.read(buf).await
    }

    /// See [`ConnWriter::write`]
    pub async fn write(&self, data: &[u8]) -> Result<usize, MuxError> {
        self.writer.write(data).await
    }

    /// Close the connection. Safe to call from multiple triggers
    /// concurrently; the teardown sequence runs exactly once.
    pub async fn close(&self) {
        self.writer.close().await;
    }

    /// Split into independently owned halves for a two-task relay
    pub fn split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }
}

/// Randomized write-chunk size, always under the 8 KiB fairness bound
fn chunk_size() -> usize {
    rand::thread_rng().gen_range(CHUNK_MIN..CHUNK_MAX)
}
