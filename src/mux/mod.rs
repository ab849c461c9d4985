//! Stream Multiplexer
//!
//! Carries several named logical channels over one byte stream. Each channel is
//! strictly FIFO; there is no ordering across channels. Incoming frames are routed
//! by a dedicated reader task into per-channel queues, and all outgoing traffic is
//! serialized by a single writer task.
//!
//! ```text
//!   MuxChannel("control") ─┐                    ┌─> queue("control")
//!   MuxChannel("rpc")     ─┼─> writer task ═══> reader task ─┼─> queue("rpc")
//!   MuxChannel("console") ─┘   (frames)         └─> queue("console")
//! ```

pub mod frame;

pub use frame::{DecodedFrame, FrameCodec, FrameError, MuxFrame};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Reassembled messages may span at most this many frames
const MAX_FRAMES_PER_MESSAGE: usize = 1024;
const OUTBOUND_QUEUE: usize = 256;

/// Read and write halves of one transport
pub struct ByteStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ByteStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split an in-memory duplex pipe into a byte stream
    pub fn from_duplex(stream: tokio::io::DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MuxError {
    #[error("channel already open: {0}")]
    AlreadyOpen(String),

    #[error("invalid channel name: {0}")]
    InvalidName(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("multiplexer already started")]
    AlreadyStarted,
}

/// Counts protocol violations on one connection and trips once the limit is exceeded
#[derive(Debug)]
pub struct ViolationTracker {
    count: AtomicU32,
    limit: u32,
    tripped: CancellationToken,
}

impl ViolationTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
            tripped: CancellationToken::new(),
        }
    }

    /// Record one violation; returns true once the connection should be treated as crashed
    pub fn record(&self, source: &str, detail: &str) -> bool {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(source, count, limit = self.limit, "protocol violation: {}", detail);
        if count > self.limit && !self.tripped.is_cancelled() {
            warn!(source, "protocol violation limit exceeded");
            self.tripped.cancel();
        }
        self.tripped.is_cancelled()
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.is_cancelled()
    }

    pub fn tripped(&self) -> CancellationToken {
        self.tripped.clone()
    }
}

enum Outbound {
    Message { channel: String, payload: Bytes },
    Close { channel: String },
}

#[derive(Default)]
struct ChannelTable {
    open: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    closed: HashSet<String>,
    partial: HashMap<String, (BytesMut, usize)>,
}

struct MuxShared {
    table: Mutex<ChannelTable>,
    violations: Arc<ViolationTracker>,
    closed: CancellationToken,
    max_payload: usize,
}

impl MuxShared {
    fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, frame: MuxFrame) {
        let mut table = self.table();

        if frame.is_close() {
            if table.open.remove(&frame.channel).is_some() {
                debug!(channel = %frame.channel, "peer closed channel");
                table.partial.remove(&frame.channel);
                table.closed.insert(frame.channel);
            } else if !table.closed.contains(&frame.channel) {
                drop(table);
                self.violations.record(
                    "mux",
                    &format!("close for unopened channel '{}'", frame.channel),
                );
            }
            return;
        }

        if table.closed.contains(&frame.channel) {
            trace!(channel = %frame.channel, "dropping frame for closed channel");
            return;
        }

        if !table.open.contains_key(&frame.channel) {
            drop(table);
            self.violations.record(
                "mux",
                &format!("frame for unopened channel '{}'", frame.channel),
            );
            return;
        }

        let message = {
            let entry = table.partial.entry(frame.channel.clone()).or_default();
            if frame.is_end() && entry.0.is_empty() {
                Some(frame.payload)
            } else {
                entry.0.extend_from_slice(&frame.payload);
                entry.1 += 1;
                if entry.1 > MAX_FRAMES_PER_MESSAGE {
                    table.partial.remove(&frame.channel);
                    drop(table);
                    self.violations.record(
                        "mux",
                        &format!("message on '{}' exceeds frame limit", frame.channel),
                    );
                    return;
                }
                if frame.is_end() {
                    table
                        .partial
                        .remove(&frame.channel)
                        .map(|(buf, _)| buf.freeze())
                } else {
                    None
                }
            }
        };

        let Some(message) = message else {
            return;
        };

        let delivered = table
            .open
            .get(&frame.channel)
            .map(|tx| tx.send(message).is_ok())
            .unwrap_or(false);
        if !delivered {
            debug!(channel = %frame.channel, "receiver dropped; closing channel");
            table.open.remove(&frame.channel);
            table.closed.insert(frame.channel);
        }
    }

    fn close_all(&self) {
        let mut table = self.table();
        table.open.clear();
        table.partial.clear();
        drop(table);
        self.closed.cancel();
    }
}

/// Frames several logical channels onto one transport
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    outbound_tx: mpsc::Sender<Outbound>,
    pending: Mutex<Option<(ByteStream, mpsc::Receiver<Outbound>)>>,
}

impl Multiplexer {
    /// Create a multiplexer; channels may be opened before [`Multiplexer::start`]
    /// so that no early frame is dropped. A `max_payload` of zero is raised to one byte.
    pub fn new(stream: ByteStream, max_payload: usize, violations: Arc<ViolationTracker>) -> Self {
        let max_payload = max_payload.max(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        Self {
            shared: Arc::new(MuxShared {
                table: Mutex::new(ChannelTable::default()),
                violations,
                closed: CancellationToken::new(),
                max_payload,
            }),
            outbound_tx,
            pending: Mutex::new(Some((stream, outbound_rx))),
        }
    }

    /// Spawn the reader and writer tasks
    pub fn start(&self) -> Result<(), MuxError> {
        let (stream, outbound_rx) = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(MuxError::AlreadyStarted)?;

        tokio::spawn(writer_loop(stream.writer, outbound_rx, Arc::clone(&self.shared)));
        tokio::spawn(reader_loop(stream.reader, Arc::clone(&self.shared)));
        Ok(())
    }

    pub fn open_channel(&self, name: &str) -> Result<MuxChannel, MuxError> {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(MuxError::InvalidName(name.to_string()));
        }
        if self.shared.closed.is_cancelled() {
            return Err(MuxError::TransportClosed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut table = self.shared.table();
            if table.open.contains_key(name) {
                return Err(MuxError::AlreadyOpen(name.to_string()));
            }
            table.closed.remove(name);
            table.open.insert(name.to_string(), tx);
        }
        debug!(channel = name, "opened mux channel");

        Ok(MuxChannel {
            sender: ChannelSender {
                name: name.to_string(),
                outbound: self.outbound_tx.clone(),
                shared: Arc::clone(&self.shared),
            },
            receiver: ChannelReceiver {
                name: name.to_string(),
                inbound: rx,
            },
        })
    }

    /// Cancelled when the transport ends, for any reason
    pub fn closed(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn violations(&self) -> Arc<ViolationTracker> {
        Arc::clone(&self.shared.violations)
    }

    pub fn shutdown(&self) {
        self.shared.close_all();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shared.close_all();
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("closed", &self.is_closed())
            .field("violations", &self.shared.violations.count())
            .finish()
    }
}

/// One logical channel; split it to share the send half between tasks
pub struct MuxChannel {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

impl MuxChannel {
    pub fn name(&self) -> &str {
        &self.sender.name
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), MuxError> {
        self.sender.send(payload).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.receiver.recv().await
    }

    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }
}

/// Cloneable send half of a channel
#[derive(Clone)]
pub struct ChannelSender {
    name: String,
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<MuxShared>,
}

impl ChannelSender {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), MuxError> {
        if self.shared.closed.is_cancelled() {
            return Err(MuxError::TransportClosed);
        }
        if !self.shared.table().open.contains_key(&self.name) {
            return Err(MuxError::ChannelClosed(self.name.clone()));
        }
        self.outbound
            .send(Outbound::Message {
                channel: self.name.clone(),
                payload,
            })
            .await
            .map_err(|_| MuxError::TransportClosed)
    }

    /// Close this channel only; the transport and other channels keep running
    pub async fn close(&self) {
        {
            let mut table = self.shared.table();
            table.open.remove(&self.name);
            table.partial.remove(&self.name);
            table.closed.insert(self.name.clone());
        }
        let _ = self
            .outbound
            .send(Outbound::Close {
                channel: self.name.clone(),
            })
            .await;
        debug!(channel = %self.name, "closed mux channel");
    }
}

/// Receive half of a channel; yields whole messages in FIFO order
pub struct ChannelReceiver {
    name: String,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl ChannelReceiver {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` once the channel or the transport is closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

async fn reader_loop(reader: Box<dyn AsyncRead + Send + Unpin>, shared: Arc<MuxShared>) {
    let mut frames = FramedRead::new(reader, FrameCodec::new(shared.max_payload));

    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = frames.next() => match next {
                Some(Ok(DecodedFrame::Frame(frame))) => {
                    trace!(channel = %frame.channel, len = frame.payload.len(), "frame received");
                    shared.route(frame);
                }
                Some(Ok(DecodedFrame::Malformed(detail))) => {
                    shared.violations.record("mux", &detail);
                }
                Some(Err(e)) => {
                    warn!("transport read failed: {}", e);
                    if matches!(e, FrameError::Oversized { .. }) {
                        shared.violations.record("mux", &e.to_string());
                    }
                    break;
                }
                None => {
                    debug!("transport reached EOF");
                    break;
                }
            }
        }
    }

    shared.close_all();
}

async fn writer_loop(
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<MuxShared>,
) {
    let mut sink = FramedWrite::new(writer, FrameCodec::new(shared.max_payload));

    loop {
        let item = tokio::select! {
            _ = shared.closed.cancelled() => break,
            item = rx.recv() => item,
        };

        let frames = match item {
            Some(Outbound::Message { channel, payload }) => {
                MuxFrame::split_message(&channel, payload, shared.max_payload)
            }
            Some(Outbound::Close { channel }) => vec![MuxFrame::close(&channel)],
            None => break,
        };

        let mut result = Ok(());
        for frame in frames {
            result = sink.feed(frame).await;
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = sink.flush().await;
        }

        if let Err(e) = result {
            warn!("transport write failed: {}", e);
            shared.close_all();
            break;
        }
    }

    let _ = sink.close().await;
}
