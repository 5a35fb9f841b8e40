//! One binary-protocol connection to an audio client
//!
//! A session owns its socket through two tasks: a reader that frames inbound
//! messages and hands them to the dispatcher, and a writer that drains the
//! session's private outbound queue. Enqueueing never blocks, so the registry
//! can fan out under its lock without a slow client stalling the others.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::ProtocolError;
use crate::hub::dispatch::Dispatcher;
use crate::protocol::{ClientMessage, Envelope, ServerMessage, Timestamp, ENVELOPE_SIZE};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A queued outbound frame: a shared handle to the message plus the request
/// id it answers (0 for unsolicited traffic)
pub struct OutboundFrame {
    pub message: Arc<ServerMessage>,
    pub refers_to: u16,
}

/// Live connection state for one audio client
pub struct ClientSession {
    id: u64,
    remote_ip: String,
    buffer_ms: i32,
    /// Empty until the client's Hello binds an identity
    mac_address: parking_lot::RwLock<String>,
    /// Audio chunks are withheld until the client sent startStream
    stream_active: AtomicBool,
    alive: AtomicBool,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    closed: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ClientSession {
    /// Start a session over `stream`: spawns the reader and writer tasks and
    /// returns the shared handle the registry will own
    pub fn spawn<S>(
        stream: S,
        remote_ip: String,
        buffer_ms: i32,
        io_timeout: Duration,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            remote_ip,
            buffer_ms,
            mac_address: parking_lot::RwLock::new(String::new()),
            stream_active: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            outbound: outbound_tx,
            closed: closed_tx,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let (reader, writer) = tokio::io::split(stream);
        let read_task = tokio::spawn(Self::read_loop(
            session.clone(),
            reader,
            io_timeout,
            dispatcher,
        ));
        let write_task = tokio::spawn(Self::write_loop(
            session.clone(),
            writer,
            outbound_rx,
            io_timeout,
        ));
        session.tasks.lock().extend([read_task, write_task]);
        session
    }

    async fn read_loop<R>(
        session: Arc<Self>,
        mut reader: R,
        io_timeout: Duration,
        dispatcher: Arc<Dispatcher>,
    ) where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut closed = session.closed.subscribe();
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                framed = timeout(io_timeout, read_frame(&mut reader)) => {
                    match framed {
                        Err(_) => {
                            tracing::debug!("Session {} read timeout", session.remote_ip);
                            break;
                        }
                        Ok(Err(e)) => {
                            tracing::debug!("Session {} read ended: {}", session.remote_ip, e);
                            break;
                        }
                        Ok(Ok((envelope, payload))) => {
                            match ClientMessage::decode(&envelope, payload) {
                                Ok(message) => dispatcher.handle(&session, &envelope, message),
                                Err(e) => {
                                    // protocol skew tolerance: no reply, no teardown
                                    tracing::debug!("Ignoring undecodable frame: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        }
        // reaped on the next broadcast pass, not proactively killed
        session.alive.store(false, Ordering::SeqCst);
    }

    async fn write_loop<W>(
        session: Arc<Self>,
        mut writer: W,
        mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        io_timeout: Duration,
    ) where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let mut closed = session.closed.subscribe();
        let mut next_id: u16 = 0;
        loop {
            tokio::select! {
                _ = closed.changed() => break,
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    next_id = next_id.wrapping_add(1);
                    let bytes = frame.message.encode_frame(next_id, frame.refers_to);
                    match timeout(io_timeout, writer.write_all(&bytes)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!("Session {} write failed: {}", session.remote_ip, e);
                            break;
                        }
                        Err(_) => {
                            tracing::debug!("Session {} write timeout", session.remote_ip);
                            break;
                        }
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
        session.alive.store(false, Ordering::SeqCst);
    }

    /// Enqueue a shared message on this session's outbound queue. Chunks are
    /// dropped while the stream is not armed; nothing here ever blocks.
    pub fn enqueue(&self, message: Arc<ServerMessage>, refers_to: u16) {
        if !self.alive() {
            return;
        }
        if message.is_chunk() && !self.stream_active() {
            return;
        }
        if self
            .outbound
            .send(OutboundFrame { message, refers_to })
            .is_err()
        {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Close the connection and wait for both tasks to finish
    pub async fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let _ = self.closed.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    pub fn buffer_ms(&self) -> i32 {
        self.buffer_ms
    }

    pub fn mac_address(&self) -> String {
        self.mac_address.read().clone()
    }

    pub fn set_mac_address(&self, mac: &str) {
        *self.mac_address.write() = mac.to_string();
    }

    pub fn stream_active(&self) -> bool {
        self.stream_active.load(Ordering::SeqCst)
    }

    pub fn set_stream_active(&self, active: bool) {
        self.stream_active.store(active, Ordering::SeqCst);
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the session dead without touching the socket; the registry's
    /// next reaping pass hands it to a teardown task
    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Read one complete frame: 26-byte envelope, then `size` payload bytes.
/// Stamps `received` the moment the frame is complete.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<(Envelope, Bytes), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; ENVELOPE_SIZE];
    reader.read_exact(&mut header).await.map_err(map_io)?;
    let mut envelope = Envelope::decode(&mut &header[..])?;

    let mut payload = vec![0u8; envelope.size as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(map_io)?;
    }
    envelope.received = Timestamp::now();
    Ok((envelope, Bytes::from(payload)))
}

fn map_io(e: std::io::Error) -> ProtocolError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
        _ => ProtocolError::Timeout,
    }
}
