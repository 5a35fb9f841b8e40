//! Control plane: JSON-RPC over newline-delimited TCP
//!
//! Every connected control session receives a terminal response for each call
//! it issues, plus unsolicited `Client.OnConnect` / `Client.OnUpdate` /
//! `Client.OnDisconnect` notifications whenever any client's state changes.

pub mod dispatch;
pub mod rpc;

pub use dispatch::ControlDispatcher;
pub use rpc::{RpcError, RpcRequest};

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

/// The set of connected control sessions, addressed only as a broadcast
/// target. Dead peers are pruned on the next send.
pub struct ControlHub {
    peers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl ControlHub {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(Vec::new()),
        }
    }

    /// Attach one control session's outbound queue
    pub fn register(&self, tx: mpsc::UnboundedSender<String>) {
        self.peers.lock().push(tx);
    }

    /// Push a notification to every control session
    pub fn notify<T: Serialize>(&self, method: &str, params: &T) {
        let params = serde_json::to_value(params).unwrap_or(Value::Null);
        let line = rpc::notification(method, params).to_string();
        self.send_all(&line);
    }

    fn send_all(&self, line: &str) {
        self.peers
            .lock()
            .retain(|tx| tx.send(line.to_string()).is_ok());
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

impl Default for ControlHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve one control connection until it closes or the server shuts down.
/// Responses and notifications share one outbound queue, so each session
/// observes its replies in call order with notifications interleaved. When
/// the connection ends, the queue's receiver drops and the next hub send
/// prunes this peer. On shutdown, queued lines are still flushed before the
/// socket closes.
pub async fn handle_control_connection<S>(
    stream: S,
    dispatcher: Arc<ControlDispatcher>,
    hub: Arc<ControlHub>,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    hub.register(tx.clone());

    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            outbound = rx.recv() => {
                let Some(line) = outbound else { break };
                if write_line(&mut writer, &line).await.is_err() {
                    break;
                }
            }
            read = lines.next_line() => match read {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let response = dispatcher.handle_line(line);
                    let _ = tx.send(response);
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Control connection read ended: {}", e);
                    break;
                }
            }
        }
    }

    // flush any response queued behind the final read
    while let Ok(line) = rx.try_recv() {
        if write_line(&mut writer, &line).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_line<W>(writer: &mut W, line: &str) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}
