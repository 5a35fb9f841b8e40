//! Stream hub: session registry, broadcast engine, binary dispatcher and
//! server lifecycle

pub mod dispatch;
pub mod registry;
pub mod session;

pub use dispatch::Dispatcher;
pub use registry::SessionRegistry;
pub use session::ClientSession;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::HubConfig;
use crate::control::{handle_control_connection, ControlDispatcher, ControlHub};
use crate::protocol::{SampleFormat, ServerMessage};
use crate::source::{PipeSource, SourceEvent};
use crate::store::ClientStore;

/// The server: owns the accept loops, the session registry, both dispatchers
/// and the audio source feed
pub struct StreamHub {
    config: HubConfig,
    sample_format: SampleFormat,
    store: Arc<ClientStore>,
    registry: Arc<SessionRegistry>,
    control: Arc<ControlHub>,
    dispatcher: Arc<Dispatcher>,
    control_dispatcher: Arc<ControlDispatcher>,
    shutdown: watch::Sender<bool>,
    tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    source: parking_lot::Mutex<Option<PipeSource>>,
}

impl StreamHub {
    pub fn new(config: HubConfig, store: Arc<ClientStore>) -> crate::Result<Self> {
        let sample_format: SampleFormat = config.sample_format.parse()?;
        let registry = Arc::new(SessionRegistry::new());
        let control = Arc::new(ControlHub::new());
        let dispatcher = Arc::new(Dispatcher::new(
            sample_format,
            config.buffer_ms,
            registry.clone(),
            store.clone(),
            control.clone(),
        ));
        let control_dispatcher = Arc::new(ControlDispatcher::new(
            config.buffer_ms,
            registry.clone(),
            store.clone(),
            control.clone(),
        ));
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            sample_format,
            store,
            registry,
            control,
            dispatcher,
            control_dispatcher,
            shutdown,
            tasks: Arc::new(parking_lot::Mutex::new(Vec::new())),
            source: parking_lot::Mutex::new(None),
        })
    }

    /// Begin listening for control and audio-client connections and start
    /// the audio source feed
    pub async fn start(&self) -> crate::Result<()> {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        // control plane
        let control_listener =
            TcpListener::bind(SocketAddr::new(any, self.config.control_port)).await?;
        tracing::info!(
            "Control listener on {}",
            control_listener.local_addr()?
        );
        self.spawn_control_accept(control_listener);

        // audio source
        let (source, events) = PipeSource::spawn(
            self.config.source_path.clone(),
            self.sample_format,
            &self.config.codec,
            self.config.chunk_ms,
        );
        self.registry.set_header(source.header().clone());
        *self.source.lock() = Some(source);
        self.spawn_feed(events);

        // audio clients
        let stream_listener =
            TcpListener::bind(SocketAddr::new(any, self.config.stream_port)).await?;
        tracing::info!("Stream listener on {}", stream_listener.local_addr()?);
        self.spawn_stream_accept(stream_listener);

        Ok(())
    }

    fn spawn_stream_accept(&self, listener: TcpListener) {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let buffer_ms = self.config.buffer_ms;
        let io_timeout = Duration::from_secs(self.config.io_timeout_secs);
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!("New client connection: {}", peer.ip());
                            let _ = stream.set_nodelay(true);
                            let session = ClientSession::spawn(
                                stream,
                                peer.ip().to_string(),
                                buffer_ms,
                                io_timeout,
                                dispatcher.clone(),
                            );
                            registry.register(session);
                        }
                        Err(e) => {
                            tracing::warn!("Accept failed: {}", e);
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_control_accept(&self, listener: TcpListener) {
        let control = self.control.clone();
        let dispatcher = self.control_dispatcher.clone();
        let tasks = self.tasks.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tracing::info!("New control connection: {}", peer.ip());
                            // tracked so stop() can join it; the shutdown
                            // watch lets it flush in-flight replies first
                            let conn = tokio::spawn(handle_control_connection(
                                stream,
                                dispatcher.clone(),
                                control.clone(),
                                shutdown.clone(),
                            ));
                            tasks.lock().push(conn);
                        }
                        Err(e) => {
                            tracing::warn!("Control accept failed: {}", e);
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Forward every source chunk to the broadcast engine and surface the
    /// disconnects the reaping pass discovered
    fn spawn_feed(&self, mut events: tokio::sync::mpsc::Receiver<SourceEvent>) {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Some(SourceEvent::Chunk(chunk)) => {
                            let gone =
                                registry.broadcast(Arc::new(ServerMessage::Chunk(chunk)));
                            for mac in gone {
                                dispatcher.handle_disconnect(&mac);
                            }
                        }
                        Some(SourceEvent::Resync(ms)) => {
                            tracing::info!("Source resync: {:.1}ms", ms);
                        }
                        None => break,
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Stop listeners and the source, then stop every live session. Unlike
    /// the broadcast reaping path this blocks until all sessions finished
    /// their cleanup, since the process is exiting.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let source = self.source.lock().take();
        if let Some(source) = source {
            source.stop().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        for session in self.registry.drain() {
            session.stop().await;
        }

        // the final save blocks; a detached write could be lost at exit
        if let Err(e) = self.store.save() {
            tracing::warn!("Client registry persistence failed: {}", e);
        }
        tracing::info!("Hub stopped");
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::ClientSession;
    use crate::protocol::{PcmChunk, Timestamp};
    use bytes::Bytes;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn test_hub() -> (StreamHub, Arc<ClientStore>) {
        let store = Arc::new(ClientStore::new());
        let hub = StreamHub::new(HubConfig::default(), store.clone()).unwrap();
        (hub, store)
    }

    fn spawn_session(hub: &StreamHub) -> (Arc<ClientSession>, tokio::io::DuplexStream) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let session = ClientSession::spawn(
            local,
            "127.0.0.1".to_string(),
            hub.config.buffer_ms,
            Duration::from_secs(5),
            hub.dispatcher.clone(),
        );
        (session, peer)
    }

    #[test]
    fn test_new_rejects_invalid_sample_format() {
        let config = HubConfig {
            sample_format: "48000x16x2".to_string(),
            ..HubConfig::default()
        };
        assert!(StreamHub::new(config, Arc::new(ClientStore::new())).is_err());
    }

    #[tokio::test]
    async fn test_feed_pass_records_disconnect_for_dead_session() {
        let (hub, store) = test_hub();
        let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
        hub.control.register(observer_tx);

        let (session, _peer) = spawn_session(&hub);
        session.set_mac_address("AA:BB");
        session.set_stream_active(true);
        store.update_or_create("AA:BB", |c| c.connected = true);
        hub.registry.register(session.clone());
        session.mark_dead();

        let (events_tx, events_rx) = mpsc::channel(4);
        hub.spawn_feed(events_rx);
        events_tx
            .send(SourceEvent::Chunk(PcmChunk {
                timestamp: Timestamp { sec: 1, usec: 0 },
                payload: Bytes::from_static(&[0u8; 8]),
            }))
            .await
            .unwrap();

        // the feed pass reaps the session, then runs the disconnect
        // bookkeeping: record persisted as offline, observers notified
        let note: Value = serde_json::from_str(&observer_rx.recv().await.unwrap()).unwrap();
        assert_eq!(note["method"], "Client.OnDisconnect");
        assert_eq!(note["params"]["macAddress"], "AA:BB");
        assert!(!store.get("AA:BB").unwrap().connected);
        assert_eq!(hub.registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_tears_down_every_session() {
        let (hub, _store) = test_hub();
        let (first, _first_peer) = spawn_session(&hub);
        let (second, _second_peer) = spawn_session(&hub);
        hub.registry.register(first.clone());
        hub.registry.register(second.clone());

        hub.stop().await;

        assert_eq!(hub.registry.session_count(), 0);
        assert!(!first.alive());
        assert!(!second.alive());
    }
}
