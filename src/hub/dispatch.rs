//! Binary protocol dispatcher
//!
//! Per-frame state machine driven by the decoded [`ClientMessage`]. Replies
//! go straight onto the session's outbound queue with `refers_to` set to the
//! request's envelope id. Unknown traffic is a silent no-op.

use std::sync::Arc;

use chrono::Utc;

use crate::control::ControlHub;
use crate::hub::registry::SessionRegistry;
use crate::hub::session::ClientSession;
use crate::protocol::{
    ClientMessage, Envelope, Hello, RequestKind, SampleFormat, ServerMessage, ServerSettings,
};
use crate::store::{ClientInfo, ClientStore};

/// Build the ephemeral settings message for one client record
pub(crate) fn settings_for(info: &ClientInfo, buffer_ms: i32) -> ServerSettings {
    ServerSettings {
        volume: info.volume.percent,
        muted: info.volume.muted,
        latency: info.latency,
        buffer_ms,
    }
}

/// Interprets frames received from audio clients
pub struct Dispatcher {
    sample_format: SampleFormat,
    buffer_ms: i32,
    registry: Arc<SessionRegistry>,
    store: Arc<ClientStore>,
    control: Arc<ControlHub>,
}

impl Dispatcher {
    pub fn new(
        sample_format: SampleFormat,
        buffer_ms: i32,
        registry: Arc<SessionRegistry>,
        store: Arc<ClientStore>,
        control: Arc<ControlHub>,
    ) -> Self {
        Self {
            sample_format,
            buffer_ms,
            registry,
            store,
            control,
        }
    }

    pub fn handle(&self, session: &Arc<ClientSession>, envelope: &Envelope, message: ClientMessage) {
        match message {
            ClientMessage::Hello(hello) => self.handle_hello(session, hello),
            ClientMessage::Request(kind) => self.handle_request(session, envelope, kind),
            ClientMessage::Command(name) => self.handle_command(session, envelope, &name),
            ClientMessage::Other => {}
        }
    }

    fn handle_request(&self, session: &Arc<ClientSession>, envelope: &Envelope, kind: RequestKind) {
        match kind {
            RequestKind::Time => {
                // round-trip estimate from the envelope's own stamps
                let latency = envelope.received.seconds_since(envelope.sent);
                session.enqueue(Arc::new(ServerMessage::Time { latency }), envelope.id);
            }
            RequestKind::ServerSettings => {
                let info = self.store.get_or_create(&session.mac_address());
                session.enqueue(
                    Arc::new(ServerMessage::ServerSettings(settings_for(
                        &info,
                        self.buffer_ms,
                    ))),
                    envelope.id,
                );
            }
            RequestKind::SampleFormat => {
                session.enqueue(
                    Arc::new(ServerMessage::SampleFormat(self.sample_format)),
                    envelope.id,
                );
            }
            RequestKind::CodecHeader => {
                // snapshot read shares the registry's critical section
                if let Some(header) = self.registry.header() {
                    session.enqueue(Arc::new(ServerMessage::CodecHeader(header)), envelope.id);
                }
            }
        }
    }

    fn handle_command(&self, session: &Arc<ClientSession>, envelope: &Envelope, name: &str) {
        if name == "startStream" {
            session.enqueue(Arc::new(ServerMessage::Ack), envelope.id);
            session.set_stream_active(true);
        }
    }

    fn handle_hello(&self, session: &Arc<ClientSession>, hello: Hello) {
        let mac = hello.mac_address.trim().to_string();
        if mac.is_empty() {
            tracing::debug!("Hello without a mac address from {}", session.remote_ip());
            return;
        }
        tracing::info!(
            "Hello from {}, host: {}, v{}",
            mac,
            hello.host_name,
            hello.version
        );

        session.set_mac_address(&mac);
        self.registry.evict_duplicate(&mac, session.id());

        let info = self.store.update_or_create(&mac, |client| {
            client.ip_address = session.remote_ip().to_string();
            client.host_name = hello.host_name.clone();
            client.version = hello.version.clone();
            client.connected = true;
            client.last_seen = Utc::now();
        });
        self.store.save_or_log();

        // only after the mutation and the save, so observers reacting to the
        // notification see the new state
        self.control.notify("Client.OnConnect", &info);
    }

    /// Bookkeeping for a session the reaping pass removed: mark the record
    /// disconnected, persist, then tell the control observers
    pub fn handle_disconnect(&self, mac: &str) {
        let Some(info) = self.store.update(mac, |client| {
            client.connected = false;
            client.last_seen = Utc::now();
        }) else {
            return;
        };
        self.store.save_or_log();
        self.control.notify("Client.OnDisconnect", &info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::session::read_frame;
    use crate::protocol::{MessageType, Timestamp};
    use bytes::Buf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        registry: Arc<SessionRegistry>,
        store: Arc<ClientStore>,
        notifications: mpsc::UnboundedReceiver<String>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let store = Arc::new(ClientStore::new());
        let control = Arc::new(ControlHub::new());
        let (tx, notifications) = mpsc::unbounded_channel();
        control.register(tx);
        let dispatcher = Arc::new(Dispatcher::new(
            SampleFormat {
                rate: 48000,
                bits: 16,
                channels: 2,
            },
            1000,
            registry.clone(),
            store.clone(),
            control.clone(),
        ));
        Fixture {
            dispatcher,
            registry,
            store,
            notifications,
        }
    }

    fn spawn_session(fx: &Fixture) -> (Arc<ClientSession>, tokio::io::DuplexStream) {
        let (local, peer) = tokio::io::duplex(64 * 1024);
        let session = ClientSession::spawn(
            local,
            "192.168.1.30".to_string(),
            1000,
            Duration::from_secs(5),
            fx.dispatcher.clone(),
        );
        (session, peer)
    }

    fn request_envelope(id: u16) -> Envelope {
        Envelope {
            msg_type: MessageType::Request,
            id,
            refers_to: 0,
            sent: Timestamp { sec: 10, usec: 250_000 },
            received: Timestamp { sec: 11, usec: 500_000 },
            size: 0,
        }
    }

    #[tokio::test]
    async fn test_time_request_round_trip() {
        let fx = fixture();
        let (session, mut peer) = spawn_session(&fx);
        let envelope = request_envelope(9);

        fx.dispatcher
            .handle(&session, &envelope, ClientMessage::Request(RequestKind::Time));

        let (reply, mut payload) = read_frame(&mut peer).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Time);
        assert_eq!(reply.refers_to, 9);
        let latency = payload.get_f64_le();
        assert!((latency - 1.25).abs() < 1e-9);

        // idempotent: no state was touched
        assert!(fx.store.all().is_empty());
        assert_eq!(session.mac_address(), "");
    }

    #[tokio::test]
    async fn test_server_settings_request_creates_record() {
        let fx = fixture();
        let (session, mut peer) = spawn_session(&fx);
        session.set_mac_address("AA:BB");

        fx.dispatcher.handle(
            &session,
            &request_envelope(4),
            ClientMessage::Request(RequestKind::ServerSettings),
        );

        let (reply, mut payload) = read_frame(&mut peer).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::ServerSettings);
        assert_eq!(reply.refers_to, 4);
        assert_eq!(payload.get_u16_le(), 100); // default volume
        assert_eq!(payload.get_u8(), 0);
        assert_eq!(payload.get_i32_le(), 0);
        assert_eq!(payload.get_i32_le(), 1000);

        assert!(fx.store.get("AA:BB").is_some(), "record created on demand");
    }

    #[tokio::test]
    async fn test_header_request_without_source_is_silent() {
        let fx = fixture();
        let (session, mut peer) = spawn_session(&fx);

        fx.dispatcher.handle(
            &session,
            &request_envelope(2),
            ClientMessage::Request(RequestKind::CodecHeader),
        );
        // nothing on the wire; a subsequent reply proves nothing was queued
        fx.dispatcher
            .handle(&session, &request_envelope(3), ClientMessage::Request(RequestKind::Time));
        let (reply, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Time);
        assert_eq!(reply.refers_to, 3);
    }

    #[tokio::test]
    async fn test_start_stream_command_arms_and_acks() {
        let fx = fixture();
        let (session, mut peer) = spawn_session(&fx);
        assert!(!session.stream_active());

        let envelope = Envelope {
            msg_type: MessageType::Command,
            ..request_envelope(12)
        };
        fx.dispatcher.handle(
            &session,
            &envelope,
            ClientMessage::Command("startStream".to_string()),
        );

        let (reply, _) = read_frame(&mut peer).await.unwrap();
        assert_eq!(reply.msg_type, MessageType::Ack);
        assert_eq!(reply.refers_to, 12);
        assert!(session.stream_active());
    }

    #[tokio::test]
    async fn test_unknown_command_is_noop() {
        let fx = fixture();
        let (session, _peer) = spawn_session(&fx);
        fx.dispatcher.handle(
            &session,
            &request_envelope(1),
            ClientMessage::Command("selfDestruct".to_string()),
        );
        assert!(!session.stream_active());
    }

    #[tokio::test]
    async fn test_hello_binds_identity_and_notifies() {
        let mut fx = fixture();
        let (session, _peer) = spawn_session(&fx);
        fx.registry.register(session.clone());

        fx.dispatcher.handle(
            &session,
            &request_envelope(1),
            ClientMessage::Hello(Hello {
                mac_address: "AA:BB:CC:DD:EE:FF".to_string(),
                host_name: "livingroom".to_string(),
                version: "0.4.0".to_string(),
            }),
        );

        assert_eq!(session.mac_address(), "AA:BB:CC:DD:EE:FF");
        let info = fx.store.get("AA:BB:CC:DD:EE:FF").unwrap();
        assert!(info.connected);
        assert_eq!(info.host_name, "livingroom");
        assert_eq!(info.version, "0.4.0");
        assert_eq!(info.ip_address, "192.168.1.30");

        let line = fx.notifications.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "Client.OnConnect");
        assert_eq!(value["params"]["macAddress"], "AA:BB:CC:DD:EE:FF");
    }

    #[tokio::test]
    async fn test_hello_collision_evicts_stale_session() {
        let fx = fixture();
        let (old, _old_peer) = spawn_session(&fx);
        let (new, _new_peer) = spawn_session(&fx);
        fx.registry.register(old.clone());
        fx.registry.register(new.clone());

        let hello = Hello {
            mac_address: "AA:BB".to_string(),
            host_name: "h".to_string(),
            version: "1".to_string(),
        };
        fx.dispatcher
            .handle(&old, &request_envelope(1), ClientMessage::Hello(hello.clone()));
        fx.dispatcher
            .handle(&new, &request_envelope(1), ClientMessage::Hello(hello));

        // no two live sessions share one identity
        assert_eq!(fx.registry.session_count(), 1);
        assert_eq!(fx.registry.lookup("AA:BB").unwrap().id(), new.id());
        assert!(!old.alive());
    }

    #[tokio::test]
    async fn test_disconnect_persists_and_notifies() {
        let mut fx = fixture();
        fx.store.update_or_create("AA:BB", |c| c.connected = true);

        fx.dispatcher.handle_disconnect("AA:BB");

        assert!(!fx.store.get("AA:BB").unwrap().connected);
        let line = fx.notifications.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["method"], "Client.OnDisconnect");
        assert_eq!(value["params"]["connected"], false);
    }

    #[tokio::test]
    async fn test_disconnect_for_unknown_mac_is_silent() {
        let mut fx = fixture();
        fx.dispatcher.handle_disconnect("no-such-client");
        assert!(fx.notifications.try_recv().is_err());
    }
}
