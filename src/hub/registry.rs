//! Live-session set and broadcast engine
//!
//! One Mutex guards the session set and the current codec-header snapshot.
//! Broadcast executes its reap pass and its fan-out in a single critical
//! section so every session either receives the message or is already being
//! torn down, never both. The lock is never held across a socket write;
//! fan-out only enqueues on each session's private queue.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::hub::session::ClientSession;
use crate::protocol::{CodecHeader, ServerMessage};

struct Shared {
    sessions: Vec<Arc<ClientSession>>,
    header: Option<CodecHeader>,
}

/// The set of live client sessions plus the stream-header snapshot
pub struct SessionRegistry {
    shared: Mutex<Shared>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                sessions: Vec::new(),
                header: None,
            }),
        }
    }

    /// Add a newly accepted, started session to the live set
    pub fn register(&self, session: Arc<ClientSession>) {
        self.shared.lock().sessions.push(session);
    }

    /// Fan a shared message out to every live session. Sessions reporting
    /// themselves not-alive are removed and handed to a detached teardown
    /// task; their bound identities are returned so the caller can emit the
    /// disconnect bookkeeping after the lock is released.
    pub fn broadcast(&self, message: Arc<ServerMessage>) -> Vec<String> {
        let mut gone = Vec::new();
        let mut shared = self.shared.lock();
        shared.sessions.retain(|session| {
            if session.alive() {
                return true;
            }
            tracing::info!("Session inactive, removing: {}", session.remote_ip());
            let mac = session.mac_address();
            if !mac.is_empty() {
                gone.push(mac);
            }
            // teardown must never stall the broadcast path
            let stale = session.clone();
            tokio::spawn(async move { stale.stop().await });
            false
        });
        for session in &shared.sessions {
            session.enqueue(message.clone(), 0);
        }
        gone
    }

    /// First live session bound to `mac`, if any
    pub fn lookup(&self, mac: &str) -> Option<Arc<ClientSession>> {
        self.shared
            .lock()
            .sessions
            .iter()
            .find(|s| s.mac_address() == mac)
            .cloned()
    }

    /// Remove any other live session already bound to `mac`, keeping
    /// `keep_id`. The evicted session goes to a detached teardown task.
    /// Returns whether an eviction happened.
    pub fn evict_duplicate(&self, mac: &str, keep_id: u64) -> bool {
        let mut evicted = false;
        let mut shared = self.shared.lock();
        shared.sessions.retain(|session| {
            if session.id() == keep_id || session.mac_address() != mac {
                return true;
            }
            tracing::warn!(
                "Evicting stale session for {} (superseded by a new connection)",
                mac
            );
            session.mark_dead();
            let stale = session.clone();
            tokio::spawn(async move { stale.stop().await });
            evicted = true;
            false
        });
        evicted
    }

    /// Replace the codec-header snapshot served to Header requests
    pub fn set_header(&self, header: CodecHeader) {
        self.shared.lock().header = Some(header);
    }

    /// Current codec-header snapshot
    pub fn header(&self) -> Option<CodecHeader> {
        self.shared.lock().header.clone()
    }

    /// Remove and return every session; used by the synchronous shutdown path
    pub fn drain(&self) -> Vec<Arc<ClientSession>> {
        self.shared.lock().sessions.drain(..).collect()
    }

    pub fn session_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
