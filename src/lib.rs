//! # LAN Audio Hub
//!
//! Multi-client audio distribution server: one shared audio feed fanned out
//! to many audio clients over a binary TCP protocol, plus a JSON-RPC control
//! channel for querying and tuning per-client state (volume, mute, latency,
//! name) while clients are connected.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               HUB                                    │
//! │                                                                      │
//! │  ┌────────────┐   chunks    ┌──────────────────────────────────┐     │
//! │  │ PipeSource ├────────────▶│  Session Registry / Broadcast    │     │
//! │  │ (source::) │   resync    │          (hub::registry)         │     │
//! │  └────────────┘             └───────┬──────────┬───────────────┘     │
//! │                                     │          │                     │
//! │                              ┌──────▼───┐  ┌───▼──────┐              │
//! │                              │ Client   │  │ Client   │   ...        │
//! │                              │ Session  │  │ Session  │              │
//! │                              │ (hub::   │  │          │              │
//! │                              │ session) │  │          │              │
//! │                              └──────┬───┘  └───┬──────┘              │
//! │        binary protocol (envelope +  │          │  typed payloads)    │
//! ├─────────────────────────────────────┼──────────┼─────────────────────┤
//! │                                     ▼          ▼                     │
//! │                               audio client   audio client            │
//! └──────────────────────────────────────────────────────────────────────┘
//!
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Control plane (control::): newline-delimited JSON-RPC               │
//! │                                                                      │
//! │   operator ──── System.GetStatus / Client.Set* ───▶ dispatcher       │
//! │            ◀─── result | error (same id) ────────── (control::       │
//! │            ◀─── Client.OnConnect / OnUpdate /        dispatch)       │
//! │                 OnDisconnect notifications                           │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A `Client.Set*` call mutates the persisted [`store::ClientInfo`] record,
//! pushes fresh server settings to the affected audio client immediately, and
//! broadcasts a notification to every control observer.

pub mod config;
pub mod control;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod source;
pub mod store;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default TCP port for the binary audio-client protocol
    pub const DEFAULT_STREAM_PORT: u16 = 1704;

    /// Default TCP port for the JSON-RPC control protocol
    pub const DEFAULT_CONTROL_PORT: u16 = 1705;

    /// Default end-to-end buffer in milliseconds
    pub const DEFAULT_BUFFER_MS: i32 = 1000;

    /// Default audio chunk duration read from the source
    pub const DEFAULT_CHUNK_MS: u32 = 50;

    /// Default per-connection read/write timeout in seconds
    pub const DEFAULT_IO_TIMEOUT_SECS: u64 = 5;

    /// Default sample format descriptor: rate:bits:channels
    pub const DEFAULT_SAMPLE_FORMAT: &str = "48000:16:2";

    /// Lower bound accepted for a client latency override, in milliseconds
    pub const MIN_LATENCY_MS: i32 = -10_000;

    /// Maximum payload size accepted in a single binary frame
    pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;
}
