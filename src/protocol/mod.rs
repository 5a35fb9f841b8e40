//! Binary wire protocol spoken with audio clients
//!
//! Every frame is a fixed 26-byte envelope followed by a typed payload.
//! Requests and replies are correlated through the envelope's `id` /
//! `refers_to` pair; there is no connection-level request queue.

pub mod envelope;
pub mod messages;

pub use envelope::{Envelope, MessageType, Timestamp, ENVELOPE_SIZE};
pub use messages::{
    ClientMessage, CodecHeader, Hello, PcmChunk, RequestKind, SampleFormat, ServerMessage,
    ServerSettings,
};
