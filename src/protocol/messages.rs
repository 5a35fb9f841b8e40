//! Typed payloads carried inside the wire envelope
//!
//! Client-to-server traffic decodes into [`ClientMessage`]; everything the
//! server can emit is a [`ServerMessage`]. Both are closed enums so the
//! dispatchers get exhaustiveness checking instead of string comparison.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::protocol::envelope::{Envelope, MessageType, Timestamp};

fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let bytes = get_blob(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidString)
}

fn get_blob(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated {
            expected: 4,
            got: buf.remaining(),
        });
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated {
            expected: len,
            got: buf.remaining(),
        });
    }
    Ok(buf.split_to(len))
}

/// Identity announcement, the first message a client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub mac_address: String,
    pub host_name: String,
    pub version: String,
}

impl Hello {
    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            mac_address: get_string(buf)?,
            host_name: get_string(buf)?,
            version: get_string(buf)?,
        })
    }
}

/// Which reply a Request frame is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Time,
    ServerSettings,
    SampleFormat,
    CodecHeader,
}

impl RequestKind {
    fn from_type(msg_type: MessageType) -> Option<Self> {
        match msg_type {
            MessageType::Time => Some(RequestKind::Time),
            MessageType::ServerSettings => Some(RequestKind::ServerSettings),
            MessageType::SampleFormat => Some(RequestKind::SampleFormat),
            MessageType::CodecHeader => Some(RequestKind::CodecHeader),
            _ => None,
        }
    }
}

/// PCM sample format: rate, bit depth, channel count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleFormat {
    pub rate: u32,
    pub bits: u16,
    pub channels: u16,
}

impl SampleFormat {
    /// Bytes per single-channel sample
    pub fn sample_size(&self) -> usize {
        self.bits as usize / 8
    }

    /// Bytes per frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.sample_size() * self.channels as usize
    }

    /// Bytes needed for `ms` milliseconds of audio
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        self.frame_size() * (self.rate as usize * ms as usize) / 1000
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.rate);
        buf.put_u16_le(self.bits);
        buf.put_u16_le(self.channels);
    }
}

impl FromStr for SampleFormat {
    type Err = crate::error::SourceError;

    /// Parses the `rate:bits:channels` descriptor, e.g. `48000:16:2`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::error::SourceError::InvalidSampleFormat(s.to_string());
        let mut parts = s.split(':');
        let rate = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let bits = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let channels = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() || rate == 0 || channels == 0 || bits % 8 != 0 || bits == 0 {
            return Err(invalid());
        }
        Ok(Self { rate, bits, channels })
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.rate, self.bits, self.channels)
    }
}

/// Per-client playback parameters, rebuilt fresh for every send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    pub volume: u16,
    pub muted: bool,
    pub latency: i32,
    pub buffer_ms: i32,
}

impl ServerSettings {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.volume);
        buf.put_u8(self.muted as u8);
        buf.put_i32_le(self.latency);
        buf.put_i32_le(self.buffer_ms);
    }
}

/// Codec framing metadata the client needs before it can decode chunks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecHeader {
    pub codec: String,
    pub payload: Bytes,
}

impl CodecHeader {
    fn encode(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.codec);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// One encoded audio chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    pub timestamp: Timestamp,
    pub payload: Bytes,
}

impl PcmChunk {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.timestamp.sec);
        buf.put_i32_le(self.timestamp.usec);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }
}

/// Everything an audio client can send us
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(Hello),
    Request(RequestKind),
    Command(String),
    /// Unknown or undecodable frame; ignored by the dispatcher
    Other,
}

impl ClientMessage {
    /// Decodes the payload of a received frame. Unknown type tags and unknown
    /// request subtypes map to [`ClientMessage::Other`] rather than an error,
    /// tolerating protocol skew between client and server versions.
    pub fn decode(envelope: &Envelope, mut payload: Bytes) -> Result<Self, ProtocolError> {
        match envelope.msg_type {
            MessageType::Hello => Ok(ClientMessage::Hello(Hello::decode(&mut payload)?)),
            MessageType::Request => {
                if payload.remaining() < 2 {
                    return Err(ProtocolError::Truncated {
                        expected: 2,
                        got: payload.remaining(),
                    });
                }
                let wanted = MessageType::from_raw(payload.get_u16_le());
                Ok(match RequestKind::from_type(wanted) {
                    Some(kind) => ClientMessage::Request(kind),
                    None => ClientMessage::Other,
                })
            }
            MessageType::Command => Ok(ClientMessage::Command(get_string(&mut payload)?)),
            _ => Ok(ClientMessage::Other),
        }
    }
}

/// Everything the server can put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Time { latency: f64 },
    ServerSettings(ServerSettings),
    SampleFormat(SampleFormat),
    CodecHeader(CodecHeader),
    Chunk(PcmChunk),
    Ack,
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Time { .. } => MessageType::Time,
            ServerMessage::ServerSettings(_) => MessageType::ServerSettings,
            ServerMessage::SampleFormat(_) => MessageType::SampleFormat,
            ServerMessage::CodecHeader(_) => MessageType::CodecHeader,
            ServerMessage::Chunk(_) => MessageType::WireChunk,
            ServerMessage::Ack => MessageType::Ack,
        }
    }

    /// True for audio-chunk broadcasts, which are gated on the session's
    /// stream-armed flag
    pub fn is_chunk(&self) -> bool {
        matches!(self, ServerMessage::Chunk(_))
    }

    pub fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            ServerMessage::Time { latency } => buf.put_f64_le(*latency),
            ServerMessage::ServerSettings(settings) => settings.encode(buf),
            ServerMessage::SampleFormat(format) => format.encode(buf),
            ServerMessage::CodecHeader(header) => header.encode(buf),
            ServerMessage::Chunk(chunk) => chunk.encode(buf),
            ServerMessage::Ack => {}
        }
    }

    /// Serializes a complete frame: envelope (with `sent` stamped now) plus
    /// payload
    pub fn encode_frame(&self, id: u16, refers_to: u16) -> Bytes {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        let envelope =
            Envelope::outbound(self.message_type(), id, refers_to, payload.len() as u32);
        let mut frame = BytesMut::with_capacity(crate::protocol::ENVELOPE_SIZE + payload.len());
        envelope.encode(&mut frame);
        frame.extend_from_slice(&payload);
        frame.freeze()
    }
}
