//! Wire-level message envelope
//!
//! Layout (little-endian, 26 bytes):
//!
//! ```text
//! type u16 | id u16 | refers_to u16 | sent {sec i32, usec i32}
//!          | received {sec i32, usec i32} | size u32
//! ```
//!
//! `sent` is stamped by the sending side at serialization time; `received` is
//! stamped by the reading side the moment the frame arrives. Their difference
//! is what the Time request uses for its round-trip latency estimate.

use bytes::{Buf, BufMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::MAX_PAYLOAD_SIZE;
use crate::error::ProtocolError;

/// Size of the serialized envelope in bytes
pub const ENVELOPE_SIZE: usize = 26;

/// Frame type tag carried in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Base,
    CodecHeader,
    WireChunk,
    SampleFormat,
    ServerSettings,
    Time,
    Request,
    Ack,
    Command,
    Hello,
    /// Tag this implementation does not know; frames carrying it are ignored
    Unknown(u16),
}

impl MessageType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => MessageType::Base,
            1 => MessageType::CodecHeader,
            2 => MessageType::WireChunk,
            3 => MessageType::SampleFormat,
            4 => MessageType::ServerSettings,
            5 => MessageType::Time,
            6 => MessageType::Request,
            7 => MessageType::Ack,
            8 => MessageType::Command,
            9 => MessageType::Hello,
            other => MessageType::Unknown(other),
        }
    }

    pub fn as_raw(self) -> u16 {
        match self {
            MessageType::Base => 0,
            MessageType::CodecHeader => 1,
            MessageType::WireChunk => 2,
            MessageType::SampleFormat => 3,
            MessageType::ServerSettings => 4,
            MessageType::Time => 5,
            MessageType::Request => 6,
            MessageType::Ack => 7,
            MessageType::Command => 8,
            MessageType::Hello => 9,
            MessageType::Unknown(raw) => raw,
        }
    }
}

/// Second/microsecond timestamp as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timestamp {
    pub sec: i32,
    pub usec: i32,
}

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: elapsed.as_secs() as i32,
            usec: elapsed.subsec_micros() as i32,
        }
    }

    /// Seconds elapsed between `sent` and this timestamp
    pub fn seconds_since(&self, sent: Timestamp) -> f64 {
        (self.sec - sent.sec) as f64 + (self.usec - sent.usec) as f64 / 1_000_000.0
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.sec);
        buf.put_i32_le(self.usec);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        Self {
            sec: buf.get_i32_le(),
            usec: buf.get_i32_le(),
        }
    }
}

/// The header shared by every binary frame
#[derive(Debug, Clone, Copy)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub id: u16,
    pub refers_to: u16,
    pub sent: Timestamp,
    pub received: Timestamp,
    pub size: u32,
}

impl Envelope {
    /// Header for an outbound frame; `sent` is stamped here
    pub fn outbound(msg_type: MessageType, id: u16, refers_to: u16, size: u32) -> Self {
        Self {
            msg_type,
            id,
            refers_to,
            sent: Timestamp::now(),
            received: Timestamp::default(),
            size,
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.msg_type.as_raw());
        buf.put_u16_le(self.id);
        buf.put_u16_le(self.refers_to);
        self.sent.encode(buf);
        self.received.encode(buf);
        buf.put_u32_le(self.size);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        if buf.remaining() < ENVELOPE_SIZE {
            return Err(ProtocolError::Truncated {
                expected: ENVELOPE_SIZE,
                got: buf.remaining(),
            });
        }
        let msg_type = MessageType::from_raw(buf.get_u16_le());
        let id = buf.get_u16_le();
        let refers_to = buf.get_u16_le();
        let sent = Timestamp::decode(buf);
        let received = Timestamp::decode(buf);
        let size = buf.get_u32_le();
        if size as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(size as usize));
        }
        Ok(Self {
            msg_type,
            id,
            refers_to,
            sent,
            received,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use proptest::prelude::*;

    #[test]
    fn test_envelope_layout() {
        let envelope = Envelope {
            msg_type: MessageType::Hello,
            id: 42,
            refers_to: 0,
            sent: Timestamp { sec: 100, usec: 500 },
            received: Timestamp::default(),
            size: 16,
        };

        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);
        assert_eq!(buf.len(), ENVELOPE_SIZE);
        // type tag lands first, little-endian
        assert_eq!(&buf[..2], &[9u8, 0][..]);

        let decoded = Envelope::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Hello);
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.sent.sec, 100);
        assert_eq!(decoded.size, 16);
    }

    #[test]
    fn test_truncated_header_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0u8; 10]);
        assert!(matches!(
            Envelope::decode(&mut buf.freeze()),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let envelope = Envelope::outbound(MessageType::WireChunk, 1, 0, u32::MAX);
        let mut buf = BytesMut::new();
        envelope.encode(&mut buf);
        assert!(matches!(
            Envelope::decode(&mut buf.freeze()),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_latency_from_timestamps() {
        let sent = Timestamp { sec: 10, usec: 250_000 };
        let received = Timestamp { sec: 11, usec: 500_000 };
        let latency = received.seconds_since(sent);
        assert!((latency - 1.25).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_type_preserved() {
        assert_eq!(MessageType::from_raw(999), MessageType::Unknown(999));
        assert_eq!(MessageType::Unknown(999).as_raw(), 999);
    }

    proptest! {
        #[test]
        fn prop_header_survives_encode_decode(
            raw_type in 0u16..16,
            id in any::<u16>(),
            refers_to in any::<u16>(),
            sec in any::<i32>(),
            usec in 0i32..1_000_000,
            size in 0u32..crate::constants::MAX_PAYLOAD_SIZE as u32,
        ) {
            let envelope = Envelope {
                msg_type: MessageType::from_raw(raw_type),
                id,
                refers_to,
                sent: Timestamp { sec, usec },
                received: Timestamp::default(),
                size,
            };
            let mut buf = BytesMut::new();
            envelope.encode(&mut buf);
            let decoded = Envelope::decode(&mut buf.freeze()).unwrap();
            prop_assert_eq!(decoded.msg_type.as_raw(), raw_type);
            prop_assert_eq!(decoded.id, id);
            prop_assert_eq!(decoded.refers_to, refers_to);
            prop_assert_eq!(decoded.sent.sec, sec);
            prop_assert_eq!(decoded.size, size);
        }
    }
}
