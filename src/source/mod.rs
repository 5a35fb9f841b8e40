//! Audio source feed
//!
//! Reads raw PCM from a FIFO (or plain file) in fixed-duration slices and
//! delivers them as timed [`SourceEvent::Chunk`]s, paced against a monotonic
//! clock. A starved pipe pads with silence so downstream clients keep a
//! continuous stream; when the pacing clock falls behind by more than one
//! chunk, a [`SourceEvent::Resync`] reports the drift and the clock
//! re-anchors.

use bytes::{BufMut, Bytes, BytesMut};
use std::path::PathBuf;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::protocol::{CodecHeader, PcmChunk, SampleFormat, Timestamp};

/// What the source hands to the hub's feed task
#[derive(Debug)]
pub enum SourceEvent {
    Chunk(PcmChunk),
    /// Pacing drift in milliseconds; informational only
    Resync(f64),
}

/// Paced PCM reader over a FIFO or file path
pub struct PipeSource {
    header: CodecHeader,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PipeSource {
    /// Start reading. Returns the source handle and the event stream the
    /// hub's feed task consumes.
    pub fn spawn(
        path: PathBuf,
        format: SampleFormat,
        codec: &str,
        chunk_ms: u32,
    ) -> (Self, mpsc::Receiver<SourceEvent>) {
        let header = build_header(codec, format);
        let (event_tx, event_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(read_loop(path, format, chunk_ms, event_tx, stop_rx));
        (
            Self {
                header,
                stop: stop_tx,
                task,
            },
            event_rx,
        )
    }

    /// Codec framing metadata served to Header requests
    pub fn header(&self) -> &CodecHeader {
        &self.header
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

/// For the plain "pcm" codec the header payload is the sample format itself
fn build_header(codec: &str, format: SampleFormat) -> CodecHeader {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_u32_le(format.rate);
    payload.put_u16_le(format.bits);
    payload.put_u16_le(format.channels);
    CodecHeader {
        codec: codec.to_string(),
        payload: payload.freeze(),
    }
}

async fn read_loop(
    path: PathBuf,
    format: SampleFormat,
    chunk_ms: u32,
    events: mpsc::Sender<SourceEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let chunk_bytes = format.bytes_for_ms(chunk_ms);
    let chunk_duration = Duration::from_millis(chunk_ms as u64);
    let mut file: Option<tokio::fs::File> = None;
    let mut next_tick = Instant::now() + chunk_duration;

    loop {
        if *stop.borrow() {
            break;
        }

        if file.is_none() {
            match tokio::fs::File::open(&path).await {
                Ok(f) => {
                    tracing::info!("Source opened: {}", path.display());
                    file = Some(f);
                }
                Err(e) => {
                    tracing::debug!("Source not available ({}); feeding silence", e);
                }
            }
        }

        // zero-initialized, so anything not filled is already silence
        let mut buf = vec![0u8; chunk_bytes];
        let mut filled = 0usize;
        if let Some(f) = file.as_mut() {
            match tokio::time::timeout(chunk_duration, fill(f, &mut buf, &mut filled)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("Source read failed: {}; reopening", e);
                    file = None;
                }
                // pipe starved this interval; pad with silence
                Err(_) => {}
            }
        }

        let chunk = PcmChunk {
            timestamp: Timestamp::now(),
            payload: Bytes::from(buf),
        };
        if events.send(SourceEvent::Chunk(chunk)).await.is_err() {
            break;
        }

        let now = Instant::now();
        if now > next_tick + chunk_duration {
            let drift_ms = (now - next_tick).as_secs_f64() * 1000.0;
            let _ = events.send(SourceEvent::Resync(drift_ms)).await;
            next_tick = now + chunk_duration;
        } else {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep_until(next_tick) => {}
            }
            next_tick += chunk_duration;
        }
    }
}

async fn fill(
    file: &mut tokio::fs::File,
    buf: &mut [u8],
    filled: &mut usize,
) -> std::io::Result<()> {
    while *filled < buf.len() {
        let n = file.read(&mut buf[*filled..]).await?;
        if n == 0 {
            break; // EOF: the remainder stays silent
        }
        *filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_format() -> SampleFormat {
        SampleFormat {
            rate: 48000,
            bits: 16,
            channels: 2,
        }
    }

    #[test]
    fn test_header_layout() {
        let header = build_header("pcm", test_format());
        assert_eq!(header.codec, "pcm");
        assert_eq!(header.payload.len(), 8);
        assert_eq!(&header.payload[..4], &48000u32.to_le_bytes());
        assert_eq!(&header.payload[4..6], &16u16.to_le_bytes());
        assert_eq!(&header.payload[6..8], &2u16.to_le_bytes());
    }

    #[tokio::test]
    async fn test_chunks_padded_with_silence() {
        let dir = std::env::temp_dir().join(format!("hub-source-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feed.pcm");
        std::fs::write(&path, vec![0xABu8; 100]).unwrap();

        let (source, mut events) = PipeSource::spawn(path, test_format(), "pcm", 10);
        let chunk_bytes = test_format().bytes_for_ms(10);

        let event = events.recv().await.unwrap();
        match event {
            SourceEvent::Chunk(chunk) => {
                assert_eq!(chunk.payload.len(), chunk_bytes);
                assert_eq!(&chunk.payload[..100], &[0xABu8; 100][..]);
                assert!(chunk.payload[100..].iter().all(|b| *b == 0));
                assert!(chunk.timestamp.sec > 0);
            }
            other => panic!("expected chunk, got {:?}", other),
        }

        source.stop().await;
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn test_missing_path_feeds_silence() {
        let (source, mut events) = PipeSource::spawn(
            PathBuf::from("/no/such/fifo"),
            test_format(),
            "pcm",
            10,
        );
        let event = events.recv().await.unwrap();
        match event {
            SourceEvent::Chunk(chunk) => {
                assert!(chunk.payload.iter().all(|b| *b == 0));
            }
            other => panic!("expected chunk, got {:?}", other),
        }
        source.stop().await;
    }
}
