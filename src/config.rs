//! Hub configuration
//!
//! Loaded from a TOML file; every field has a default so a missing or partial
//! file still yields a runnable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::Error;

/// Static server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// TCP port for the binary audio-client protocol
    pub stream_port: u16,

    /// TCP port for the JSON-RPC control protocol
    pub control_port: u16,

    /// End-to-end buffer in milliseconds; also the upper bound for
    /// per-client latency overrides
    pub buffer_ms: i32,

    /// Sample format descriptor, `rate:bits:channels`
    pub sample_format: String,

    /// Codec name announced in the stream header
    pub codec: String,

    /// FIFO or file the audio feed is read from
    pub source_path: PathBuf,

    /// Duration of one audio chunk read from the source
    pub chunk_ms: u32,

    /// Read/write timeout applied to every audio-client connection
    pub io_timeout_secs: u64,

    /// Where the client registry is persisted; None keeps it in memory
    pub store_path: Option<PathBuf>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            stream_port: DEFAULT_STREAM_PORT,
            control_port: DEFAULT_CONTROL_PORT,
            buffer_ms: DEFAULT_BUFFER_MS,
            sample_format: DEFAULT_SAMPLE_FORMAT.to_string(),
            codec: "pcm".to_string(),
            source_path: PathBuf::from("/tmp/audiohub"),
            chunk_ms: DEFAULT_CHUNK_MS,
            io_timeout_secs: DEFAULT_IO_TIMEOUT_SECS,
            store_path: default_store_path(),
        }
    }
}

impl HubConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(e.to_string()))
    }

    /// Load from `path` if given, otherwise from the default location,
    /// otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => match default_config_path() {
                Some(p) if p.exists() => Self::load(&p),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Write the configuration to a TOML file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let raw = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, raw)?;
        Ok(())
    }
}

/// Default config file location, e.g. `~/.config/lan-audio-hub/hub.toml`
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lan-audio-hub")
        .map(|dirs| dirs.config_dir().join("hub.toml"))
}

/// Default client registry location, e.g.
/// `~/.local/share/lan-audio-hub/clients.json`
pub fn default_store_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "lan-audio-hub")
        .map(|dirs| dirs.data_dir().join("clients.json"))
}
