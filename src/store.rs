//! Persisted client registry
//!
//! One [`ClientInfo`] record per client hardware address, surviving across
//! connections and server restarts. Records are never deleted here; the
//! control plane and the binary dispatcher only read and mutate fields and
//! trigger a save.
//!
//! A failed save is logged and swallowed: the in-memory mutation stands and
//! the triggering operation still succeeds (accepted durability gap).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Client volume state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub percent: u16,
    pub muted: bool,
}

impl Default for Volume {
    fn default() -> Self {
        Self {
            percent: 100,
            muted: false,
        }
    }
}

/// Everything the hub knows about one client, keyed by mac address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub mac_address: String,
    pub name: String,
    pub host_name: String,
    pub ip_address: String,
    pub version: String,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub volume: Volume,
    pub latency: i32,
}

impl ClientInfo {
    pub fn new(mac_address: impl Into<String>) -> Self {
        Self {
            mac_address: mac_address.into(),
            name: String::new(),
            host_name: String::new(),
            ip_address: String::new(),
            version: String::new(),
            connected: false,
            last_seen: Utc::now(),
            volume: Volume::default(),
            latency: 0,
        }
    }
}

/// Concurrent client-record store with optional JSON persistence
pub struct ClientStore {
    clients: DashMap<String, ClientInfo>,
    path: Option<PathBuf>,
}

impl ClientStore {
    /// In-memory store without persistence
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
            path: None,
        }
    }

    /// Load the registry from `path`. A missing file yields an empty store;
    /// `connected` is forced false on every restored record since liveness
    /// from a previous run must not leak into this one.
    pub fn load(path: PathBuf) -> Result<Self, StoreError> {
        let clients = DashMap::new();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let records: Vec<ClientInfo> = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Malformed(e.to_string()))?;
                for mut record in records {
                    record.connected = false;
                    clients.insert(record.mac_address.clone(), record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(StoreError::ReadFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        }
        Ok(Self {
            clients,
            path: Some(path),
        })
    }

    /// Snapshot of one record
    pub fn get(&self, mac_address: &str) -> Option<ClientInfo> {
        self.clients.get(mac_address).map(|r| r.clone())
    }

    /// Snapshot of one record, creating a default one if unknown
    pub fn get_or_create(&self, mac_address: &str) -> ClientInfo {
        self.clients
            .entry(mac_address.to_string())
            .or_insert_with(|| ClientInfo::new(mac_address))
            .clone()
    }

    /// Mutate an existing record in place; returns the updated snapshot,
    /// or None if the mac is unknown
    pub fn update<F>(&self, mac_address: &str, mutate: F) -> Option<ClientInfo>
    where
        F: FnOnce(&mut ClientInfo),
    {
        self.clients.get_mut(mac_address).map(|mut r| {
            mutate(&mut r);
            r.clone()
        })
    }

    /// Mutate a record, creating it first if unknown; returns the updated
    /// snapshot
    pub fn update_or_create<F>(&self, mac_address: &str, mutate: F) -> ClientInfo
    where
        F: FnOnce(&mut ClientInfo),
    {
        let mut entry = self
            .clients
            .entry(mac_address.to_string())
            .or_insert_with(|| ClientInfo::new(mac_address));
        mutate(&mut entry);
        entry.clone()
    }

    /// Snapshots of every record, ordered by mac address
    pub fn all(&self) -> Vec<ClientInfo> {
        let mut records: Vec<ClientInfo> = self.clients.iter().map(|r| r.clone()).collect();
        records.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        records
    }

    /// Write the registry to its backing file, blocking the caller until the
    /// write lands. No-op for in-memory stores.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_records(path, self.serialize()?)
    }

    /// Save without stalling the caller: the snapshot is serialized inline,
    /// then the disk write moves to a blocking worker when a runtime is
    /// available. Failures are demoted to a warning; mutations are not
    /// rolled back when the disk write fails.
    pub fn save_or_log(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let json = match self.serialize() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Client registry persistence failed: {}", e);
                return;
            }
        };
        let write = move || {
            if let Err(e) = write_records(&path, json) {
                tracing::warn!("Client registry persistence failed: {}", e);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(write);
            }
            Err(_) => write(),
        }
    }

    fn serialize(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(&self.all()).map_err(|e| StoreError::Malformed(e.to_string()))
    }
}

fn write_records(path: &Path, json: String) -> Result<(), StoreError> {
    std::fs::write(path, json).map_err(|e| StoreError::WriteFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

impl Default for ClientStore {
    fn default() -> Self {
        Self::new()
    }
}
