//! Control command dispatcher
//!
//! Translates remote calls into client-registry mutations. After any
//! successful `Client.Set*` the affected audio client gets a fresh settings
//! push, the registry is persisted, and every control observer receives a
//! `Client.OnUpdate` notification carrying the full updated record.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::constants::MIN_LATENCY_MS;
use crate::control::rpc::{error_response, RpcError, RpcRequest};
use crate::control::ControlHub;
use crate::hub::dispatch::settings_for;
use crate::hub::registry::SessionRegistry;
use crate::protocol::ServerMessage;
use crate::store::{ClientInfo, ClientStore};

/// Interprets control-plane remote calls
pub struct ControlDispatcher {
    buffer_ms: i32,
    registry: Arc<SessionRegistry>,
    store: Arc<ClientStore>,
    control: Arc<ControlHub>,
}

impl ControlDispatcher {
    pub fn new(
        buffer_ms: i32,
        registry: Arc<SessionRegistry>,
        store: Arc<ClientStore>,
        control: Arc<ControlHub>,
    ) -> Self {
        Self {
            buffer_ms,
            registry,
            store,
            control,
        }
    }

    /// One raw line in, one terminal response line out
    pub fn handle_line(&self, line: &str) -> String {
        match RpcRequest::parse(line) {
            Err((id, error)) => error_response(&id, &error).to_string(),
            Ok(request) => {
                tracing::debug!("Control call: {} (id: {})", request.method, request.id);
                match self.dispatch(&request) {
                    Ok(result) => request.response(result).to_string(),
                    Err(error) => error_response(&request.id, &error).to_string(),
                }
            }
        }
    }

    fn dispatch(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        if request.method.starts_with("Client.Set") {
            return self.dispatch_set(request);
        }
        match request.method.as_str() {
            "System.GetStatus" => self.get_status(request),
            _ => Err(RpcError::method_not_found()),
        }
    }

    fn get_status(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        let clients: Vec<ClientInfo> = if request.has_param("client") {
            // unknown client yields an empty list, not an error
            let mac = request.str_param("client")?;
            self.store.get(&mac).into_iter().collect()
        } else {
            self.store.all()
        };

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(json!({
            "server": {
                "host": host,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "clients": clients,
        }))
    }

    fn dispatch_set(&self, request: &RpcRequest) -> Result<Value, RpcError> {
        // resolve the target before dispatch; nothing runs for unknown clients
        let mac = request.str_param("client")?;
        if self.store.get(&mac).is_none() {
            return Err(RpcError::internal("Client not found"));
        }

        let missing = || RpcError::internal("Client not found");
        let (result, info) = match request.method.as_str() {
            "Client.SetVolume" => {
                let volume = request.int_param("volume", 0, 100)?;
                let info = self
                    .store
                    .update(&mac, |c| c.volume.percent = volume as u16)
                    .ok_or_else(missing)?;
                (json!(volume), info)
            }
            "Client.SetMute" => {
                let muted = request.bool_param("mute")?;
                let info = self
                    .store
                    .update(&mac, |c| c.volume.muted = muted)
                    .ok_or_else(missing)?;
                (json!(muted), info)
            }
            "Client.SetLatency" => {
                let latency =
                    request.int_param("latency", MIN_LATENCY_MS as i64, self.buffer_ms as i64)?;
                let info = self
                    .store
                    .update(&mac, |c| c.latency = latency as i32)
                    .ok_or_else(missing)?;
                (json!(latency), info)
            }
            "Client.SetName" => {
                let name = request.str_param("name")?;
                let info = self
                    .store
                    .update(&mac, |c| c.name = name.clone())
                    .ok_or_else(missing)?;
                (json!(name), info)
            }
            _ => return Err(RpcError::method_not_found()),
        };

        // the audio client changes behavior immediately, without waiting for
        // its own settings poll
        if let Some(session) = self.registry.lookup(&mac) {
            session.enqueue(
                Arc::new(ServerMessage::ServerSettings(settings_for(
                    &info,
                    self.buffer_ms,
                ))),
                0,
            );
        }
        self.store.save_or_log();
        self.control.notify("Client.OnUpdate", &info);
        Ok(result)
    }
}
