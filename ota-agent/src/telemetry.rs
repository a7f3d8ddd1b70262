//! Telemetry device client contract.
//!
//! Out of scope per the system's purpose and scope: the actual backend
//! connection, its wire protocol, and its reconnection/backoff policy are a
//! separate collaborator. What the OTA engine needs from it is narrow --
//! publish an aggregated event, and be told about inbound command objects --
//! so that's all this module specifies. `EspTelemetryClient` is a thin
//! pass-through stub; a real implementation would own an MQTT-ish handle the
//! way `etiennetremel-esp32-home-sensor/src/mqtt.rs` owns its broker
//! connection, but wiring that up is explicitly not this crate's job.

use anyhow::Result;
use log::debug;
use std::sync::{Arc, Mutex};

/// What the OTA engine (via the command dispatcher) needs from the
/// telemetry channel: publish an outbound aggregated object, and register a
/// callback for inbound ones. Callbacks run on the telemetry client's own
/// polling task per the concurrency model, so they must return quickly.
pub trait TelemetryClient: Send + Sync {
    /// Publish an aggregated object (already serialized to its wire form) on
    /// `topic`.
    fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Register the callback invoked for every inbound command object. Only
    /// one handler is supported; a later registration replaces the earlier
    /// one.
    fn register_command_handler(&self, handler: Box<dyn Fn(&str) + Send + Sync>);

    /// `true` once the client has completed its connection handshake with
    /// the backend. Polled during the startup rendezvous (see `main.rs`).
    fn is_connected(&self) -> bool;
}

/// Thin stub: owns nowhere to connect to, but satisfies the contract so the
/// rest of the agent can be wired and tested against a real trait object.
/// Construction and the underlying wire protocol are out of scope per the
/// system's purpose and scope.
#[derive(Default)]
pub struct EspTelemetryClient {
    handler: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    connected: std::sync::atomic::AtomicBool,
}

impl EspTelemetryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a raw inbound payload to the registered handler, if any.
    /// Stands in for whatever the real client's callback registration would
    /// invoke directly; exposed so `main.rs`'s polling loop has something to
    /// call even though no real transport backs it yet.
    pub fn deliver(&self, payload: &str) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(payload);
        }
    }

    /// Mark the handshake complete. A real implementation would call this
    /// from its connection-established callback.
    pub fn mark_connected(&self) {
        self.connected.store(true, std::sync::atomic::Ordering::Release);
    }
}

impl TelemetryClient for EspTelemetryClient {
    fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        debug!("telemetry: publish {topic}: {payload}");
        Ok(())
    }

    fn register_command_handler(&self, handler: Box<dyn Fn(&str) + Send + Sync>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// In-memory `TelemetryClient` test double: records every publish and lets
/// tests drive `deliver` directly instead of going through a transport.
#[derive(Default)]
pub struct RecordingTelemetryClient {
    pub published: Mutex<Vec<(String, String)>>,
    handler: Mutex<Option<Box<dyn Fn(&str) + Send + Sync>>>,
    connected: std::sync::atomic::AtomicBool,
}

impl RecordingTelemetryClient {
    pub fn deliver(&self, payload: &str) {
        if let Some(handler) = self.handler.lock().unwrap().as_ref() {
            handler(payload);
        }
    }
}

impl TelemetryClient for RecordingTelemetryClient {
    fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn register_command_handler(&self, handler: Box<dyn Fn(&str) + Send + Sync>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::Acquire)
    }
}

/// `Arc`-shared handle passed to both the agent task and the telemetry
/// task's callback registration, breaking the cyclic "client calls back into
/// agent, agent holds client" dependency the way the spec's Design Notes
/// describe: the client is stored once, behind an `Arc`, and every callback
/// only receives a clone of it rather than a fresh construction.
pub type SharedTelemetryClient = Arc<dyn TelemetryClient>;
