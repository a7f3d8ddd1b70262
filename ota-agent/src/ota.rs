//! Over-The-Air firmware update engine.
//!
//! Owns the OTA worker, its bounded retry loop, cancellation, the persisted
//! state machine that survives a reboot, and boot-time reconciliation of any
//! update that was still in flight when the device last went down. See each
//! submodule's doc comment for the collaborator it wraps.

pub mod bootloader;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod flash;
pub mod http;
pub mod reconcile;
pub mod types;
