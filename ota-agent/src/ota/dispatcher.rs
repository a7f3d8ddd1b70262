//! Inbound command dispatcher: parses the aggregated `OTARequest` object off
//! the command channel, validates it, and forwards to `OtaEngine`.
//!
//! Grounded on `tachtalk-firmware/src/web_server.rs`'s request-field
//! validation style: reject on a missing/malformed required field by
//! returning an error response rather than panicking or guessing a default.

use serde::Deserialize;

use super::engine::{Collaborators, OtaEngine};
use super::error::OtaErrorKind;
use super::events::{EventSink, OtaEvent};
use super::types::OtaRequest;
use crate::settings::SettingsStore;

/// Wire shape of an inbound command. `operation` dictates which other fields
/// are required: `url` only makes sense for `"Update"`.
#[derive(Debug, Deserialize)]
pub struct RawOtaCommand {
    pub uuid: Option<String>,
    pub operation: Option<String>,
    pub url: Option<String>,
}

/// A validated, dispatch-ready command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaCommand {
    Update(OtaRequest),
    Cancel { uuid: String },
}

/// Validates a raw inbound object, emitting `Failure/InvalidRequest` on any
/// rejection instead of returning an `Err` the caller would have to also
/// translate into an event -- there is exactly one way a malformed command is
/// reported, and this is it.
pub fn validate(raw: RawOtaCommand, events: &dyn EventSink) -> Option<OtaCommand> {
    let Some(uuid) = raw.uuid else {
        reject(events, "", "missing required field 'uuid'");
        return None;
    };
    if !OtaRequest::is_uuid_well_formed(&uuid) {
        reject(events, &uuid, "'uuid' must be a 36-character identifier");
        return None;
    }
    let Some(operation) = raw.operation else {
        reject(events, &uuid, "missing required field 'operation'");
        return None;
    };

    match operation.as_str() {
        "Update" => {
            let Some(url) = raw.url else {
                reject(events, &uuid, "'operation':'Update' requires 'url'");
                return None;
            };
            if url.is_empty() {
                reject(events, &uuid, "'url' must not be empty");
                return None;
            }
            Some(OtaCommand::Update(OtaRequest {
                uuid,
                download_url: url,
            }))
        }
        "Cancel" => Some(OtaCommand::Cancel { uuid }),
        other => {
            reject(events, &uuid, &format!("unknown operation '{other}'"));
            None
        }
    }
}

fn reject(events: &dyn EventSink, uuid: &str, message: &str) {
    let _ = events.publish(OtaEvent::failure(uuid, OtaErrorKind::InvalidRequest, message));
}

/// Validates `raw` and, if valid, dispatches it onto `engine`. Exposed as one
/// call so the command-channel reader in `main` doesn't need to know about
/// `OtaCommand` at all.
pub fn dispatch(
    raw: RawOtaCommand,
    engine: &OtaEngine,
    settings: &dyn SettingsStore,
    collaborators_for_update: impl FnOnce() -> Collaborators,
    events: &dyn EventSink,
) {
    match validate(raw, events) {
        Some(OtaCommand::Update(request)) => {
            engine.handle_update(request, collaborators_for_update());
        }
        Some(OtaCommand::Cancel { uuid }) => {
            engine.handle_cancel(&uuid, settings, events);
        }
        None => {}
    }
}
