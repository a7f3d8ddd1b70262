//! Event publisher: maps internal OTA progress onto the external
//! `OTAEvent/event` schema and, optionally, a coarse
//! mirror on an in-process bus other local subscribers can react to.
//!
//! Grounded on `tachtalk-firmware/src/main.rs`'s `State` holding `mpsc::Sender`
//! handles (`sse_tx`, `rpm_tx`) that tasks publish into rather than touching
//! the transport directly -- `EspLocalOtaBus` follows the same shape for the
//! optional local mirror, while `TelemetryEventSink` hands the serialized
//! aggregated event straight to the telemetry device client (`crate::telemetry`).

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::OtaErrorKind;

/// `status` values. Variant names serialize verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Acknowledged,
    Downloading,
    Deploying,
    Deployed,
    Rebooting,
    Success,
    Failure,
    Error,
}

/// The aggregated object sent on `OTAEvent/event`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtaEvent {
    #[serde(rename = "requestUUID")]
    pub request_uuid: String,
    pub status: Status,
    pub status_progress: i32,
    pub status_code: String,
    pub message: String,
    pub timestamp: i64,
}

impl OtaEvent {
    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn acknowledged(uuid: &str) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Acknowledged,
            status_progress: 0,
            status_code: String::new(),
            message: String::new(),
            timestamp: Self::now(),
        }
    }

    pub fn downloading(uuid: &str, percent: u32) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Downloading,
            status_progress: percent as i32,
            status_code: String::new(),
            message: String::new(),
            timestamp: Self::now(),
        }
    }

    pub fn deploying(uuid: &str) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Deploying,
            status_progress: 0,
            status_code: String::new(),
            message: String::new(),
            timestamp: Self::now(),
        }
    }

    pub fn deployed(uuid: &str) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Deployed,
            status_progress: 0,
            status_code: String::new(),
            message: String::new(),
            timestamp: Self::now(),
        }
    }

    pub fn rebooting(uuid: &str) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Rebooting,
            status_progress: 0,
            status_code: String::new(),
            message: String::new(),
            timestamp: Self::now(),
        }
    }

    pub fn success(uuid: &str) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Success,
            status_progress: 100,
            status_code: String::new(),
            message: String::new(),
            timestamp: Self::now(),
        }
    }

    /// Terminal failure. `kind` supplies the `statusCode`, per the Open
    /// Question resolved in `DESIGN.md`: intermediate `Error`
    /// events reuse this same `statusCode` enum.
    pub fn failure(uuid: &str, kind: OtaErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Failure,
            status_progress: 0,
            status_code: kind.status_code().to_string(),
            message: message.into(),
            timestamp: Self::now(),
        }
    }

    /// Intermediate, non-terminal error inside the attempt/retry loop.
    pub fn error(uuid: &str, kind: OtaErrorKind, message: impl Into<String>) -> Self {
        Self {
            request_uuid: uuid.to_string(),
            status: Status::Error,
            status_progress: 0,
            status_code: kind.status_code().to_string(),
            message: message.into(),
            timestamp: Self::now(),
        }
    }
}

/// Coarse-grained mirror published on the optional in-process OTA bus, per
/// so other local subscribers (UI, watchdog) can react
/// without parsing the aggregated event schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalOtaEvent {
    Init,
    Success,
    Failed,
    PendingReboot,
    ConfirmReboot,
}

/// Publishes `OtaEvent`s onto the outbound telemetry channel.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: OtaEvent) -> Result<()>;
}

/// Publishes coarse `LocalOtaEvent`s onto the in-process bus. Distinct from
/// `EventSink` because the local bus is optional ("when the
/// optional local event bus is enabled") while the outbound channel is not.
pub trait LocalOtaBus: Send + Sync {
    fn publish_local(&self, event: LocalOtaEvent);
}

/// `LocalOtaBus` that forwards onto an `mpsc::Sender`. A send failure (no
/// subscriber currently listening) is not an error: the bus is explicitly
/// optional.
pub struct EspLocalOtaBus {
    tx: mpsc::Sender<LocalOtaEvent>,
}

impl EspLocalOtaBus {
    pub fn new(tx: mpsc::Sender<LocalOtaEvent>) -> Self {
        Self { tx }
    }
}

impl LocalOtaBus for EspLocalOtaBus {
    fn publish_local(&self, event: LocalOtaEvent) {
        let _ = self.tx.send(event);
    }
}

/// Topic the external aggregated event is published on.
pub const OTA_EVENT_TOPIC: &str = "OTAEvent/event";

/// `EventSink` that serializes to the wire schema and hands it to the
/// telemetry device client, the production wiring `main.rs` uses.
pub struct TelemetryEventSink {
    client: crate::telemetry::SharedTelemetryClient,
}

impl TelemetryEventSink {
    pub fn new(client: crate::telemetry::SharedTelemetryClient) -> Self {
        Self { client }
    }
}

impl EventSink for TelemetryEventSink {
    fn publish(&self, event: OtaEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)
            .map_err(|e| anyhow!("event sink: failed to serialize event: {e}"))?;
        self.client.publish(OTA_EVENT_TOPIC, &payload)
    }
}

/// `EventSink` test double: records every published event in order.
#[derive(Default)]
pub struct RecordingEventSink {
    pub events: Mutex<Vec<OtaEvent>>,
}

impl EventSink for RecordingEventSink {
    fn publish(&self, event: OtaEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

impl RecordingEventSink {
    /// The `status` sequence for one `requestUUID`, in publish order, for
    /// asserting against the expected status-sequence regular expressions.
    pub fn status_sequence(&self, uuid: &str) -> Vec<Status> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.request_uuid == uuid)
            .map(|e| e.status)
            .collect()
    }
}

/// `LocalOtaBus` test double.
#[derive(Default)]
pub struct RecordingLocalOtaBus {
    pub events: Mutex<Vec<LocalOtaEvent>>,
}

impl LocalOtaBus for RecordingLocalOtaBus {
    fn publish_local(&self, event: LocalOtaEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingTelemetryClient;
    use std::sync::Arc;

    #[test]
    fn telemetry_event_sink_publishes_serialized_event_to_the_ota_topic() {
        let client = Arc::new(RecordingTelemetryClient::default());
        let sink = TelemetryEventSink::new(client.clone());
        sink.publish(OtaEvent::acknowledged("u")).unwrap();
        let log = client.published.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, OTA_EVENT_TOPIC);
        assert!(log[0].1.contains("\"requestUUID\":\"u\""));
    }

    #[test]
    fn failure_and_error_share_status_code_enum() {
        let f = OtaEvent::failure("u", OtaErrorKind::NetworkError, "timed out");
        let e = OtaEvent::error("u", OtaErrorKind::NetworkError, "retrying");
        assert_eq!(f.status_code, e.status_code);
        assert_eq!(f.status_code, "ErrorNetwork");
    }

    #[test]
    fn non_error_events_have_empty_status_code() {
        assert_eq!(OtaEvent::acknowledged("u").status_code, "");
        assert_eq!(OtaEvent::success("u").status_code, "");
    }

    #[test]
    fn recording_sink_preserves_publish_order() {
        let sink = RecordingEventSink::default();
        sink.publish(OtaEvent::acknowledged("u")).unwrap();
        sink.publish(OtaEvent::downloading("u", 10)).unwrap();
        sink.publish(OtaEvent::success("u")).unwrap();
        assert_eq!(
            sink.status_sequence("u"),
            vec![Status::Acknowledged, Status::Downloading, Status::Success]
        );
    }

    #[test]
    fn serializes_with_camel_case_fields() {
        let json = serde_json::to_string(&OtaEvent::downloading("abc", 30)).unwrap();
        assert!(json.contains("\"requestUUID\":\"abc\""));
        assert!(json.contains("\"statusProgress\":30"));
        assert!(json.contains("\"statusCode\":\"\""));
    }
}
