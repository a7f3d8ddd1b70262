//! Boot-time reconciliation: runs once at agent start, before the command
//! dispatcher accepts anything, and decides the fate of any OTA that was
//! still in flight across the last reboot.
//!
//! New logic -- `tachtalk-firmware` has no multi-reboot verdict table of its
//! own (its `mark_running_slot_valid` call is unconditional, not gated on a
//! persisted state machine) -- but it reuses the same collaborator seams
//! (`SettingsStore`, `BootloaderAdapter`, `EventSink`) as the rest of `ota/`.

use log::{info, warn};

use super::bootloader::{BootloaderAdapter, SwapType};
use super::engine::clear_persisted_record;
use super::error::OtaErrorKind;
use super::events::{EventSink, LocalOtaBus, LocalOtaEvent, OtaEvent};
use super::types::{OtaRequest, PersistentState, KEY_REQ_ID, KEY_STATE, NAMESPACE};
use crate::settings::SettingsStore;

/// Load the persisted `(state, req_id)` pair. Absence of either key, or a
/// `req_id` that isn't a well-formed 36-char UUID, is read as "no pending
/// OTA" rather than an error -- a fresh device has never written either key.
fn load_record(settings: &dyn SettingsStore) -> (Option<PersistentState>, Option<String>) {
    let mut state = None;
    let mut req_id = None;
    let _ = settings.load(NAMESPACE, &mut |key, bytes| {
        match key {
            KEY_STATE => state = bytes.first().copied().and_then(PersistentState::from_byte),
            KEY_REQ_ID => req_id = std::str::from_utf8(bytes).ok().map(str::to_string),
            _ => {}
        }
        true
    });
    (state, req_id)
}

fn fail(
    uuid: &str,
    kind: OtaErrorKind,
    message: &str,
    settings: &dyn SettingsStore,
    events: &dyn EventSink,
    local_bus: Option<&dyn LocalOtaBus>,
) {
    warn!("ota: reconcile: {uuid}: {message}");
    let _ = events.publish(OtaEvent::failure(uuid, kind, message));
    if let Some(bus) = local_bus {
        bus.publish_local(LocalOtaEvent::Failed);
    }
    clear_persisted_record(settings);
}

/// Runs once, synchronously, before the agent starts accepting commands.
pub fn reconcile(
    settings: &dyn SettingsStore,
    bootloader: &mut dyn BootloaderAdapter,
    events: &dyn EventSink,
    local_bus: Option<&dyn LocalOtaBus>,
) {
    let (state, req_id) = load_record(settings);

    let Some(uuid) = req_id.filter(|u| OtaRequest::is_uuid_well_formed(u)) else {
        info!("ota: reconcile: no pending OTA record, nothing to do");
        return;
    };

    if state != Some(PersistentState::Reboot) {
        fail(
            &uuid,
            OtaErrorKind::InternalError,
            "the previous run crashed mid-update (persisted state was not Reboot)",
            settings,
            events,
            local_bus,
        );
        return;
    }

    let swap_type = match bootloader.current_swap_type() {
        Ok(t) => t,
        Err(e) => {
            fail(&uuid, OtaErrorKind::SwapFail, &e.to_string(), settings, events, local_bus);
            return;
        }
    };
    if swap_type != SwapType::None {
        fail(
            &uuid,
            OtaErrorKind::SwapFail,
            &format!("bootloader reports swap type {swap_type:?}, expected None"),
            settings,
            events,
            local_bus,
        );
        return;
    }

    match bootloader.is_image_confirmed() {
        Ok(true) => {
            fail(
                &uuid,
                OtaErrorKind::SwapFail,
                "running image is already confirmed; this is not the freshly swapped image",
                settings,
                events,
                local_bus,
            );
            return;
        }
        Ok(false) => {}
        Err(e) => {
            fail(&uuid, OtaErrorKind::SwapFail, &e.to_string(), settings, events, local_bus);
            return;
        }
    }

    if let Some(bus) = local_bus {
        bus.publish_local(LocalOtaEvent::ConfirmReboot);
    }
    if let Err(e) = bootloader.confirm_current_image() {
        fail(&uuid, OtaErrorKind::InternalError, &e.to_string(), settings, events, local_bus);
        return;
    }

    info!("ota: reconcile: {uuid}: confirmed running image, update succeeded");
    let _ = events.publish(OtaEvent::success(&uuid));
    if let Some(bus) = local_bus {
        bus.publish_local(LocalOtaEvent::Success);
    }
    clear_persisted_record(settings);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::bootloader::MockBootloader;
    use crate::ota::events::{RecordingEventSink, RecordingLocalOtaBus, Status};
    use crate::settings::MemSettingsStore;

    const UUID: &str = "11111111-1111-1111-1111-111111111111";

    fn persist(settings: &MemSettingsStore, state: PersistentState, uuid: &str) {
        settings.save(NAMESPACE, KEY_STATE, &[state.to_byte()]).unwrap();
        settings.save(NAMESPACE, KEY_REQ_ID, uuid.as_bytes()).unwrap();
    }

    #[test]
    fn no_pending_record_is_a_silent_noop() {
        let settings = MemSettingsStore::default();
        let mut bootloader = MockBootloader::default();
        let events = RecordingEventSink::default();
        reconcile(&settings, &mut bootloader, &events, None);
        assert!(events.status_sequence(UUID).is_empty());
    }

    #[test]
    fn successful_swap_confirms_and_emits_success() {
        let settings = MemSettingsStore::default();
        persist(&settings, PersistentState::Reboot, UUID);
        let mut bootloader = MockBootloader {
            swap_type: SwapType::None,
            confirmed: false,
            ..Default::default()
        };
        let events = RecordingEventSink::default();
        let bus = RecordingLocalOtaBus::default();
        reconcile(&settings, &mut bootloader, &events, Some(&bus));

        assert_eq!(events.status_sequence(UUID), vec![Status::Success]);
        assert!(bootloader.confirmed);

        let mut seen_state = None;
        let mut seen_req_id = false;
        settings
            .load(NAMESPACE, &mut |k, v| {
                if k == KEY_STATE {
                    seen_state = v.first().copied();
                }
                if k == KEY_REQ_ID {
                    seen_req_id = true;
                }
                true
            })
            .unwrap();
        assert_eq!(seen_state, Some(PersistentState::Idle.to_byte()));
        assert!(!seen_req_id, "req_id must be deleted after reconciliation");
    }

    #[test]
    fn state_not_reboot_means_previous_run_crashed() {
        let settings = MemSettingsStore::default();
        persist(&settings, PersistentState::InProgress, UUID);
        let mut bootloader = MockBootloader::default();
        let events = RecordingEventSink::default();
        reconcile(&settings, &mut bootloader, &events, None);
        assert_eq!(events.status_sequence(UUID), vec![Status::Failure]);
    }

    #[test]
    fn swap_type_other_than_none_is_swap_fail() {
        let settings = MemSettingsStore::default();
        persist(&settings, PersistentState::Reboot, UUID);
        let mut bootloader = MockBootloader {
            swap_type: SwapType::Revert,
            ..Default::default()
        };
        let events = RecordingEventSink::default();
        reconcile(&settings, &mut bootloader, &events, None);
        assert_eq!(events.status_sequence(UUID), vec![Status::Failure]);
    }

    #[test]
    fn already_confirmed_image_is_swap_fail() {
        let settings = MemSettingsStore::default();
        persist(&settings, PersistentState::Reboot, UUID);
        let mut bootloader = MockBootloader {
            swap_type: SwapType::None,
            confirmed: true,
            ..Default::default()
        };
        let events = RecordingEventSink::default();
        reconcile(&settings, &mut bootloader, &events, None);
        assert_eq!(events.status_sequence(UUID), vec![Status::Failure]);
    }

    #[test]
    fn confirm_failure_surfaces_as_internal_error() {
        let settings = MemSettingsStore::default();
        persist(&settings, PersistentState::Reboot, UUID);
        let mut bootloader = MockBootloader {
            swap_type: SwapType::None,
            confirmed: false,
            fail_confirm: true,
            ..Default::default()
        };
        let events = RecordingEventSink::default();
        reconcile(&settings, &mut bootloader, &events, None);
        assert_eq!(events.status_sequence(UUID), vec![Status::Failure]);
    }

    #[test]
    fn malformed_req_id_is_treated_as_no_pending_update() {
        let settings = MemSettingsStore::default();
        settings
            .save(NAMESPACE, KEY_STATE, &[PersistentState::Reboot.to_byte()])
            .unwrap();
        settings.save(NAMESPACE, KEY_REQ_ID, b"short").unwrap();
        let mut bootloader = MockBootloader::default();
        let events = RecordingEventSink::default();
        reconcile(&settings, &mut bootloader, &events, None);
        assert!(events.status_sequence("short").is_empty());
    }
}
