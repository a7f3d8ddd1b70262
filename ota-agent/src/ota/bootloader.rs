//! Bootloader adapter: thin synchronous abstraction over the ESP-IDF
//! bootloader's slot-swap machinery.
//!
//! Grounded on `tachtalk-firmware/src/ota.rs`'s `mark_running_slot_valid`
//! (`esp_idf_svc::ota::EspOta`) and `esp-idf-svc`'s OTA slot/state query
//! surface, supplemented with a swap-type/confirm state machine since
//! `tachtalk-firmware` has no reboot-time verdict reconciliation of its own.

use anyhow::{anyhow, Result};

/// Bootloader's verdict at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapType {
    None,
    Test,
    Perm,
    Revert,
    Fail,
}

/// Synchronous bootloader operations the OTA engine and reconciler invoke.
pub trait BootloaderAdapter: Send {
    fn current_swap_type(&self) -> Result<SwapType>;
    fn is_image_confirmed(&self) -> Result<bool>;
    fn confirm_current_image(&mut self) -> Result<()>;
    /// Sanity-reads the secondary bank's image header; returns an opaque
    /// summary (currently just its length) so the engine can assert the
    /// write landed before issuing `request_upgrade_test`.
    fn read_secondary_header(&self) -> Result<usize>;
    fn request_upgrade_test(&mut self) -> Result<()>;
    fn reboot_warm(&mut self) -> !;
}

/// ESP-IDF-backed `BootloaderAdapter`, wrapping `esp_idf_svc::ota::EspOta`.
pub struct EspBootloaderAdapter;

impl Default for EspBootloaderAdapter {
    fn default() -> Self {
        Self
    }
}

impl BootloaderAdapter for EspBootloaderAdapter {
    fn current_swap_type(&self) -> Result<SwapType> {
        use embedded_svc::ota::SlotState;
        let ota = esp_idf_svc::ota::EspOta::new().map_err(|e| anyhow!("OTA_SWAP_FAIL: {e}"))?;
        let running = ota
            .get_running_slot()
            .map_err(|e| anyhow!("OTA_SWAP_FAIL: {e}"))?;
        Ok(match running.state {
            SlotState::Valid => SwapType::None,
            SlotState::Unverified => SwapType::Test,
            SlotState::Invalid => SwapType::Revert,
            SlotState::Unknown | SlotState::Factory => SwapType::None,
        })
    }

    fn is_image_confirmed(&self) -> Result<bool> {
        use embedded_svc::ota::SlotState;
        let ota = esp_idf_svc::ota::EspOta::new().map_err(|e| anyhow!("OTA_SWAP_FAIL: {e}"))?;
        let running = ota
            .get_running_slot()
            .map_err(|e| anyhow!("OTA_SWAP_FAIL: {e}"))?;
        Ok(running.state == SlotState::Valid)
    }

    fn confirm_current_image(&mut self) -> Result<()> {
        let mut ota = esp_idf_svc::ota::EspOta::new().map_err(|e| anyhow!("InternalError: {e}"))?;
        ota.mark_running_slot_valid()
            .map_err(|e| anyhow!("InternalError: {e}"))
    }

    fn read_secondary_header(&self) -> Result<usize> {
        let ota = esp_idf_svc::ota::EspOta::new().map_err(|e| anyhow!("InternalError: {e}"))?;
        let slot = ota
            .get_update_slot()
            .map_err(|e| anyhow!("InternalError: {e}"))?;
        Ok(slot.label.len())
    }

    fn request_upgrade_test(&mut self) -> Result<()> {
        use embedded_svc::ota::SlotState;
        // `EspOtaUpdate::complete()` (called from `ota::flash::EspFlashWriter`
        // on the final chunk) already calls `esp_ota_set_boot_partition`, so
        // the boot slot has already been switched to the freshly written
        // image by the time this runs. There is no separate "mark for test
        // boot" call in `esp-idf-svc`; ESP-IDF's rollback-enabled bootloader
        // treats a freshly switched partition as unverified until
        // `mark_running_slot_valid` runs post-reboot, which is exactly
        // "Test" swap semantics. This call only asserts that switch took.
        let ota = esp_idf_svc::ota::EspOta::new().map_err(|e| anyhow!("InternalError: {e}"))?;
        let boot = ota
            .get_boot_slot()
            .map_err(|e| anyhow!("InternalError: {e}"))?;
        let update = ota
            .get_update_slot()
            .map_err(|e| anyhow!("InternalError: {e}"))?;
        if boot.label != update.label {
            return Err(anyhow!(
                "SwapFail: boot slot was not switched to the updated image"
            ));
        }
        if boot.state != SlotState::Unverified {
            return Err(anyhow!(
                "SwapFail: boot slot is not pending verification (state {:?})",
                boot.state
            ));
        }
        Ok(())
    }

    fn reboot_warm(&mut self) -> ! {
        unsafe { esp_idf_svc::sys::esp_restart() }
    }
}

/// In-memory `BootloaderAdapter` used by host-side unit tests.
pub struct MockBootloader {
    pub swap_type: SwapType,
    pub confirmed: bool,
    pub secondary_header_ok: bool,
    pub fail_confirm: bool,
    pub fail_upgrade_request: bool,
    pub upgrade_requested: bool,
    pub rebooted: bool,
}

impl Default for MockBootloader {
    fn default() -> Self {
        Self {
            swap_type: SwapType::None,
            confirmed: true,
            secondary_header_ok: true,
            fail_confirm: false,
            fail_upgrade_request: false,
            upgrade_requested: false,
            rebooted: false,
        }
    }
}

impl BootloaderAdapter for MockBootloader {
    fn current_swap_type(&self) -> Result<SwapType> {
        Ok(self.swap_type)
    }

    fn is_image_confirmed(&self) -> Result<bool> {
        Ok(self.confirmed)
    }

    fn confirm_current_image(&mut self) -> Result<()> {
        if self.fail_confirm {
            return Err(anyhow!("mock confirm failure"));
        }
        self.confirmed = true;
        Ok(())
    }

    fn read_secondary_header(&self) -> Result<usize> {
        if self.secondary_header_ok {
            Ok(64)
        } else {
            Err(anyhow!("mock header read failure"))
        }
    }

    fn request_upgrade_test(&mut self) -> Result<()> {
        if self.fail_upgrade_request {
            return Err(anyhow!("mock upgrade request failure"));
        }
        self.upgrade_requested = true;
        Ok(())
    }

    fn reboot_warm(&mut self) -> ! {
        // Tests never actually reboot; a mock call site observes
        // `rebooted` instead of calling this. Kept unreachable so the trait
        // shape matches production.
        panic!("MockBootloader::reboot_warm is not callable from tests; check rebooted flag instead");
    }
}
