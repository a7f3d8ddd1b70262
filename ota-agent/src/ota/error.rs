//! Error taxonomy.
//!
//! Collaborators (`SettingsStore`, `FlashWriter`, `HttpDownloader`,
//! `BootloaderAdapter`) surface `anyhow::Error` at their own boundary, in the
//! teacher's style (`ota.rs` uses `anyhow::bail!`/`?` throughout). The engine
//! maps those into the nearest `OtaErrorKind` variant at the call site, since
//! only the engine knows which phase failed.

use std::fmt;

/// Internal error kind, consumed by `status_code()` to produce the external
/// `statusCode` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaErrorKind {
    InvalidRequest,
    AlreadyInProgress,
    NetworkError,
    SettingsInitFail,
    SettingsSaveFail,
    SettingsLoadFail,
    SettingsDeleteFail,
    EraseSecondSlotError,
    InitFlashError,
    WriteFlashError,
    InvalidImage,
    SwapFail,
    SystemRollback,
    Canceled,
    OutOfMemory,
    ThreadCreateError,
    InternalError,
}

impl OtaErrorKind {
    /// Maps to the external `statusCode` enum.
    pub fn status_code(self) -> &'static str {
        use OtaErrorKind::*;
        match self {
            InvalidRequest => "InvalidRequest",
            AlreadyInProgress => "UpdateAlreadyInProgress",
            NetworkError => "ErrorNetwork",
            SettingsInitFail | SettingsSaveFail | SettingsLoadFail | SettingsDeleteFail => {
                "IOError"
            }
            EraseSecondSlotError | InitFlashError | WriteFlashError => "InternalError",
            InvalidImage => "InvalidBaseImage",
            SwapFail => "InternalError",
            SystemRollback => "SystemRollback",
            Canceled => "Canceled",
            OutOfMemory | ThreadCreateError | InternalError => "InternalError",
        }
    }

    /// Whether an attempt failing with this error should be retried (up to
    /// `MAX_OTA_RETRY`) rather than surfacing immediately as `Failure`.
    pub fn is_retryable(self) -> bool {
        use OtaErrorKind::*;
        matches!(
            self,
            NetworkError | EraseSecondSlotError | InitFlashError | WriteFlashError
        )
    }
}

impl fmt::Display for OtaErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.status_code())
    }
}

impl std::error::Error for OtaErrorKind {}

#[cfg(test)]
mod tests {
    use super::OtaErrorKind::*;

    #[test]
    fn settings_errors_map_to_io_error() {
        for kind in [
            SettingsInitFail,
            SettingsSaveFail,
            SettingsLoadFail,
            SettingsDeleteFail,
        ] {
            assert_eq!(kind.status_code(), "IOError");
        }
    }

    #[test]
    fn error_status_reuses_failure_status_code_enum() {
        // Intermediate Error events use the
        // same statusCode enum as terminal Failure events.
        assert_eq!(NetworkError.status_code(), "ErrorNetwork");
    }

    #[test]
    fn retryable_set_matches_spec() {
        assert!(NetworkError.is_retryable());
        assert!(EraseSecondSlotError.is_retryable());
        assert!(InitFlashError.is_retryable());
        assert!(WriteFlashError.is_retryable());
        assert!(!Canceled.is_retryable());
        assert!(!InvalidImage.is_retryable());
    }
}
