//! OTA data model: the in-memory request, the persisted record, and the
//! run token that gates admission/cancellation of the single OTA worker.

use std::sync::{Arc, Mutex};

/// NVS namespace all OTA persistent keys live under.
pub const NAMESPACE: &str = "ota";
/// Key holding the single-byte `PersistentState` enum.
pub const KEY_STATE: &str = "state";
/// Key holding the 36-byte UUID of the in-flight update, present iff state != Idle.
pub const KEY_REQ_ID: &str = "req_id";

/// A 36-char RFC-4122 UUID string, as required by `OTARequest.uuid`.
pub const UUID_LEN: usize = 36;

/// Persisted OTA state, single byte on disk.
///
/// Transitions only `Idle -> InProgress -> Reboot -> Idle` (success path, via
/// boot-time reconciliation) or `Idle -> InProgress -> Idle` (failure/cancel
/// without a reboot having happened).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistentState {
    Idle = 1,
    InProgress = 2,
    Reboot = 3,
}

impl PersistentState {
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Idle),
            2 => Some(Self::InProgress),
            3 => Some(Self::Reboot),
            _ => None,
        }
    }
}

/// An OTA request, created per inbound `Update` command, destroyed when the
/// worker exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtaRequest {
    pub uuid: String,
    pub download_url: String,
}

impl OtaRequest {
    /// `uuid` must be exactly 36 bytes.
    pub fn is_uuid_well_formed(uuid: &str) -> bool {
        uuid.len() == UUID_LEN
    }
}

/// In-memory worker phase, separate from the persisted `PersistentState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Acknowledging,
    Downloading,
    Deploying,
    Rebooting,
    Terminal,
}

/// Shared state backing `OtaRunToken`. `current` is `Some(generation)` while
/// a worker is admitted, `None` while idle. `canceled_by` records the `uuid`
/// of the `Cancel` command that last cleared `current`, if any, so the
/// worker can report a uuid mismatch instead of silently redirecting it.
struct OtaRunTokenState {
    current: Option<u64>,
    next_generation: u64,
    canceled_by: Option<String>,
}

/// Typed wrapper around the run-bit: exposes admission/cancellation as a
/// token rather than raw atomic bits callers would have to order themselves.
///
/// Every admitted worker gets its own generation. `release()` only clears
/// the bit if the generation it was given is still the current one -- a
/// worker that was superseded (cancel followed by a new admission before
/// the old worker finished unwinding) must not clobber the new holder's
/// slot, or a second worker could be admitted alongside the one still
/// running, violating "at most one OTA worker exists at any time".
#[derive(Clone)]
pub struct OtaRunToken {
    state: Arc<Mutex<OtaRunTokenState>>,
}

impl Default for OtaRunToken {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(OtaRunTokenState {
                current: None,
                next_generation: 0,
                canceled_by: None,
            })),
        }
    }
}

impl OtaRunToken {
    /// Atomically admit a worker iff the slot is free. Returns the
    /// generation the caller now owns, to be presented back to `release()`
    /// and `is_current()`.
    pub fn acquire(&self) -> Option<u64> {
        let mut state = self.state.lock().unwrap();
        if state.current.is_some() {
            return None;
        }
        state.next_generation += 1;
        let generation = state.next_generation;
        state.current = Some(generation);
        state.canceled_by = None;
        Some(generation)
    }

    /// Cooperative-cancellation surface: clears whichever worker is
    /// currently admitted, regardless of which generation it is, and
    /// records `cancel_uuid` (the uuid from the inbound `Cancel` command)
    /// so the worker can compare it against its own request uuid.
    pub fn cancel(&self, cancel_uuid: &str) {
        let mut state = self.state.lock().unwrap();
        state.current = None;
        state.canceled_by = Some(cancel_uuid.to_string());
    }

    /// `true` iff `generation` is still the admitted worker -- i.e. this
    /// worker has not been canceled and has not been superseded.
    pub fn is_current(&self, generation: u64) -> bool {
        self.state.lock().unwrap().current == Some(generation)
    }

    /// Release the slot iff `generation` is still the current holder. A
    /// worker that was already superseded by a later admission is a no-op,
    /// so it never clears a different worker's slot.
    pub fn release(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if state.current == Some(generation) {
            state.current = None;
        }
    }

    /// `true` iff any worker is currently admitted.
    pub fn is_set(&self) -> bool {
        self.state.lock().unwrap().current.is_some()
    }

    /// Takes the uuid of the `Cancel` command that most recently cleared
    /// this token, if any, so the worker reports it at most once.
    pub fn take_cancel_uuid(&self) -> Option<String> {
        self.state.lock().unwrap().canceled_by.take()
    }
}

/// Per-worker progress state, owned by the OTA engine for the lifetime of
/// one attempt loop.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    pub image_size: usize,
    pub download_size: usize,
    pub last_percent_sent: Option<u32>,
}

impl DownloadProgress {
    /// `floor(100 * download_size / image_size / 10) * 10`, clamped to
    /// `[0, 100]`.
    pub fn percent(&self) -> u32 {
        if self.image_size == 0 {
            return 0;
        }
        let raw = (self.download_size * 100 / self.image_size) as u32;
        (raw / 10 * 10).min(100)
    }

    /// Returns `Some(percent)` iff the bucketed percent changed since the
    /// last time this was called (so at most 11 `Downloading` events are
    /// emitted per attempt).
    pub fn percent_if_changed(&mut self) -> Option<u32> {
        let p = self.percent();
        if self.last_percent_sent != Some(p) {
            self.last_percent_sent = Some(p);
            Some(p)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_token_admits_once() {
        let token = OtaRunToken::default();
        let gen_a = token.acquire().expect("first acquire succeeds");
        assert!(token.acquire().is_none(), "second acquire must fail while held");
        token.release(gen_a);
        assert!(token.acquire().is_some(), "acquire succeeds again after release");
    }

    #[test]
    fn stale_release_does_not_clobber_a_later_generation() {
        let token = OtaRunToken::default();
        let gen_a = token.acquire().unwrap();
        token.cancel("some-uuid");
        assert!(!token.is_current(gen_a));
        let gen_b = token.acquire().expect("slot is free again after cancel");
        // Worker A finally exits and releases its own (stale) generation.
        token.release(gen_a);
        assert!(token.is_current(gen_b), "A's late release must not clear B's slot");
    }

    #[test]
    fn cancel_uuid_is_recorded_and_taken_once() {
        let token = OtaRunToken::default();
        token.acquire().unwrap();
        token.cancel("caller-uuid");
        assert_eq!(token.take_cancel_uuid().as_deref(), Some("caller-uuid"));
        assert_eq!(token.take_cancel_uuid(), None, "taken exactly once");
    }

    #[test]
    fn persistent_state_round_trips_through_byte() {
        for s in [
            PersistentState::Idle,
            PersistentState::InProgress,
            PersistentState::Reboot,
        ] {
            assert_eq!(PersistentState::from_byte(s.to_byte()), Some(s));
        }
        assert_eq!(PersistentState::from_byte(0), None);
        assert_eq!(PersistentState::from_byte(4), None);
    }

    #[test]
    fn percent_buckets_to_multiples_of_ten() {
        let mut p = DownloadProgress {
            image_size: 1024,
            download_size: 0,
            last_percent_sent: None,
        };
        assert_eq!(p.percent(), 0);
        p.download_size = 107; // 10.45%
        assert_eq!(p.percent(), 10);
        p.download_size = 1024;
        assert_eq!(p.percent(), 100);
    }

    #[test]
    fn percent_if_changed_only_fires_on_change() {
        let mut p = DownloadProgress {
            image_size: 1000,
            download_size: 0,
            last_percent_sent: None,
        };
        assert_eq!(p.percent_if_changed(), Some(0));
        assert_eq!(p.percent_if_changed(), None);
        p.download_size = 50; // still 5% -> buckets to 0
        assert_eq!(p.percent_if_changed(), None);
        p.download_size = 100; // 10%
        assert_eq!(p.percent_if_changed(), Some(10));
    }

    #[test]
    fn uuid_length_validation() {
        assert!(OtaRequest::is_uuid_well_formed(
            "11111111-1111-1111-1111-111111111111"
        ));
        assert!(!OtaRequest::is_uuid_well_formed("too-short"));
    }
}
