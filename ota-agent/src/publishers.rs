//! Periodic telemetry publishers: system status, storage usage, OS/hardware
//! info, WiFi scan results.
//!
//! Out of scope per the system's purpose and scope -- these are "thin
//! publishers that read a value and send it" owned by a separate collaborator.
//! Kept here only as stubs so `main.rs`'s agent task keeps the shape the
//! teacher's `spawn_background_tasks` has (a named task polling a handful of
//! `dump_*` sources every few seconds, see `tachtalk-firmware/src/main.rs`'s
//! `cpu_metrics`/`web_server::log_sockets` loop) without implementing
//! functionality this crate isn't responsible for.

use log::debug;

/// One periodic publisher. `main.rs`'s agent task polls a small fixed list
/// of these at the ~500ms cadence the concurrency model specifies.
pub trait PeriodicPublisher: Send {
    /// Human-readable name, used only in the heartbeat log line.
    fn name(&self) -> &'static str;
    /// Read whatever value this publisher reports and send it. Stubbed to a
    /// debug heartbeat; the real read-and-publish logic lives in the
    /// out-of-scope collaborator this type stands in for.
    fn publish(&mut self);
}

macro_rules! stub_publisher {
    ($name:ident, $label:expr) => {
        #[derive(Default)]
        pub struct $name;

        impl PeriodicPublisher for $name {
            fn name(&self) -> &'static str {
                $label
            }

            fn publish(&mut self) {
                debug!("publishers: {} heartbeat (not implemented, out of scope)", $label);
            }
        }
    };
}

stub_publisher!(SystemStatusPublisher, "system_status");
stub_publisher!(StorageUsagePublisher, "storage_usage");
stub_publisher!(OsInfoPublisher, "os_info");
stub_publisher!(WifiScanPublisher, "wifi_scan");

/// The fixed list of publishers the agent task polls, in the order
/// `main.rs` wires them.
pub fn default_publishers() -> Vec<Box<dyn PeriodicPublisher>> {
    vec![
        Box::new(SystemStatusPublisher),
        Box::new(StorageUsagePublisher),
        Box::new(OsInfoPublisher),
        Box::new(WifiScanPublisher),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_publishers_are_named() {
        let names: Vec<_> = default_publishers().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["system_status", "storage_usage", "os_info", "wifi_scan"]);
    }

    #[test]
    fn publish_does_not_panic() {
        for mut p in default_publishers() {
            p.publish();
        }
    }
}
