//! Crash-safe key/value settings store.
//!
//! Generalizes `tachtalk-firmware`'s single-blob NVS config (`config.rs`)
//! into a `(namespace, key)` store: every OTA persistent-state key lives
//! under the `ota/` namespace (see `crate::ota::types`).

use anyhow::{anyhow, Result};
use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// A key/value settings store keyed by `(namespace, key)`.
///
/// `load` enumerates all keys under `ns` and calls `visitor(key, bytes)` for
/// each; the visitor returns `true` to keep iterating or `false` to stop
/// early. `delete` of a missing key is not an error.
pub trait SettingsStore: Send + Sync {
    fn save(&self, ns: &str, key: &str, bytes: &[u8]) -> Result<()>;
    fn load(&self, ns: &str, visitor: &mut dyn FnMut(&str, &[u8]) -> bool) -> Result<()>;
    fn delete(&self, ns: &str, key: &str) -> Result<()>;
}

/// Compose the flat NVS key from a namespace and key, since `EspNvs` has no
/// native namespacing below the partition-namespace level.
fn nvs_key(ns: &str, key: &str) -> String {
    format!("{ns}/{key}")
}

/// ESP-IDF NVS-backed settings store.
///
/// `save` and `delete` are atomic at the key level by construction: NVS's
/// underlying write is a single erase-and-rewrite page transaction, so a
/// crash mid-write leaves either the old or the new value, never a torn one.
pub struct EspSettingsStore {
    nvs: Mutex<EspNvs<NvsDefault>>,
    /// Keys ever written, so `load` can enumerate a namespace without a
    /// native NVS "list keys" API (not exposed by `esp-idf-svc`).
    known_keys: Mutex<BTreeMap<String, ()>>,
}

impl EspSettingsStore {
    pub fn init(partition: EspNvsPartition<NvsDefault>, nvs_namespace: &str) -> Result<Self> {
        debug!("settings: opening NVS namespace '{nvs_namespace}'");
        let nvs = EspNvs::new(partition, nvs_namespace, true)
            .map_err(|e| anyhow!("settings: INIT_FAIL: {e}"))?;
        Ok(Self {
            nvs: Mutex::new(nvs),
            known_keys: Mutex::new(BTreeMap::new()),
        })
    }
}

impl SettingsStore for EspSettingsStore {
    fn save(&self, ns: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let flat = nvs_key(ns, key);
        let mut nvs = self.nvs.lock().unwrap();
        nvs.set_blob(&flat, bytes)
            .map_err(|e| anyhow!("settings: SAVE_FAIL({flat}): {e}"))?;
        self.known_keys.lock().unwrap().insert(flat, ());
        Ok(())
    }

    fn load(&self, ns: &str, visitor: &mut dyn FnMut(&str, &[u8]) -> bool) -> Result<()> {
        let prefix = format!("{ns}/");
        let keys: Vec<String> = self
            .known_keys
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(&prefix))
            .cloned()
            .collect();

        let nvs = self.nvs.lock().unwrap();
        for flat in keys {
            let Some(bare) = flat.strip_prefix(&prefix) else {
                continue;
            };
            let len = nvs
                .blob_len(&flat)
                .map_err(|e| anyhow!("settings: LOAD_FAIL({flat}): {e}"))?;
            let Some(len) = len else { continue };
            let mut buf = vec![0u8; len];
            nvs.get_blob(&flat, &mut buf)
                .map_err(|e| anyhow!("settings: LOAD_FAIL({flat}): {e}"))?;
            if !visitor(bare, &buf) {
                break;
            }
        }
        Ok(())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let flat = nvs_key(ns, key);
        let mut nvs = self.nvs.lock().unwrap();
        match nvs.remove(&flat) {
            Ok(_) => {}
            Err(e) => {
                warn!("settings: delete({flat}) failed (treated as missing): {e}");
            }
        }
        self.known_keys.lock().unwrap().remove(&flat);
        Ok(())
    }
}

/// In-memory settings store used by host-side unit tests.
#[derive(Default)]
pub struct MemSettingsStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl SettingsStore for MemSettingsStore {
    fn save(&self, ns: &str, key: &str, bytes: &[u8]) -> Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(nvs_key(ns, key), bytes.to_vec());
        Ok(())
    }

    fn load(&self, ns: &str, visitor: &mut dyn FnMut(&str, &[u8]) -> bool) -> Result<()> {
        let prefix = format!("{ns}/");
        let map = self.map.lock().unwrap();
        for (flat, bytes) in map.iter().filter(|(k, _)| k.starts_with(&prefix)) {
            let bare = &flat[prefix.len()..];
            if !visitor(bare, bytes) {
                break;
            }
        }
        Ok(())
    }

    fn delete(&self, ns: &str, key: &str) -> Result<()> {
        self.map.lock().unwrap().remove(&nvs_key(ns, key));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips() {
        let store = MemSettingsStore::default();
        store.save("ota", "state", &[2]).unwrap();
        store.save("ota", "req_id", b"11111111-1111-1111-1111-111111111111").unwrap();

        let mut seen = Vec::new();
        store
            .load("ota", &mut |k, v| {
                seen.push((k.to_string(), v.to_vec()));
                true
            })
            .unwrap();

        seen.sort();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, "req_id");
        assert_eq!(seen[1].0, "state");
    }

    #[test]
    fn load_visitor_can_stop_early() {
        let store = MemSettingsStore::default();
        store.save("ota", "a", b"1").unwrap();
        store.save("ota", "b", b"2").unwrap();

        let mut count = 0;
        store
            .load("ota", &mut |_, _| {
                count += 1;
                false
            })
            .unwrap();

        assert_eq!(count, 1);
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let store = MemSettingsStore::default();
        assert!(store.delete("ota", "nope").is_ok());
    }

    #[test]
    fn namespaces_do_not_leak_into_each_other() {
        let store = MemSettingsStore::default();
        store.save("ota", "state", &[2]).unwrap();
        store.save("wifi", "ssid", b"home").unwrap();

        let mut seen = Vec::new();
        store.load("ota", &mut |k, _| { seen.push(k.to_string()); true }).unwrap();
        assert_eq!(seen, vec!["state".to_string()]);
    }
}
