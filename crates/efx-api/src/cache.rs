//! ---
//! efx_section: "02-device-connectivity"
//! efx_subsection: "module"
//! efx_type: "source"
//! efx_scope: "code"
//! efx_description: "Device connectivity contract and transport strategies."
//! efx_version: "v0.1.0"
//! efx_owner: "tbd"
//! ---
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::models::QuotaSnapshot;

/// Concurrency-safe store of the latest decoded snapshot per device.
///
/// The background receive task of a bus transport is the sole writer;
/// the collection loop is the sole reader. No history is retained, so
/// memory is O(1) per device.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    inner: RwLock<HashMap<String, QuotaSnapshot>>,
}

impl SnapshotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wholly replace the entry for the snapshot's device.
    ///
    /// Returns false when the incoming snapshot is older than the stored
    /// one; `captured_at` is non-decreasing per device.
    pub fn put(&self, snapshot: QuotaSnapshot) -> bool {
        let mut guard = self.inner.write();
        if let Some(existing) = guard.get(&snapshot.device_sn) {
            if snapshot.captured_at < existing.captured_at {
                return false;
            }
        }
        guard.insert(snapshot.device_sn.clone(), snapshot);
        true
    }

    /// Current snapshot for a device, or None when nothing has arrived.
    pub fn get(&self, device_sn: &str) -> Option<QuotaSnapshot> {
        self.inner.read().get(device_sn).cloned()
    }

    /// Capture timestamp of the stored snapshot, if any.
    pub fn captured_at(&self, device_sn: &str) -> Option<DateTime<Utc>> {
        self.inner.read().get(device_sn).map(|s| s.captured_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SnapshotSource;
    use chrono::Duration as ChronoDuration;
    use efx_common::QuotaValue;
    use std::sync::Arc;

    fn snapshot(sn: &str, soc: u64) -> QuotaSnapshot {
        let mut map = indexmap::IndexMap::new();
        map.insert("soc".to_owned(), QuotaValue::UInt(soc));
        QuotaSnapshot::now(sn, QuotaValue::Mapping(map), SnapshotSource::Push)
    }

    #[test]
    fn put_is_isolated_per_device() {
        let cache = SnapshotCache::new();
        cache.put(snapshot("device-x", 10));
        cache.put(snapshot("device-y", 90));

        cache.put(snapshot("device-x", 11));
        let x = cache.get("device-x").unwrap();
        let y = cache.get("device-y").unwrap();
        assert_eq!(
            x.values.as_mapping().unwrap()["soc"],
            QuotaValue::UInt(11)
        );
        assert_eq!(
            y.values.as_mapping().unwrap()["soc"],
            QuotaValue::UInt(90)
        );
    }

    #[test]
    fn put_wholly_replaces() {
        let cache = SnapshotCache::new();
        let mut first = indexmap::IndexMap::new();
        first.insert("soc".to_owned(), QuotaValue::UInt(10));
        first.insert("watts".to_owned(), QuotaValue::UInt(240));
        cache.put(QuotaSnapshot::now(
            "device-x",
            QuotaValue::Mapping(first),
            SnapshotSource::Push,
        ));

        cache.put(snapshot("device-x", 11));
        let stored = cache.get("device-x").unwrap();
        let map = stored.values.as_mapping().unwrap();
        assert_eq!(map.len(), 1);
        assert!(!map.contains_key("watts"));
    }

    #[test]
    fn stale_put_is_rejected() {
        let cache = SnapshotCache::new();
        let fresh = snapshot("device-x", 50);
        let mut stale = snapshot("device-x", 49);
        stale.captured_at = fresh.captured_at - ChronoDuration::seconds(5);

        assert!(cache.put(fresh));
        assert!(!cache.put(stale));
        assert_eq!(
            cache.get("device-x").unwrap().values.as_mapping().unwrap()["soc"],
            QuotaValue::UInt(50)
        );
    }

    #[test]
    fn missing_device_reads_as_unavailable() {
        let cache = SnapshotCache::new();
        assert!(cache.get("device-z").is_none());
        assert!(cache.captured_at("device-z").is_none());
    }

    #[test]
    fn concurrent_put_get_sequences_are_serializable() {
        let cache = Arc::new(SnapshotCache::new());
        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..250u64 {
                    cache.put(snapshot("device-x", worker * 1000 + i));
                    let _ = cache.get("device-x");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        // Whatever interleaving happened, exactly one coherent snapshot
        // remains.
        let stored = cache.get("device-x").unwrap();
        assert!(stored.values.as_mapping().unwrap().contains_key("soc"));
    }
}
