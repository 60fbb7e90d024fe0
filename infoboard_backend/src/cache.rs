use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::snapshot::SnapshotRecord;
use crate::store::KvStore;

pub const CACHE_STORE_KEY: &str = "infoboard_sidebar_board_cache_v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: SnapshotRecord,
    /// Unix epoch milliseconds.
    #[serde(rename = "savedAt", default)]
    pub saved_at: i64,
}

/// Last parsed snapshot per conversation key.
///
/// The whole map is one blob in the store: read once on load, rewritten on
/// every `put`. Entries are never evicted.
pub struct SnapshotCache {
    store: Arc<dyn KvStore>,
    entries: BTreeMap<String, CacheEntry>,
}

impl SnapshotCache {
    pub fn load(store: Arc<dyn KvStore>) -> Self {
        let entries = match store.get(CACHE_STORE_KEY) {
            Ok(Some(raw)) => decode_entries(&raw),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!("Failed to read snapshot cache, starting empty: {}", e);
                BTreeMap::new()
            }
        };

        tracing::debug!("Loaded {} cached snapshot(s)", entries.len());
        Self { store, entries }
    }

    pub fn get(&self, key: &str) -> Option<&SnapshotRecord> {
        self.entries.get(key).map(|entry| &entry.data)
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn put(&mut self, key: &str, record: SnapshotRecord) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data: record,
                saved_at: Utc::now().timestamp_millis(),
            },
        );
        self.save();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) {
        let result = serde_json::to_string(&self.entries)
            .map_err(anyhow::Error::from)
            .and_then(|raw| self.store.set(CACHE_STORE_KEY, &raw));
        if let Err(e) = result {
            tracing::warn!("Failed to save snapshot cache: {}", e);
        }
    }
}

fn decode_entries(raw: &str) -> BTreeMap<String, CacheEntry> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        tracing::warn!("Snapshot cache blob is not an object; resetting");
        return BTreeMap::new();
    };

    map.into_iter()
        .filter_map(|(key, value)| match serde_json::from_value::<CacheEntry>(value) {
            Ok(entry) => Some((key, entry)),
            Err(e) => {
                tracing::debug!("Skipping malformed cache entry '{}': {}", key, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryKvStore, SqliteKvStore};

    fn sample() -> SnapshotRecord {
        SnapshotRecord::parse("Mood: [calm]\nLocation: pier\nWeather: fog", false)
    }

    #[test]
    fn round_trip_through_fresh_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&path).unwrap());
            let mut cache = SnapshotCache::load(store);
            cache.put("chid:7", sample());
        }

        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::open(&path).unwrap());
        let cache = SnapshotCache::load(store);
        assert_eq!(cache.get("chid:7"), Some(&sample()));
        assert!(cache.entry("chid:7").unwrap().saved_at > 0);
        assert!(cache.get("chid:8").is_none());
    }

    #[test]
    fn reload_keeps_field_order() {
        let record = SnapshotRecord::parse("Zeta: 1\nMood: ok\nAlpha: 2", false);
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        SnapshotCache::load(store.clone()).put("chid:7", record.clone());

        let reloaded = SnapshotCache::load(store);
        let restored = reloaded.get("chid:7").unwrap();
        let keys: Vec<&str> = restored.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["Zeta", "Mood", "Alpha"]);
        assert_eq!(restored, &record);

        let view = crate::panel::render(Some(restored), false);
        let extras: Vec<&str> = view
            .section("Extra")
            .unwrap()
            .fields
            .iter()
            .map(|f| f.label())
            .collect();
        assert_eq!(extras, ["Zeta", "Alpha"]);
    }

    #[test]
    fn corrupt_blob_resets_to_empty() {
        for raw in ["{oops", "[1,2]", "\"text\"", "null"] {
            let store = Arc::new(MemoryKvStore::new());
            store.set(CACHE_STORE_KEY, raw).unwrap();
            let cache = SnapshotCache::load(store);
            assert!(cache.is_empty(), "blob {:?} should reset", raw);
        }
    }

    #[test]
    fn malformed_entries_are_skipped() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .set(
                CACHE_STORE_KEY,
                r#"{"good": {"data": {"Mood": "ok"}, "savedAt": 5}, "bad": {"data": "nope"}, "worse": 3}"#,
            )
            .unwrap();
        let cache = SnapshotCache::load(store);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("good").and_then(|r| r.get("Mood")), Some("ok"));
    }

    #[test]
    fn put_overwrites_and_rewrites_blob() {
        let store = Arc::new(MemoryKvStore::new());
        let mut cache = SnapshotCache::load(store.clone());
        cache.put("global", sample());
        cache.put("global", SnapshotRecord::parse("Mood: tense", false));

        let raw = store.get(CACHE_STORE_KEY).unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["global"]["data"], serde_json::json!({"Mood": "tense"}));
        assert!(value["global"]["savedAt"].is_i64());
        assert_eq!(cache.len(), 1);
    }
}
