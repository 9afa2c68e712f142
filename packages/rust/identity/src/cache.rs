//! File-backed cache of directory lookups, one JSON file per query hash.
//!
//! Entries are either a validated [`DirectoryRecord`] or a terminal
//! `{"status": "NOT_FOUND", "reason": ..., "metadata": ...}` marker. Writes
//! replace the whole file atomically, so two workers racing on the same
//! query leave one complete, equivalent entry behind.

use std::path::{Path, PathBuf};

use recordflow_shared::store::{read_json, write_json_atomic};
use recordflow_shared::{Address, DirectoryRecord, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::rules::MismatchReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarkerStatus {
    NotFound,
}

/// Cached "no usable match" verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotFoundMarker {
    pub status: MarkerStatus,
    pub reason: MismatchReason,
    /// Query and candidate details kept for auditing.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NotFoundMarker {
    pub fn new(reason: MismatchReason, metadata: Map<String, Value>) -> Self {
        Self {
            status: MarkerStatus::NotFound,
            reason,
            metadata,
        }
    }
}

/// One cache file's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheEntry {
    NotFound(NotFoundMarker),
    Matched(DirectoryRecord),
}

/// Directory of cached lookup outcomes.
#[derive(Debug, Clone)]
pub struct DirectoryCache {
    dir: PathBuf,
}

impl DirectoryCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache key of a normalized query: hex SHA-256.
    pub fn key_for(query: &str) -> String {
        format!("{:x}", Sha256::digest(query.as_bytes()))
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read an entry. A corrupt file is treated as a miss so the lookup is redone.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = self.path_for(key);
        match read_json(&path) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable cache entry");
                None
            }
        }
    }

    pub fn put(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        write_json_atomic(&self.path_for(key), entry)
    }
}

/// The lookup query for a subject: `"<name> <street, city, state, zip>"`,
/// lowercased with whitespace collapsed.
pub fn normalize_query(name: &str, address: Option<&Address>) -> String {
    let address = address.map(Address::one_line).unwrap_or_default();
    format!("{name} {address}")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use recordflow_shared::Contact;
    use uuid::Uuid;

    use super::*;

    fn temp_cache() -> DirectoryCache {
        DirectoryCache::new(
            std::env::temp_dir().join(format!("rf-dircache-{}", Uuid::now_v7())),
        )
    }

    #[test]
    fn query_normalization_is_stable() {
        let address = Address {
            street: Some("100  Oak St".into()),
            city: Some("Austin".into()),
            state: Some("TX".into()),
            zip: Some("78701".into()),
            ..Address::default()
        };
        let a = normalize_query("Sunshine   Kids", Some(&address));
        let b = normalize_query("SUNSHINE KIDS", Some(&address));
        assert_eq!(a, "sunshine kids 100 oak st, austin, tx, 78701");
        assert_eq!(DirectoryCache::key_for(&a), DirectoryCache::key_for(&b));
        assert_eq!(normalize_query(" Solo ", None), "solo");
    }

    #[test]
    fn marker_wire_format() {
        let marker = CacheEntry::NotFound(NotFoundMarker::new(
            MismatchReason::NameMismatch,
            Map::new(),
        ));
        let json = serde_json::to_value(&marker).unwrap();
        assert_eq!(json["status"], "NOT_FOUND");
        assert_eq!(json["reason"], "name_mismatch");
    }

    #[test]
    fn entries_survive_reopen() {
        let cache = temp_cache();
        let key = DirectoryCache::key_for("sunshine kids 100 oak st");
        assert!(cache.get(&key).is_none());

        let record = DirectoryRecord {
            place_id: "p1".into(),
            name: "Sunshine Kids Daycare".into(),
            address: Some("100 Oak Street".into()),
            business_status: Some("OPERATIONAL".into()),
            contact: Contact::default(),
            rating: None,
            location: None,
            operating_hours: None,
            reviews: vec![],
            ..DirectoryRecord::default()
        };
        cache.put(&key, &CacheEntry::Matched(record.clone())).unwrap();

        let reopened = DirectoryCache::new(cache.dir());
        assert_eq!(reopened.get(&key), Some(CacheEntry::Matched(record)));

        let _ = std::fs::remove_dir_all(cache.dir());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let cache = temp_cache();
        std::fs::create_dir_all(cache.dir()).unwrap();
        std::fs::write(cache.path_for("bad"), "{").unwrap();
        assert!(cache.get("bad").is_none());
        let _ = std::fs::remove_dir_all(cache.dir());
    }
}
