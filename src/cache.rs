//! Metadata cache: a filename-keyed store of recording metadata, persisted
//! as a single JSON document and reconciled against fresh file-list reads
//! using a truncated-list merge policy.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::file_list::Recording;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub filename: String,
    pub size: u32,
    pub duration: f64,
    pub created_at: Option<chrono::NaiveDateTime>,
    pub device_path: String,
    pub local_path: Option<PathBuf>,
    pub checksum: Option<String>,
}

impl CacheEntry {
    fn from_recording(recording: &Recording) -> Self {
        Self {
            filename: recording.filename.clone(),
            size: recording.size,
            duration: recording.duration_seconds,
            created_at: recording.created_at,
            device_path: recording.filename.clone(),
            local_path: None,
            checksum: None,
        }
    }
}

/// Read whole into memory on construction, rewritten whole on every
/// mutating call — adequate for the hundreds-to-low-thousands cardinality
/// expected here.
pub struct Cache {
    path: PathBuf,
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join("metadata.json");
        let entries = Self::load(&path);
        Self { path, entries }
    }

    fn load(path: &Path) -> HashMap<String, CacheEntry> {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("cache file {path:?} is corrupt, starting empty: {err}");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                warn!("could not create cache directory {parent:?}: {err}");
                return;
            }
        }
        match serde_json::to_string_pretty(&self.entries) {
            Ok(json) => {
                if let Err(err) = fs::write(&self.path, json) {
                    warn!("could not write cache file {:?}: {err}", self.path);
                }
            }
            Err(err) => warn!("could not serialize cache: {err}"),
        }
    }

    pub fn get_all(&self) -> Vec<CacheEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn get(&self, filename: &str) -> Option<&CacheEntry> {
        self.entries.get(filename)
    }

    pub fn set(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.filename.clone(), entry);
        self.persist();
    }

    pub fn remove(&mut self, filename: &str) {
        if self.entries.remove(filename).is_some() {
            self.persist();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.persist();
    }

    /// Reconcile a freshly streamed file list against the cache: a fresh
    /// list at least as long as the cache is authoritative (upsert +
    /// delete-missing); a shorter (truncated) fresh list only upserts,
    /// never deleting entries it didn't mention.
    pub fn reconcile(&mut self, fresh: &[Recording]) {
        let cached_count = self.entries.len();
        let authoritative = fresh.len() >= cached_count;

        let fresh_names: std::collections::HashSet<&str> =
            fresh.iter().map(|r| r.filename.as_str()).collect();

        for recording in fresh {
            self.entries.insert(
                recording.filename.clone(),
                CacheEntry::from_recording(recording),
            );
        }

        if authoritative {
            self.entries.retain(|name, _| fresh_names.contains(name.as_str()));
            debug!(
                "file-list refresh authoritative: {} entries retained",
                self.entries.len()
            );
        } else {
            debug!(
                "file-list refresh truncated ({} < {cached_count}), merging without deletion",
                fresh.len()
            );
        }

        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn recording(filename: &str, size: u32) -> Recording {
        Recording {
            filename: filename.to_string(),
            size,
            duration_seconds: 1.0,
            created_at: NaiveDate::from_ymd_opt(2025, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0)),
            version: 2,
            signature: [0u8; 16],
        }
    }

    fn temp_cache() -> (Cache, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir");
        (Cache::new(dir.path()), dir)
    }

    #[test]
    fn authoritative_refresh_deletes_entries_missing_from_fresh_list() {
        let (mut cache, _dir) = temp_cache();
        cache.set(CacheEntry::from_recording(&recording("a.wav", 1)));
        cache.set(CacheEntry::from_recording(&recording("b.wav", 2)));

        cache.reconcile(&[recording("a.wav", 10)]);

        let all = cache.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].filename, "a.wav");
        assert_eq!(all[0].size, 10);
    }

    #[test]
    fn truncated_refresh_merges_without_deleting() {
        let (mut cache, _dir) = temp_cache();
        cache.set(CacheEntry::from_recording(&recording("a.wav", 1)));
        cache.set(CacheEntry::from_recording(&recording("b.wav", 2)));
        cache.set(CacheEntry::from_recording(&recording("c.wav", 3)));

        // Fresh list is shorter than the cache: treat as truncated, keep b/c.
        cache.reconcile(&[recording("a.wav", 99)]);

        let mut names: Vec<&str> = cache.get_all().iter().map(|e| e.filename.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a.wav", "b.wav", "c.wav"]);
    }

    #[test]
    fn persists_and_reloads_across_instances() {
        let (mut cache, dir) = temp_cache();
        cache.set(CacheEntry::from_recording(&recording("a.wav", 1)));
        drop(cache);

        let reloaded = Cache::new(dir.path());
        assert_eq!(reloaded.get_all().len(), 1);
    }
}
