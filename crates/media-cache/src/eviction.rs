//! # Eviction index
//!
//! Usage statistics of every resource in the cache directory and the
//! weighted recency/frequency ranking that picks eviction victims.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::resource::{CacheKey, MediaResource};
use crate::store::write_json;

pub const DEFAULT_TIME_WEIGHT: u64 = 2;
pub const DEFAULT_USE_WEIGHT: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionEntry {
    pub resource: MediaResource,
    pub last_accessed_at: DateTime<Utc>,
    pub visit_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexState {
    time_weight: u64,
    use_weight: u64,
    contents: BTreeMap<CacheKey, EvictionEntry>,
}

#[derive(Debug)]
pub struct EvictionIndex {
    path: PathBuf,
    state: Mutex<IndexState>,
}

impl EvictionIndex {
    /// Loads the index at `path`. A missing or undecodable file yields a fresh
    /// index with the given weights.
    pub fn load_or_create(path: impl Into<PathBuf>, time_weight: u64, use_weight: u64) -> Self {
        let path = path.into();
        let loaded = std::fs::read(&path)
            .ok()
            .and_then(|bytes| match serde_json::from_slice::<IndexState>(&bytes) {
                Ok(state) => Some(state),
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to parse eviction index, starting fresh");
                    None
                }
            });

        match loaded {
            Some(state) => {
                debug!(entries = state.contents.len(), "Loaded eviction index");
                Self {
                    path,
                    state: Mutex::new(state),
                }
            }
            None => Self {
                path,
                state: Mutex::new(IndexState {
                    time_weight,
                    use_weight,
                    contents: BTreeMap::new(),
                }),
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a playback start of `resource`.
    pub fn visit(&self, resource: &MediaResource) {
        let mut state = self.state.lock();
        let now = Utc::now();
        state
            .contents
            .entry(resource.cache_key().to_string())
            .and_modify(|entry| {
                entry.visit_count += 1;
                entry.last_accessed_at = now;
            })
            .or_insert_with(|| EvictionEntry {
                resource: resource.clone(),
                last_accessed_at: now,
                visit_count: 1,
            });
        self.persist(&state);
    }

    pub fn delete(&self, cache_key: &str) {
        let mut state = self.state.lock();
        if state.contents.remove(cache_key).is_some() {
            debug!(key = cache_key, "Removed eviction entry");
            self.persist(&state);
        }
    }

    /// Removes every entry whose key is not in `keep`.
    pub fn delete_all(&self, keep: &HashSet<CacheKey>) {
        let mut state = self.state.lock();
        state.contents.retain(|key, _| keep.contains(key));
        self.persist(&state);
    }

    /// Sets the ranking weights and persists them.
    pub fn update_weights(&self, time_weight: u64, use_weight: u64) {
        let mut state = self.state.lock();
        state.time_weight = time_weight;
        state.use_weight = use_weight;
        self.persist(&state);
    }

    pub fn weights(&self) -> (u64, u64) {
        let state = self.state.lock();
        (state.time_weight, state.use_weight)
    }

    /// Up to `max_count` eviction victims, never any resource in `excluding`.
    ///
    /// When there are no more candidates than `max_count` all of them are
    /// returned unranked. Otherwise each candidate scores
    /// `(time rank + 1) * time_weight + (use rank + 1) * use_weight`, ranks
    /// ascending from the oldest and least visited, and the lowest scores win.
    pub fn oldest_resources(
        &self,
        max_count: usize,
        excluding: &HashSet<CacheKey>,
    ) -> Vec<MediaResource> {
        let state = self.state.lock();
        let candidates: Vec<&EvictionEntry> = state
            .contents
            .iter()
            .filter(|(key, _)| !excluding.contains(*key))
            .map(|(_, entry)| entry)
            .collect();

        if candidates.len() <= max_count {
            return candidates.iter().map(|entry| entry.resource.clone()).collect();
        }

        let mut scores = vec![0u64; candidates.len()];

        let mut by_time: Vec<usize> = (0..candidates.len()).collect();
        by_time.sort_by_key(|&i| candidates[i].last_accessed_at);
        for (rank, &i) in by_time.iter().enumerate() {
            scores[i] += (rank as u64 + 1) * state.time_weight;
        }

        let mut by_use: Vec<usize> = (0..candidates.len()).collect();
        by_use.sort_by_key(|&i| candidates[i].visit_count);
        for (rank, &i) in by_use.iter().enumerate() {
            scores[i] += (rank as u64 + 1) * state.use_weight;
        }

        let mut ranked: Vec<usize> = (0..candidates.len()).collect();
        ranked.sort_by_key(|&i| scores[i]);
        ranked
            .into_iter()
            .take(max_count)
            .map(|i| candidates[i].resource.clone())
            .collect()
    }

    pub fn contains(&self, cache_key: &str) -> bool {
        self.state.lock().contents.contains_key(cache_key)
    }

    pub fn entry(&self, cache_key: &str) -> Option<EvictionEntry> {
        self.state.lock().contents.get(cache_key).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the index to disk.
    pub fn synchronize(&self) -> bool {
        let state = self.state.lock();
        self.persist(&state)
    }

    fn persist(&self, state: &IndexState) -> bool {
        match write_json(state, &self.path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to persist eviction index");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn resource(key: &str) -> MediaResource {
        MediaResource::new(&format!("https://example.com/{key}.mp4"), Some(key.into())).unwrap()
    }

    fn keys(resources: &[MediaResource]) -> Vec<&str> {
        resources.iter().map(|r| r.cache_key()).collect()
    }

    /// Entries `a`..`e`, oldest first, with the given visit counts.
    fn seeded(dir: &Path, counts: [u64; 5]) -> EvictionIndex {
        let index = EvictionIndex::load_or_create(dir.join("lru.json"), 2, 1);
        let base = Utc::now() - Duration::hours(1);
        {
            let mut state = index.state.lock();
            for (i, (key, count)) in ["a", "b", "c", "d", "e"].iter().zip(counts).enumerate() {
                state.contents.insert(
                    key.to_string(),
                    EvictionEntry {
                        resource: resource(key),
                        last_accessed_at: base + Duration::minutes(i as i64),
                        visit_count: count,
                    },
                );
            }
        }
        index
    }

    #[test]
    fn test_visit_creates_then_increments() {
        let dir = tempfile::tempdir().unwrap();
        let index = EvictionIndex::load_or_create(dir.path().join("lru.json"), 2, 1);
        let res = resource("movie");

        index.visit(&res);
        let first = index.entry("movie").unwrap();
        assert_eq!(first.visit_count, 1);

        index.visit(&res);
        let second = index.entry("movie").unwrap();
        assert_eq!(second.visit_count, 2);
        assert!(second.last_accessed_at >= first.last_accessed_at);
    }

    #[test]
    fn test_weighted_ranking() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded(dir.path(), [5, 1, 3, 2, 4]);

        // Scores: a=2+5, b=4+1, c=6+3, d=8+2, e=10+4.
        let victims = index.oldest_resources(3, &HashSet::new());
        assert_eq!(keys(&victims), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_ranking_excludes_and_breaks_ties_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded(dir.path(), [5, 1, 3, 2, 4]);

        // Without b: a=2+4, c=4+2, d=6+1, e=8+3.
        let excluding = HashSet::from(["b".to_string()]);
        let victims = index.oldest_resources(3, &excluding);
        assert_eq!(keys(&victims), vec!["a", "c", "d"]);
    }

    #[test]
    fn test_small_candidate_set_is_returned_whole() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded(dir.path(), [1, 1, 1, 1, 1]);
        let excluding = HashSet::from(["a".to_string(), "c".to_string()]);

        let victims = index.oldest_resources(4, &excluding);
        let mut got = keys(&victims);
        got.sort();
        assert_eq!(got, vec!["b", "d", "e"]);
        assert!(index.oldest_resources(0, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_delete_all_keeps_listed() {
        let dir = tempfile::tempdir().unwrap();
        let index = seeded(dir.path(), [1, 2, 3, 4, 5]);
        index.delete("a");
        assert!(!index.contains("a"));

        let keep = HashSet::from(["c".to_string(), "zzz".to_string()]);
        index.delete_all(&keep);
        assert_eq!(index.len(), 1);
        assert!(index.contains("c"));
    }

    #[test]
    fn test_persisted_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lru.json");
        let index = seeded(dir.path(), [1, 2, 3, 4, 5]);
        index.update_weights(3, 7);

        let reloaded = EvictionIndex::load_or_create(&path, 2, 1);
        assert_eq!(reloaded.weights(), (3, 7));
        assert_eq!(*reloaded.state.lock(), *index.state.lock());

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["timeWeight"], 3);
        assert_eq!(json["contents"]["b"]["visitCount"], 2);
        assert_eq!(json["contents"]["b"]["resource"]["cacheKey"], "b");
    }

    #[test]
    fn test_corrupt_index_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lru.json");
        std::fs::write(&path, b"[]").unwrap();

        let index = EvictionIndex::load_or_create(&path, 4, 2);
        assert!(index.is_empty());
        assert_eq!(index.weights(), (4, 2));
    }
}
