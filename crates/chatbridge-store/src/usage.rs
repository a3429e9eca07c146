//! Cumulative token-usage persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::{write_atomic, Result};

/// On-disk map of profile path → cumulative token count.
///
/// Rotation ranks candidate profiles by ascending usage, so this map is the
/// long-term fairness signal across restarts.
#[derive(Debug)]
pub struct UsageStore {
    path: PathBuf,
    counts: HashMap<String, u64>,
}

impl UsageStore {
    /// Loads the store from `path`, tolerating a missing or corrupt file.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let counts = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, u64>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt usage store; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, counts }
    }

    /// Creates an empty in-memory store backed by `path` without reading it.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            counts: HashMap::new(),
        }
    }

    /// Cumulative tokens recorded for a profile.
    pub fn get(&self, profile: &Path) -> u64 {
        self.counts
            .get(&profile.display().to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Adds tokens to a profile's cumulative count; returns the new total.
    pub fn add(&mut self, profile: &Path, tokens: u64) -> u64 {
        let entry = self
            .counts
            .entry(profile.display().to_string())
            .or_insert(0);
        *entry = entry.saturating_add(tokens);
        *entry
    }

    /// Persists the store.
    pub fn save(&self) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.counts)?;
        write_atomic(&self.path, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = UsageStore::empty(dir.path().join("usage.json"));
        let profile = Path::new("/profiles/a");

        assert_eq!(store.get(profile), 0);
        assert_eq!(store.add(profile, 100), 100);
        assert_eq!(store.add(profile, 50), 150);
        assert_eq!(store.get(profile), 150);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        let profile = Path::new("/profiles/a");

        let mut store = UsageStore::empty(&path);
        store.add(profile, 12345);
        store.save().unwrap();

        let reloaded = UsageStore::load(&path);
        assert_eq!(reloaded.get(profile), 12345);
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage.json");
        std::fs::write(&path, "[1, 2, 3]").unwrap();

        let store = UsageStore::load(&path);
        assert_eq!(store.get(Path::new("/profiles/a")), 0);
    }
}
