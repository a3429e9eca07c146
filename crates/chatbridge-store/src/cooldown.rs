//! Profile cooldown persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::{write_atomic, Result};

/// On-disk map of profile path → cooldown expiry.
///
/// A profile with an unexpired entry is excluded from rotation selection.
/// Expired entries are pruned on load and on save.
#[derive(Debug)]
pub struct CooldownStore {
    path: PathBuf,
    entries: HashMap<String, DateTime<Utc>>,
}

impl CooldownStore {
    /// Loads the store from `path`, tolerating a missing or corrupt file.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, DateTime<Utc>>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt cooldown store; starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        let mut store = Self { path, entries };
        store.prune(Utc::now());
        store
    }

    /// Creates an empty in-memory store backed by `path` without reading it.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: HashMap::new(),
        }
    }

    /// Puts a profile on cooldown for `duration` from now.
    pub fn set_cooldown(&mut self, profile: &Path, duration: Duration) {
        let expiry = Utc::now() + duration;
        self.entries
            .insert(profile.display().to_string(), expiry);
    }

    /// Sets an explicit expiry, mainly for tests and migrations.
    pub fn set_expiry(&mut self, profile: &Path, expiry: DateTime<Utc>) {
        self.entries.insert(profile.display().to_string(), expiry);
    }

    /// Returns true if the profile is cooling down at `now`.
    pub fn is_cooling(&self, profile: &Path, now: DateTime<Utc>) -> bool {
        self.entries
            .get(&profile.display().to_string())
            .is_some_and(|expiry| *expiry > now)
    }

    /// Returns the expiry for a profile, if one is recorded.
    pub fn expiry(&self, profile: &Path) -> Option<DateTime<Utc>> {
        self.entries.get(&profile.display().to_string()).copied()
    }

    /// Drops entries that expired at or before `now`.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, expiry| *expiry > now);
    }

    /// Number of active entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no profile is cooling down.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persists the store, pruning expired entries first.
    pub fn save(&mut self) -> Result<()> {
        self.prune(Utc::now());
        let raw = serde_json::to_string_pretty(&self.entries)?;
        write_atomic(&self.path, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_check_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CooldownStore::empty(dir.path().join("cooldowns.json"));
        let profile = Path::new("/profiles/a");

        store.set_cooldown(profile, Duration::minutes(30));
        assert!(store.is_cooling(profile, Utc::now()));
        assert!(!store.is_cooling(Path::new("/profiles/b"), Utc::now()));
    }

    #[test]
    fn test_expired_entry_is_not_cooling() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CooldownStore::empty(dir.path().join("cooldowns.json"));
        let profile = Path::new("/profiles/a");

        store.set_expiry(profile, Utc::now() - Duration::seconds(1));
        assert!(!store.is_cooling(profile, Utc::now()));

        store.prune(Utc::now());
        assert!(store.is_empty());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        let profile = Path::new("/profiles/a");

        let mut store = CooldownStore::empty(&path);
        store.set_cooldown(profile, Duration::hours(1));
        store.save().unwrap();

        let reloaded = CooldownStore::load(&path);
        assert!(reloaded.is_cooling(profile, Utc::now()));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_load_prunes_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");

        let mut store = CooldownStore::empty(&path);
        store.set_expiry(Path::new("/profiles/stale"), Utc::now() - Duration::hours(1));
        store.set_expiry(Path::new("/profiles/live"), Utc::now() + Duration::hours(1));
        // Bypass save() pruning to exercise load-side pruning.
        let raw = serde_json::to_string(&store.entries).unwrap();
        crate::write_atomic(&path, &raw).unwrap();

        let reloaded = CooldownStore::load(&path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.is_cooling(Path::new("/profiles/live"), Utc::now()));
    }

    #[test]
    fn test_corrupt_file_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cooldowns.json");
        std::fs::write(&path, "not json at all").unwrap();

        let store = CooldownStore::load(&path);
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let store = CooldownStore::load("/nonexistent/path/cooldowns.json");
        assert!(store.is_empty());
    }
}
