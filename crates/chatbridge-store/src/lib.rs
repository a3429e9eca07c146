//! Chatbridge Store - JSON-file persistence layer.
//!
//! Two small on-disk maps keyed by absolute profile path:
//!
//! - the cooldown store (path → ISO-8601 expiry timestamp), and
//! - the usage store (path → cumulative token count).
//!
//! Both survive restarts so rotation decisions stay fair across runs.
//! Writes go through a temp-file-and-rename step; a missing or corrupt
//! file degrades to an empty map with a warning rather than an error.

mod cooldown;
mod usage;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use cooldown::CooldownStore;
pub use usage::UsageStore;

/// Storage error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Default data directory for the stores.
pub fn default_data_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "chatbridge", "Chatbridge")
        .map(|dirs| dirs.data_dir().to_path_buf())
}

/// Writes `contents` to `path` atomically via a sibling temp file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deep/file.json");
        write_atomic(&path, "{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(!path.with_extension("tmp").exists());
    }
}
