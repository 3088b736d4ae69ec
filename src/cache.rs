//! Advisory on-disk cache of session records and provider discovery results.
//!
//! Everything here is best effort: a missing or corrupt cache is rebuilt by
//! re-running discovery and probing, so failures are logged and swallowed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheArea {
    Sessions,
    Providers,
}

impl CacheArea {
    fn dir_name(&self) -> &'static str {
        match self {
            CacheArea::Sessions => "sessions",
            CacheArea::Providers => "providers",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateCache {
    root: PathBuf,
}

impl StateCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, area: CacheArea, id: &str) -> PathBuf {
        // ids are uuids or manifest names; keep them filesystem-safe regardless
        let safe: String = id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(area.dir_name()).join(format!("{}.json", safe))
    }

    pub async fn store<T: Serialize>(&self, area: CacheArea, id: &str, value: &T) {
        let path = self.entry_path(area, id);
        let result = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let bytes = serde_json::to_vec_pretty(value).map_err(std::io::Error::other)?;
            // write-then-rename so readers never see a torn file
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, bytes).await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        match result {
            Ok(()) => debug!(path = %path.display(), "Cache entry stored"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to store cache entry"),
        }
    }

    pub async fn remove(&self, area: CacheArea, id: &str) {
        let path = self.entry_path(area, id);
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to remove cache entry");
            }
        }
    }

    /// Loads every readable entry of `area`; unreadable ones are skipped.
    pub async fn load_all<T: DeserializeOwned>(&self, area: CacheArea) -> Vec<T> {
        let dir = self.root.join(area.dir_name());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut values = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read(&path).await.map(|bytes| serde_json::from_slice::<T>(&bytes)) {
                Ok(Ok(value)) => values.push(value),
                Ok(Err(e)) => warn!(path = %path.display(), error = %e, "Skipping corrupt cache entry"),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache entry"),
            }
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        name: String,
    }

    #[tokio::test]
    async fn store_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::new(dir.path());
        cache.store(CacheArea::Providers, "alpha", &Entry { name: "alpha".into() }).await;
        cache.store(CacheArea::Providers, "beta/../x", &Entry { name: "beta".into() }).await;

        let mut loaded: Vec<Entry> = cache.load_all(CacheArea::Providers).await;
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].name, "alpha");

        cache.remove(CacheArea::Providers, "alpha").await;
        let loaded: Vec<Entry> = cache.load_all(CacheArea::Providers).await;
        assert_eq!(loaded, vec![Entry { name: "beta".into() }]);
        assert!(cache.load_all::<Entry>(CacheArea::Sessions).await.is_empty());
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StateCache::new(dir.path());
        std::fs::create_dir_all(dir.path().join("sessions")).unwrap();
        std::fs::write(dir.path().join("sessions").join("bad.json"), "{not json").unwrap();
        assert!(cache.load_all::<Entry>(CacheArea::Sessions).await.is_empty());
    }
}
