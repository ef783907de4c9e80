//! Disk persistence for cache entries.
//!
//! Layout: `<root>/namespaces/<ns>/<keyHash>.json`. Writes go to a `.tmp`
//! sibling, fsync, then rename so a crashed flush never leaves a torn file.
//! Corrupt files found during load are renamed to `.corrupt` and skipped.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use super::CachedValue;

/// Serialized form of one cache entry on disk.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DiskEntry {
    pub namespace: String,
    pub key_hash: String,
    pub value: CachedValue,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub stale_until_ms: i64,
    pub size: u64,
}

/// Filesystem store rooted at a cache directory.
#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join("namespaces").join(sanitize_component(namespace))
    }

    fn entry_path(&self, namespace: &str, key_hash: &str) -> PathBuf {
        self.namespace_dir(namespace).join(format!("{key_hash}.json"))
    }

    /// Persist a single entry atomically.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure; callers log and retry on interval.
    pub async fn write_entry(&self, entry: &DiskEntry) -> std::io::Result<()> {
        let dir = self.namespace_dir(&entry.namespace);
        tokio::fs::create_dir_all(&dir).await?;

        let path = self.entry_path(&entry.namespace, &entry.key_hash);
        let tmp = path.with_extension("tmp");

        let encoded = serde_json::to_vec(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Remove a single entry file, ignoring missing files.
    pub async fn remove_entry(&self, namespace: &str, key_hash: &str) {
        let path = self.entry_path(namespace, key_hash);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache file");
            }
        }
    }

    /// Remove an entire namespace directory.
    pub async fn remove_namespace(&self, namespace: &str) {
        let dir = self.namespace_dir(namespace);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove cache namespace");
            }
        }
    }

    /// Load all persisted entries. Corrupt files are quarantined, expired
    /// entries (relative to `now_ms`) are deleted.
    pub async fn load_all(&self, now_ms: i64) -> Vec<DiskEntry> {
        let namespaces_dir = self.root.join("namespaces");
        let mut entries = Vec::new();

        let Ok(mut namespaces) = tokio::fs::read_dir(&namespaces_dir).await else {
            return entries;
        };

        while let Ok(Some(ns_dir)) = namespaces.next_entry().await {
            let Ok(mut files) = tokio::fs::read_dir(ns_dir.path()).await else {
                continue;
            };
            while let Ok(Some(file)) = files.next_entry().await {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match read_entry(&path).await {
                    Ok(entry) if entry.expires_at_ms > now_ms => entries.push(entry),
                    Ok(_) => {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Quarantining corrupt cache file");
                        let _ = tokio::fs::rename(&path, path.with_extension("corrupt")).await;
                    }
                }
            }
        }

        entries
    }
}

async fn read_entry(path: &Path) -> anyhow::Result<DiskEntry> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Namespace names come from tool names, but defend the path join anyway.
fn sanitize_component(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' }).collect()
}
