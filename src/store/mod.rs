//! JSON-file-backed persisted state (§6 "Persisted state layout").
//!
//! Each store is read-copy-update: a write serializes the whole table under
//! the writer's lock; readers take a brief read lock and operate on a clone
//! (§5 "Shared-resource policy").

pub mod folders;
pub mod registries;
pub mod users;

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;

use crate::Result;

/// A single JSON array persisted at `path`, guarded by a read-copy-update lock.
pub struct JsonStore<T> {
    path: PathBuf,
    items: RwLock<Vec<T>>,
}

impl<T> JsonStore<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = Self::load(&path).await?;
        Ok(Self {
            path,
            items: RwLock::new(items),
        })
    }

    async fn load(path: &Path) -> Result<Vec<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Snapshot of the current table.
    pub async fn all(&self) -> Vec<T> {
        self.items.read().await.clone()
    }

    /// Replace the whole table and persist it to disk.
    pub async fn replace(&self, items: Vec<T>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&items)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        *self.items.write().await = items;
        Ok(())
    }

    /// Mutate the table under the write lock, then persist the result.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<T>) -> Result<()>,
    {
        let mut guard = self.items.write().await;
        let mut items = guard.clone();
        f(&mut items)?;
        let bytes = serde_json::to_vec_pretty(&items)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        *guard = items;
        Ok(())
    }
}
