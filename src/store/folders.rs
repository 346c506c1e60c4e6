//! `{data_dir}/folders.json`.

use uuid::Uuid;

use crate::model::{Folder, FolderPermission};
use crate::store::JsonStore;
use crate::{Error, Result};

pub struct FolderStore {
    inner: JsonStore<Folder>,
}

/// A single path segment: lowercase, no `/`, no whitespace.
fn valid_folder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl FolderStore {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(Self {
            inner: JsonStore::open(path).await?,
        })
    }

    pub async fn all(&self) -> Vec<Folder> {
        self.inner.all().await
    }

    /// The folder matching `path` by its first segment, if any.
    pub async fn matching(&self, image_path: &str) -> Option<Folder> {
        let first = image_path.split('/').next()?;
        self.inner.all().await.into_iter().find(|f| f.name == first)
    }

    pub async fn create(&self, name: String, description: String) -> Result<Folder> {
        if !valid_folder_name(&name) {
            return Err(Error::Validation(format!(
                "folder name {name:?} must be a single lowercase path segment"
            )));
        }
        let folder = Folder {
            id: Uuid::new_v4(),
            name: name.clone(),
            description,
            created_at: chrono::Utc::now(),
            permissions: Vec::new(),
        };
        let to_insert = folder.clone();
        self.inner
            .update(move |items| {
                if items.iter().any(|f| f.name == name) {
                    return Err(Error::Conflict(format!("folder {name:?} already exists")));
                }
                items.push(to_insert);
                Ok(())
            })
            .await?;
        Ok(folder)
    }

    pub async fn set_permission(&self, folder_id: Uuid, perm: FolderPermission) -> Result<()> {
        self.inner
            .update(move |items| {
                let folder = items
                    .iter_mut()
                    .find(|f| f.id == folder_id)
                    .ok_or_else(|| Error::NotFound(format!("folder {folder_id}")))?;
                if let Some(existing) = folder.permissions.iter_mut().find(|p| p.username == perm.username) {
                    *existing = perm;
                } else {
                    folder.permissions.push(perm);
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_picks_the_first_path_segment() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderStore::open(dir.path().join("folders.json")).await.unwrap();
        store.create("production".to_string(), "prod images".to_string()).await.unwrap();

        let found = store.matching("production/web/manifests/v1").await;
        assert!(found.is_some());
        assert!(store.matching("staging/web").await.is_none());
    }

    #[tokio::test]
    async fn rejects_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FolderStore::open(dir.path().join("folders.json")).await.unwrap();
        assert!(store.create("Has/Slash".to_string(), String::new()).await.is_err());
        assert!(store.create("has space".to_string(), String::new()).await.is_err());
    }
}
