//! `{data_dir}/external_registries.json`.

use uuid::Uuid;

use crate::model::ExternalRegistry;
use crate::store::JsonStore;
use crate::{Error, Result};

pub struct RegistryStore {
    inner: JsonStore<ExternalRegistry>,
}

impl RegistryStore {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(Self {
            inner: JsonStore::open(path).await?,
        })
    }

    /// All registries, passwords redacted — safe to serve from an admin endpoint.
    pub async fn all_redacted(&self) -> Vec<ExternalRegistry> {
        self.inner.all().await.iter().map(ExternalRegistry::redacted).collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<ExternalRegistry> {
        self.inner.all().await.into_iter().find(|r| r.id == id)
    }

    pub async fn create(&self, registry: ExternalRegistry) -> Result<ExternalRegistry> {
        let result = registry.redacted();
        let name = registry.name.clone();
        self.inner
            .update(move |items| {
                if items.iter().any(|r| r.name == name) {
                    return Err(Error::Conflict(format!("registry {name:?} already exists")));
                }
                items.push(registry);
                Ok(())
            })
            .await?;
        Ok(result)
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner
            .update(move |items| {
                let before = items.len();
                items.retain(|r| r.id != id);
                if items.len() == before {
                    return Err(Error::NotFound(format!("registry {id}")));
                }
                Ok(())
            })
            .await
    }
}
