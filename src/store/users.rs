//! `{data_dir}/local_users.json`.

use uuid::Uuid;

use crate::model::User;
use crate::store::JsonStore;
use crate::{Error, Result};

pub struct UserStore {
    inner: JsonStore<User>,
}

impl UserStore {
    pub async fn open(path: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(Self {
            inner: JsonStore::open(path).await?,
        })
    }

    pub async fn all(&self) -> Vec<User> {
        self.inner.all().await
    }

    pub async fn find_by_username(&self, username: &str) -> Option<User> {
        self.inner.all().await.into_iter().find(|u| u.username == username)
    }

    pub async fn create(&self, user: User) -> Result<()> {
        let username = user.username.clone();
        self.inner
            .update(move |items| {
                if items.iter().any(|u| u.username == username) {
                    return Err(Error::Conflict(format!("user {username:?} already exists")));
                }
                items.push(user);
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.inner
            .update(move |items| {
                let before = items.len();
                items.retain(|u| u.id != id);
                if items.len() == before {
                    return Err(Error::NotFound(format!("user {id}")));
                }
                Ok(())
            })
            .await
    }
}
