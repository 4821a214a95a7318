//! Superuser password cache
//!
//! The password is read from the Secret named in `spec.passwordSecret` once
//! per VerticaDB and kept until the VerticaDB is deleted.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::controller::meta::NamespacedName;
use crate::controller::objects::ObjectStore;
use crate::crd::VerticaDB;
use crate::error::{Error, Result};

/// Key in the password Secret holding the superuser password
pub const PASSWORD_SECRET_KEY: &str = "password";

#[derive(Clone, Default)]
pub struct PasswordManager {
    cache: Arc<RwLock<HashMap<NamespacedName, String>>>,
}

impl PasswordManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, vdb: &NamespacedName) -> Option<String> {
        self.cache.read().await.get(vdb).cloned()
    }

    pub async fn set(&self, vdb: &NamespacedName, password: impl Into<String>) {
        self.cache.write().await.insert(vdb.clone(), password.into());
    }

    pub async fn delete(&self, vdb: &NamespacedName) {
        self.cache.write().await.remove(vdb);
    }

    /// Cached password, or the one read from the VerticaDB's Secret. A
    /// VerticaDB without a password Secret, or a Secret without the
    /// `password` key, has an empty password.
    pub async fn resolve(&self, store: &dyn ObjectStore, vdb: &VerticaDB) -> Result<String> {
        let name = NamespacedName::of(vdb);
        if let Some(pw) = self.get(&name).await {
            return Ok(pw);
        }

        let password = if vdb.spec.password_secret.is_empty() {
            String::new()
        } else {
            let secret_nm = NamespacedName::new(name.namespace.clone(), vdb.spec.password_secret.clone());
            let secret = store
                .get_secret(&secret_nm)
                .await?
                .ok_or_else(|| Error::NotFound(format!("password secret {secret_nm}")))?;
            match secret.data.as_ref().and_then(|d| d.get(PASSWORD_SECRET_KEY)) {
                Some(bytes) => String::from_utf8(bytes.0.clone()).map_err(|_| {
                    Error::ConfigError(format!(
                        "key {PASSWORD_SECRET_KEY} in secret {secret_nm} is not valid UTF-8"
                    ))
                })?,
                None => String::new(),
            }
        };

        debug!(vdb = %name, "Cached superuser password");
        self.set(&name, password.clone()).await;
        Ok(password)
    }
}
