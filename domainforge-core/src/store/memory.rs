//! In-memory credential storage implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{CredentialStore, StoreError};
use crate::model::DomainName;
use crate::token::Credential;

/// In-memory credential store for testing and development.
///
/// This store is not persistent; data is lost when the process exits.
#[derive(Default)]
pub struct MemoryCredentialStore {
    data: RwLock<BTreeMap<DomainName, Credential>>,
}

impl MemoryCredentialStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory store with initial records.
    pub fn with_credentials(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let data = credentials
            .into_iter()
            .map(|c| (c.domain.clone(), c))
            .collect();
        Self {
            data: RwLock::new(data),
        }
    }
}

impl std::fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("domains", &self.data.read().len())
            .finish()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, domain: &DomainName) -> Result<Credential, StoreError> {
        self.data
            .read()
            .get(domain)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                domain: domain.clone(),
            })
    }

    async fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        self.data
            .write()
            .insert(credential.domain.clone(), credential.clone());
        Ok(())
    }

    async fn delete(&self, domain: &DomainName) -> Result<(), StoreError> {
        self.data.write().remove(domain);
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainName>, StoreError> {
        Ok(self.data.read().keys().cloned().collect())
    }
}
