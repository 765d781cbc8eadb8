//! Credential storage abstraction.
//!
//! This module provides:
//! - [`Secret`] - A wrapper for sensitive values that prevents accidental logging
//! - [`CredentialStore`] - Trait for per-domain credential persistence
//! - [`FileCredentialStore`] - One record file per domain under the storage root
//! - [`MemoryCredentialStore`] - In-memory implementation for testing
//! - [`RecordCodec`] - Strategy for the on-disk record encoding
//! - [`create_store`] - Helper to build the store selected by [`Settings`]
//!
//! # Storage Layout
//!
//! Records live at `{storage_root}/credentials/{domain}.{ext}` where `ext`
//! depends on the active codec (`json` or `bin`). Operations on one domain
//! never touch another domain's file.
//!
//! # Example
//!
//! ```rust,ignore
//! use domainforge_core::store::{CredentialStore, MemoryCredentialStore};
//!
//! let store = MemoryCredentialStore::new();
//! store.save(&credential).await?;
//! let loaded = store.load(&credential.domain).await?;
//! assert_eq!(loaded, credential);
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod codec;
mod file;
mod memory;

pub use codec::{BincodeCodec, JsonCodec, RecordCodec};
pub use file::FileCredentialStore;
pub use memory::MemoryCredentialStore;

use crate::model::DomainName;
use crate::settings::Settings;
use crate::token::Credential;

/// A secret value that prevents accidental exposure in logs.
///
/// The inner value is only accessible via [`expose()`](Secret::expose).
/// Debug and Display implementations show `[REDACTED]` instead of the value,
/// and the memory is zeroed when the secret is dropped.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    /// Create a new secret from a string value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    ///
    /// Use sparingly and never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the secret and return the inner value.
    pub fn into_inner(mut self) -> String {
        std::mem::take(&mut self.0)
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

impl std::fmt::Display for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for Secret {}

/// Error type for credential store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the domain.
    #[error("no stored credential for {domain}")]
    NotFound { domain: DomainName },

    /// The stored record exists but cannot be decoded.
    #[error("stored credential for {domain} is corrupt: {message}")]
    Corrupt { domain: DomainName, message: String },

    /// Reading or writing the record failed.
    #[error("I/O error on credential for {domain}: {source}")]
    Io {
        domain: DomainName,
        #[source]
        source: std::io::Error,
    },

    /// The record could not be encoded.
    #[error("failed to encode credential for {domain}: {message}")]
    Encode { domain: DomainName, message: String },

    /// Listing the storage directory failed.
    #[error("failed to list stored credentials: {0}")]
    List(#[source] std::io::Error),
}

impl StoreError {
    /// The domain this error refers to, if any.
    pub fn domain(&self) -> Option<&DomainName> {
        match self {
            Self::NotFound { domain }
            | Self::Corrupt { domain, .. }
            | Self::Io { domain, .. }
            | Self::Encode { domain, .. } => Some(domain),
            Self::List(_) => None,
        }
    }
}

/// Durable per-domain credential persistence.
///
/// Implementations must replace records atomically so a concurrent reader
/// never observes a partially written record.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Load the credential for a domain.
    ///
    /// Fails with [`StoreError::NotFound`] if no record exists and
    /// [`StoreError::Corrupt`] if it cannot be decoded.
    async fn load(&self, domain: &DomainName) -> Result<Credential, StoreError>;

    /// Write or overwrite the record for `credential.domain`.
    async fn save(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Remove a domain's record.
    ///
    /// Returns `Ok(())` even if no record existed.
    async fn delete(&self, domain: &DomainName) -> Result<(), StoreError>;

    /// List domains with a stored record, sorted lexicographically.
    async fn list_domains(&self) -> Result<Vec<DomainName>, StoreError>;

    /// Check if a record exists without decoding it.
    async fn exists(&self, domain: &DomainName) -> Result<bool, StoreError> {
        match self.load(domain).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Create the file-backed store selected by the settings.
///
/// The codec follows `settings.encoding`; every record written by this store
/// uses the same encoding.
pub fn create_store(settings: &Settings) -> Arc<dyn CredentialStore> {
    let codec = settings.encoding.codec();
    tracing::debug!(
        "Using {} credential records under {:?}",
        codec.extension(),
        settings.storage_root
    );
    Arc::new(FileCredentialStore::new(settings.storage_root.clone(), codec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("super-secret");
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_secret_display_redacted() {
        let secret = Secret::new("super-secret");
        let display = format!("{}", secret);
        assert!(!display.contains("super-secret"));
        assert!(display.contains("REDACTED"));
    }

    #[test]
    fn test_secret_into_inner() {
        let secret = Secret::new("value");
        assert_eq!(secret.into_inner(), "value");
    }

    #[tokio::test]
    async fn test_create_store_uses_settings_encoding() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::with_root(temp.path().to_path_buf());
        settings.encoding = crate::settings::RecordEncoding::Binary;

        let store = create_store(&settings);
        let credential = crate::token::Credential::user(
            DomainName::parse("example.com").unwrap(),
            "access",
            Some("refresh".to_string()),
            chrono::Utc::now() + chrono::Duration::hours(1),
            crate::model::ScopeSet::parse(["scope.a"]).unwrap(),
        );
        store.save(&credential).await.unwrap();

        assert!(temp.path().join("credentials/example.com.bin").exists());
    }
}
