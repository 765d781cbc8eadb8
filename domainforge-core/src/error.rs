//! Top-level error types for Domainforge.

use thiserror::Error;

use crate::client_secrets::ClientSecretsError;
use crate::model::{DomainName, ModelError};
use crate::registry::RegistryError;
use crate::session::SessionError;
use crate::settings::SettingsError;
use crate::store::StoreError;
use crate::token::AuthError;

/// Top-level error type encompassing all Domainforge errors.
#[derive(Debug, Error)]
pub enum DomainforgeError {
    /// Error from credential storage operations.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error from authentication or token refresh.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Error from the domain registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Error building a session.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Error loading settings.
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    /// Error loading the OAuth client secrets.
    #[error("client secrets error: {0}")]
    ClientSecrets(#[from] ClientSecretsError),

    /// Invalid domain name or scope.
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl DomainforgeError {
    /// The domain this error refers to, if any.
    ///
    /// Lets a batch over many domains report which one failed.
    pub fn domain(&self) -> Option<&DomainName> {
        match self {
            Self::Store(e) => e.domain(),
            Self::Auth(e) => e.domain(),
            Self::Registry(e) => e.domain(),
            Self::Session(e) => e.domain(),
            Self::Settings(_) | Self::ClientSecrets(_) | Self::Model(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_is_exposed_through_layers() {
        let domain = DomainName::parse("example.com").unwrap();
        let err: DomainforgeError = SessionError::from(AuthError::from(StoreError::NotFound {
            domain: domain.clone(),
        }))
        .into();

        assert_eq!(err.domain(), Some(&domain));
        assert!(err.to_string().contains("example.com"));
    }

    #[test]
    fn test_registry_errors_without_domain() {
        let err: DomainforgeError = RegistryError::NoDomainAvailable.into();
        assert!(err.domain().is_none());
    }
}
