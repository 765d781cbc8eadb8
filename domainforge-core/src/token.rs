//! Credentials and the token authenticator seam.
//!
//! This module provides:
//! - [`Credential`] - Persisted token material for one domain
//! - [`TokenKind`] - Whether a credential came from user consent or a service account
//! - [`AuthError`] - Error type for authentication and refresh
//! - [`TokenAuthenticator`] - Trait for the network-facing token flows
//! - [`RefreshGrant`] - What a refresh is allowed to use

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client_secrets::ClientSecretBundle;
use crate::model::{DomainName, ScopeSet};
use crate::oauth::service_account::ServiceAccountKey;
use crate::store::{Secret, StoreError};

/// Error type for authentication, refresh and revocation.
///
/// Every variant that concerns a domain carries it, so a batch over many
/// domains can report which one failed.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The user declined consent.
    #[error("authorization denied for {domain}")]
    AuthDenied { domain: DomainName },

    /// The directory administrator has not granted impersonation.
    #[error("delegation to {subject} denied for {domain}: {message}")]
    DelegationDenied {
        domain: DomainName,
        subject: String,
        message: String,
    },

    /// The service-account key could not be loaded or was rejected.
    #[error("invalid service-account key for {domain}: {message}")]
    InvalidKey { domain: DomainName, message: String },

    /// A requested scope is malformed or was rejected by the provider.
    #[error("invalid scope '{scope}' for {domain}")]
    InvalidScope { domain: DomainName, scope: String },

    /// The stored credential lacks scopes and cannot be upgraded silently.
    #[error("credential for {domain} is missing scopes: {}", .missing.join(" "))]
    ScopeNotGranted {
        domain: DomainName,
        missing: Vec<String>,
    },

    /// The refresh token was revoked; interactive authentication is required.
    #[error("re-authentication required for {domain}")]
    ReauthRequired { domain: DomainName },

    /// The consent wait exceeded its bound.
    #[error("timed out after {seconds}s waiting for consent for {domain}")]
    AuthTimeout { domain: DomainName, seconds: u64 },

    /// Transport failure during a token exchange.
    #[error("network error for {domain}: {message}")]
    Network { domain: DomainName, message: String },

    /// The provider answered with something the protocol does not allow.
    #[error("OAuth flow failed for {domain}: {message}")]
    OAuth { domain: DomainName, message: String },

    /// A user-flow operation needs a client-secret bundle that was not configured.
    #[error("no OAuth client secrets configured (needed for {domain})")]
    ClientSecretsMissing { domain: DomainName },

    /// Impersonation needs a service account that is not configured.
    #[error("no service account configured for {domain}")]
    ServiceAccountNotConfigured { domain: DomainName },

    /// Storage error while reading or writing the credential.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl AuthError {
    /// The domain this error refers to, if any.
    pub fn domain(&self) -> Option<&DomainName> {
        match self {
            Self::AuthDenied { domain }
            | Self::DelegationDenied { domain, .. }
            | Self::InvalidKey { domain, .. }
            | Self::InvalidScope { domain, .. }
            | Self::ScopeNotGranted { domain, .. }
            | Self::ReauthRequired { domain }
            | Self::AuthTimeout { domain, .. }
            | Self::Network { domain, .. }
            | Self::OAuth { domain, .. }
            | Self::ClientSecretsMissing { domain }
            | Self::ServiceAccountNotConfigured { domain } => Some(domain),
            Self::Storage(e) => e.domain(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Origin of a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Obtained through the authorization-code (user consent) flow.
    User,

    /// Obtained by exchanging a signed service-account assertion.
    ServiceAccount,
}

/// Token material proving authorization to act on a domain's behalf.
///
/// This is also the persisted record format; field order is part of the
/// binary encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Domain this credential belongs to.
    pub domain: DomainName,

    pub kind: TokenKind,

    pub access_token: Secret,

    /// Present for user credentials only; service accounts re-sign instead.
    pub refresh_token: Option<Secret>,

    /// Absolute expiry of the access token.
    pub expires_at: DateTime<Utc>,

    /// Scopes granted to the access token.
    pub scopes: ScopeSet,

    /// Service-account email that signed the assertion.
    pub signer: Option<String>,

    /// User impersonated under domain-wide delegation.
    pub subject: Option<String>,
}

impl Credential {
    /// Create a user-consent credential.
    pub fn user(
        domain: DomainName,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
        scopes: ScopeSet,
    ) -> Self {
        Self {
            domain,
            kind: TokenKind::User,
            access_token: Secret::new(access_token),
            refresh_token: refresh_token.map(Secret::new),
            expires_at,
            scopes,
            signer: None,
            subject: None,
        }
    }

    /// Create a service-account credential.
    pub fn service_account(
        domain: DomainName,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
        scopes: ScopeSet,
        signer: impl Into<String>,
        subject: Option<String>,
    ) -> Self {
        Self {
            domain,
            kind: TokenKind::ServiceAccount,
            access_token: Secret::new(access_token),
            refresh_token: None,
            expires_at,
            scopes,
            signer: Some(signer.into()),
            subject,
        }
    }

    /// Whether the access token expires within `margin` from now.
    ///
    /// A token expiring exactly at the margin boundary counts as expired.
    pub fn is_expired(&self, margin: Duration) -> bool {
        self.expires_at <= Utc::now() + margin
    }

    /// Whether the granted scopes cover `requested`.
    pub fn covers(&self, requested: &ScopeSet) -> bool {
        self.scopes.is_superset(requested)
    }

    /// Whether this credential acts as `subject` (or as itself when `None`).
    pub fn acts_as(&self, subject: Option<&str>) -> bool {
        match (subject, self.subject.as_deref()) {
            (None, _) => true,
            (Some(wanted), Some(current)) => wanted.eq_ignore_ascii_case(current),
            (Some(_), None) => false,
        }
    }
}

/// What a refresh may use to obtain a new access token.
#[derive(Debug, Clone, Copy)]
pub enum RefreshGrant<'a> {
    /// Exchange the stored refresh token using the OAuth client.
    RefreshToken(&'a ClientSecretBundle),

    /// Sign a new assertion with the service-account key.
    Assertion(&'a ServiceAccountKey),
}

/// Network-facing token flows.
///
/// Implementations perform exactly one flow per call and never touch the
/// credential store; persistence and locking live in
/// [`CredentialManager`](crate::token_manager::CredentialManager).
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    /// Run the user-consent flow and return the resulting credential.
    async fn authorize_user(
        &self,
        domain: &DomainName,
        client: &ClientSecretBundle,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError>;

    /// Exchange a signed service-account assertion for an access token.
    async fn authorize_service_account(
        &self,
        domain: &DomainName,
        key: &ServiceAccountKey,
        subject: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError>;

    /// Obtain a new access token without user interaction.
    async fn refresh(
        &self,
        credential: &Credential,
        grant: RefreshGrant<'_>,
    ) -> Result<Credential, AuthError>;

    /// Revoke the credential with the provider, if supported.
    async fn revoke(
        &self,
        _credential: &Credential,
        _client: Option<&ClientSecretBundle>,
    ) -> Result<(), AuthError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_in: Duration) -> Credential {
        Credential::user(
            DomainName::parse("example.com").unwrap(),
            "token",
            None,
            Utc::now() + expires_in,
            ScopeSet::parse(["a", "b"]).unwrap(),
        )
    }

    #[test]
    fn test_credential_is_expired() {
        assert!(credential(Duration::hours(-1)).is_expired(Duration::zero()));
        assert!(!credential(Duration::hours(1)).is_expired(Duration::zero()));
    }

    #[test]
    fn test_credential_expiry_margin() {
        let c = credential(Duration::minutes(3));
        assert!(c.is_expired(Duration::minutes(5)));
        assert!(!c.is_expired(Duration::minutes(1)));
    }

    #[test]
    fn test_credential_covers() {
        let c = credential(Duration::hours(1));
        assert!(c.covers(&ScopeSet::parse(["a"]).unwrap()));
        assert!(!c.covers(&ScopeSet::parse(["a", "c"]).unwrap()));
    }

    #[test]
    fn test_credential_acts_as() {
        let mut c = credential(Duration::hours(1));
        assert!(c.acts_as(None));
        assert!(!c.acts_as(Some("admin@example.com")));

        c.subject = Some("admin@example.com".to_string());
        assert!(c.acts_as(Some("Admin@Example.com")));
        assert!(!c.acts_as(Some("other@example.com")));
    }

    #[test]
    fn test_auth_error_carries_domain() {
        let domain = DomainName::parse("example.com").unwrap();
        let err = AuthError::ReauthRequired {
            domain: domain.clone(),
        };
        assert_eq!(err.domain(), Some(&domain));
        assert!(err.to_string().contains("example.com"));
        assert!(!err.is_transient());
    }
}
