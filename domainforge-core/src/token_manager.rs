//! Credential lifecycle orchestration.
//!
//! This module provides [`CredentialManager`], which combines the
//! [`CredentialStore`], the [`TokenAuthenticator`] and the
//! [`DomainRegistry`] to authenticate domains, keep their tokens fresh and
//! revoke them.
//!
//! # Features
//!
//! - Automatic refresh when a token is within the expiry buffer
//! - At most one refresh in flight per domain; concurrent callers reuse it
//! - One retry after a short backoff on network errors
//! - Scope upgrades (re-signing for service accounts, consent for users)
//! - In-memory delegated credentials for impersonating arbitrary users
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use domainforge_core::{
//!     CredentialManager, DomainName, DomainRegistry, MemoryCredentialStore,
//!     OAuthAuthenticator, ScopeSet,
//! };
//!
//! let store = Arc::new(MemoryCredentialStore::new());
//! let registry = Arc::new(DomainRegistry::load("domains.json".into(), store.clone())?);
//! let manager = CredentialManager::new(store, Arc::new(OAuthAuthenticator::new()), registry);
//!
//! let domain = DomainName::parse("example.com")?;
//! let scopes = ScopeSet::parse(["https://www.googleapis.com/auth/admin.directory.user"])?;
//! let credential = manager.ensure_credential(&domain, &scopes, None).await?;
//! println!("Token expires at {}", credential.expires_at);
//! # Ok(())
//! # }
//! ```

use chrono::Duration;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::client_secrets::ClientSecretBundle;
use crate::model::{DomainName, ScopeSet};
use crate::oauth::service_account::{ServiceAccountKey, check_delegation};
use crate::registry::{DomainRegistry, RegistryError};
use crate::store::{CredentialStore, StoreError};
use crate::token::{AuthError, Credential, RefreshGrant, TokenAuthenticator, TokenKind};

/// Default expiry buffer in minutes.
///
/// Tokens are considered expired if they expire within this many minutes.
const DEFAULT_EXPIRY_BUFFER_MINUTES: i64 = 5;

/// Delay before the single retry of a network failure.
const DEFAULT_RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(500);

type DomainLock = Arc<tokio::sync::Mutex<()>>;

/// Orchestrates authentication, refresh and revocation per domain.
///
/// All state changes for one domain happen under that domain's async lock:
/// read the record, talk to the provider, write the record. Different
/// domains never contend.
pub struct CredentialManager {
    store: Arc<dyn CredentialStore>,
    authenticator: Arc<dyn TokenAuthenticator>,
    registry: Arc<DomainRegistry>,
    client_secrets: Option<ClientSecretBundle>,
    expiry_buffer: Duration,
    interactive: bool,
    retry_backoff: std::time::Duration,
    locks: Mutex<HashMap<DomainName, DomainLock>>,
    generations: Mutex<HashMap<DomainName, u64>>,
    delegated: Mutex<HashMap<(DomainName, String), Credential>>,
}

impl CredentialManager {
    /// Create a manager with the default five-minute expiry buffer.
    ///
    /// Interactive fallback is disabled until client secrets are supplied
    /// and [`with_interactive`](Self::with_interactive) enables it.
    pub fn new(
        store: Arc<dyn CredentialStore>,
        authenticator: Arc<dyn TokenAuthenticator>,
        registry: Arc<DomainRegistry>,
    ) -> Self {
        Self {
            store,
            authenticator,
            registry,
            client_secrets: None,
            expiry_buffer: Duration::minutes(DEFAULT_EXPIRY_BUFFER_MINUTES),
            interactive: false,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            locks: Mutex::new(HashMap::new()),
            generations: Mutex::new(HashMap::new()),
            delegated: Mutex::new(HashMap::new()),
        }
    }

    /// OAuth client used for consent and user-token refresh.
    pub fn with_client_secrets(mut self, client: Option<ClientSecretBundle>) -> Self {
        self.client_secrets = client;
        self
    }

    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Self {
        self.expiry_buffer = buffer;
        self
    }

    /// Allow falling back to the consent flow when a silent path fails.
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: std::time::Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn expiry_buffer(&self) -> Duration {
        self.expiry_buffer
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Counter bumped whenever `domain`'s stored credential changes.
    pub fn generation(&self, domain: &DomainName) -> u64 {
        self.generations.lock().get(domain).copied().unwrap_or(0)
    }

    /// Run the consent flow for `domain`.
    ///
    /// A stored user credential that is fresh and already covers `scopes` is
    /// returned unchanged. Otherwise consent is requested for `scopes` plus
    /// whatever the stored credential already had.
    pub async fn authenticate_interactive(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        let wanted = match self.load_stored(domain).await {
            Ok(Some(existing)) if existing.kind == TokenKind::User => {
                if existing.covers(scopes) && !existing.is_expired(self.expiry_buffer) {
                    tracing::debug!("Stored credential for {} already covers the request", domain);
                    return Ok(existing);
                }
                existing.scopes.union(scopes)
            }
            Ok(_) => scopes.clone(),
            Err(AuthError::Storage(StoreError::Corrupt { message, .. })) => {
                tracing::warn!(
                    "Replacing unreadable credential for {} after consent: {}",
                    domain,
                    message
                );
                scopes.clone()
            }
            Err(e) => return Err(e),
        };

        let credential = self.consent(domain, &wanted).await?;
        self.persist(&credential).await?;
        tracing::info!("Authenticated {} interactively", domain);
        Ok(credential)
    }

    /// Authenticate `domain` with a service-account key, optionally
    /// impersonating `subject`.
    ///
    /// Delegation is checked before any network call; nothing is written on
    /// failure.
    pub async fn authenticate_service_account(
        &self,
        domain: &DomainName,
        key: &ServiceAccountKey,
        subject: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        check_delegation(domain, key, subject)?;

        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        let credential = self
            .retry_once(domain, || {
                self.authenticator
                    .authorize_service_account(domain, key, subject, scopes)
            })
            .await?;
        self.persist(&credential).await?;
        tracing::info!("Authenticated {} with service account {}", domain, key.email());
        Ok(credential)
    }

    /// Refresh `credential` without user interaction.
    ///
    /// If another caller refreshed the domain while this one waited for the
    /// lock, the already refreshed credential is returned and no request is
    /// made.
    pub async fn refresh(&self, credential: &Credential) -> Result<Credential, AuthError> {
        let domain = &credential.domain;
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        let stored = self
            .load_stored(domain)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                domain: domain.clone(),
            })?;

        if !stored.is_expired(self.expiry_buffer)
            && stored.covers(&credential.scopes)
            && stored.acts_as(credential.subject.as_deref())
        {
            tracing::debug!("Credential for {} was already refreshed", domain);
            return Ok(stored);
        }

        let refreshed = self.renew(&stored).await?;
        self.persist(&refreshed).await?;
        Ok(refreshed)
    }

    /// Return a credential for `domain` that is fresh and covers `scopes`,
    /// acting as `subject` when given.
    ///
    /// Resolution order:
    /// 1. a different `subject` than the stored one mints an in-memory
    ///    delegated credential from the domain's service account
    /// 2. no record: the domain's service account, else consent when
    ///    interactive
    /// 3. missing scopes: re-sign (service account) or consent (user)
    /// 4. expired: refresh, falling back once to consent when the refresh
    ///    token was revoked
    pub async fn ensure_credential(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
        subject: Option<&str>,
    ) -> Result<Credential, AuthError> {
        Ok(self.ensure_versioned(domain, scopes, subject).await?.0)
    }

    /// Like [`ensure_credential`](Self::ensure_credential), also returning
    /// the domain's generation as observed under the domain lock.
    pub async fn ensure_versioned(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
        subject: Option<&str>,
    ) -> Result<(Credential, u64), AuthError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        let credential = self.ensure_locked(domain, scopes, subject).await?;
        Ok((credential, self.generation(domain)))
    }

    async fn ensure_locked(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
        subject: Option<&str>,
    ) -> Result<Credential, AuthError> {
        let stored = self.load_stored(domain).await?;

        if let Some(subject) = subject {
            if !stored.as_ref().is_some_and(|c| c.acts_as(Some(subject))) {
                return self.delegated_credential(domain, subject, scopes).await;
            }
        }

        let Some(stored) = stored else {
            return self.first_authentication(domain, scopes).await;
        };

        let fresh = !stored.is_expired(self.expiry_buffer);
        if fresh && stored.covers(scopes) {
            tracing::debug!("Using stored credential for {}", domain);
            return Ok(stored);
        }

        let credential = if !stored.covers(scopes) {
            self.upgrade_scopes(&stored, scopes).await?
        } else {
            tracing::info!("Access token for {} expired, refreshing", domain);
            match self.renew(&stored).await {
                Err(AuthError::ReauthRequired { .. })
                    if self.interactive && self.client_secrets.is_some() =>
                {
                    tracing::warn!(
                        "Refresh token for {} was revoked; falling back to consent",
                        domain
                    );
                    self.consent(domain, &stored.scopes.union(scopes)).await?
                }
                other => other?,
            }
        };

        self.persist(&credential).await?;
        Ok(credential)
    }

    /// Revoke `domain`'s credential with the provider and delete the record.
    ///
    /// Revocation is best effort; the record is deleted even when the
    /// provider cannot be reached.
    pub async fn revoke(&self, domain: &DomainName) -> Result<(), AuthError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        match self.load_stored(domain).await {
            Ok(Some(credential)) => {
                if let Err(e) = self
                    .authenticator
                    .revoke(&credential, self.client_secrets.as_ref())
                    .await
                {
                    tracing::warn!("Failed to revoke token for {}: {}", domain, e);
                }
            }
            Ok(None) => {}
            Err(AuthError::Storage(StoreError::Corrupt { message, .. })) => {
                tracing::warn!("Deleting unreadable credential for {}: {}", domain, message);
            }
            Err(e) => return Err(e),
        }

        self.store.delete(domain).await?;
        self.forget(domain);
        tracing::info!("Signed out of {}", domain);
        Ok(())
    }

    /// Forget `domain` entirely: its record, service account and default
    /// flag.
    ///
    /// Runs under the domain lock, so a refresh already in flight finishes
    /// writing before the record is deleted and cannot bring it back.
    pub async fn remove(&self, domain: &DomainName) -> Result<(), RegistryError> {
        let lock = self.domain_lock(domain);
        let _guard = lock.lock().await;

        self.registry.remove_domain(domain).await?;
        self.forget(domain);
        Ok(())
    }

    /// Mark `domain`'s cached state stale without touching the store.
    pub fn forget(&self, domain: &DomainName) {
        *self.generations.lock().entry(domain.clone()).or_insert(0) += 1;
        self.delegated.lock().retain(|(d, _), _| d != domain);
    }

    fn domain_lock(&self, domain: &DomainName) -> DomainLock {
        self.locks.lock().entry(domain.clone()).or_default().clone()
    }

    async fn load_stored(&self, domain: &DomainName) -> Result<Option<Credential>, AuthError> {
        match self.store.load(domain).await {
            Ok(credential) => Ok(Some(credential)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Save a credential, invalidate cached state and adopt it as the
    /// default when there is none.
    async fn persist(&self, credential: &Credential) -> Result<(), AuthError> {
        self.store.save(credential).await?;
        self.forget(&credential.domain);
        if let Err(e) = self.registry.set_default_if_unset(&credential.domain) {
            tracing::warn!(
                "Failed to record {} as the default domain: {}",
                credential.domain,
                e
            );
        }
        Ok(())
    }

    fn client_for(&self, domain: &DomainName) -> Result<&ClientSecretBundle, AuthError> {
        self.client_secrets
            .as_ref()
            .ok_or_else(|| AuthError::ClientSecretsMissing {
                domain: domain.clone(),
            })
    }

    async fn consent(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let client = self.client_for(domain)?;
        self.authenticator.authorize_user(domain, client, scopes).await
    }

    async fn first_authentication(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let credential = if self.registry.service_account(domain).is_some() {
            let key = self.registry.load_service_account_key(domain)?;
            tracing::info!("Authenticating {} with its service account", domain);
            self.retry_once(domain, || {
                self.authenticator
                    .authorize_service_account(domain, &key, None, scopes)
            })
            .await?
        } else if self.interactive && self.client_secrets.is_some() {
            tracing::info!("No credential for {}; requesting consent", domain);
            self.consent(domain, scopes).await?
        } else {
            return Err(StoreError::NotFound {
                domain: domain.clone(),
            }
            .into());
        };

        self.persist(&credential).await?;
        Ok(credential)
    }

    async fn upgrade_scopes(
        &self,
        stored: &Credential,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let domain = &stored.domain;
        let wanted = stored.scopes.union(scopes);
        match stored.kind {
            TokenKind::ServiceAccount => {
                tracing::info!("Re-signing {} for additional scopes", domain);
                let mut widened = stored.clone();
                widened.scopes = wanted;
                self.renew(&widened).await
            }
            TokenKind::User if self.interactive && self.client_secrets.is_some() => {
                tracing::info!("Requesting consent for additional scopes on {}", domain);
                self.consent(domain, &wanted).await
            }
            TokenKind::User => Err(AuthError::ScopeNotGranted {
                domain: domain.clone(),
                missing: stored.scopes.missing_from(scopes),
            }),
        }
    }

    /// Obtain a new access token for `base` using its own grant.
    async fn renew(&self, base: &Credential) -> Result<Credential, AuthError> {
        let domain = &base.domain;
        match base.kind {
            TokenKind::User => {
                let client = self.client_for(domain)?;
                self.retry_once(domain, || {
                    self.authenticator
                        .refresh(base, RefreshGrant::RefreshToken(client))
                })
                .await
            }
            TokenKind::ServiceAccount => {
                let key = self.registry.load_service_account_key(domain)?;
                if base.signer.as_deref().is_some_and(|s| s != key.email()) {
                    tracing::warn!(
                        "Credential for {} was signed by {:?}; renewing with {}",
                        domain,
                        base.signer,
                        key.email()
                    );
                }
                self.retry_once(domain, || {
                    self.authenticator
                        .refresh(base, RefreshGrant::Assertion(&key))
                })
                .await
            }
        }
    }

    async fn delegated_credential(
        &self,
        domain: &DomainName,
        subject: &str,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let cache_key = (domain.clone(), subject.to_ascii_lowercase());
        let cached = self.delegated.lock().get(&cache_key).cloned();

        let wanted = match &cached {
            Some(c) if c.covers(scopes) && !c.is_expired(self.expiry_buffer) => {
                tracing::debug!("Using delegated credential for {} as {}", domain, subject);
                return Ok(c.clone());
            }
            Some(c) => c.scopes.union(scopes),
            None => scopes.clone(),
        };

        let key = self.registry.load_service_account_key(domain)?;
        check_delegation(domain, &key, Some(subject))?;

        tracing::info!("Minting delegated credential for {} as {}", domain, subject);
        let credential = self
            .retry_once(domain, || {
                self.authenticator
                    .authorize_service_account(domain, &key, Some(subject), &wanted)
            })
            .await?;

        self.delegated.lock().insert(cache_key, credential.clone());
        Ok(credential)
    }

    /// Run `op`, retrying once after the backoff if it fails with a
    /// network error.
    async fn retry_once<F, Fut>(&self, domain: &DomainName, mut op: F) -> Result<Credential, AuthError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Credential, AuthError>>,
    {
        match op().await {
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    "Token request for {} failed ({}); retrying in {:?}",
                    domain,
                    e,
                    self.retry_backoff
                );
                tokio::time::sleep(self.retry_backoff).await;
                op().await
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialManager")
            .field("expiry_buffer", &self.expiry_buffer)
            .field("interactive", &self.interactive)
            .field("client_secrets", &self.client_secrets.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCredentialStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Authenticator answering from a script of outcomes.
    #[derive(Default)]
    struct ScriptedAuthenticator {
        refreshes: AtomicUsize,
        consents: AtomicUsize,
        fail_refresh_with: Mutex<Vec<AuthError>>,
    }

    #[async_trait]
    impl TokenAuthenticator for ScriptedAuthenticator {
        async fn authorize_user(
            &self,
            domain: &DomainName,
            _client: &ClientSecretBundle,
            scopes: &ScopeSet,
        ) -> Result<Credential, AuthError> {
            self.consents.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::user(
                domain.clone(),
                "consented",
                Some("refresh".to_string()),
                Utc::now() + Duration::hours(1),
                scopes.clone(),
            ))
        }

        async fn authorize_service_account(
            &self,
            domain: &DomainName,
            key: &ServiceAccountKey,
            subject: Option<&str>,
            scopes: &ScopeSet,
        ) -> Result<Credential, AuthError> {
            Ok(Credential::service_account(
                domain.clone(),
                "assertion",
                Utc::now() + Duration::hours(1),
                scopes.clone(),
                key.email(),
                subject.map(str::to_string),
            ))
        }

        async fn refresh(
            &self,
            credential: &Credential,
            _grant: RefreshGrant<'_>,
        ) -> Result<Credential, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let failure = self.fail_refresh_with.lock().pop();
            if let Some(e) = failure {
                return Err(e);
            }
            let mut refreshed = credential.clone();
            refreshed.access_token = crate::store::Secret::new("refreshed");
            refreshed.expires_at = Utc::now() + Duration::hours(1);
            Ok(refreshed)
        }
    }

    fn domain() -> DomainName {
        DomainName::parse("example.com").unwrap()
    }

    fn expired_user(scopes: &[&str]) -> Credential {
        Credential::user(
            domain(),
            "stale",
            Some("refresh".to_string()),
            Utc::now() - Duration::minutes(1),
            ScopeSet::parse(scopes).unwrap(),
        )
    }

    fn manager(
        temp: &TempDir,
        credentials: Vec<Credential>,
        authenticator: Arc<ScriptedAuthenticator>,
    ) -> CredentialManager {
        let store: Arc<dyn CredentialStore> =
            Arc::new(MemoryCredentialStore::with_credentials(credentials));
        let registry =
            Arc::new(DomainRegistry::load(temp.path().join("domains.json"), store.clone()).unwrap());
        CredentialManager::new(store, authenticator, registry)
            .with_client_secrets(Some(ClientSecretBundle::new("client", None)))
            .with_retry_backoff(std::time::Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_ensure_refreshes_expired_credential() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        let manager = manager(&temp, vec![expired_user(&["a"])], auth.clone());
        let scopes = ScopeSet::parse(["a"]).unwrap();

        let credential = manager.ensure_credential(&domain(), &scopes, None).await.unwrap();
        assert_eq!(credential.access_token.expose(), "refreshed");
        assert_eq!(manager.generation(&domain()), 1);

        // Fresh now; no second refresh.
        manager.ensure_credential(&domain(), &scopes, None).await.unwrap();
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_network_error_is_retried_once() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        auth.fail_refresh_with.lock().push(AuthError::Network {
            domain: domain(),
            message: "connection reset".to_string(),
        });
        let manager = manager(&temp, vec![expired_user(&["a"])], auth.clone());

        let credential = manager
            .ensure_credential(&domain(), &ScopeSet::parse(["a"]).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(credential.access_token.expose(), "refreshed");
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_reauth_falls_back_to_consent_when_interactive() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        auth.fail_refresh_with
            .lock()
            .push(AuthError::ReauthRequired { domain: domain() });
        let manager = manager(&temp, vec![expired_user(&["a"])], auth.clone()).with_interactive(true);

        let credential = manager
            .ensure_credential(&domain(), &ScopeSet::parse(["a"]).unwrap(), None)
            .await
            .unwrap();
        assert_eq!(credential.access_token.expose(), "consented");
        assert_eq!(auth.consents.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reauth_surfaces_when_not_interactive() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        auth.fail_refresh_with
            .lock()
            .push(AuthError::ReauthRequired { domain: domain() });
        let manager = manager(&temp, vec![expired_user(&["a"])], auth.clone());

        let result = manager
            .ensure_credential(&domain(), &ScopeSet::parse(["a"]).unwrap(), None)
            .await;
        assert!(matches!(result, Err(AuthError::ReauthRequired { .. })));
        assert_eq!(auth.consents.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_user_scopes_are_not_granted_silently() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        let mut fresh = expired_user(&["a"]);
        fresh.expires_at = Utc::now() + Duration::hours(1);
        let manager = manager(&temp, vec![fresh], auth);

        let result = manager
            .ensure_credential(&domain(), &ScopeSet::parse(["a", "b"]).unwrap(), None)
            .await;
        match result {
            Err(AuthError::ScopeNotGranted { missing, .. }) => assert_eq!(missing, vec!["b"]),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_forgets_domain() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        let manager = manager(&temp, vec![expired_user(&["a"])], auth);
        let scopes = ScopeSet::parse(["a"]).unwrap();

        manager.ensure_credential(&domain(), &scopes, None).await.unwrap();
        assert_eq!(manager.registry().get_default().unwrap(), domain());

        manager.remove(&domain()).await.unwrap();
        assert_eq!(manager.generation(&domain()), 2);
        assert!(!manager.store().exists(&domain()).await.unwrap());
        assert!(manager.registry().get_default().is_err());
        assert!(matches!(
            manager.remove(&domain()).await,
            Err(RegistryError::UnknownDomain { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_domain_without_fallback_is_not_found() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, vec![], Arc::new(ScriptedAuthenticator::default()));

        let result = manager
            .ensure_credential(&domain(), &ScopeSet::new(), None)
            .await;
        assert!(matches!(
            result,
            Err(AuthError::Storage(StoreError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_interactive_returns_covering_credential_unchanged() {
        let temp = TempDir::new().unwrap();
        let auth = Arc::new(ScriptedAuthenticator::default());
        let mut fresh = expired_user(&["a", "b"]);
        fresh.expires_at = Utc::now() + Duration::hours(1);
        let manager = manager(&temp, vec![fresh.clone()], auth.clone());

        let credential = manager
            .authenticate_interactive(&domain(), &ScopeSet::parse(["a"]).unwrap())
            .await
            .unwrap();
        assert_eq!(credential, fresh);
        assert_eq!(auth.consents.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_authentication_becomes_default() {
        let temp = TempDir::new().unwrap();
        let manager = manager(&temp, vec![], Arc::new(ScriptedAuthenticator::default()));

        manager
            .authenticate_interactive(&domain(), &ScopeSet::parse(["a"]).unwrap())
            .await
            .unwrap();

        assert_eq!(manager.registry().get_default().unwrap(), domain());
    }

    #[tokio::test]
    async fn test_revoke_deletes_record() {
        let temp = TempDir::new().unwrap();
        let manager = manager(
            &temp,
            vec![expired_user(&["a"])],
            Arc::new(ScriptedAuthenticator::default()),
        );

        manager.revoke(&domain()).await.unwrap();
        assert!(!manager.store().exists(&domain()).await.unwrap());
        assert_eq!(manager.generation(&domain()), 1);

        // Idempotent.
        manager.revoke(&domain()).await.unwrap();
    }
}
