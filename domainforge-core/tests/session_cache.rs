//! Integration tests for the session builder and its cache.
//!
//! A counting authenticator stands in for the network so the tests can
//! assert exactly how many token exchanges each scenario costs.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use domainforge_core::{
    ApiSurface, AuthError, ClientSecretBundle, Credential, CredentialManager, CredentialStore,
    DomainName, DomainRegistry, DomainforgeError, Forge, MemoryCredentialStore, RefreshGrant,
    ScopeSet, ServiceAccountKey, Session, SessionBuilder, SessionError, Settings, SurfaceRegistry,
    TokenAuthenticator,
};
use tempfile::TempDir;

const DIRECTORY_SCOPE: &str = "https://www.googleapis.com/auth/admin.directory.user";

/// Authenticator that counts calls and hands out numbered tokens.
struct CountingAuthenticator {
    refreshes: AtomicUsize,
    consents: AtomicUsize,
    revokes: AtomicUsize,
    refresh_delay: std::time::Duration,
}

impl Default for CountingAuthenticator {
    fn default() -> Self {
        Self::with_refresh_delay(std::time::Duration::from_millis(20))
    }
}

impl CountingAuthenticator {
    fn with_refresh_delay(refresh_delay: std::time::Duration) -> Self {
        Self {
            refreshes: AtomicUsize::new(0),
            consents: AtomicUsize::new(0),
            revokes: AtomicUsize::new(0),
            refresh_delay,
        }
    }

    fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenAuthenticator for CountingAuthenticator {
    async fn authorize_user(
        &self,
        domain: &DomainName,
        _client: &ClientSecretBundle,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let n = self.consents.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Credential::user(
            domain.clone(),
            format!("consent-{}", n),
            Some("refresh".to_string()),
            Utc::now() + Duration::hours(1),
            scopes.clone(),
        ))
    }

    async fn authorize_service_account(
        &self,
        domain: &DomainName,
        _key: &ServiceAccountKey,
        _subject: Option<&str>,
        _scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        Err(AuthError::ServiceAccountNotConfigured {
            domain: domain.clone(),
        })
    }

    async fn refresh(
        &self,
        credential: &Credential,
        _grant: RefreshGrant<'_>,
    ) -> Result<Credential, AuthError> {
        // Give concurrent callers a chance to pile up on the domain lock.
        tokio::time::sleep(self.refresh_delay).await;
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut refreshed = credential.clone();
        refreshed.access_token = domainforge_core::Secret::new(format!("refreshed-{}", n));
        refreshed.expires_at = Utc::now() + Duration::hours(1);
        Ok(refreshed)
    }

    async fn revoke(
        &self,
        _credential: &Credential,
        _client: Option<&ClientSecretBundle>,
    ) -> Result<(), AuthError> {
        self.revokes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<MemoryCredentialStore>,
    authenticator: Arc<CountingAuthenticator>,
    builder: SessionBuilder,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryCredentialStore::new());
    let authenticator = Arc::new(CountingAuthenticator::default());
    let registry =
        Arc::new(DomainRegistry::load(dir.path().join("domains.json"), store.clone()).unwrap());
    let manager = CredentialManager::new(store.clone(), authenticator.clone(), registry)
        .with_client_secrets(Some(ClientSecretBundle::new("client-id", None)));
    let builder = SessionBuilder::new(Arc::new(manager), SurfaceRegistry::with_defaults().unwrap());

    Harness {
        _dir: dir,
        store,
        authenticator,
        builder,
    }
}

/// The bearer token a session attaches to its requests.
fn bearer(session: &Session) -> String {
    let request = session.get("users").unwrap().build().unwrap();
    request.headers()["authorization"].to_str().unwrap().to_string()
}

fn domain(name: &str) -> DomainName {
    DomainName::parse(name).unwrap()
}

fn credential(domain: &DomainName, expires_in: Duration) -> Credential {
    Credential::user(
        domain.clone(),
        "stored-token",
        Some("refresh".to_string()),
        Utc::now() + expires_in,
        ScopeSet::parse([DIRECTORY_SCOPE, "scope.extra"]).unwrap(),
    )
}

#[tokio::test]
async fn test_second_get_session_hits_cache() {
    let h = harness();
    let example = domain("example.com");
    h.store
        .save(&credential(&example, Duration::hours(1)))
        .await
        .unwrap();
    let directory = ApiSurface::new("directory");

    let first = h
        .builder
        .get_session(&example, &directory, &ScopeSet::new(), None)
        .await
        .unwrap();
    let second = h
        .builder
        .get_session(&example, &directory, &ScopeSet::new(), None)
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(h.builder.cached(), 1);
    assert_eq!(h.authenticator.refreshes(), 0);
    assert_eq!(first.info().version, "directory_v1");
}

#[tokio::test]
async fn test_sessions_are_isolated_per_domain() {
    let h = harness();
    let a = domain("a.example.com");
    let b = domain("b.example.com");
    h.store.save(&credential(&a, Duration::hours(1))).await.unwrap();

    let directory = ApiSurface::new("directory");
    let session = h
        .builder
        .get_session(&a, &directory, &ScopeSet::new(), None)
        .await
        .unwrap();
    assert_eq!(session.domain(), &a);

    // b has no credential and the builder is not interactive.
    let err = h
        .builder
        .get_session(&b, &directory, &ScopeSet::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.domain(), Some(&b));
}

#[tokio::test]
async fn test_expired_credential_is_refreshed_once_under_concurrency() {
    let h = harness();
    let example = domain("example.com");
    h.store
        .save(&credential(&example, Duration::minutes(2)))
        .await
        .unwrap();
    let directory = ApiSurface::new("directory");
    let reports = ApiSurface::new("reports");
    let builder = Arc::new(h.builder);

    let scopes = ScopeSet::parse([DIRECTORY_SCOPE]).unwrap();
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let builder = builder.clone();
            let example = example.clone();
            let directory = directory.clone();
            let scopes = scopes.clone();
            tokio::spawn(async move {
                builder
                    .get_session(&example, &directory, &scopes, None)
                    .await
                    .map(|s| (s.expires_at(), bearer(&s)))
            })
        })
        .collect();

    let mut observed = Vec::new();
    for task in tasks {
        observed.push(task.await.unwrap().unwrap());
    }
    assert_eq!(h.authenticator.refreshes(), 1);
    assert_eq!(observed[0].1, "Bearer refreshed-1");
    assert!(observed.iter().all(|seen| seen == &observed[0]));

    // The reports surface needs a scope the credential lacks; without
    // interaction that is reported instead of silently re-consented.
    let err = builder
        .get_session(&example, &reports, &ScopeSet::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SessionError::Auth(AuthError::ScopeNotGranted { .. })
    ));
}

#[tokio::test]
async fn test_credential_change_invalidates_cached_session() {
    let h = harness();
    let example = domain("example.com");
    h.store
        .save(&credential(&example, Duration::hours(1)))
        .await
        .unwrap();
    let directory = ApiSurface::new("directory");

    let before = h
        .builder
        .get_session(&example, &directory, &ScopeSet::new(), None)
        .await
        .unwrap();

    // A re-authentication through the manager bumps the domain generation.
    h.builder
        .manager()
        .authenticate_interactive(&example, &ScopeSet::parse(["scope.new"]).unwrap())
        .await
        .unwrap();

    let after = h
        .builder
        .get_session(&example, &directory, &ScopeSet::new(), None)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(after.scopes().is_superset(&ScopeSet::parse(["scope.new"]).unwrap()));
}

#[tokio::test]
async fn test_invalidate_and_sign_out() {
    let h = harness();
    let example = domain("example.com");
    let other = domain("other.example.com");
    for d in [&example, &other] {
        h.store.save(&credential(d, Duration::hours(1))).await.unwrap();
        h.builder
            .get_session(d, &ApiSurface::new("directory"), &ScopeSet::new(), None)
            .await
            .unwrap();
    }
    assert_eq!(h.builder.cached(), 2);

    h.builder
        .invalidate_session(&example, Some(&ApiSurface::new("gmail")));
    assert_eq!(h.builder.cached(), 2);

    h.builder.invalidate_session(&example, None);
    assert_eq!(h.builder.cached(), 1);

    h.builder.sign_out(&other).await.unwrap();
    assert_eq!(h.builder.cached(), 0);
    assert_eq!(h.authenticator.revokes.load(Ordering::SeqCst), 1);
    assert!(!h.store.exists(&other).await.unwrap());
    assert!(h.store.exists(&example).await.unwrap());
}

#[tokio::test]
async fn test_unknown_surface() {
    let h = harness();
    let err = h
        .builder
        .get_session(
            &domain("example.com"),
            &ApiSurface::new("drive"),
            &ScopeSet::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::UnknownSurface { .. }));
}

#[tokio::test]
async fn test_forge_interactive_first_use_consents_and_sets_default() {
    let dir = TempDir::new().unwrap();
    let authenticator = Arc::new(CountingAuthenticator::default());
    let forge = Forge::builder(Settings::with_root(dir.path().to_path_buf()))
        .store(Arc::new(MemoryCredentialStore::new()))
        .authenticator(authenticator.clone())
        .client_secrets(ClientSecretBundle::new("client-id", None))
        .interactive(true)
        .build()
        .unwrap();

    let example = domain("example.com");
    let session = forge
        .get_session(&example, &ApiSurface::new("groupssettings"), &ScopeSet::new(), None)
        .await
        .unwrap();

    assert_eq!(authenticator.consents.load(Ordering::SeqCst), 1);
    assert_eq!(forge.default_domain().unwrap(), example);
    let request = session.get("group@example.com").unwrap().build().unwrap();
    assert_eq!(request.url().query(), Some("alt=json"));

    forge.remove_domain(&example).await.unwrap();
    assert!(forge.sessions().cached() == 0);
    assert!(matches!(
        forge.default_domain(),
        Err(DomainforgeError::Registry(_))
    ));
}

#[tokio::test]
async fn test_remove_domain_waits_for_refresh_in_flight() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryCredentialStore::new());
    let authenticator = Arc::new(CountingAuthenticator::with_refresh_delay(
        std::time::Duration::from_millis(200),
    ));
    let forge = Arc::new(
        Forge::builder(Settings::with_root(dir.path().to_path_buf()))
            .store(store.clone())
            .authenticator(authenticator.clone())
            .client_secrets(ClientSecretBundle::new("client-id", None))
            .build()
            .unwrap(),
    );
    let example = domain("example.com");
    store
        .save(&credential(&example, Duration::minutes(-1)))
        .await
        .unwrap();

    let refreshing = {
        let forge = forge.clone();
        let example = example.clone();
        tokio::spawn(async move {
            forge
                .get_session(&example, &ApiSurface::new("directory"), &ScopeSet::new(), None)
                .await
                .map(|_| ())
        })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    forge.remove_domain(&example).await.unwrap();
    // The refresh finished writing before the record was deleted.
    assert_eq!(authenticator.refreshes(), 1);
    refreshing.await.unwrap().unwrap();

    assert!(!store.exists(&example).await.unwrap());
    assert!(forge.list_domains().await.unwrap().is_empty());
    assert!(matches!(
        forge.default_domain(),
        Err(DomainforgeError::Registry(_))
    ));
}
