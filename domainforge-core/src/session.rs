//! Authenticated sessions and the session cache.
//!
//! A [`Session`] is bound to one `(domain, surface, impersonated user)`
//! triple and builds `reqwest` requests carrying that credential's bearer
//! token. [`SessionBuilder`] memoizes sessions; the cache is never a source
//! of truth and an entry is dropped as soon as the credential behind it
//! changes.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use reqwest::{Method, RequestBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::model::{ApiSurface, DomainName, ScopeSet};
use crate::store::Secret;
use crate::surface::{ApiInfo, SurfaceRegistry};
use crate::token::{AuthError, Credential};
use crate::token_manager::CredentialManager;

/// Error type for session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No surface with this identifier is registered.
    #[error("unknown API surface '{surface}'")]
    UnknownSurface { surface: ApiSurface },

    /// A surface description is malformed.
    #[error("invalid API surface '{surface}': {message}")]
    InvalidSurface { surface: ApiSurface, message: String },

    /// A request path does not stay under the surface's base URL.
    #[error("invalid request path '{path}' for {surface}")]
    InvalidPath { surface: ApiSurface, path: String },

    /// Obtaining the credential failed.
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl SessionError {
    /// The domain this error refers to, if any.
    pub fn domain(&self) -> Option<&DomainName> {
        match self {
            Self::Auth(e) => e.domain(),
            _ => None,
        }
    }
}

/// An authenticated client handle for one API surface.
///
/// Holds a snapshot of the access token; a session whose token is within
/// the expiry margin is rebuilt by [`SessionBuilder`] rather than refreshed
/// in place.
#[derive(Debug, Clone)]
pub struct Session {
    info: Arc<ApiInfo>,
    domain: DomainName,
    subject: Option<String>,
    access_token: Secret,
    expires_at: DateTime<Utc>,
    scopes: ScopeSet,
    query: Vec<(String, String)>,
    http: reqwest::Client,
}

impl Session {
    /// Plain session constructor: bearer token, no extra parameters.
    pub fn build(
        info: Arc<ApiInfo>,
        credential: &Credential,
        http: &reqwest::Client,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            info,
            domain: credential.domain.clone(),
            subject: credential.subject.clone(),
            access_token: credential.access_token.clone(),
            expires_at: credential.expires_at,
            scopes: credential.scopes.clone(),
            query: Vec::new(),
            http: http.clone(),
        })
    }

    /// Add a query parameter sent with every request.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Static description of the surface.
    pub fn info(&self) -> &ApiInfo {
        &self.info
    }

    pub fn domain(&self) -> &DomainName {
        &self.domain
    }

    /// The impersonated user, if any.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// Whether the token stays valid for at least `margin`.
    pub fn is_fresh(&self, margin: Duration) -> bool {
        self.expires_at > Utc::now() + margin
    }

    /// Resolve `path` against the surface base URL.
    ///
    /// Leading slashes are ignored; the result must stay under the base URL.
    pub fn url(&self, path: &str) -> Result<Url, SessionError> {
        let invalid = || SessionError::InvalidPath {
            surface: self.info.surface.clone(),
            path: path.to_string(),
        };

        let url = self
            .info
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|_| invalid())?;
        if !url.as_str().starts_with(self.info.base_url.as_str()) {
            return Err(invalid());
        }
        Ok(url)
    }

    /// Start an authenticated request.
    pub fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, SessionError> {
        let url = self.url(path)?;
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(self.access_token.expose());
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }
        Ok(request)
    }

    pub fn get(&self, path: &str) -> Result<RequestBuilder, SessionError> {
        self.request(Method::GET, path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    domain: DomainName,
    surface: ApiSurface,
    subject: Option<String>,
}

impl SessionKey {
    fn new(domain: &DomainName, surface: &ApiSurface, subject: Option<&str>) -> Self {
        Self {
            domain: domain.clone(),
            surface: surface.clone(),
            subject: subject.map(str::to_ascii_lowercase),
        }
    }
}

struct CachedSession {
    generation: u64,
    session: Arc<Session>,
}

/// Builds and caches sessions.
///
/// The cache lock is only held for map operations, never across a token
/// exchange.
pub struct SessionBuilder {
    manager: Arc<CredentialManager>,
    surfaces: SurfaceRegistry,
    http: reqwest::Client,
    cache: Mutex<HashMap<SessionKey, CachedSession>>,
}

impl SessionBuilder {
    pub fn new(manager: Arc<CredentialManager>, surfaces: SurfaceRegistry) -> Self {
        Self {
            manager,
            surfaces,
            http: reqwest::Client::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Use a specific HTTP client for built sessions.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn surfaces(&self) -> &SurfaceRegistry {
        &self.surfaces
    }

    pub fn manager(&self) -> &Arc<CredentialManager> {
        &self.manager
    }

    /// Get a session for `surface` on `domain`, optionally impersonating
    /// `subject`.
    ///
    /// The surface's base scopes are always requested in addition to
    /// `scopes`. A cached session is reused when its credential has not
    /// changed, is still fresh and covers the request.
    pub async fn get_session(
        &self,
        domain: &DomainName,
        surface: &ApiSurface,
        scopes: &ScopeSet,
        subject: Option<&str>,
    ) -> Result<Arc<Session>, SessionError> {
        let (info, constructor) =
            self.surfaces
                .get(surface)
                .ok_or_else(|| SessionError::UnknownSurface {
                    surface: surface.clone(),
                })?;
        let wanted = info.base_scopes.union(scopes);
        let key = SessionKey::new(domain, surface, subject);
        let margin = self.manager.expiry_buffer();

        let generation = self.manager.generation(domain);
        if let Some(session) = self.lookup(&key, generation, margin, &wanted) {
            tracing::debug!("Session cache hit for {}/{}", domain, surface);
            return Ok(session);
        }

        let (credential, generation) = self
            .manager
            .ensure_versioned(domain, &wanted, subject)
            .await?;
        let session = Arc::new(constructor(info, &credential, &self.http)?);

        self.cache.lock().insert(
            key,
            CachedSession {
                generation,
                session: session.clone(),
            },
        );
        tracing::debug!("Built session for {}/{}", domain, surface);
        Ok(session)
    }

    fn lookup(
        &self,
        key: &SessionKey,
        generation: u64,
        margin: Duration,
        wanted: &ScopeSet,
    ) -> Option<Arc<Session>> {
        let mut cache = self.cache.lock();
        let entry = cache.get(key)?;
        if entry.generation == generation
            && entry.session.is_fresh(margin)
            && entry.session.scopes().is_superset(wanted)
        {
            return Some(entry.session.clone());
        }
        cache.remove(key);
        None
    }

    /// Drop cached sessions for `domain`: one surface, or all when `None`.
    pub fn invalidate_session(&self, domain: &DomainName, surface: Option<&ApiSurface>) {
        let mut cache = self.cache.lock();
        let before = cache.len();
        cache.retain(|key, _| {
            key.domain != *domain || surface.is_some_and(|s| key.surface != *s)
        });
        tracing::debug!(
            "Invalidated {} cached session(s) for {}",
            before - cache.len(),
            domain
        );
    }

    /// Revoke `domain`'s credential and drop its sessions.
    pub async fn sign_out(&self, domain: &DomainName) -> Result<(), SessionError> {
        self.manager.revoke(domain).await?;
        self.invalidate_session(domain, None);
        Ok(())
    }

    /// Number of cached sessions.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("surfaces", &self.surfaces)
            .field("cached", &self.cached())
            .finish()
    }
}
