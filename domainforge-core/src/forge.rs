//! The caller-facing facade.
//!
//! [`Forge`] wires settings, the credential store, the registry, the
//! credential manager and the session builder together, and exposes the
//! operations commands use: resolve a domain, get a session, manage
//! defaults and service accounts, authenticate and sign out.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), domainforge_core::DomainforgeError> {
//! use domainforge_core::{ApiSurface, Forge, ScopeSet, Settings};
//!
//! let forge = Forge::builder(Settings::load()?).build()?;
//! let context = forge.resolve_domain(None).await?;
//! let session = forge
//!     .get_session(context.domain(), &ApiSurface::new("directory"), &ScopeSet::new(), None)
//!     .await?;
//! let response = session.get("users?customer=my_customer")?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::client_secrets::ClientSecretBundle;
use crate::error::DomainforgeError;
use crate::model::{
    ApiSurface, DomainContext, DomainEntry, DomainName, ScopeSet, ServiceAccountRef,
};
use crate::oauth::OAuthAuthenticator;
use crate::oauth::service_account::ServiceAccountKey;
use crate::registry::DomainRegistry;
use crate::session::{Session, SessionBuilder};
use crate::settings::Settings;
use crate::store::{CredentialStore, create_store};
use crate::surface::SurfaceRegistry;
use crate::token::{Credential, TokenAuthenticator};
use crate::token_manager::CredentialManager;

/// Builder for [`Forge`].
///
/// Every part defaults to the production implementation chosen by the
/// settings; tests replace the store and authenticator.
pub struct ForgeBuilder {
    settings: Settings,
    store: Option<Arc<dyn CredentialStore>>,
    authenticator: Option<Arc<dyn TokenAuthenticator>>,
    client_secrets: Option<ClientSecretBundle>,
    surfaces: Option<SurfaceRegistry>,
    interactive: bool,
}

impl ForgeBuilder {
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn TokenAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// OAuth client to use instead of the settings' `client_secrets.json`.
    pub fn client_secrets(mut self, client: ClientSecretBundle) -> Self {
        self.client_secrets = Some(client);
        self
    }

    pub fn surfaces(mut self, surfaces: SurfaceRegistry) -> Self {
        self.surfaces = Some(surfaces);
        self
    }

    /// Allow the consent flow as a fallback while building sessions.
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    pub fn build(self) -> Result<Forge, DomainforgeError> {
        let settings = self.settings;

        let client_secrets = match self.client_secrets {
            Some(client) => Some(client),
            None => load_client_secrets(&settings.client_secrets_path())?,
        };

        let store = self.store.unwrap_or_else(|| create_store(&settings));
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| Arc::new(OAuthAuthenticator::from_settings(&settings)));
        let surfaces = match self.surfaces {
            Some(surfaces) => surfaces,
            None => SurfaceRegistry::with_defaults()?,
        };

        let registry = Arc::new(DomainRegistry::load(settings.registry_path(), store.clone())?);
        let manager = Arc::new(
            CredentialManager::new(store, authenticator, registry.clone())
                .with_client_secrets(client_secrets)
                .with_expiry_buffer(settings.expiry_margin())
                .with_interactive(self.interactive),
        );
        let sessions = SessionBuilder::new(manager.clone(), surfaces);

        Ok(Forge {
            settings,
            registry,
            manager,
            sessions,
        })
    }
}

fn load_client_secrets(path: &Path) -> Result<Option<ClientSecretBundle>, DomainforgeError> {
    if !path.exists() {
        tracing::debug!("No client secrets at {:?}; consent flow disabled", path);
        return Ok(None);
    }
    Ok(Some(ClientSecretBundle::load(path)?))
}

/// Multi-domain credential and session manager.
pub struct Forge {
    settings: Settings,
    registry: Arc<DomainRegistry>,
    manager: Arc<CredentialManager>,
    sessions: SessionBuilder,
}

impl Forge {
    pub fn builder(settings: Settings) -> ForgeBuilder {
        ForgeBuilder {
            settings,
            store: None,
            authenticator: None,
            client_secrets: None,
            surfaces: None,
            interactive: false,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &CredentialManager {
        &self.manager
    }

    pub fn sessions(&self) -> &SessionBuilder {
        &self.sessions
    }

    /// Resolve the domain for this invocation: the explicit one if given
    /// (it must be known), else the default.
    pub async fn resolve_domain(
        &self,
        requested: Option<&str>,
    ) -> Result<DomainContext, DomainforgeError> {
        Ok(self.registry.resolve(requested).await?)
    }

    /// Get an authenticated session for `surface` on `domain`.
    pub async fn get_session(
        &self,
        domain: &DomainName,
        surface: &ApiSurface,
        scopes: &ScopeSet,
        subject: Option<&str>,
    ) -> Result<Arc<Session>, DomainforgeError> {
        Ok(self
            .sessions
            .get_session(domain, surface, scopes, subject)
            .await?)
    }

    pub async fn set_default_domain(&self, domain: &DomainName) -> Result<(), DomainforgeError> {
        Ok(self.registry.set_default(domain).await?)
    }

    pub fn default_domain(&self) -> Result<DomainName, DomainforgeError> {
        Ok(self.registry.get_default()?)
    }

    pub async fn list_domains(&self) -> Result<Vec<DomainName>, DomainforgeError> {
        Ok(self.registry.list_domains().await?)
    }

    pub async fn domain_entries(&self) -> Result<Vec<DomainEntry>, DomainforgeError> {
        Ok(self.registry.entries().await?)
    }

    /// Associate a service account with `domain` after checking its key.
    pub fn set_service_account(
        &self,
        domain: &DomainName,
        email: &str,
        certificate_path: impl Into<PathBuf>,
        key_password: Option<String>,
    ) -> Result<ServiceAccountRef, DomainforgeError> {
        let reference =
            self.registry
                .set_service_account(domain, email, certificate_path, key_password)?;
        self.sessions.invalidate_session(domain, None);
        Ok(reference)
    }

    /// Run the consent flow for `domain`.
    pub async fn authenticate_interactive(
        &self,
        domain: &DomainName,
        scopes: &ScopeSet,
    ) -> Result<Credential, DomainforgeError> {
        let credential = self.manager.authenticate_interactive(domain, scopes).await?;
        self.sessions.invalidate_session(domain, None);
        Ok(credential)
    }

    /// Authenticate `domain` with its associated service account.
    pub async fn authenticate_service_account(
        &self,
        domain: &DomainName,
        subject: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<Credential, DomainforgeError> {
        let key = self.registry.load_service_account_key(domain)?;
        self.authenticate_with_key(domain, &key, subject, scopes)
            .await
    }

    /// Authenticate `domain` with the key named by `reference`, without
    /// associating it.
    pub async fn authenticate_service_account_with(
        &self,
        domain: &DomainName,
        reference: &ServiceAccountRef,
        subject: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<Credential, DomainforgeError> {
        let key = ServiceAccountKey::from_ref(domain, reference)?;
        self.authenticate_with_key(domain, &key, subject, scopes)
            .await
    }

    async fn authenticate_with_key(
        &self,
        domain: &DomainName,
        key: &ServiceAccountKey,
        subject: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<Credential, DomainforgeError> {
        let credential = self
            .manager
            .authenticate_service_account(domain, key, subject, scopes)
            .await?;
        self.sessions.invalidate_session(domain, None);
        Ok(credential)
    }

    /// Revoke `domain`'s credential and drop its sessions.
    pub async fn sign_out(&self, domain: &DomainName) -> Result<(), DomainforgeError> {
        Ok(self.sessions.sign_out(domain).await?)
    }

    /// Forget `domain` entirely.
    pub async fn remove_domain(&self, domain: &DomainName) -> Result<(), DomainforgeError> {
        self.manager.remove(domain).await?;
        self.sessions.invalidate_session(domain, None);
        Ok(())
    }
}

impl std::fmt::Debug for Forge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forge")
            .field("settings", &self.settings)
            .field("registry", &self.registry)
            .field("manager", &self.manager)
            .finish()
    }
}
