//! # Domainforge Core
//!
//! Core library for Domainforge multi-domain credential management.
//!
//! This crate provides:
//! - Domain types for domains, scope sets, API surfaces and credentials
//! - A per-domain credential store with pluggable record encodings
//! - OAuth2 consent (PKCE over a loopback redirect) and service-account
//!   assertion flows, including domain-wide delegation
//! - A domain registry tracking the default domain and service-account keys
//! - A session builder that caches authenticated API sessions
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use domainforge_core::{ApiSurface, Forge, ScopeSet, Settings};
//!
//! async fn list_users(domain: Option<&str>) -> Result<(), domainforge_core::DomainforgeError> {
//!     let forge = Forge::builder(Settings::load()?).build()?;
//!     let context = forge.resolve_domain(domain).await?;
//!     let session = forge
//!         .get_session(context.domain(), &ApiSurface::new("directory"), &ScopeSet::new(), None)
//!         .await?;
//!     let _request = session.get("users?customer=my_customer")?;
//!     Ok(())
//! }
//! ```

pub mod client_secrets;
pub mod error;
pub mod forge;
pub mod model;
pub mod oauth;
pub mod registry;
pub mod session;
pub mod settings;
pub mod store;
pub mod surface;
pub mod token;
pub mod token_manager;

// Re-export commonly used types at crate root
pub use model::{
    ApiSurface,
    DomainContext,
    DomainEntry,
    DomainName,
    ModelError,
    ScopeSet,
    ServiceAccountRef,
};

pub use store::{
    CredentialStore,
    FileCredentialStore,
    MemoryCredentialStore,
    Secret,
    StoreError,
    create_store,
};

pub use token::{
    AuthError,
    Credential,
    RefreshGrant,
    TokenAuthenticator,
    TokenKind,
};

pub use client_secrets::{ClientSecretBundle, ClientSecretsError, OAuthEndpoints};

pub use settings::{RecordEncoding, Settings, SettingsError};

pub use oauth::OAuthAuthenticator;
pub use oauth::service_account::{KeyError, ServiceAccountKey};

pub use registry::{DomainRegistry, RegistryError};

pub use token_manager::CredentialManager;

pub use surface::{ApiInfo, SurfaceRegistry};

pub use session::{Session, SessionBuilder, SessionError};

pub use forge::{Forge, ForgeBuilder};

pub use error::DomainforgeError;
