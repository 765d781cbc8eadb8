//! Domain registry: which domains are known, which one is the default, and
//! which service account each domain uses.
//!
//! The registry keeps its own small JSON file, `domains.json`, under the
//! storage root. Credential records stay in the
//! [`CredentialStore`](crate::store::CredentialStore); the registry reads the
//! store to decide whether a domain is known.
//!
//! # Example
//!
//! ```rust,ignore
//! use domainforge_core::registry::DomainRegistry;
//!
//! let registry = DomainRegistry::load(settings.registry_path(), store)?;
//! let context = registry.resolve(Some("example.com")).await?;
//! registry.set_default(context.domain()).await?;
//! ```

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{DomainContext, DomainEntry, DomainName, ModelError, ServiceAccountRef};
use crate::oauth::service_account::ServiceAccountKey;
use crate::store::{CredentialStore, Secret, StoreError};
use crate::token::AuthError;

const REGISTRY_VERSION: u32 = 1;

/// Error type for registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No default domain has been set.
    #[error("no default domain is set")]
    NotSet,

    /// The domain has no credential record and no service account.
    #[error("unknown domain {domain}; authenticate it first")]
    UnknownDomain { domain: DomainName },

    /// No domain was requested and there is no default.
    #[error("no domain given and no default domain is set")]
    NoDomainAvailable,

    #[error(transparent)]
    InvalidDomain(#[from] ModelError),

    /// I/O error reading or writing the registry file.
    #[error("failed to access registry at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file is not valid JSON.
    #[error("invalid registry file {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported registry version {0}")]
    UnsupportedVersion(u32),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl RegistryError {
    /// The domain this error refers to, if any.
    pub fn domain(&self) -> Option<&DomainName> {
        match self {
            Self::UnknownDomain { domain } => Some(domain),
            Self::Store(e) => e.domain(),
            Self::Auth(e) => e.domain(),
            _ => None,
        }
    }
}

/// On-disk format of `domains.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryData {
    /// Version of the file format (for future migrations).
    version: u32,

    #[serde(default)]
    default: Option<DomainName>,

    #[serde(default)]
    service_accounts: BTreeMap<DomainName, ServiceAccountRef>,
}

impl Default for RegistryData {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            default: None,
            service_accounts: BTreeMap::new(),
        }
    }
}

/// Disk-backed registry of domains.
///
/// # Thread Safety
///
/// State lives behind a `RwLock`; the file is rewritten while the write lock
/// is held, so concurrent updates cannot reorder on disk.
///
/// Service-account keys are read from disk once per association and kept in
/// memory afterwards.
pub struct DomainRegistry {
    path: PathBuf,
    store: Arc<dyn CredentialStore>,
    data: RwLock<RegistryData>,
    keys: Mutex<HashMap<DomainName, ServiceAccountKey>>,
}

impl DomainRegistry {
    /// Load the registry from `path`.
    ///
    /// A missing file yields an empty registry; the file is created on the
    /// first change.
    pub fn load(path: PathBuf, store: Arc<dyn CredentialStore>) -> Result<Self, RegistryError> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
                path: path.clone(),
                source,
            })?;
            let data: RegistryData =
                serde_json::from_str(&contents).map_err(|source| RegistryError::Json {
                    path: path.clone(),
                    source,
                })?;
            if data.version > REGISTRY_VERSION {
                return Err(RegistryError::UnsupportedVersion(data.version));
            }
            data
        } else {
            RegistryData::default()
        };

        Ok(Self {
            path,
            store,
            data: RwLock::new(data),
            keys: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the registry file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sorted names of all domains with a credential record.
    pub async fn list_domains(&self) -> Result<Vec<DomainName>, RegistryError> {
        Ok(self.store.list_domains().await?)
    }

    /// All known domains with their default flag and service account.
    pub async fn entries(&self) -> Result<Vec<DomainEntry>, RegistryError> {
        let with_credentials = self.store.list_domains().await?;
        let data = self.data.read().clone();

        let mut names: Vec<DomainName> = with_credentials.clone();
        for domain in data.service_accounts.keys() {
            if !names.contains(domain) {
                names.push(domain.clone());
            }
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|domain| DomainEntry {
                is_default: data.default.as_ref() == Some(&domain),
                has_credential: with_credentials.contains(&domain),
                service_account: data.service_accounts.get(&domain).cloned(),
                domain,
            })
            .collect())
    }

    /// The default domain.
    pub fn get_default(&self) -> Result<DomainName, RegistryError> {
        self.data.read().default.clone().ok_or(RegistryError::NotSet)
    }

    /// Make `domain` the default. It must already be known.
    pub async fn set_default(&self, domain: &DomainName) -> Result<(), RegistryError> {
        self.ensure_known(domain).await?;
        self.update(|data| data.default = Some(domain.clone()))?;
        tracing::info!("Default domain set to {}", domain);
        Ok(())
    }

    /// Make `domain` the default when none is set. Returns whether it was set.
    pub fn set_default_if_unset(&self, domain: &DomainName) -> Result<bool, RegistryError> {
        if self.data.read().default.is_some() {
            return Ok(false);
        }
        let mut changed = false;
        self.update(|data| {
            if data.default.is_none() {
                data.default = Some(domain.clone());
                changed = true;
            }
        })?;
        if changed {
            tracing::info!("Default domain set to {}", domain);
        }
        Ok(changed)
    }

    /// Whether `domain` has a credential record or a service account.
    pub async fn is_known(&self, domain: &DomainName) -> Result<bool, RegistryError> {
        if self.data.read().service_accounts.contains_key(domain) {
            return Ok(true);
        }
        Ok(self.store.exists(domain).await?)
    }

    /// Resolve the domain for one invocation.
    ///
    /// An explicit domain must be known; nothing is authenticated as a side
    /// effect. Without one, the default is used.
    pub async fn resolve(&self, requested: Option<&str>) -> Result<DomainContext, RegistryError> {
        match requested {
            Some(name) => {
                let domain = DomainName::parse(name)?;
                self.ensure_known(&domain).await?;
                Ok(DomainContext {
                    domain,
                    explicit: true,
                })
            }
            None => {
                let domain = self
                    .data
                    .read()
                    .default
                    .clone()
                    .ok_or(RegistryError::NoDomainAvailable)?;
                Ok(DomainContext {
                    domain,
                    explicit: false,
                })
            }
        }
    }

    /// Associate a service account with `domain`.
    ///
    /// The key is loaded once to verify it; nothing is persisted when that
    /// fails.
    pub fn set_service_account(
        &self,
        domain: &DomainName,
        email: impl Into<String>,
        certificate_path: impl Into<PathBuf>,
        key_password: Option<String>,
    ) -> Result<ServiceAccountRef, RegistryError> {
        let reference = ServiceAccountRef {
            email: email.into(),
            certificate_path: certificate_path.into(),
            key_password: key_password.map(Secret::new),
            token_uri: None,
        };
        self.set_service_account_ref(domain, reference)
    }

    /// Associate a fully specified service-account reference with `domain`.
    pub fn set_service_account_ref(
        &self,
        domain: &DomainName,
        reference: ServiceAccountRef,
    ) -> Result<ServiceAccountRef, RegistryError> {
        let key = ServiceAccountKey::from_ref(domain, &reference)?;

        self.update(|data| {
            data.service_accounts
                .insert(domain.clone(), reference.clone());
        })?;
        self.keys.lock().insert(domain.clone(), key);
        tracing::info!(
            "Service account {} associated with {}",
            reference.email,
            domain
        );
        Ok(reference)
    }

    /// The service account associated with `domain`, if any.
    pub fn service_account(&self, domain: &DomainName) -> Option<ServiceAccountRef> {
        self.data.read().service_accounts.get(domain).cloned()
    }

    /// The signing key of `domain`'s service account.
    ///
    /// The key file is read on first use only.
    pub fn load_service_account_key(
        &self,
        domain: &DomainName,
    ) -> Result<ServiceAccountKey, AuthError> {
        let cached = self.keys.lock().get(domain).cloned();
        if let Some(key) = cached {
            return Ok(key);
        }
        let reference =
            self.service_account(domain)
                .ok_or_else(|| AuthError::ServiceAccountNotConfigured {
                    domain: domain.clone(),
                })?;
        let key = ServiceAccountKey::from_ref(domain, &reference)?;
        self.keys.lock().insert(domain.clone(), key.clone());
        Ok(key)
    }

    /// Forget `domain`: its credential record, service account and default
    /// flag.
    ///
    /// This does not coordinate with token refreshes in flight; go through
    /// [`CredentialManager::remove`](crate::CredentialManager::remove) when a
    /// manager shares this registry.
    pub async fn remove_domain(&self, domain: &DomainName) -> Result<(), RegistryError> {
        self.ensure_known(domain).await?;
        self.store.delete(domain).await?;
        self.update(|data| {
            data.service_accounts.remove(domain);
            if data.default.as_ref() == Some(domain) {
                data.default = None;
            }
        })?;
        self.keys.lock().remove(domain);
        tracing::info!("Removed domain {}", domain);
        Ok(())
    }

    async fn ensure_known(&self, domain: &DomainName) -> Result<(), RegistryError> {
        if self.is_known(domain).await? {
            Ok(())
        } else {
            Err(RegistryError::UnknownDomain {
                domain: domain.clone(),
            })
        }
    }

    /// Apply `change` and persist the result.
    ///
    /// The in-memory state is only replaced once the file is written.
    fn update(&self, change: impl FnOnce(&mut RegistryData)) -> Result<(), RegistryError> {
        let mut data = self.data.write();
        let mut next = data.clone();
        change(&mut next);
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn persist(&self, data: &RegistryData) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: self.path.clone(),
            source,
        };

        let contents = serde_json::to_vec_pretty(data).map_err(|source| RegistryError::Json {
            path: self.path.clone(),
            source,
        })?;

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        let temp = dir.join(format!(".domains.{}.tmp", Uuid::new_v4()));
        let result = write_private(&temp, &contents).and_then(|()| fs::rename(&temp, &self.path));
        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(io_err(e));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DomainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        f.debug_struct("DomainRegistry")
            .field("path", &self.path)
            .field("default", &data.default)
            .field("service_accounts", &data.service_accounts.len())
            .finish()
    }
}

/// Write a new file readable only by the owner (it may hold key passwords).
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
