//! Domain model types for Domainforge.
//!
//! This module defines the identifiers shared by every other module:
//! - [`DomainName`] - A validated tenant name, the top-level key for credential state
//! - [`ApiSurface`] - Identifier for an administration API surface
//! - [`ScopeSet`] - An ordered set of OAuth scopes
//! - [`ServiceAccountRef`] - Persisted association between a domain and a key file
//! - [`DomainEntry`] - Registry view of a single domain
//! - [`DomainContext`] - The domain resolved for one command invocation

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::store::Secret;

/// Longest domain name accepted.
///
/// Below the RFC 1035 limit of 253 so that the record file `{name}.json`
/// fits in a 255-byte file name.
pub(crate) const MAX_DOMAIN_LEN: usize = 250;

/// Longest label between two dots (RFC 1035).
const MAX_LABEL_LEN: usize = 63;

/// Error constructing a model value.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid domain name '{name}': {reason}")]
    InvalidDomain { name: String, reason: String },

    #[error("invalid scope '{scope}'")]
    InvalidScope { scope: String },
}

/// Name of an administrative tenant, e.g. `example.com`.
///
/// Names are normalized to lowercase. They double as file names in the
/// credential store, so anything that could escape the storage directory is
/// rejected.
///
/// # Examples
///
/// ```
/// use domainforge_core::DomainName;
///
/// let domain = DomainName::parse("Example.COM").unwrap();
/// assert_eq!(domain.as_str(), "example.com");
/// assert!(DomainName::parse("../etc").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    /// Parse and normalize a domain name.
    pub fn parse(name: impl AsRef<str>) -> Result<Self, ModelError> {
        let raw = name.as_ref().trim();
        let invalid = |reason: &str| ModelError::InvalidDomain {
            name: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.is_empty() {
            return Err(invalid("name is empty"));
        }
        if raw.len() > MAX_DOMAIN_LEN {
            return Err(invalid("name is too long"));
        }
        if raw.starts_with('.') || raw.starts_with('-') {
            return Err(invalid("name must start with a letter or digit"));
        }
        if raw.ends_with('.') {
            return Err(invalid("name must not end with a dot"));
        }
        if raw.contains("..") {
            return Err(invalid("name contains an empty label"));
        }
        if raw.split('.').any(|label| label.len() > MAX_LABEL_LEN) {
            return Err(invalid("label is longer than 63 characters"));
        }

        let normalized = raw.to_ascii_lowercase();
        if let Some(c) = normalized
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '.' || *c == '-'))
        {
            return Err(invalid(&format!("character {:?} is not allowed", c)));
        }

        Ok(Self(normalized))
    }

    /// Get the domain name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `email` is an address inside this domain.
    pub fn owns_email(&self, email: &str) -> bool {
        email
            .rsplit_once('@')
            .map(|(_, host)| host.eq_ignore_ascii_case(&self.0))
            .unwrap_or(false)
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DomainName {
    type Error = ModelError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for DomainName {
    type Error = ModelError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<DomainName> for String {
    fn from(d: DomainName) -> Self {
        d.0
    }
}

/// Identifier for an API surface (e.g., "directory", "reports").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ApiSurface(String);

impl ApiSurface {
    /// Create a new surface ID.
    ///
    /// The ID is normalized to lowercase.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().to_lowercase())
    }

    /// Get the surface ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiSurface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ApiSurface {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ApiSurface {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// An ordered set of OAuth scopes.
///
/// Ordering is lexicographic so the wire form and persisted records are
/// stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Create an empty scope set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse scopes, rejecting malformed entries.
    ///
    /// A scope is malformed if it is empty or contains a character outside
    /// the RFC 6749 `scope-token` grammar (whitespace, `"`, `\`, controls).
    pub fn parse<I, S>(scopes: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for scope in scopes {
            let scope = scope.as_ref();
            let valid = !scope.is_empty()
                && scope
                    .chars()
                    .all(|c| c.is_ascii() && c > ' ' && c != '"' && c != '\\' && c != '\x7f');
            if !valid {
                return Err(ModelError::InvalidScope {
                    scope: scope.to_string(),
                });
            }
            set.insert(scope.to_string());
        }
        Ok(Self(set))
    }

    /// Parse the space-delimited form used on the wire.
    pub fn from_delimited(s: &str) -> Result<Self, ModelError> {
        Self::parse(s.split_whitespace())
    }

    /// Render the space-delimited form used on the wire.
    pub fn to_delimited(&self) -> String {
        self.0.iter().cloned().collect::<Vec<_>>().join(" ")
    }

    /// Whether every scope in `other` is also in `self`.
    pub fn is_superset(&self, other: &ScopeSet) -> bool {
        self.0.is_superset(&other.0)
    }

    /// Union of two scope sets.
    pub fn union(&self, other: &ScopeSet) -> ScopeSet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Scopes of `requested` that `self` does not contain.
    pub fn missing_from(&self, requested: &ScopeSet) -> Vec<String> {
        requested.0.difference(&self.0).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_delimited())
    }
}

/// Persisted association between a domain and its service-account key.
///
/// Only the reference is stored; the key file itself stays where the
/// administrator put it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccountRef {
    /// Service account email (the JWT issuer).
    pub email: String,

    /// Path to the PEM or JSON key file.
    pub certificate_path: PathBuf,

    /// Password protecting an encrypted PKCS#8 key.
    #[serde(default)]
    pub key_password: Option<Secret>,

    /// Token endpoint override (defaults to the key file's or Google's).
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// Registry view of a single domain.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainEntry {
    pub domain: DomainName,
    pub is_default: bool,
    pub has_credential: bool,
    pub service_account: Option<ServiceAccountRef>,
}

/// The domain a single command invocation runs against.
///
/// Passed explicitly to every call instead of living in global state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainContext {
    pub domain: DomainName,

    /// `true` if the caller named the domain, `false` if the default was used.
    pub explicit: bool,
}

impl DomainContext {
    pub fn domain(&self) -> &DomainName {
        &self.domain
    }
}
