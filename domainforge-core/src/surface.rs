//! API surface metadata and registry.
//!
//! This module provides:
//! - [`ApiInfo`] - Static description of an API surface
//! - [`SurfaceRegistry`] - Maps surface identifiers to their description and
//!   session constructor
//!
//! The registry comes pre-configured with the administration surfaces
//! (directory, groups settings, reports, gmail) and can be extended with
//! custom ones.

use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::model::{ApiSurface, ScopeSet};
use crate::session::{Session, SessionError};
use crate::token::Credential;

/// Builds a [`Session`] for one surface from a credential.
pub type SessionConstructor =
    fn(Arc<ApiInfo>, &Credential, &reqwest::Client) -> Result<Session, SessionError>;

/// Static description of an API surface.
///
/// Immutable once constructed; every session built for the surface shares
/// it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiInfo {
    /// Surface identifier (e.g. "directory").
    pub surface: ApiSurface,

    /// Human-readable name (e.g. "Admin SDK Directory API").
    pub name: String,

    /// API version (e.g. "directory_v1").
    pub version: String,

    /// Base URL request paths are resolved against. Always ends in `/`.
    pub base_url: Url,

    /// Scopes every session for this surface needs.
    pub base_scopes: ScopeSet,
}

impl ApiInfo {
    /// Describe a surface.
    ///
    /// # Errors
    ///
    /// Fails if `base_url` is not an absolute http(s) URL or a scope is
    /// malformed.
    pub fn new(
        surface: impl Into<ApiSurface>,
        name: impl Into<String>,
        version: impl Into<String>,
        base_url: &str,
        base_scopes: &[&str],
    ) -> Result<Self, SessionError> {
        let surface = surface.into();
        let invalid = |message: String| SessionError::InvalidSurface {
            surface: surface.clone(),
            message,
        };

        let mut base_url = Url::parse(base_url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", base_url.scheme())));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let base_scopes = ScopeSet::parse(base_scopes).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            surface,
            name: name.into(),
            version: version.into(),
            base_url,
            base_scopes,
        })
    }
}

#[derive(Clone)]
struct SurfaceEntry {
    info: Arc<ApiInfo>,
    constructor: SessionConstructor,
}

/// Registry of API surfaces.
///
/// # Example
///
/// ```
/// use domainforge_core::surface::SurfaceRegistry;
/// use domainforge_core::ApiSurface;
///
/// let registry = SurfaceRegistry::with_defaults().unwrap();
/// let directory = registry.info(&ApiSurface::new("directory")).unwrap();
/// assert_eq!(directory.version, "directory_v1");
/// ```
#[derive(Clone, Default)]
pub struct SurfaceRegistry {
    surfaces: HashMap<ApiSurface, SurfaceEntry>,
}

impl SurfaceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the administration surfaces pre-registered:
    /// - directory
    /// - groupssettings
    /// - reports
    /// - gmail
    pub fn with_defaults() -> Result<Self, SessionError> {
        let mut registry = Self::new();

        registry.register(
            ApiInfo::new(
                "directory",
                "Admin SDK Directory API",
                "directory_v1",
                "https://admin.googleapis.com/admin/directory/v1/",
                &["https://www.googleapis.com/auth/admin.directory.user"],
            )?,
            Session::build,
        );

        // Groups Settings answers in Atom unless asked for JSON.
        registry.register(
            ApiInfo::new(
                "groupssettings",
                "Groups Settings API",
                "v1",
                "https://www.googleapis.com/groups/v1/groups/",
                &["https://www.googleapis.com/auth/apps.groups.settings"],
            )?,
            build_json_session,
        );

        registry.register(
            ApiInfo::new(
                "reports",
                "Admin SDK Reports API",
                "reports_v1",
                "https://admin.googleapis.com/admin/reports/v1/",
                &["https://www.googleapis.com/auth/admin.reports.audit.readonly"],
            )?,
            Session::build,
        );

        registry.register(
            ApiInfo::new(
                "gmail",
                "Gmail API",
                "v1",
                "https://gmail.googleapis.com/gmail/v1/",
                &["https://www.googleapis.com/auth/gmail.settings.basic"],
            )?,
            Session::build,
        );

        Ok(registry)
    }

    /// Register a surface.
    ///
    /// If a surface with the same identifier exists, it is replaced.
    pub fn register(&mut self, info: ApiInfo, constructor: SessionConstructor) {
        self.surfaces.insert(
            info.surface.clone(),
            SurfaceEntry {
                info: Arc::new(info),
                constructor,
            },
        );
    }

    /// Description and constructor of a surface.
    pub fn get(&self, surface: &ApiSurface) -> Option<(Arc<ApiInfo>, SessionConstructor)> {
        self.surfaces
            .get(surface)
            .map(|entry| (entry.info.clone(), entry.constructor))
    }

    /// Description of a surface.
    pub fn info(&self, surface: &ApiSurface) -> Option<&ApiInfo> {
        self.surfaces.get(surface).map(|entry| entry.info.as_ref())
    }

    /// Registered surface identifiers, sorted.
    pub fn list(&self) -> Vec<&ApiSurface> {
        let mut surfaces: Vec<_> = self.surfaces.keys().collect();
        surfaces.sort();
        surfaces
    }

    pub fn len(&self) -> usize {
        self.surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.surfaces.is_empty()
    }
}

impl std::fmt::Debug for SurfaceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceRegistry")
            .field("surfaces", &self.list())
            .finish()
    }
}

fn build_json_session(
    info: Arc<ApiInfo>,
    credential: &Credential,
    http: &reqwest::Client,
) -> Result<Session, SessionError> {
    Ok(Session::build(info, credential, http)?.with_query("alt", "json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_with_defaults() {
        let registry = SurfaceRegistry::with_defaults().unwrap();

        let ids: Vec<&str> = registry.list().iter().map(|s| s.as_str()).collect();
        assert_eq!(ids, vec!["directory", "gmail", "groupssettings", "reports"]);

        let reports = registry.info(&ApiSurface::new("reports")).unwrap();
        assert_eq!(reports.name, "Admin SDK Reports API");
        assert_eq!(reports.base_scopes.len(), 1);
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = SurfaceRegistry::new();
        assert!(registry.is_empty());

        registry.register(
            ApiInfo::new("custom", "Custom 1", "v1", "https://api.example.com/v1", &[]).unwrap(),
            Session::build,
        );
        registry.register(
            ApiInfo::new("custom", "Custom 2", "v2", "https://api.example.com/v2", &[]).unwrap(),
            Session::build,
        );

        assert_eq!(registry.len(), 1);
        let info = registry.info(&ApiSurface::new("custom")).unwrap();
        assert_eq!(info.name, "Custom 2");
        assert_eq!(info.base_url.as_str(), "https://api.example.com/v2/");
    }

    #[test]
    fn test_api_info_validation() {
        assert!(matches!(
            ApiInfo::new("bad", "Bad", "v1", "not a url", &[]),
            Err(SessionError::InvalidSurface { .. })
        ));
        assert!(matches!(
            ApiInfo::new("bad", "Bad", "v1", "ftp://example.com/", &[]),
            Err(SessionError::InvalidSurface { .. })
        ));
        assert!(matches!(
            ApiInfo::new("bad", "Bad", "v1", "https://example.com/", &["two words"]),
            Err(SessionError::InvalidSurface { .. })
        ));
    }

    #[test]
    fn test_unknown_surface() {
        let registry = SurfaceRegistry::with_defaults().unwrap();
        assert!(registry.get(&ApiSurface::new("drive")).is_none());
    }
}
