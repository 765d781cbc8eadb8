//! OAuth client configuration for the user-consent flow.
//!
//! This module provides:
//! - [`OAuthEndpoints`] - Authorization, token and revocation endpoints
//! - [`ClientSecretBundle`] - Client ID/secret plus endpoints, loaded from a
//!   `client_secrets.json` file
//!
//! The file format is the one issued by the Google Cloud console, with the
//! client under either an `installed` or a `web` key.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::Secret;

/// Google's authorization endpoint.
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Google's token endpoint, also the audience of service-account assertions.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Google's token revocation endpoint.
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

/// Error loading a client-secret bundle.
#[derive(Debug, Error)]
pub enum ClientSecretsError {
    #[error("failed to read client secrets from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid client secrets in {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// OAuth endpoints of the identity provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthEndpoints {
    pub auth_url: String,
    pub token_url: String,
    pub revoke_url: Option<String>,
}

impl OAuthEndpoints {
    /// Google's production endpoints.
    pub fn google() -> Self {
        Self {
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            revoke_url: Some(GOOGLE_REVOKE_URL.to_string()),
        }
    }
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self::google()
    }
}

/// OAuth client credentials for the user-consent flow.
///
/// Supplied by configuration loading outside the core; never persisted by
/// the credential store.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSecretBundle {
    pub client_id: String,

    /// Absent for public clients.
    pub client_secret: Option<Secret>,

    pub endpoints: OAuthEndpoints,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecretsEntry>,
    web: Option<ClientSecretsEntry>,
}

#[derive(Deserialize)]
struct ClientSecretsEntry {
    client_id: String,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
    revoke_uri: Option<String>,
}

impl ClientSecretBundle {
    /// Create a bundle using Google's endpoints.
    pub fn new(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.map(Secret::new),
            endpoints: OAuthEndpoints::google(),
        }
    }

    /// Replace the endpoints.
    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    /// Load a `client_secrets.json` file.
    pub fn load(path: &Path) -> Result<Self, ClientSecretsError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ClientSecretsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json(&contents).map_err(|message| ClientSecretsError::Parse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse the contents of a `client_secrets.json` file.
    pub fn from_json(contents: &str) -> Result<Self, String> {
        let file: ClientSecretsFile =
            serde_json::from_str(contents).map_err(|e| e.to_string())?;
        let entry = file
            .installed
            .or(file.web)
            .ok_or_else(|| "expected an 'installed' or 'web' client".to_string())?;

        if entry.client_id.trim().is_empty() {
            return Err("client_id is empty".to_string());
        }

        let defaults = OAuthEndpoints::google();
        Ok(Self {
            client_id: entry.client_id,
            client_secret: entry.client_secret.map(Secret::new),
            endpoints: OAuthEndpoints {
                auth_url: entry.auth_uri.unwrap_or(defaults.auth_url),
                token_url: entry.token_uri.unwrap_or(defaults.token_url),
                revoke_url: entry.revoke_uri.or(defaults.revoke_url),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_installed_client() {
        let bundle = ClientSecretBundle::from_json(
            r#"{"installed": {
                "client_id": "123.apps.googleusercontent.com",
                "client_secret": "shh",
                "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                "token_uri": "https://oauth2.googleapis.com/token",
                "redirect_uris": ["http://localhost"]
            }}"#,
        )
        .unwrap();

        assert_eq!(bundle.client_id, "123.apps.googleusercontent.com");
        assert_eq!(bundle.client_secret.unwrap().expose(), "shh");
        assert_eq!(
            bundle.endpoints.auth_url,
            "https://accounts.google.com/o/oauth2/auth"
        );
        assert_eq!(bundle.endpoints.revoke_url.as_deref(), Some(GOOGLE_REVOKE_URL));
    }

    #[test]
    fn test_parse_web_client_defaults_endpoints() {
        let bundle = ClientSecretBundle::from_json(r#"{"web": {"client_id": "abc"}}"#).unwrap();
        assert!(bundle.client_secret.is_none());
        assert_eq!(bundle.endpoints, OAuthEndpoints::google());
    }

    #[test]
    fn test_parse_rejects_missing_client() {
        assert!(ClientSecretBundle::from_json(r#"{"other": {}}"#).is_err());
        assert!(ClientSecretBundle::from_json(r#"{"installed": {"client_id": " "}}"#).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let result = ClientSecretBundle::load(Path::new("/definitely/not/here.json"));
        assert!(matches!(result, Err(ClientSecretsError::Io { .. })));
    }
}
