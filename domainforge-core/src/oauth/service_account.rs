//! Service-account authentication with signed JWT assertions.
//!
//! A service account proves its identity by signing a short-lived JWT with
//! its RSA key and exchanging it at the token endpoint
//! (`urn:ietf:params:oauth:grant-type:jwt-bearer`). With domain-wide
//! delegation the assertion names a `sub`, and the resulting token acts as
//! that user.
//!
//! No refresh token is issued; an expired credential is renewed by signing a
//! new assertion.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::RsaPrivateKey;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::DEFAULT_TOKEN_LIFETIME_SECS;
use crate::client_secrets::GOOGLE_TOKEN_URL;
use crate::model::{DomainName, ScopeSet, ServiceAccountRef};
use crate::store::Secret;
use crate::token::{AuthError, Credential};

/// Grant type for exchanging a signed assertion.
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of a signed assertion.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// Error loading or using a service-account key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("failed to read key file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key file {path:?} is encrypted and no key password was given")]
    PasswordRequired { path: PathBuf },

    #[error("failed to decrypt key file {path:?}: {message}")]
    Decrypt { path: PathBuf, message: String },

    #[error("key file {path:?} does not hold a usable RSA key: {message}")]
    Unusable { path: PathBuf, message: String },

    #[error("failed to sign assertion: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),
}

/// A loaded service-account signing key.
///
/// Held in memory only; the persisted form is
/// [`ServiceAccountRef`](crate::model::ServiceAccountRef).
#[derive(Clone)]
pub struct ServiceAccountKey {
    email: String,
    certificate_path: PathBuf,
    token_uri: String,
    delegation: Vec<String>,
    encoding_key: EncodingKey,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("email", &self.email)
            .field("certificate_path", &self.certificate_path)
            .field("token_uri", &self.token_uri)
            .field("delegation", &self.delegation)
            .field("encoding_key", &"[REDACTED]")
            .finish()
    }
}

/// The subset of a JSON key file we read.
#[derive(Deserialize)]
struct JsonKeyFile {
    client_email: Option<String>,
    private_key: String,
    token_uri: Option<String>,
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub: Option<&'a str>,
}

#[derive(Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    expires_in: Option<i64>,
    scope: Option<String>,
}

#[derive(Deserialize)]
struct TokenEndpointError {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

impl ServiceAccountKey {
    /// Load a key from a PEM or JSON key file.
    ///
    /// Accepted formats:
    /// - PEM `PRIVATE KEY` (PKCS#8) or `RSA PRIVATE KEY` (PKCS#1)
    /// - PEM `ENCRYPTED PRIVATE KEY`, decrypted with `key_password`
    /// - a JSON key file with `private_key` and optionally `client_email`
    ///   and `token_uri`
    ///
    /// An empty `email` takes the JSON file's `client_email`. The key is
    /// exercised once so an unusable key fails here rather than mid-exchange.
    pub fn load(
        email: impl Into<String>,
        certificate_path: &Path,
        key_password: Option<&Secret>,
    ) -> Result<Self, KeyError> {
        let path = certificate_path.to_path_buf();
        let contents = std::fs::read_to_string(certificate_path).map_err(|source| KeyError::Io {
            path: path.clone(),
            source,
        })?;

        let mut email = email.into();
        let mut token_uri = GOOGLE_TOKEN_URL.to_string();

        let pem = if contents.trim_start().starts_with('{') {
            let file: JsonKeyFile =
                serde_json::from_str(&contents).map_err(|e| KeyError::Unusable {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
            if email.is_empty() {
                email = file.client_email.unwrap_or_default();
            }
            if let Some(uri) = file.token_uri {
                token_uri = uri;
            }
            file.private_key
        } else {
            contents
        };

        if email.is_empty() {
            return Err(KeyError::Unusable {
                path,
                message: "no service-account email given".to_string(),
            });
        }

        let encoding_key = parse_signing_key(&path, &pem, key_password)?;
        let key = Self {
            email,
            certificate_path: path,
            token_uri,
            delegation: Vec::new(),
            encoding_key,
        };

        key.sign_assertion(&ScopeSet::new(), None, Utc::now())
            .map_err(|e| KeyError::Unusable {
                path: key.certificate_path.clone(),
                message: e.to_string(),
            })?;

        Ok(key)
    }

    /// Load the key named by a domain's service-account association.
    ///
    /// The key may impersonate any user of `domain`.
    pub fn from_ref(domain: &DomainName, reference: &ServiceAccountRef) -> Result<Self, AuthError> {
        let key = Self::load(
            reference.email.clone(),
            &reference.certificate_path,
            reference.key_password.as_ref(),
        )
        .map_err(|e| AuthError::InvalidKey {
            domain: domain.clone(),
            message: e.to_string(),
        })?;

        let key = match &reference.token_uri {
            Some(uri) => key.with_token_uri(uri.clone()),
            None => key,
        };
        Ok(key.allow_delegation(domain.as_str()))
    }

    /// Override the token endpoint (also the assertion audience).
    pub fn with_token_uri(mut self, token_uri: impl Into<String>) -> Self {
        self.token_uri = token_uri.into();
        self
    }

    /// Allow impersonating users of a domain, or one exact user email.
    pub fn allow_delegation(mut self, target: impl Into<String>) -> Self {
        let target = target.into().to_ascii_lowercase();
        if !self.delegation.contains(&target) {
            self.delegation.push(target);
        }
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    pub fn token_uri(&self) -> &str {
        &self.token_uri
    }

    /// Whether this key may impersonate `subject`.
    pub fn may_impersonate(&self, subject: &str) -> bool {
        let host = subject.rsplit_once('@').map(|(_, host)| host);
        self.delegation.iter().any(|target| {
            if target.contains('@') {
                target.eq_ignore_ascii_case(subject)
            } else {
                host.is_some_and(|h| h.eq_ignore_ascii_case(target))
            }
        })
    }

    /// Sign an RS256 assertion for `scopes`, optionally impersonating `subject`.
    pub fn sign_assertion(
        &self,
        scopes: &ScopeSet,
        subject: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String, KeyError> {
        let iat = now.timestamp();
        let claims = AssertionClaims {
            iss: &self.email,
            scope: scopes.to_delimited(),
            aud: &self.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
            sub: subject,
        };

        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.encoding_key,
        )?)
    }
}

fn parse_signing_key(
    path: &Path,
    pem: &str,
    key_password: Option<&Secret>,
) -> Result<EncodingKey, KeyError> {
    if pem.contains("BEGIN ENCRYPTED PRIVATE KEY") {
        let password = key_password.ok_or_else(|| KeyError::PasswordRequired {
            path: path.to_path_buf(),
        })?;
        let key = RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password.expose().as_bytes())
            .map_err(|e| KeyError::Decrypt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let der = key.to_pkcs1_der().map_err(|e| KeyError::Unusable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        return Ok(EncodingKey::from_rsa_der(der.as_bytes()));
    }

    if key_password.is_some() {
        tracing::warn!("Key file {:?} is not encrypted; ignoring key password", path);
    }

    EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| KeyError::Unusable {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Fail with [`AuthError::DelegationDenied`] when `key` may not act as
/// `subject`.
pub(crate) fn check_delegation(
    domain: &DomainName,
    key: &ServiceAccountKey,
    subject: Option<&str>,
) -> Result<(), AuthError> {
    match subject {
        Some(subject) if !key.may_impersonate(subject) => Err(AuthError::DelegationDenied {
            domain: domain.clone(),
            subject: subject.to_string(),
            message: format!("{} is not permitted to impersonate this user", key.email),
        }),
        _ => Ok(()),
    }
}

/// Sign an assertion and exchange it for an access token.
///
/// Delegation is checked locally first; nothing goes over the network for a
/// subject the key may not impersonate.
pub(crate) async fn exchange_assertion(
    http: &reqwest::Client,
    domain: &DomainName,
    key: &ServiceAccountKey,
    subject: Option<&str>,
    scopes: &ScopeSet,
) -> Result<Credential, AuthError> {
    check_delegation(domain, key, subject)?;

    let assertion =
        key.sign_assertion(scopes, subject, Utc::now())
            .map_err(|e| AuthError::InvalidKey {
                domain: domain.clone(),
                message: e.to_string(),
            })?;

    tracing::debug!("Exchanging assertion for {} at {}", domain, key.token_uri);

    let network = |e: reqwest::Error| AuthError::Network {
        domain: domain.clone(),
        message: e.to_string(),
    };

    let response = http
        .post(&key.token_uri)
        .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
        .send()
        .await
        .map_err(network)?;

    let status = response.status();
    if status.is_server_error() {
        return Err(AuthError::Network {
            domain: domain.clone(),
            message: format!("token endpoint returned {}", status),
        });
    }

    let body = response.text().await.map_err(network)?;

    if !status.is_success() {
        let error: TokenEndpointError =
            serde_json::from_str(&body).map_err(|_| AuthError::OAuth {
                domain: domain.clone(),
                message: format!("token endpoint returned {}", status),
            })?;
        return Err(map_assertion_error(domain, subject, error));
    }

    let token: TokenEndpointResponse =
        serde_json::from_str(&body).map_err(|e| AuthError::OAuth {
            domain: domain.clone(),
            message: format!("invalid token response: {}", e),
        })?;

    let granted = match token.scope.as_deref() {
        Some(scope) => ScopeSet::from_delimited(scope).map_err(|e| AuthError::OAuth {
            domain: domain.clone(),
            message: format!("provider returned {}", e),
        })?,
        None => scopes.clone(),
    };
    let lifetime = token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);

    Ok(Credential::service_account(
        domain.clone(),
        token.access_token,
        Utc::now() + Duration::seconds(lifetime),
        granted,
        key.email.clone(),
        subject.map(str::to_string),
    ))
}

fn map_assertion_error(
    domain: &DomainName,
    subject: Option<&str>,
    error: TokenEndpointError,
) -> AuthError {
    let message = error
        .error_description
        .unwrap_or_else(|| error.error.clone());
    let delegation_denied = |message: String| match subject {
        Some(subject) => AuthError::DelegationDenied {
            domain: domain.clone(),
            subject: subject.to_string(),
            message,
        },
        None => AuthError::AuthDenied {
            domain: domain.clone(),
        },
    };

    match error.error.as_str() {
        "unauthorized_client" | "access_denied" => delegation_denied(message),
        "invalid_grant" => {
            if subject.is_none() || message.to_ascii_lowercase().contains("signature") {
                AuthError::InvalidKey {
                    domain: domain.clone(),
                    message,
                }
            } else {
                delegation_denied(message)
            }
        }
        "invalid_scope" => AuthError::InvalidScope {
            domain: domain.clone(),
            scope: message,
        },
        _ => AuthError::OAuth {
            domain: domain.clone(),
            message: format!("{}: {}", error.error, message),
        },
    }
}
