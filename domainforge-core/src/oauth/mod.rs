//! OAuth 2.0 flow implementations.
//!
//! This module provides:
//! - [`pkce`] - Authorization Code flow with PKCE and a loopback redirect
//! - [`service_account`] - JWT bearer assertions for service accounts
//! - [`OAuthAuthenticator`] - The production [`TokenAuthenticator`](crate::TokenAuthenticator)

pub mod authenticator;
pub mod pkce;
pub mod service_account;

pub use authenticator::OAuthAuthenticator;

use chrono::Utc;
use oauth2::{
    AuthUrl, ClientId, ClientSecret, RedirectUrl, RequestTokenError, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType, BasicTokenResponse},
};

use crate::client_secrets::ClientSecretBundle;
use crate::model::{DomainName, ScopeSet};
use crate::store::Secret;
use crate::token::{AuthError, Credential};

/// Lifetime assumed when the provider omits `expires_in`.
pub(crate) const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

/// Which grant produced a token endpoint error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Exchange {
    AuthorizationCode,
    RefreshToken,
}

/// Create an OAuth2 client from a client-secret bundle.
///
/// # Arguments
///
/// * `domain` - Domain the client acts for (used in errors)
/// * `client` - Client credentials and endpoints
/// * `redirect_uri` - Redirect URI for the authorization code flow
pub fn create_oauth_client(
    domain: &DomainName,
    client: &ClientSecretBundle,
    redirect_uri: Option<&str>,
) -> Result<BasicClient, AuthError> {
    let auth_url =
        AuthUrl::new(client.endpoints.auth_url.clone()).map_err(|e| AuthError::OAuth {
            domain: domain.clone(),
            message: format!("invalid auth URL: {}", e),
        })?;

    let token_url =
        TokenUrl::new(client.endpoints.token_url.clone()).map_err(|e| AuthError::OAuth {
            domain: domain.clone(),
            message: format!("invalid token URL: {}", e),
        })?;

    let mut oauth_client = BasicClient::new(
        ClientId::new(client.client_id.clone()),
        client
            .client_secret
            .as_ref()
            .map(|s| ClientSecret::new(s.expose().to_string())),
        auth_url,
        Some(token_url),
    );

    if let Some(redirect) = redirect_uri {
        let redirect_url =
            RedirectUrl::new(redirect.to_string()).map_err(|e| AuthError::OAuth {
                domain: domain.clone(),
                message: format!("invalid redirect URL: {}", e),
            })?;
        oauth_client = oauth_client.set_redirect_uri(redirect_url);
    }

    Ok(oauth_client)
}

/// Build a user credential from a token endpoint response.
///
/// Scopes fall back to `fallback_scopes` when the response omits them; the
/// refresh token falls back to `previous_refresh` when the provider does not
/// rotate it.
pub(crate) fn user_credential_from_response(
    domain: &DomainName,
    response: &BasicTokenResponse,
    fallback_scopes: &ScopeSet,
    previous_refresh: Option<&Secret>,
) -> Result<Credential, AuthError> {
    let lifetime = match response.expires_in() {
        Some(duration) => chrono::Duration::from_std(duration).map_err(|e| AuthError::OAuth {
            domain: domain.clone(),
            message: format!("invalid expiration duration: {}", e),
        })?,
        None => chrono::Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS),
    };

    let scopes = match response.scopes() {
        Some(granted) => ScopeSet::parse(granted.iter().map(|s| s.as_str())).map_err(|e| {
            AuthError::OAuth {
                domain: domain.clone(),
                message: format!("provider returned {}", e),
            }
        })?,
        None => fallback_scopes.clone(),
    };

    let refresh_token = response
        .refresh_token()
        .map(|t| t.secret().to_string())
        .or_else(|| previous_refresh.map(|s| s.expose().to_string()));

    Ok(Credential::user(
        domain.clone(),
        response.access_token().secret().to_string(),
        refresh_token,
        Utc::now() + lifetime,
        scopes,
    ))
}

/// Translate a token endpoint failure into an [`AuthError`].
pub(crate) fn map_token_error<RE>(
    domain: &DomainName,
    exchange: Exchange,
    err: RequestTokenError<RE, BasicErrorResponse>,
) -> AuthError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            let description = response.error_description().cloned().unwrap_or_default();
            match response.error() {
                BasicErrorResponseType::InvalidGrant if exchange == Exchange::RefreshToken => {
                    AuthError::ReauthRequired {
                        domain: domain.clone(),
                    }
                }
                BasicErrorResponseType::InvalidScope => AuthError::InvalidScope {
                    domain: domain.clone(),
                    scope: description,
                },
                other => AuthError::OAuth {
                    domain: domain.clone(),
                    message: format!("{}: {}", other.as_ref(), description),
                },
            }
        }
        RequestTokenError::Request(e) => AuthError::Network {
            domain: domain.clone(),
            message: e.to_string(),
        },
        RequestTokenError::Parse(e, _) => AuthError::OAuth {
            domain: domain.clone(),
            message: format!("invalid token response: {}", e),
        },
        RequestTokenError::Other(message) => AuthError::OAuth {
            domain: domain.clone(),
            message,
        },
    }
}
