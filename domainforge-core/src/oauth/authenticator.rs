//! Production [`TokenAuthenticator`] backed by the `oauth2` crate and
//! `reqwest`.

use async_trait::async_trait;
use oauth2::{RefreshToken, reqwest::async_http_client};
use std::time::Duration;
use tokio::net::TcpListener;

use super::pkce::PkceFlow;
use super::service_account::{ServiceAccountKey, exchange_assertion};
use super::{Exchange, create_oauth_client, map_token_error, user_credential_from_response};
use crate::client_secrets::ClientSecretBundle;
use crate::model::{DomainName, ScopeSet};
use crate::settings::Settings;
use crate::token::{AuthError, Credential, RefreshGrant, TokenAuthenticator, TokenKind};

type Presenter = Box<dyn Fn(&str) + Send + Sync>;

/// Authenticator performing real OAuth exchanges.
///
/// The consent URL of the user flow is handed to a presenter callback; the
/// default one logs it.
pub struct OAuthAuthenticator {
    http: reqwest::Client,
    callback_port: u16,
    consent_timeout: Duration,
    presenter: Presenter,
}

impl OAuthAuthenticator {
    /// Create an authenticator with an ephemeral callback port and a
    /// five-minute consent timeout.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            callback_port: 0,
            consent_timeout: Duration::from_secs(300),
            presenter: Box::new(|url| {
                tracing::info!("Open this URL to authorize: {}", url);
            }),
        }
    }

    /// Create an authenticator configured from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new()
            .with_callback_port(settings.callback_port)
            .with_consent_timeout(settings.consent_timeout())
    }

    pub fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = port;
        self
    }

    pub fn with_consent_timeout(mut self, timeout: Duration) -> Self {
        self.consent_timeout = timeout;
        self
    }

    /// Replace how the consent URL is shown to the user.
    pub fn with_presenter(mut self, presenter: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.presenter = Box::new(presenter);
        self
    }

    /// Use a specific HTTP client for assertion exchange and revocation.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    async fn refresh_user(
        &self,
        credential: &Credential,
        client: &ClientSecretBundle,
    ) -> Result<Credential, AuthError> {
        let domain = &credential.domain;
        let refresh_token =
            credential
                .refresh_token
                .as_ref()
                .ok_or_else(|| AuthError::ReauthRequired {
                    domain: domain.clone(),
                })?;

        let oauth_client = create_oauth_client(domain, client, None)?;
        let response = oauth_client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.expose().to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| map_token_error(domain, Exchange::RefreshToken, e))?;

        user_credential_from_response(domain, &response, &credential.scopes, Some(refresh_token))
    }
}

impl Default for OAuthAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenAuthenticator for OAuthAuthenticator {
    async fn authorize_user(
        &self,
        domain: &DomainName,
        client: &ClientSecretBundle,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let addr = format!("127.0.0.1:{}", self.callback_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| AuthError::OAuth {
                domain: domain.clone(),
                message: format!("failed to bind to {}: {}", addr, e),
            })?;
        let port = listener
            .local_addr()
            .map_err(|e| AuthError::OAuth {
                domain: domain.clone(),
                message: format!("failed to read listener address: {}", e),
            })?
            .port();

        let flow = PkceFlow::new(
            domain.clone(),
            client.clone(),
            format!("http://127.0.0.1:{}/", port),
        );
        let (auth_url, csrf_state) = flow.build_authorization_url(scopes)?;
        (self.presenter)(&auth_url);

        let code = tokio::time::timeout(
            self.consent_timeout,
            flow.listen_for_callback(&listener, &csrf_state),
        )
        .await
        .map_err(|_| AuthError::AuthTimeout {
            domain: domain.clone(),
            seconds: self.consent_timeout.as_secs(),
        })??;

        tracing::info!("Received authorization code for {}", domain);
        flow.exchange_code(code, scopes).await
    }

    async fn authorize_service_account(
        &self,
        domain: &DomainName,
        key: &ServiceAccountKey,
        subject: Option<&str>,
        scopes: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        exchange_assertion(&self.http, domain, key, subject, scopes).await
    }

    async fn refresh(
        &self,
        credential: &Credential,
        grant: RefreshGrant<'_>,
    ) -> Result<Credential, AuthError> {
        match grant {
            RefreshGrant::RefreshToken(client) => self.refresh_user(credential, client).await,
            RefreshGrant::Assertion(key) => {
                exchange_assertion(
                    &self.http,
                    &credential.domain,
                    key,
                    credential.subject.as_deref(),
                    &credential.scopes,
                )
                .await
            }
        }
    }

    async fn revoke(
        &self,
        credential: &Credential,
        client: Option<&ClientSecretBundle>,
    ) -> Result<(), AuthError> {
        // Assertion tokens are short-lived and have nothing to revoke upstream.
        if credential.kind == TokenKind::ServiceAccount {
            return Ok(());
        }
        let Some(revoke_url) = client.and_then(|c| c.endpoints.revoke_url.as_deref()) else {
            tracing::debug!("No revocation endpoint for {}; skipping", credential.domain);
            return Ok(());
        };

        let token = credential
            .refresh_token
            .as_ref()
            .unwrap_or(&credential.access_token);

        let response = self
            .http
            .post(revoke_url)
            .form(&[("token", token.expose())])
            .send()
            .await
            .map_err(|e| AuthError::Network {
                domain: credential.domain.clone(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            tracing::warn!(
                "Revocation for {} returned {}",
                credential.domain,
                response.status()
            );
        } else {
            tracing::info!("Revoked token for {}", credential.domain);
        }
        Ok(())
    }
}
