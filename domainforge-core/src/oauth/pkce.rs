//! Authorization Code flow with PKCE (Proof Key for Code Exchange).
//!
//! This module implements the OAuth 2.0 Authorization Code flow with PKCE
//! and a loopback redirect, which is how an installed application obtains
//! user consent for a domain.
//!
//! # Flow Overview
//!
//! 1. Generate PKCE code verifier and challenge
//! 2. Build authorization URL with state, PKCE challenge and offline access
//! 3. User authorizes in browser
//! 4. Receive authorization code via the loopback redirect
//! 5. Exchange code for tokens using PKCE verifier
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use domainforge_core::{ClientSecretBundle, DomainName, ScopeSet};
//! use domainforge_core::oauth::pkce::PkceFlow;
//! use tokio::net::TcpListener;
//!
//! let domain = DomainName::parse("example.com")?;
//! let client = ClientSecretBundle::new("my-client-id", None);
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let redirect = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
//!
//! let flow = PkceFlow::new(domain, client, redirect);
//! let scopes = ScopeSet::parse(["https://www.googleapis.com/auth/admin.directory.user"])?;
//! let (auth_url, csrf_state) = flow.build_authorization_url(&scopes)?;
//! println!("Visit: {}", auth_url);
//!
//! let code = flow.listen_for_callback(&listener, &csrf_state).await?;
//! let credential = flow.exchange_code(code, &scopes).await?;
//! # Ok(())
//! # }
//! ```

use oauth2::{
    AuthorizationCode, CsrfToken, PkceCodeChallenge, PkceCodeVerifier, Scope,
    reqwest::async_http_client,
};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

use super::{Exchange, create_oauth_client, map_token_error, user_credential_from_response};
use crate::client_secrets::ClientSecretBundle;
use crate::model::{DomainName, ScopeSet};
use crate::token::{AuthError, Credential};

const SUCCESS_PAGE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n\
    <html><body><h1>Authentication Successful!</h1>\
    <p>You can close this window and return to your terminal.</p></body></html>";

const FAILURE_PAGE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n\
    <html><body><h1>Authentication Failed</h1>\
    <p>Return to your terminal for details.</p></body></html>";

const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n\
    <html><body><h1>Bad Request</h1></body></html>";

/// Outcome of one request hitting the loopback listener.
#[derive(Debug, PartialEq)]
enum Callback {
    Code(String),
    Failed(CallbackFailure),
    Ignored,
}

#[derive(Debug, PartialEq)]
enum CallbackFailure {
    Denied,
    InvalidScope(String),
    Provider(String),
    StateMismatch,
}

/// PKCE flow for one domain's consent.
///
/// This struct manages the PKCE code verifier/challenge and provides methods
/// for building the authorization URL, receiving the redirect and exchanging
/// the authorization code for a [`Credential`].
pub struct PkceFlow {
    domain: DomainName,
    client: ClientSecretBundle,
    redirect_uri: String,
    verifier: Mutex<Option<PkceCodeVerifier>>,
}

impl PkceFlow {
    /// Create a new PKCE flow.
    ///
    /// # Arguments
    ///
    /// * `domain` - Domain being authorized; sent as the hosted-domain hint
    /// * `client` - OAuth client credentials and endpoints
    /// * `redirect_uri` - Loopback redirect URI the listener is bound to
    pub fn new(domain: DomainName, client: ClientSecretBundle, redirect_uri: String) -> Self {
        Self {
            domain,
            client,
            redirect_uri,
            verifier: Mutex::new(None),
        }
    }

    /// Build an authorization URL for the user to visit.
    ///
    /// This generates a new PKCE code verifier and challenge, and constructs
    /// the authorization URL with the challenge, a CSRF state token and a
    /// request for offline access so the grant includes a refresh token.
    ///
    /// # Returns
    ///
    /// A tuple of (authorization URL, CSRF state token). The state token must
    /// be verified when receiving the redirect.
    pub fn build_authorization_url(
        &self,
        scopes: &ScopeSet,
    ) -> Result<(String, String), AuthError> {
        let client = create_oauth_client(&self.domain, &self.client, Some(&self.redirect_uri))?;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        *self.verifier.lock() = Some(pkce_verifier);

        let mut auth_request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .add_extra_param("hd", self.domain.as_str());

        for scope in scopes.iter() {
            auth_request = auth_request.add_scope(Scope::new(scope.to_string()));
        }

        let (url, csrf_state) = auth_request.url();

        Ok((url.to_string(), csrf_state.secret().to_string()))
    }

    /// Exchange an authorization code for a credential.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The PKCE verifier is not available (authorization URL not generated)
    /// - The provider rejects the code or a scope
    /// - Network errors occur
    pub async fn exchange_code(
        &self,
        code: impl Into<String>,
        requested: &ScopeSet,
    ) -> Result<Credential, AuthError> {
        let verifier = self
            .verifier
            .lock()
            .take()
            .ok_or_else(|| AuthError::OAuth {
                domain: self.domain.clone(),
                message: "PKCE verifier not found; build the authorization URL first".to_string(),
            })?;

        let client = create_oauth_client(&self.domain, &self.client, Some(&self.redirect_uri))?;

        let response = client
            .exchange_code(AuthorizationCode::new(code.into()))
            .set_pkce_verifier(verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| map_token_error(&self.domain, Exchange::AuthorizationCode, e))?;

        user_credential_from_response(&self.domain, &response, requested, None)
    }

    /// Accept connections on `listener` until the OAuth redirect arrives.
    ///
    /// Requests without OAuth parameters (favicon fetches and the like) are
    /// answered with 400 and ignored. The caller bounds the wait.
    pub async fn listen_for_callback(
        &self,
        listener: &TcpListener,
        expected_state: &str,
    ) -> Result<String, AuthError> {
        let oauth_err = |message: String| AuthError::OAuth {
            domain: self.domain.clone(),
            message,
        };

        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Listening for OAuth callback on {}", addr);
        }

        loop {
            let (mut socket, _) = listener
                .accept()
                .await
                .map_err(|e| oauth_err(format!("failed to accept connection: {}", e)))?;

            let mut buffer = [0; 4096];
            let n = socket
                .read(&mut buffer)
                .await
                .map_err(|e| oauth_err(format!("failed to read request: {}", e)))?;

            let request = String::from_utf8_lossy(&buffer[..n]);

            match parse_callback(&request, expected_state) {
                Callback::Code(code) => {
                    let _ = socket.write_all(SUCCESS_PAGE).await;
                    return Ok(code);
                }
                Callback::Failed(failure) => {
                    let _ = socket.write_all(FAILURE_PAGE).await;
                    return Err(self.callback_error(failure));
                }
                Callback::Ignored => {
                    let _ = socket.write_all(BAD_REQUEST).await;
                }
            }
        }
    }

    fn callback_error(&self, failure: CallbackFailure) -> AuthError {
        let domain = self.domain.clone();
        match failure {
            CallbackFailure::Denied => AuthError::AuthDenied { domain },
            CallbackFailure::InvalidScope(scope) => AuthError::InvalidScope { domain, scope },
            CallbackFailure::Provider(error) => AuthError::OAuth {
                domain,
                message: format!("OAuth provider returned error: {}", error),
            },
            CallbackFailure::StateMismatch => AuthError::OAuth {
                domain,
                message: "state parameter mismatch".to_string(),
            },
        }
    }
}

/// Interpret the request line of an HTTP request hitting the redirect URI.
fn parse_callback(request: &str, expected_state: &str) -> Callback {
    let Some(target) = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
    else {
        return Callback::Ignored;
    };

    // The target is origin-form; any base works for parsing the query.
    let Ok(url) = Url::parse("http://127.0.0.1").and_then(|base| base.join(target)) else {
        return Callback::Ignored;
    };

    let mut code = None;
    let mut state = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        let failure = match error.as_str() {
            "access_denied" => CallbackFailure::Denied,
            "invalid_scope" => CallbackFailure::InvalidScope(description.unwrap_or_default()),
            _ => CallbackFailure::Provider(error),
        };
        return Callback::Failed(failure);
    }

    match (code, state) {
        (Some(_), Some(state)) if state != expected_state => {
            Callback::Failed(CallbackFailure::StateMismatch)
        }
        (Some(code), Some(_)) => Callback::Code(code),
        (Some(_), None) => Callback::Failed(CallbackFailure::StateMismatch),
        _ => Callback::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_secrets::OAuthEndpoints;

    fn flow(redirect: &str) -> PkceFlow {
        let client = ClientSecretBundle::new("client-id", None).with_endpoints(OAuthEndpoints {
            auth_url: "https://example.com/auth".to_string(),
            token_url: "https://example.com/token".to_string(),
            revoke_url: None,
        });
        PkceFlow::new(
            DomainName::parse("example.com").unwrap(),
            client,
            redirect.to_string(),
        )
    }

    #[test]
    fn test_build_authorization_url() {
        let flow = flow("http://127.0.0.1:8080/");
        let scopes = ScopeSet::parse(["read", "write"]).unwrap();

        let (url, state) = flow.build_authorization_url(&scopes).unwrap();

        assert!(url.starts_with("https://example.com/auth"));
        assert!(url.contains("client_id=client-id"));
        assert!(url.contains("code_challenge="));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("hd=example.com"));
        assert!(url.contains("scope=read+write"));
        assert!(!state.is_empty());
    }

    #[tokio::test]
    async fn test_exchange_without_url_fails() {
        let flow = flow("http://127.0.0.1:8080/");
        let result = flow.exchange_code("code", &ScopeSet::new()).await;
        assert!(matches!(result, Err(AuthError::OAuth { .. })));
    }

    #[test]
    fn test_parse_callback_code() {
        let request = "GET /?state=abc&code=4%2Fxyz&scope=read HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(
            parse_callback(request, "abc"),
            Callback::Code("4/xyz".to_string())
        );
    }

    #[test]
    fn test_parse_callback_errors() {
        assert_eq!(
            parse_callback("GET /?error=access_denied&state=abc HTTP/1.1", "abc"),
            Callback::Failed(CallbackFailure::Denied)
        );
        assert_eq!(
            parse_callback(
                "GET /?error=invalid_scope&error_description=bad+scope HTTP/1.1",
                "abc"
            ),
            Callback::Failed(CallbackFailure::InvalidScope("bad scope".to_string()))
        );
        assert_eq!(
            parse_callback("GET /?code=c&state=other HTTP/1.1", "abc"),
            Callback::Failed(CallbackFailure::StateMismatch)
        );
    }

    #[test]
    fn test_parse_callback_ignores_unrelated_requests() {
        assert_eq!(
            parse_callback("GET /favicon.ico HTTP/1.1", "abc"),
            Callback::Ignored
        );
        assert_eq!(parse_callback("", "abc"), Callback::Ignored);
    }

    #[tokio::test]
    async fn test_listen_for_callback_receives_code() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let flow = flow(&format!("http://127.0.0.1:{}/", port));

        let browser = tokio::spawn(async move {
            let mut stray = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            stray
                .write_all(b"GET /favicon.ico HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
            let mut sink = Vec::new();
            let _ = stray.read_to_end(&mut sink).await;

            let mut redirect = tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .unwrap();
            redirect
                .write_all(b"GET /?code=the-code&state=s1 HTTP/1.1\r\n\r\n")
                .await
                .unwrap();
        });

        let code = flow.listen_for_callback(&listener, "s1").await.unwrap();
        assert_eq!(code, "the-code");
        browser.await.unwrap();
    }
}
