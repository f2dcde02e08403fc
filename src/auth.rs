//! Credentials for the Administration Service.
//!
//! The Admin Service itself does not define an authentication protocol;
//! whatever the HTTP stack can present is accepted by IIS in front of it.
//! `Credential` covers the three cases this crate supports:
//!
//! - `Default` — send nothing and let the environment (an authenticating
//!   proxy, a pre-authorized network path) handle it.
//! - `Basic` — username and password on every request.
//! - `AzureAd` — an OAuth2 client-credentials bearer token, used when the
//!   service is published through a cloud management gateway. The token is
//!   cached in [`TokenProvider`] and refreshed on demand by the client.

use std::time::Instant;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AdminError, Result};

/// Default Entra ID authority. `{tenant_id}` is replaced at runtime.
const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token";

/// Refresh this long before the advertised expiry so a request never races
/// the boundary.
const EXPIRY_BUFFER_SECS: u64 = 60;

/// How requests to the Admin Service authenticate.
#[derive(Debug, Default)]
pub enum Credential {
    /// No Authorization header.
    #[default]
    Default,
    /// HTTP basic authentication.
    Basic {
        /// Account name, usually `DOMAIN\user` or a UPN.
        username: String,
        /// Account password.
        password: SecretString,
    },
    /// Bearer token from the Entra ID token endpoint.
    AzureAd(TokenProvider),
}

impl Credential {
    /// Basic credential from a username and a plain password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// Short label for logs; never includes secret material.
    pub fn kind(&self) -> &'static str {
        match self {
            Credential::Default => "default",
            Credential::Basic { .. } => "basic",
            Credential::AzureAd(_) => "azure-ad",
        }
    }
}

/// Form body sent to the token endpoint.
#[derive(Serialize)]
struct TokenRequest<'a> {
    client_id: &'a str,
    scope: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
}

/// Subset of the token response we use; extra fields are ignored.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Acquires and caches client-credentials tokens.
///
/// Invariants:
/// - `token` is `None` until the first successful `refresh_token()` call.
/// - `acquired_at` is `Some` whenever `token` is `Some`.
pub struct TokenProvider {
    http: reqwest::Client,
    token_url: String,
    scope: String,
    client_id: String,
    client_secret: SecretString,
    token: Option<(SecretString, u64)>,
    acquired_at: Option<Instant>,
}

impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenProvider")
            .field("token_url", &self.token_url)
            .field("scope", &self.scope)
            .field("client_id", &self.client_id)
            .field("has_token", &self.token.is_some())
            .finish_non_exhaustive()
    }
}

impl TokenProvider {
    /// Provider for the public Entra ID authority.
    pub fn new(tenant_id: &str, client_id: &str, client_secret: &str, scope: &str) -> Self {
        let url = DEFAULT_TOKEN_URL.replace("{tenant_id}", tenant_id);
        Self::with_token_url(&url, client_id, client_secret, scope)
    }

    /// Provider against an explicit token endpoint (sovereign clouds, tests).
    pub fn with_token_url(token_url: &str, client_id: &str, client_secret: &str, scope: &str) -> Self {
        TokenProvider {
            http: reqwest::Client::new(),
            token_url: token_url.to_string(),
            scope: scope.to_string(),
            client_id: client_id.to_string(),
            client_secret: SecretString::from(client_secret.to_string()),
            token: None,
            acquired_at: None,
        }
    }

    /// Provider holding a pre-issued token that is treated as fresh for an
    /// hour. Refreshing it will fail because no endpoint is configured.
    pub fn with_token(token: &str) -> Self {
        TokenProvider {
            http: reqwest::Client::new(),
            token_url: String::new(),
            scope: String::new(),
            client_id: String::new(),
            client_secret: SecretString::from(String::new()),
            token: Some((SecretString::from(token.to_string()), 3600)),
            acquired_at: Some(Instant::now()),
        }
    }

    /// Fetches a new token and caches it.
    ///
    /// The body is read as text before the status check so the endpoint's
    /// AADSTS diagnostics end up in the error message.
    pub async fn refresh_token(&mut self) -> Result<()> {
        if self.token_url.is_empty() {
            return Err(AdminError::Auth {
                message: "no token endpoint configured".into(),
                source: None,
            });
        }

        let form = TokenRequest {
            client_id: &self.client_id,
            scope: &self.scope,
            client_secret: self.client_secret.expose_secret(),
            grant_type: "client_credentials",
        };

        debug!(url = %self.token_url, "requesting access token");
        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AdminError::Auth {
                message: "token endpoint unreachable".into(),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AdminError::Auth {
            message: "failed to read token response".into(),
            source: Some(Box::new(e)),
        })?;

        if !status.is_success() {
            return Err(AdminError::Auth {
                message: format!("token request failed ({status}): {body}"),
                source: None,
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| AdminError::Auth {
            message: "failed to parse token response".into(),
            source: Some(Box::new(e)),
        })?;

        self.token = Some((SecretString::from(parsed.access_token), parsed.expires_in));
        self.acquired_at = Some(Instant::now());
        Ok(())
    }

    /// Drops the cached token so the next request refreshes.
    pub fn invalidate(&mut self) {
        self.token = None;
        self.acquired_at = None;
    }

    fn is_expired(&self) -> bool {
        match (&self.token, self.acquired_at) {
            (Some((_, expires_in)), Some(acquired)) => {
                let lifetime = expires_in.saturating_sub(EXPIRY_BUFFER_SECS);
                acquired.elapsed().as_secs() >= lifetime
            }
            _ => false,
        }
    }

    /// The cached token, or `None` if absent or inside the expiry buffer.
    pub fn token(&self) -> Option<&str> {
        if self.is_expired() {
            return None;
        }
        self.token.as_ref().map(|(t, _)| t.expose_secret())
    }
}
