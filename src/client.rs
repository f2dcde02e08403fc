//! HTTP transport for the Configuration Manager Administration Service.
//!
//! `AdminServiceClient` wraps a `reqwest::Client` built for one server and
//! carries the connection record (server, site code, certificate policy,
//! credential). It turns a [`ResourcePath`] plus an optional body into one
//! HTTP call and a parsed JSON result.
//!
//! Behavior every caller relies on:
//! - URLs are `{base}{path}` where `base` is `https://{server}/AdminService/`.
//! - Write verbs always send `Content-Type: application/json`. When there is
//!   no payload the body is `{}`; parameterless method calls are rejected
//!   without a content type.
//! - Any non-2xx status becomes `AdminError::Http` with the body preserved.
//!   404 is not interpreted here; the calling operation decides whether it
//!   means "absent" or "not created yet".
//! - With an Entra ID credential, a 401 invalidates the token, refreshes
//!   once and retries exactly once. Other credentials never retry.

use std::time::Duration;

use reqwest::{Client, Method, StatusCode, header};
use secrecy::ExposeSecret;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use url::Url;

use crate::auth::{Credential, TokenProvider};
use crate::error::{AdminError, Result};
use crate::odata::{ResourcePath, list_payload, single_payload};

/// Transport settings that are not part of the connection identity.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// TCP + TLS handshake limit.
    pub connect_timeout: Duration,
    /// Whole-request limit including the response body.
    pub request_timeout: Duration,
    /// Wait between a write and the read-back that reports its result.
    /// The provider commits asynchronously, so an immediate re-fetch can
    /// still return the old state.
    pub propagation_delay: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            propagation_delay: Duration::from_secs(2),
            user_agent: concat!("mecm-admin/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// What the client knows about the server it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Host name (optionally `host:port`) of the SMS Provider.
    pub server_host: String,
    /// Site code reported by the server at connect time.
    pub site_code: Option<String>,
    /// Whether TLS certificate validation is disabled.
    pub skip_certificate_validation: bool,
}

fn build_http_client(config: &ClientConfig, skip_certificate_validation: bool) -> Result<Client> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .user_agent(config.user_agent.clone());

    if skip_certificate_validation {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|e| AdminError::Connection {
        message: "failed to build HTTP client".into(),
        source: Some(Box::new(AdminError::Network(e))),
    })
}

/// Service root for a server host.
pub fn service_root(server_host: &str) -> Result<Url> {
    let host = server_host.trim().trim_end_matches('/');
    if host.is_empty() {
        return Err(AdminError::Validation("server host must not be empty".into()));
    }
    Ok(Url::parse(&format!("https://{host}/AdminService/"))?)
}

/// Authenticated HTTP client bound to one Administration Service.
///
/// This is the explicit connection value: every operation takes a
/// `&AdminServiceClient`, so several servers can be used side by side.
/// The only interior mutability is the token cache, behind a `Mutex`
/// that is never held across an HTTP round-trip.
pub struct AdminServiceClient {
    http: Client,
    base_url: Url,
    connection: Connection,
    credential: Credential,
    token: Option<Mutex<TokenProvider>>,
    config: ClientConfig,
}

impl std::fmt::Debug for AdminServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminServiceClient")
            .field("base_url", &self.base_url.as_str())
            .field("connection", &self.connection)
            .field(
                "credential",
                &if self.token.is_some() { "azure-ad" } else { self.credential.kind() },
            )
            .finish_non_exhaustive()
    }
}

impl AdminServiceClient {
    /// Client for `https://{server_host}/AdminService/`. No request is made;
    /// use [`crate::session::connect`] to validate the server and learn the
    /// site code.
    pub fn new(
        server_host: &str,
        credential: Credential,
        skip_certificate_validation: bool,
        config: ClientConfig,
    ) -> Result<Self> {
        let base = service_root(server_host)?;
        Self::build(
            base,
            server_host.trim().to_string(),
            credential,
            skip_certificate_validation,
            config,
        )
    }

    /// Client with an explicit service root, used by tests to point at a
    /// local mock server. `base_url` must end with `/`.
    pub fn with_base_url(base_url: &str, credential: Credential, config: ClientConfig) -> Result<Self> {
        let base = Url::parse(base_url)?;
        let host = match (base.host_str(), base.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => String::new(),
        };
        Self::build(base, host, credential, false, config)
    }

    pub(crate) fn build(
        base_url: Url,
        server_host: String,
        credential: Credential,
        skip_certificate_validation: bool,
        config: ClientConfig,
    ) -> Result<Self> {
        let http = build_http_client(&config, skip_certificate_validation)?;
        let (credential, token) = match credential {
            Credential::AzureAd(provider) => (Credential::Default, Some(Mutex::new(provider))),
            other => (other, None),
        };
        Ok(AdminServiceClient {
            http,
            base_url,
            connection: Connection {
                server_host,
                site_code: None,
                skip_certificate_validation,
            },
            credential,
            token,
            config,
        })
    }

    pub(crate) fn set_site_code(&mut self, site_code: String) {
        self.connection.site_code = Some(site_code);
    }

    /// The connection record.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Site code learned at connect time.
    pub fn site_code(&self) -> Option<&str> {
        self.connection.site_code.as_deref()
    }

    /// The service root all paths are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Transport settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sleeps for the configured propagation delay. Called between a write
    /// and the read-back that reports its result.
    pub async fn wait_for_propagation(&self) {
        if !self.config.propagation_delay.is_zero() {
            trace!(delay = ?self.config.propagation_delay, "waiting for provider to commit");
            tokio::time::sleep(self.config.propagation_delay).await;
        }
    }

    // ── Token handling ───────────────────────────────────────────────

    async fn bearer_token(&self) -> Result<Option<String>> {
        let Some(token) = &self.token else {
            return Ok(None);
        };
        let mut provider = token.lock().await;
        if provider.token().is_none() {
            provider.refresh_token().await?;
        }
        provider
            .token()
            .map(|t| Some(t.to_owned()))
            .ok_or_else(|| AdminError::Auth {
                message: "token missing after refresh".into(),
                source: None,
            })
    }

    async fn force_refresh(&self) -> Result<Option<String>> {
        let Some(token) = &self.token else {
            return Ok(None);
        };
        let mut provider = token.lock().await;
        provider.invalidate();
        provider.refresh_token().await?;
        provider
            .token()
            .map(|t| Some(t.to_owned()))
            .ok_or_else(|| AdminError::Auth {
                message: "token missing after forced refresh".into(),
                source: None,
            })
    }

    // ── Request plumbing ─────────────────────────────────────────────

    fn build_request(
        &self,
        method: Method,
        url: &Url,
        bearer: Option<&str>,
        body: Option<&[u8]>,
    ) -> reqwest::RequestBuilder {
        let is_write = method != Method::GET && method != Method::HEAD;
        let mut req = self
            .http
            .request(method, url.clone())
            .header(header::ACCEPT, "application/json");

        req = match (&self.credential, bearer) {
            (_, Some(token)) => req.bearer_auth(token),
            (Credential::Basic { username, password }, None) => {
                req.basic_auth(username, Some(password.expose_secret()))
            }
            _ => req,
        };

        if is_write {
            req = req
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.map_or_else(|| b"{}".to_vec(), <[u8]>::to_vec));
        }
        req
    }

    /// Sends one request and returns the parsed JSON body.
    ///
    /// Empty 2xx bodies (204, or a DELETE with no content) come back as
    /// `Value::Null`.
    pub async fn send(
        &self,
        method: Method,
        path: &ResourcePath,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = path.to_url(&self.base_url)?;
        let payload = body.map(serde_json::to_vec).transpose()?;
        debug!(%method, %url, "admin service request");
        if let Some(p) = &payload {
            trace!(bytes = p.len(), "request body");
        }

        let bearer = self.bearer_token().await?;
        let resp = self
            .build_request(method.clone(), &url, bearer.as_deref(), payload.as_deref())
            .send()
            .await?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED && self.token.is_some() {
            warn!(%url, "401 from admin service; refreshing token and retrying once");
            let fresh = self.force_refresh().await?;
            self.build_request(method, &url, fresh.as_deref(), payload.as_deref())
                .send()
                .await?
        } else {
            resp
        };

        Self::parse_response(resp).await
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let text = resp.text().await?;
        trace!(%status, bytes = text.len(), "admin service response");

        if !status.is_success() {
            return Err(AdminError::Http { status, body: text });
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    // ── Typed helpers ────────────────────────────────────────────────

    /// GET and return the raw JSON body.
    pub async fn get_value(&self, path: &ResourcePath) -> Result<Value> {
        self.send(Method::GET, path, None).await
    }

    /// GET a list endpoint and deserialize each item.
    pub async fn get_list<T: DeserializeOwned>(&self, path: &ResourcePath) -> Result<Vec<T>> {
        let body = self.get_value(path).await?;
        list_payload(body)
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(AdminError::from))
            .collect()
    }

    /// GET one object, accepting both a bare object and a one-item
    /// envelope. `None` when the envelope is empty.
    pub async fn get_single<T: DeserializeOwned>(&self, path: &ResourcePath) -> Result<Option<T>> {
        let body = self.get_value(path).await?;
        single_payload(body)
            .map(|item| serde_json::from_value(item).map_err(AdminError::from))
            .transpose()
    }

    /// POST a JSON body and return the raw response.
    pub async fn post<B: Serialize + ?Sized>(&self, path: &ResourcePath, body: &B) -> Result<Value> {
        let body = serde_json::to_value(body)?;
        self.send(Method::POST, path, Some(&body)).await
    }

    /// POST with no payload (parameterless method call).
    pub async fn post_empty(&self, path: &ResourcePath) -> Result<Value> {
        self.send(Method::POST, path, None).await
    }

    /// PUT a JSON body and return the raw response.
    pub async fn put<B: Serialize + ?Sized>(&self, path: &ResourcePath, body: &B) -> Result<Value> {
        let body = serde_json::to_value(body)?;
        self.send(Method::PUT, path, Some(&body)).await
    }

    /// DELETE an instance.
    pub async fn delete(&self, path: &ResourcePath) -> Result<()> {
        self.send(Method::DELETE, path, None).await.map(|_| ())
    }
}
