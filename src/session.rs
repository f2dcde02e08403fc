//! Connecting to an Administration Service.
//!
//! [`connect`] builds an [`AdminServiceClient`], proves the server answers
//! by reading its site record, and returns the client with the site code
//! filled in. That client is the connection: pass it to every operation.
//!
//! [`Session`] exists for callers that want one ambient connection per
//! process (the CLI, scripts ported from the console cmdlets). It holds at
//! most one client; a successful connect replaces it, a failed connect
//! leaves whatever was there.

use std::sync::{Arc, OnceLock};

use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::auth::Credential;
use crate::client::{AdminServiceClient, ClientConfig, service_root};
use crate::error::{AdminError, Result};
use crate::odata::ResourcePath;

/// Lightweight endpoint read at connect time.
const SITE_CLASS: &str = "SMS_Site";

/// Everything needed to open a connection.
#[derive(Debug, Default)]
pub struct ConnectOptions {
    /// SMS Provider host, optionally with `:port`.
    pub server: String,
    /// How to authenticate.
    pub credential: Credential,
    /// Accept any TLS certificate (lab servers with self-signed certs).
    pub skip_certificate_validation: bool,
    /// Service root override; replaces `https://{server}/AdminService/`.
    pub base_url: Option<String>,
    /// Timeouts and propagation delay.
    pub config: ClientConfig,
}

impl ConnectOptions {
    /// Options for `server` with the default credential and settings.
    pub fn new(server: impl Into<String>) -> Self {
        ConnectOptions {
            server: server.into(),
            ..Default::default()
        }
    }

    /// Sets the credential.
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    /// Disables TLS certificate validation.
    pub fn skip_certificate_validation(mut self, skip: bool) -> Self {
        self.skip_certificate_validation = skip;
        self
    }

    /// Overrides the service root.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Replaces the transport settings.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SiteRecord {
    site_code: String,
}

/// Opens a connection and learns the site code.
///
/// # Errors
///
/// - `AdminError::Validation` — empty server host (no request made).
/// - `AdminError::Connection` — the site record could not be read; the
///   HTTP status or transport failure is the error's source.
pub async fn connect(options: ConnectOptions) -> Result<AdminServiceClient> {
    let server = options.server.trim().to_string();
    if server.is_empty() {
        return Err(AdminError::Validation("server host must not be empty".into()));
    }

    let base_url = match &options.base_url {
        Some(base) => url::Url::parse(base)?,
        None => service_root(&server)?,
    };

    let mut client = AdminServiceClient::build(
        base_url,
        server.clone(),
        options.credential,
        options.skip_certificate_validation,
        options.config,
    )?;

    let path = ResourcePath::class(SITE_CLASS).select(&["SiteCode"]);
    let site: Option<SiteRecord> = client.get_single(&path).await.map_err(|e| {
        AdminError::Connection {
            message: format!("failed to connect to {server}"),
            source: Some(Box::new(e)),
        }
    })?;

    let Some(site) = site else {
        return Err(AdminError::Connection {
            message: format!("{server} returned no site information"),
            source: None,
        });
    };

    info!(server = %server, site_code = %site.site_code, "connected to admin service");
    client.set_site_code(site.site_code);
    Ok(client)
}

/// Process-wide holder for one active connection.
#[derive(Debug, Default)]
pub struct Session {
    current: RwLock<Option<Arc<AdminServiceClient>>>,
}

impl Session {
    /// An empty session.
    pub fn new() -> Self {
        Session::default()
    }

    /// The process-wide session.
    pub fn global() -> &'static Session {
        static GLOBAL: OnceLock<Session> = OnceLock::new();
        GLOBAL.get_or_init(Session::new)
    }

    /// Connects and, on success, replaces the stored connection. On
    /// failure the previous connection stays in place.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Arc<AdminServiceClient>> {
        let client = Arc::new(connect(options).await?);
        *self.current.write().await = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Stores an already-built client as the active connection.
    pub async fn replace(&self, client: AdminServiceClient) -> Arc<AdminServiceClient> {
        let client = Arc::new(client);
        *self.current.write().await = Some(Arc::clone(&client));
        client
    }

    /// The active connection.
    ///
    /// # Errors
    ///
    /// `AdminError::Connection` when nothing has connected yet.
    pub async fn current(&self) -> Result<Arc<AdminServiceClient>> {
        self.current
            .read()
            .await
            .clone()
            .ok_or_else(AdminError::not_connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_session_is_not_connected() {
        let session = Session::new();
        let err = session.current().await.unwrap_err();
        assert!(matches!(err, AdminError::Connection { source: None, .. }));
    }

    #[tokio::test]
    async fn connect_rejects_empty_server_without_network() {
        let err = connect(ConnectOptions::new("   ")).await.unwrap_err();
        assert!(matches!(err, AdminError::Validation(_)));
    }

    #[tokio::test]
    async fn replace_sets_current() {
        let session = Session::new();
        let client = AdminServiceClient::new(
            "cm01.contoso.com",
            Credential::Default,
            false,
            ClientConfig::default(),
        )
        .unwrap();
        session.replace(client).await;
        let current = session.current().await.unwrap();
        assert_eq!(current.connection().server_host, "cm01.contoso.com");
    }

    #[test]
    fn options_builder_sets_fields() {
        let opts = ConnectOptions::new("cm01")
            .skip_certificate_validation(true)
            .base_url("http://127.0.0.1:8080/");
        assert_eq!(opts.server, "cm01");
        assert!(opts.skip_certificate_validation);
        assert_eq!(opts.base_url.as_deref(), Some("http://127.0.0.1:8080/"));
    }
}
