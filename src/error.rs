//! Typed error hierarchy for the mecm-admin crate.
//!
//! `AdminError` covers every failure boundary a caller can hit: the session
//! (nothing connected, connect rejected), the HTTP transport, the name
//! resolver, and the entity-level preconditions checked before any write.
//!
//! Design rationale:
//! - Resolver outcomes (`NotFound`, `AmbiguousName`) are ordinary variants,
//!   not panics or stringly errors, so a batch can record them per item and
//!   carry on.
//! - `Http` keeps the status and the raw body. The Admin Service returns a
//!   WMI error document on failure, and 404 means different things to
//!   different callers (absent entity vs. settings object not created yet),
//!   so the status must survive to the call site.
//! - `Connection` and `Auth` chain their cause through `#[source]`.

use reqwest::StatusCode;

/// Unified error type for all mecm-admin library operations.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// No active connection, or the connect handshake failed.
    ///
    /// When a connect attempt was rejected (unreachable host, 401, TLS
    /// failure) the underlying error is available via `source()`.
    #[error("connection error: {message}")]
    Connection {
        /// What went wrong, including the server host when known.
        message: String,
        /// The transport or HTTP error that caused the failure, if any.
        #[source]
        source: Option<Box<AdminError>>,
    },

    /// Token acquisition failed for an Entra ID (Azure AD) credential.
    #[error("authentication failed: {message}")]
    Auth {
        /// Human-readable description, including the token endpoint's
        /// status and error body when available.
        message: String,
        /// The underlying transport or parse error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The Admin Service returned a non-success HTTP status code.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code returned by the server.
        status: StatusCode,
        /// Raw response body (WMI error document or empty string).
        body: String,
    },

    /// A required lookup matched nothing.
    #[error("{resource_class} '{identifier}' was not found")]
    NotFound {
        /// WMI class or logical resource name (e.g. `SMS_Collection`).
        resource_class: String,
        /// The name, key or pattern that was looked up.
        identifier: String,
    },

    /// A lookup that must match exactly one entity matched several.
    #[error("{resource_class} name '{identifier}' is ambiguous: {count} matches")]
    AmbiguousName {
        /// WMI class that was queried.
        resource_class: String,
        /// The name that was looked up.
        identifier: String,
        /// Number of entities sharing that name.
        count: usize,
    },

    /// A create operation hit an existing entity with the same identity.
    #[error("{resource_class} '{identifier}' already exists")]
    AlreadyExists {
        /// The kind of thing being created (e.g. `collection variable`).
        resource_class: String,
        /// The conflicting name.
        identifier: String,
    },

    /// A write targeted a built-in collection.
    #[error("'{identifier}' is a built-in collection and cannot be modified")]
    ProtectedEntity {
        /// The protected collection ID.
        identifier: String,
    },

    /// The caller supplied conflicting or insufficient parameters.
    /// Always raised before any network call.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Polling for a script execution exceeded its timeout.
    #[error("polling timed out after {elapsed:?} for operation {operation_id}")]
    Timeout {
        /// Elapsed time when the timeout was detected.
        elapsed: std::time::Duration,
        /// Client operation ID being polled.
        operation_id: u64,
    },

    /// JSON (de)serialization failed for a request or response body.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// DNS, TCP, TLS or timeout failure below the HTTP layer.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A server host or base URL could not be turned into a valid URL.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
}

impl AdminError {
    /// Builds a `Connection` error with no underlying cause.
    pub fn not_connected() -> Self {
        AdminError::Connection {
            message: "not connected to an Administration Service; call connect first".into(),
            source: None,
        }
    }

    /// `true` for HTTP 404 and for the resolver's zero-match case.
    pub fn is_not_found(&self) -> bool {
        match self {
            AdminError::Http { status, .. } => *status == StatusCode::NOT_FOUND,
            AdminError::NotFound { .. } => true,
            _ => false,
        }
    }

    /// `true` when a retried create found its own earlier write.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, AdminError::AlreadyExists { .. })
    }

    /// The HTTP status carried by this error, if it came from the server.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            AdminError::Http { status, .. } => Some(*status),
            AdminError::Connection {
                source: Some(inner),
                ..
            } => inner.status(),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, AdminError>;
