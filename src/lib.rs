//! Async Rust client library for the Configuration Manager (MECM/SCCM)
//! Administration Service.
//!
//! Provides an authenticated transport over the service's OData `wmi/`
//! route, a resolver that turns display names into canonical keys with an
//! exactly-one-match rule, and typed operations for collections, devices,
//! variables, membership rules and Run Scripts.
//!
//! # Modules
//!
//! - [`auth`] — Basic and Entra ID client-credential authentication.
//! - [`batch`] — Per-item outcome reports for wildcard operations.
//! - [`client`] — Authenticated HTTP wrapper (`AdminServiceClient`).
//! - [`collections`] — Collection CRUD, refresh and membership listing.
//! - [`devices`] — Device lookup.
//! - [`error`] — Typed error hierarchy (`AdminError`).
//! - [`odata`] — Resource paths, `$filter` builder and envelope handling.
//! - [`resolver`] — Name-to-key resolution and wildcard matching.
//! - [`rules`] — Direct, query, include and exclude membership rules.
//! - [`scripts`] — Script invocation, status and polling.
//! - [`session`] — `connect` and the optional process-wide session.
//! - [`variables`] — Device and collection variables.
//!
//! # Quick Start
//!
//! ```ignore
//! use mecm_admin::auth::Credential;
//! use mecm_admin::resolver::EntityRef;
//! use mecm_admin::rules::add_direct_rule;
//! use mecm_admin::session::{ConnectOptions, connect};
//!
//! let client = connect(
//!     ConnectOptions::new("cm01.contoso.com")
//!         .credential(Credential::basic("CONTOSO\\cmadmin", "..."))
//! ).await?;
//! add_direct_rule(
//!     &client,
//!     &EntityRef::name("Test Collection"),
//!     &EntityRef::name("PC-001"),
//! ).await?;
//! ```

#![warn(missing_docs)]

pub mod auth;
pub mod batch;
pub mod client;
pub mod collections;
pub mod devices;
pub mod error;
pub mod odata;
pub mod resolver;
pub mod rules;
pub mod scripts;
pub mod session;
pub mod variables;
