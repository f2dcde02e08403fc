//! Collection lookup and management.
//!
//! | Function | Request |
//! |----------|---------|
//! | [`list_collections`] | GET `wmi/SMS_Collection[?$filter=...]` |
//! | [`get_collection`] | GET `wmi/SMS_Collection('{id}')` |
//! | [`find_collections`] | GET `wmi/SMS_Collection`, wildcard applied locally |
//! | [`new_collection`] | POST `wmi/SMS_Collection` |
//! | [`set_collection`] | PUT `wmi/SMS_Collection('{id}')` |
//! | [`remove_collection`] / [`remove_collections`] | DELETE `wmi/SMS_Collection('{id}')` |
//! | [`invoke_collection_update`] | POST `.../AdminService.RequestRefresh` |
//! | [`get_collection_members`] | GET `wmi/SMS_FullCollectionMembership` |
//!
//! Built-in collections (All Systems, All Users, ...) are read-only here:
//! any write naming one fails with `AdminError::ProtectedEntity` before the
//! mutating request. When the caller passes the key, that happens before
//! any request at all.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::batch::BatchReport;
use crate::client::AdminServiceClient;
use crate::error::{AdminError, Result};
use crate::odata::{Filter, Key, ResourcePath, strip_annotations};
use crate::resolver::{
    self, COLLECTION, EntityRef, GlobPattern, filter_by_pattern, has_wildcards,
};

/// Collection IDs the site creates at install time.
pub const PROTECTED_COLLECTIONS: &[&str] = &[
    "SMS00001", // All Systems
    "SMS00002", // All Users
    "SMS00003", // All Users and User Groups
    "SMS00004", // All User Groups
    "SMSDM001", // All Mobile Devices
    "SMSDM003", // All Desktop and Server Clients
    "SMS000US", // All Unknown Computers
];

/// A device or user collection.
///
/// Only the properties this crate reasons about are typed; everything else
/// the provider returns is kept in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Collection {
    /// Canonical key, e.g. `PS100012`.
    #[serde(rename = "CollectionID")]
    pub collection_id: String,

    /// Display name. Not unique.
    pub name: String,

    /// Free-text comment.
    #[serde(default)]
    pub comment: Option<String>,

    /// Limiting collection key.
    #[serde(rename = "LimitToCollectionID", default)]
    pub limit_to_collection_id: Option<String>,

    /// Limiting collection name.
    #[serde(default)]
    pub limit_to_collection_name: Option<String>,

    /// `1` = user collection, `2` = device collection.
    #[serde(default)]
    pub collection_type: Option<u32>,

    /// Evaluated member count.
    #[serde(default)]
    pub member_count: Option<i64>,

    /// Membership refresh mode bit field.
    #[serde(default)]
    pub refresh_type: Option<u32>,

    /// Set by the provider on site-created collections.
    #[serde(default)]
    pub is_built_in: Option<bool>,

    /// Remaining provider properties, passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Kind of members a collection holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    /// Users and user groups.
    User,
    /// Devices.
    Device,
}

impl CollectionKind {
    /// The `CollectionType` value.
    pub fn wmi_value(self) -> u32 {
        match self {
            CollectionKind::User => 1,
            CollectionKind::Device => 2,
        }
    }
}

/// How membership gets re-evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshType {
    /// Only on demand.
    Manual,
    /// On the collection's schedule.
    Periodic,
    /// Incremental updates.
    Continuous,
    /// Schedule plus incremental updates.
    Both,
}

impl RefreshType {
    /// The `RefreshType` value.
    pub fn wmi_value(self) -> u32 {
        match self {
            RefreshType::Manual => 1,
            RefreshType::Periodic => 2,
            RefreshType::Continuous => 4,
            RefreshType::Both => 6,
        }
    }
}

/// Input for [`new_collection`].
#[derive(Debug, Clone)]
pub struct NewCollection {
    /// Display name; must not already be in use.
    pub name: String,
    /// Collection whose members bound this one.
    pub limiting_collection: EntityRef,
    /// Device or user collection.
    pub kind: CollectionKind,
    /// Optional comment.
    pub comment: Option<String>,
    /// Refresh mode; the provider default applies when `None`.
    pub refresh_type: Option<RefreshType>,
}

/// Input for [`set_collection`]. `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct CollectionUpdate {
    /// New display name.
    pub name: Option<String>,
    /// New comment.
    pub comment: Option<String>,
    /// New refresh mode.
    pub refresh_type: Option<RefreshType>,
}

impl CollectionUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none() && self.comment.is_none() && self.refresh_type.is_none()
    }
}

/// A resolved member of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CollectionMember {
    /// Device or user resource key.
    #[serde(rename = "ResourceID")]
    pub resource_id: i64,
    /// Member name.
    #[serde(default)]
    pub name: Option<String>,
    /// `5` for systems, `4` for users.
    #[serde(default)]
    pub resource_type: Option<i64>,
    /// Whether the device has the client installed.
    #[serde(default)]
    pub is_client: Option<bool>,
    /// Remaining provider properties.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ── Protection ─────────────────────────────────────────────────────────

/// `true` for the site's built-in collection IDs.
pub fn is_protected(collection_id: &str) -> bool {
    PROTECTED_COLLECTIONS
        .iter()
        .any(|p| p.eq_ignore_ascii_case(collection_id))
}

/// Fails with `ProtectedEntity` for a built-in collection key.
pub fn ensure_writable(key: &Key) -> Result<()> {
    let id = key.as_text();
    if is_protected(&id) {
        return Err(AdminError::ProtectedEntity { identifier: id });
    }
    Ok(())
}

/// Resolves a collection for a write. Keys are checked before any
/// request; names are checked right after resolution.
pub async fn resolve_writable(client: &AdminServiceClient, collection: &EntityRef) -> Result<Key> {
    if let EntityRef::Key(key) = collection {
        ensure_writable(key)?;
    }
    let key = resolver::resolve(client, &COLLECTION, collection).await?;
    ensure_writable(&key)?;
    Ok(key)
}

// ── Reads ──────────────────────────────────────────────────────────────

/// Lists collections, optionally narrowed server-side.
pub async fn list_collections(
    client: &AdminServiceClient,
    filter: Option<Filter>,
) -> Result<Vec<Collection>> {
    let path = ResourcePath::class(COLLECTION.wmi_class).maybe_filter(filter);
    client.get_list(&path).await
}

/// Fetches one collection by name (exactly one match) or key.
pub async fn get_collection(
    client: &AdminServiceClient,
    collection: &EntityRef,
) -> Result<Collection> {
    resolver::fetch(client, &COLLECTION, collection).await
}

/// Every collection whose name matches `pattern` (`*`, `?`). A pattern
/// without wildcards is sent to the server as an exact-name filter.
pub async fn find_collections(client: &AdminServiceClient, pattern: &str) -> Result<Vec<Collection>> {
    if !has_wildcards(pattern) {
        return list_collections(client, Some(Filter::eq(COLLECTION.name_field, pattern))).await;
    }
    let glob = GlobPattern::new(pattern)?;
    let all = list_collections(client, None).await?;
    Ok(filter_by_pattern(all, &glob, |c| c.name.as_str()))
}

/// Current members of a collection.
pub async fn get_collection_members(
    client: &AdminServiceClient,
    collection: &EntityRef,
) -> Result<Vec<CollectionMember>> {
    let key = resolver::resolve(client, &COLLECTION, collection).await?;
    let path = ResourcePath::class("SMS_FullCollectionMembership")
        .filter(Filter::eq("CollectionID", key.as_text()));
    client.get_list(&path).await
}

// ── Writes ─────────────────────────────────────────────────────────────

async fn ensure_name_free(client: &AdminServiceClient, name: &str) -> Result<()> {
    let existing = list_collections(client, Some(Filter::eq(COLLECTION.name_field, name))).await?;
    if !existing.is_empty() {
        return Err(AdminError::AlreadyExists {
            resource_class: COLLECTION.wmi_class.to_string(),
            identifier: name.to_string(),
        });
    }
    Ok(())
}

/// Creates a collection.
///
/// Returns the created collection, re-read after the propagation delay,
/// when `pass_thru` is set.
///
/// # Errors
///
/// - `AdminError::Validation` — empty name.
/// - `AdminError::AlreadyExists` — a collection with that name exists.
/// - `AdminError::NotFound` / `AmbiguousName` — the limiting collection
///   could not be resolved.
pub async fn new_collection(
    client: &AdminServiceClient,
    request: &NewCollection,
    pass_thru: bool,
) -> Result<Option<Collection>> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AdminError::Validation("collection name must not be empty".into()));
    }

    ensure_name_free(client, name).await?;
    let limit = resolver::resolve(client, &COLLECTION, &request.limiting_collection).await?;

    let mut body = json!({
        "Name": name,
        "CollectionType": request.kind.wmi_value(),
        "LimitToCollectionID": limit.as_text(),
    });
    if let Some(comment) = &request.comment {
        body["Comment"] = json!(comment);
    }
    if let Some(refresh) = request.refresh_type {
        body["RefreshType"] = json!(refresh.wmi_value());
    }

    client
        .post(&ResourcePath::class(COLLECTION.wmi_class), &body)
        .await?;
    info!(name, limit = %limit, "created collection");

    if !pass_thru {
        return Ok(None);
    }
    client.wait_for_propagation().await;
    let row = resolver::lookup_by_name(client, &COLLECTION, name).await?;
    Ok(Some(serde_json::from_value(row)?))
}

/// Updates name, comment or refresh mode of a collection.
///
/// The instance is read, patched in memory and written back whole.
///
/// # Errors
///
/// - `AdminError::Validation` — nothing to change.
/// - `AdminError::ProtectedEntity` — built-in collection.
/// - `AdminError::AlreadyExists` — the new name is taken.
pub async fn set_collection(
    client: &AdminServiceClient,
    collection: &EntityRef,
    update: &CollectionUpdate,
    pass_thru: bool,
) -> Result<Option<Collection>> {
    if update.is_empty() {
        return Err(AdminError::Validation("no collection properties to update".into()));
    }

    let key = resolve_writable(client, collection).await?;
    let current: Value = resolver::fetch_by_key(client, &COLLECTION, &key).await?;
    let Value::Object(mut object) = current else {
        return Err(AdminError::Validation(format!(
            "unexpected response shape for collection {key}"
        )));
    };

    if let Some(name) = &update.name {
        let unchanged = object
            .get(COLLECTION.name_field)
            .and_then(Value::as_str)
            .is_some_and(|n| n.eq_ignore_ascii_case(name));
        if !unchanged {
            ensure_name_free(client, name).await?;
        }
        object.insert("Name".into(), json!(name));
    }
    if let Some(comment) = &update.comment {
        object.insert("Comment".into(), json!(comment));
    }
    if let Some(refresh) = update.refresh_type {
        object.insert("RefreshType".into(), json!(refresh.wmi_value()));
    }
    strip_annotations(&mut object);

    let path = ResourcePath::instance(COLLECTION.wmi_class, key.clone());
    client.put(&path, &Value::Object(object)).await?;
    info!(collection = %key, "updated collection");

    if !pass_thru {
        return Ok(None);
    }
    client.wait_for_propagation().await;
    resolver::fetch_by_key(client, &COLLECTION, &key).await.map(Some)
}

/// Deletes one collection.
pub async fn remove_collection(client: &AdminServiceClient, collection: &EntityRef) -> Result<()> {
    let key = resolve_writable(client, collection).await?;
    client
        .delete(&ResourcePath::instance(COLLECTION.wmi_class, key.clone()))
        .await?;
    info!(collection = %key, "removed collection");
    Ok(())
}

/// Deletes every collection whose name matches `pattern`.
///
/// Built-in collections among the matches are reported as failures; the
/// rest are still removed.
///
/// # Errors
///
/// `AdminError::NotFound` when nothing matches.
pub async fn remove_collections(
    client: &AdminServiceClient,
    pattern: &str,
) -> Result<BatchReport<String>> {
    let matches = find_collections(client, pattern).await?;
    if matches.is_empty() {
        return Err(AdminError::NotFound {
            resource_class: COLLECTION.wmi_class.to_string(),
            identifier: pattern.to_string(),
        });
    }

    let mut report = BatchReport::default();
    for collection in matches {
        let id = collection.collection_id.clone();
        let outcome = remove_collection(client, &EntityRef::Key(Key::Text(id.clone())))
            .await
            .map(|()| id.clone());
        report.record(format!("{} ({id})", collection.name), outcome);
    }
    Ok(report)
}

/// Asks the site to re-evaluate collection membership now.
pub async fn invoke_collection_update(
    client: &AdminServiceClient,
    collection: &EntityRef,
) -> Result<()> {
    let key = resolver::resolve(client, &COLLECTION, collection).await?;
    let path = ResourcePath::instance(COLLECTION.wmi_class, key.clone()).method("RequestRefresh");
    client.post_empty(&path).await?;
    info!(collection = %key, "requested membership refresh");
    Ok(())
}
