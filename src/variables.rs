//! Device and collection variables.
//!
//! Variables have no identity of their own on the server. They live as an
//! embedded array inside a settings object:
//!
//! | Owner | Settings instance | Array |
//! |-------|-------------------|-------|
//! | device | `SMS_MachineSettings({ResourceId})` | `MachineVariables` |
//! | collection | `SMS_CollectionSettings('{CollectionID}')` | `CollectionVariables` |
//!
//! Every change reads the whole settings object, edits the array in memory
//! and writes the object back in one request. A settings object that does
//! not exist yet (404) reads as an empty array and is created with POST on
//! the first write.
//!
//! Values are returned exactly as the server stores them. Masking is a
//! display concern for the caller.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::client::AdminServiceClient;
use crate::collections;
use crate::error::{AdminError, Result};
use crate::odata::{Key, ResourcePath, strip_annotations};
use crate::resolver::{self, COLLECTION, DEVICE, EntityRef, GlobPattern, filter_by_pattern};

const MACHINE_SETTINGS: &str = "SMS_MachineSettings";
const COLLECTION_SETTINGS: &str = "SMS_CollectionSettings";

/// Locale the console writes into new machine settings.
const DEFAULT_LOCALE_ID: i64 = 1033;

/// A name/value pair stored on a device or collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Variable {
    /// Variable name, unique per owner (case-insensitive).
    pub name: String,
    /// Stored value. `null` on the wire reads as an empty string.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub value: String,
    /// Whether the console hides the value.
    #[serde(default)]
    pub is_masked: bool,
    /// Any other properties of the embedded object, written back as read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

impl Variable {
    /// A fresh variable with no extra properties.
    pub fn new(name: impl Into<String>, value: impl Into<String>, is_masked: bool) -> Self {
        Variable {
            name: name.into(),
            value: value.into(),
            is_masked,
            extra: Map::new(),
        }
    }

    fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// The entity that holds a variable list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableOwner {
    /// A device, by name or resource ID.
    Device(EntityRef),
    /// A collection, by name or collection ID.
    Collection(EntityRef),
}

impl VariableOwner {
    fn label(&self) -> String {
        match self {
            VariableOwner::Device(r) => format!("device {}", r.label()),
            VariableOwner::Collection(r) => format!("collection {}", r.label()),
        }
    }

    fn variable_class(&self) -> &'static str {
        match self {
            VariableOwner::Device(_) => "SMS_MachineVariable",
            VariableOwner::Collection(_) => "SMS_CollectionVariable",
        }
    }
}

/// Input for [`new_variable`].
#[derive(Debug, Clone)]
pub struct NewVariable {
    /// Name; must not exist on the owner yet.
    pub name: String,
    /// Value.
    pub value: String,
    /// Hide the value in the console.
    pub is_masked: bool,
}

/// Input for [`set_variable`]. `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct VariableUpdate {
    /// New value.
    pub value: Option<String>,
    /// New mask state.
    pub is_masked: Option<bool>,
}

// ── Settings plumbing ──────────────────────────────────────────────────

/// The owner resolved to its settings instance.
#[derive(Debug)]
struct SettingsTarget {
    class: &'static str,
    field: &'static str,
    key: Key,
}

impl SettingsTarget {
    fn instance_path(&self) -> ResourcePath {
        ResourcePath::instance(self.class, self.key.clone())
    }

    /// Body for creating a settings object that does not exist yet.
    fn new_settings(&self, client: &AdminServiceClient, variables: Value) -> Result<Value> {
        match self.class {
            MACHINE_SETTINGS => {
                let site = client.site_code().ok_or_else(AdminError::not_connected)?;
                let resource_id = self.key.as_number().ok_or_else(|| {
                    AdminError::Validation(format!("device key '{}' is not numeric", self.key))
                })?;
                Ok(json!({
                    "ResourceID": resource_id,
                    "SourceSite": site,
                    "LocaleID": DEFAULT_LOCALE_ID,
                    self.field: variables,
                }))
            }
            _ => Ok(json!({
                "CollectionID": self.key.as_text(),
                "ReplicateToSubSites": true,
                self.field: variables,
            })),
        }
    }
}

/// A settings object as read from the server, or `None` when it does not
/// exist yet.
#[derive(Debug)]
struct Settings {
    object: Option<Map<String, Value>>,
}

impl Settings {
    fn variables(&self, field: &str) -> Result<Vec<Variable>> {
        match self.object.as_ref().and_then(|o| o.get(field)) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(list) => Ok(serde_json::from_value(list.clone())?),
        }
    }
}

async fn resolve_target(
    client: &AdminServiceClient,
    owner: &VariableOwner,
    for_write: bool,
) -> Result<SettingsTarget> {
    match owner {
        VariableOwner::Device(device) => {
            let key = resolver::resolve(client, &DEVICE, device).await?;
            let id = key.as_number().ok_or_else(|| {
                AdminError::Validation(format!("device key '{key}' is not numeric"))
            })?;
            Ok(SettingsTarget {
                class: MACHINE_SETTINGS,
                field: "MachineVariables",
                key: Key::Number(id),
            })
        }
        VariableOwner::Collection(collection) => {
            let key = if for_write {
                collections::resolve_writable(client, collection).await?
            } else {
                resolver::resolve(client, &COLLECTION, collection).await?
            };
            Ok(SettingsTarget {
                class: COLLECTION_SETTINGS,
                field: "CollectionVariables",
                key,
            })
        }
    }
}

async fn read_settings(client: &AdminServiceClient, target: &SettingsTarget) -> Result<Settings> {
    match client.get_single::<Value>(&target.instance_path()).await {
        Ok(Some(Value::Object(object))) => Ok(Settings {
            object: Some(object),
        }),
        Ok(_) => Ok(Settings { object: None }),
        Err(e) if e.is_not_found() => {
            debug!(class = target.class, key = %target.key, "settings not created yet");
            Ok(Settings { object: None })
        }
        Err(e) => Err(e),
    }
}

/// Rewrites the whole settings object with `variables` as its array.
async fn write_settings(
    client: &AdminServiceClient,
    target: &SettingsTarget,
    settings: Settings,
    variables: &[Variable],
) -> Result<()> {
    let list = serde_json::to_value(variables)?;
    match settings.object {
        Some(mut object) => {
            strip_annotations(&mut object);
            object.insert(target.field.to_string(), list);
            client
                .put(&target.instance_path(), &Value::Object(object))
                .await?;
        }
        None => {
            let body = target.new_settings(client, list)?;
            client
                .post(&ResourcePath::class(target.class), &body)
                .await?;
        }
    }
    Ok(())
}

async fn read_back(
    client: &AdminServiceClient,
    owner: &VariableOwner,
    target: &SettingsTarget,
    name: &str,
) -> Result<Variable> {
    client.wait_for_propagation().await;
    read_settings(client, target)
        .await?
        .variables(target.field)?
        .into_iter()
        .find(|v| v.is_named(name))
        .ok_or_else(|| variable_not_found(owner, name))
}

fn variable_not_found(owner: &VariableOwner, name: &str) -> AdminError {
    AdminError::NotFound {
        resource_class: owner.variable_class().to_string(),
        identifier: format!("{name} on {}", owner.label()),
    }
}

// ── Operations ─────────────────────────────────────────────────────────

/// Variables on `owner`, optionally narrowed by a `*` / `?` pattern.
/// An owner without a settings object has no variables.
pub async fn get_variables(
    client: &AdminServiceClient,
    owner: &VariableOwner,
    pattern: Option<&str>,
) -> Result<Vec<Variable>> {
    let target = resolve_target(client, owner, false).await?;
    let variables = read_settings(client, &target).await?.variables(target.field)?;
    match pattern {
        Some(p) => Ok(filter_by_pattern(variables, &GlobPattern::new(p)?, |v| {
            v.name.as_str()
        })),
        None => Ok(variables),
    }
}

/// Adds a variable.
///
/// # Errors
///
/// - `AdminError::Validation` — empty name.
/// - `AdminError::AlreadyExists` — the owner already has a variable with
///   this name; nothing is written.
/// - `AdminError::ProtectedEntity` — built-in collection.
pub async fn new_variable(
    client: &AdminServiceClient,
    owner: &VariableOwner,
    variable: &NewVariable,
    pass_thru: bool,
) -> Result<Option<Variable>> {
    let name = variable.name.trim();
    if name.is_empty() {
        return Err(AdminError::Validation("variable name must not be empty".into()));
    }

    let target = resolve_target(client, owner, true).await?;
    let settings = read_settings(client, &target).await?;
    let mut variables = settings.variables(target.field)?;

    if variables.iter().any(|v| v.is_named(name)) {
        return Err(AdminError::AlreadyExists {
            resource_class: owner.variable_class().to_string(),
            identifier: format!("{name} on {}", owner.label()),
        });
    }

    variables.push(Variable::new(name, variable.value.clone(), variable.is_masked));
    write_settings(client, &target, settings, &variables).await?;
    info!(owner = %owner.label(), name, "created variable");

    if !pass_thru {
        return Ok(None);
    }
    read_back(client, owner, &target, name).await.map(Some)
}

/// Changes the value and/or mask state of an existing variable.
///
/// Setting a variable to what it already holds succeeds without a write.
///
/// # Errors
///
/// - `AdminError::Validation` — nothing to change.
/// - `AdminError::NotFound` — no such variable (or no settings at all).
/// - `AdminError::ProtectedEntity` — built-in collection.
pub async fn set_variable(
    client: &AdminServiceClient,
    owner: &VariableOwner,
    name: &str,
    update: &VariableUpdate,
    pass_thru: bool,
) -> Result<Option<Variable>> {
    if update.value.is_none() && update.is_masked.is_none() {
        return Err(AdminError::Validation("no variable properties to update".into()));
    }

    let target = resolve_target(client, owner, true).await?;
    let settings = read_settings(client, &target).await?;
    let mut variables = settings.variables(target.field)?;

    let Some(existing) = variables.iter_mut().find(|v| v.is_named(name)) else {
        return Err(variable_not_found(owner, name));
    };

    let mut changed = false;
    if let Some(value) = &update.value {
        if existing.value != *value {
            existing.value = value.clone();
            changed = true;
        }
    }
    if let Some(masked) = update.is_masked {
        if existing.is_masked != masked {
            existing.is_masked = masked;
            changed = true;
        }
    }

    if changed {
        write_settings(client, &target, settings, &variables).await?;
        info!(owner = %owner.label(), name, "updated variable");
    } else {
        debug!(owner = %owner.label(), name, "variable unchanged; skipping write");
    }

    if !pass_thru {
        return Ok(None);
    }
    read_back(client, owner, &target, name).await.map(Some)
}

/// Removes every variable whose name matches `pattern` in one rewrite and
/// returns what was removed.
///
/// # Errors
///
/// - `AdminError::NotFound` — nothing matched.
/// - `AdminError::ProtectedEntity` — built-in collection.
pub async fn remove_variables(
    client: &AdminServiceClient,
    owner: &VariableOwner,
    pattern: &str,
) -> Result<Vec<Variable>> {
    let glob = GlobPattern::new(pattern)?;
    let target = resolve_target(client, owner, true).await?;
    let settings = read_settings(client, &target).await?;

    let (removed, kept): (Vec<Variable>, Vec<Variable>) = settings
        .variables(target.field)?
        .into_iter()
        .partition(|v| glob.is_match(&v.name));

    if removed.is_empty() {
        return Err(variable_not_found(owner, pattern));
    }

    write_settings(client, &target, settings, &kept).await?;
    info!(owner = %owner.label(), pattern, removed = removed.len(), "removed variables");
    Ok(removed)
}
