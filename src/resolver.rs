//! Name-to-key resolution and client-side wildcard matching.
//!
//! Display names are not unique on the server, so every operation that
//! accepts a name goes through [`resolve_by_name`], which insists on
//! exactly one match. Keys supplied by the caller are only brought into
//! the class's key type (device IDs are numeric); the operation that uses
//! them finds out soon enough whether they exist.
//!
//! The Admin Service has no glob support in `$filter`, so wildcard
//! selection (`Temp*`, `PC-0?`) is done here with [`GlobPattern`] over
//! lists that were fetched in full.

use regex::{Regex, RegexBuilder};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::client::AdminServiceClient;
use crate::error::{AdminError, Result};
use crate::odata::{Filter, Key, ResourcePath};

/// Where an entity lives on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityClass {
    /// WMI class name.
    pub wmi_class: &'static str,
    /// Property holding the canonical key.
    pub key_field: &'static str,
    /// Property holding the display name.
    pub name_field: &'static str,
    /// Whether the key is an integer and renders unquoted in paths.
    pub numeric_key: bool,
}

impl EntityClass {
    /// Brings a caller-supplied key into the class's wire form: numeric
    /// classes turn `"16777220"` into `16777220`.
    ///
    /// # Errors
    ///
    /// `AdminError::Validation` when a numeric class gets a non-numeric key.
    pub fn normalize_key(&self, key: Key) -> Result<Key> {
        if !self.numeric_key {
            return Ok(key);
        }
        key.as_number().map(Key::Number).ok_or_else(|| {
            AdminError::Validation(format!(
                "{} key '{key}' is not numeric",
                self.wmi_class
            ))
        })
    }
}

/// Device and user collections.
pub const COLLECTION: EntityClass = EntityClass {
    wmi_class: "SMS_Collection",
    key_field: "CollectionID",
    name_field: "Name",
    numeric_key: false,
};

/// Discovered systems.
pub const DEVICE: EntityClass = EntityClass {
    wmi_class: "SMS_R_System",
    key_field: "ResourceId",
    name_field: "Name",
    numeric_key: true,
};

/// Scripts registered in the console's Run Scripts library.
pub const SCRIPT: EntityClass = EntityClass {
    wmi_class: "SMS_Scripts",
    key_field: "ScriptGuid",
    name_field: "ScriptName",
    numeric_key: false,
};

/// How a caller identifies an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    /// Display name; resolved to a key with the exactly-one rule.
    Name(String),
    /// Canonical key; used without validation.
    Key(Key),
}

impl EntityRef {
    /// Reference by display name.
    pub fn name(name: impl Into<String>) -> Self {
        EntityRef::Name(name.into())
    }

    /// Reference by key.
    pub fn key(key: impl Into<Key>) -> Self {
        EntityRef::Key(key.into())
    }

    /// Name or key as text, for error messages and batch reports.
    pub fn label(&self) -> String {
        match self {
            EntityRef::Name(n) => n.clone(),
            EntityRef::Key(k) => k.to_string(),
        }
    }
}

/// Queries `class` by exact name and returns the single matching row.
///
/// # Errors
///
/// - `AdminError::NotFound` — nothing has that name.
/// - `AdminError::AmbiguousName` — more than one entity has that name.
/// - `AdminError::Http` / `AdminError::Network` — the query itself failed.
pub async fn lookup_by_name(
    client: &AdminServiceClient,
    class: &EntityClass,
    name: &str,
) -> Result<Value> {
    let path = ResourcePath::class(class.wmi_class).filter(Filter::eq(class.name_field, name));
    let mut matches: Vec<Value> = client.get_list(&path).await?;
    debug!(class = class.wmi_class, name, count = matches.len(), "resolved name");

    match matches.len() {
        0 => Err(AdminError::NotFound {
            resource_class: class.wmi_class.to_string(),
            identifier: name.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(AdminError::AmbiguousName {
            resource_class: class.wmi_class.to_string(),
            identifier: name.to_string(),
            count,
        }),
    }
}

/// Resolves a display name to the entity's canonical key.
pub async fn resolve_by_name(
    client: &AdminServiceClient,
    class: &EntityClass,
    name: &str,
) -> Result<Key> {
    let row = lookup_by_name(client, class, name).await?;
    row.get(class.key_field)
        .and_then(Key::from_json)
        .ok_or_else(|| AdminError::NotFound {
            resource_class: class.wmi_class.to_string(),
            identifier: format!("{name} ({} missing from response)", class.key_field),
        })
}

/// Returns `key` untouched when given, otherwise resolves `name`.
///
/// # Errors
///
/// `AdminError::Validation` when both or neither are supplied, before any
/// request is made.
pub async fn resolve_by_name_or_key(
    client: &AdminServiceClient,
    class: &EntityClass,
    name: Option<&str>,
    key: Option<Key>,
) -> Result<Key> {
    match (name, key) {
        (Some(_), Some(_)) => Err(AdminError::Validation(format!(
            "specify either a name or a key for {}, not both",
            class.wmi_class
        ))),
        (None, None) => Err(AdminError::Validation(format!(
            "a name or a key is required for {}",
            class.wmi_class
        ))),
        (None, Some(key)) => class.normalize_key(key),
        (Some(name), None) => resolve_by_name(client, class, name).await,
    }
}

/// Resolves an [`EntityRef`] to a key.
pub async fn resolve(
    client: &AdminServiceClient,
    class: &EntityClass,
    entity: &EntityRef,
) -> Result<Key> {
    match entity {
        EntityRef::Key(key) => class.normalize_key(key.clone()),
        EntityRef::Name(name) => resolve_by_name(client, class, name).await,
    }
}

/// Fetches one instance by key. An empty envelope or a 404 both become
/// `AdminError::NotFound`.
pub async fn fetch_by_key<T: DeserializeOwned>(
    client: &AdminServiceClient,
    class: &EntityClass,
    key: &Key,
) -> Result<T> {
    let key = class.normalize_key(key.clone())?;
    let not_found = || AdminError::NotFound {
        resource_class: class.wmi_class.to_string(),
        identifier: key.to_string(),
    };
    let path = ResourcePath::instance(class.wmi_class, key.clone());
    match client.get_single::<T>(&path).await {
        Ok(Some(item)) => Ok(item),
        Ok(None) => Err(not_found()),
        Err(e) if e.is_not_found() => Err(not_found()),
        Err(e) => Err(e),
    }
}

/// Resolves a reference and fetches the full instance by key.
pub async fn fetch<T: DeserializeOwned>(
    client: &AdminServiceClient,
    class: &EntityClass,
    entity: &EntityRef,
) -> Result<T> {
    let key = resolve(client, class, entity).await?;
    fetch_by_key(client, class, &key).await
}

// ── Wildcards ──────────────────────────────────────────────────────────

/// A `*` / `?` wildcard pattern, matched case-insensitively against the
/// whole name.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compiles a wildcard pattern. Every other character is literal.
    pub fn new(pattern: &str) -> Result<Self> {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');

        let regex = RegexBuilder::new(&source)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| AdminError::Validation(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(GlobPattern {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// `true` when `name` matches the whole pattern.
    pub fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `true` when the pattern contains a wildcard character.
    pub fn has_wildcards(&self) -> bool {
        has_wildcards(&self.raw)
    }
}

/// `true` when `text` contains `*` or `?`.
pub fn has_wildcards(text: &str) -> bool {
    text.contains(['*', '?'])
}

/// Keeps every item whose name matches `pattern`, in input order.
pub fn filter_by_pattern<T, F>(items: Vec<T>, pattern: &GlobPattern, name_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    items
        .into_iter()
        .filter(|item| pattern.is_match(name_of(item)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_keys_normalize_to_numbers() {
        assert_eq!(
            DEVICE.normalize_key(Key::from("16777220")).unwrap(),
            Key::Number(16777220)
        );
        assert!(matches!(
            DEVICE.normalize_key(Key::from("PC-001")),
            Err(AdminError::Validation(_))
        ));
        assert_eq!(
            COLLECTION.normalize_key(Key::from("PS100012")).unwrap(),
            Key::from("PS100012")
        );
    }

    #[test]
    fn star_matches_any_run() {
        let p = GlobPattern::new("Temp*").unwrap();
        assert!(p.is_match("Temp"));
        assert!(p.is_match("TempDir"));
        assert!(p.is_match("temp_path"), "matching is case-insensitive");
        assert!(!p.is_match("MyTemp"), "pattern is anchored at the start");
    }

    #[test]
    fn question_mark_matches_one_char() {
        let p = GlobPattern::new("PC-0?").unwrap();
        assert!(p.is_match("PC-01"));
        assert!(!p.is_match("PC-0"));
        assert!(!p.is_match("PC-012"), "pattern is anchored at the end");
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let p = GlobPattern::new("a.b+(c)").unwrap();
        assert!(p.is_match("a.b+(c)"));
        assert!(!p.is_match("aXb+(c)"));
    }

    #[test]
    fn exact_pattern_is_whole_name_match() {
        let p = GlobPattern::new("OSDComputerName").unwrap();
        assert!(p.is_match("osdcomputername"));
        assert!(!p.is_match("OSDComputerName2"));
        assert!(!p.has_wildcards());
    }

    #[test]
    fn filter_keeps_every_match_in_order() {
        let names = vec!["TempA", "Keep", "TempB", "temp", "Other"];
        let p = GlobPattern::new("Temp*").unwrap();
        let kept = filter_by_pattern(names, &p, |n| *n);
        assert_eq!(kept, vec!["TempA", "TempB", "temp"]);
    }

    #[test]
    fn wildcard_detection() {
        assert!(has_wildcards("Temp*"));
        assert!(has_wildcards("PC-0?"));
        assert!(!has_wildcards("Plain"));
    }

    #[test]
    fn entity_ref_labels() {
        assert_eq!(EntityRef::name("All Desktops").label(), "All Desktops");
        assert_eq!(EntityRef::key(16777220_i64).label(), "16777220");
    }
}
