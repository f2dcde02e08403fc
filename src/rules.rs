//! Collection membership rules.
//!
//! Rules are embedded in the collection (`CollectionRules`) and are never
//! written as a list. Each one is added or removed through an instance
//! method on the collection:
//!
//! ```text
//! POST wmi/SMS_Collection('PS100012')/AdminService.AddMembershipRule
//! { "collectionRule": { "@odata.type": "#AdminService.SMS_CollectionRuleDirect", ... } }
//! ```
//!
//! Duplicate detection is the server's job.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::batch::BatchReport;
use crate::client::AdminServiceClient;
use crate::collections::{self, Collection};
use crate::devices;
use crate::error::{AdminError, Result};
use crate::odata::{Key, ResourcePath};
use crate::resolver::{self, COLLECTION, EntityRef, GlobPattern};

const ADD_METHOD: &str = "AddMembershipRule";
const DELETE_METHOD: &str = "DeleteMembershipRule";

/// Adds one specific resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DirectRule {
    /// `SMS_R_System` for devices, `SMS_R_User` for users.
    #[serde(default = "system_class")]
    pub resource_class_name: String,
    /// Resource key.
    #[serde(rename = "ResourceID")]
    pub resource_id: i64,
    /// Usually the resource name.
    #[serde(default)]
    pub rule_name: String,
}

fn system_class() -> String {
    "SMS_R_System".to_string()
}

/// Adds whatever a WQL query returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueryRule {
    /// Rule name.
    #[serde(default)]
    pub rule_name: String,
    /// WQL statement.
    pub query_expression: String,
    /// Server-assigned query ID; absent on new rules.
    #[serde(rename = "QueryID", default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<i64>,
}

/// Adds the members of another collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IncludeRule {
    /// Usually the included collection's name.
    #[serde(default)]
    pub rule_name: String,
    /// Included collection key.
    #[serde(rename = "IncludeCollectionID")]
    pub include_collection_id: String,
}

/// Removes the members of another collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExcludeRule {
    /// Usually the excluded collection's name.
    #[serde(default)]
    pub rule_name: String,
    /// Excluded collection key.
    #[serde(rename = "ExcludeCollectionID")]
    pub exclude_collection_id: String,
}

/// One membership rule, discriminated by its `@odata.type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "@odata.type")]
pub enum MembershipRule {
    /// `SMS_CollectionRuleDirect`
    #[serde(rename = "#AdminService.SMS_CollectionRuleDirect")]
    Direct(DirectRule),
    /// `SMS_CollectionRuleQuery`
    #[serde(rename = "#AdminService.SMS_CollectionRuleQuery")]
    Query(QueryRule),
    /// `SMS_CollectionRuleIncludeCollection`
    #[serde(rename = "#AdminService.SMS_CollectionRuleIncludeCollection")]
    Include(IncludeRule),
    /// `SMS_CollectionRuleExcludeCollection`
    #[serde(rename = "#AdminService.SMS_CollectionRuleExcludeCollection")]
    Exclude(ExcludeRule),
    /// A rule type this crate does not model. Listed, never added or removed.
    #[serde(other)]
    Unknown,
}

impl MembershipRule {
    /// The rule's display name; empty for [`MembershipRule::Unknown`].
    pub fn rule_name(&self) -> &str {
        match self {
            MembershipRule::Direct(r) => &r.rule_name,
            MembershipRule::Query(r) => &r.rule_name,
            MembershipRule::Include(r) => &r.rule_name,
            MembershipRule::Exclude(r) => &r.rule_name,
            MembershipRule::Unknown => "",
        }
    }

    /// The rule's variant.
    pub fn kind(&self) -> Option<RuleKind> {
        match self {
            MembershipRule::Direct(_) => Some(RuleKind::Direct),
            MembershipRule::Query(_) => Some(RuleKind::Query),
            MembershipRule::Include(_) => Some(RuleKind::Include),
            MembershipRule::Exclude(_) => Some(RuleKind::Exclude),
            MembershipRule::Unknown => None,
        }
    }
}

/// Rule variant selector for the list and remove operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Direct rules.
    Direct,
    /// Query rules.
    Query,
    /// Include-collection rules.
    Include,
    /// Exclude-collection rules.
    Exclude,
}

// ── Reads ──────────────────────────────────────────────────────────────

async fn read_rules(client: &AdminServiceClient, key: &Key) -> Result<Vec<MembershipRule>> {
    let collection: Value = resolver::fetch_by_key(client, &COLLECTION, key).await?;
    match collection.get("CollectionRules") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => Ok(serde_json::from_value(list.clone())?),
    }
}

fn select(
    rules: Vec<MembershipRule>,
    kind: Option<RuleKind>,
    pattern: Option<&GlobPattern>,
) -> Vec<MembershipRule> {
    rules
        .into_iter()
        .filter(|r| kind.is_none_or(|k| r.kind() == Some(k)))
        .filter(|r| pattern.is_none_or(|p| p.is_match(r.rule_name())))
        .collect()
}

/// Rules of a collection, optionally narrowed by variant and by a
/// wildcard over the rule name.
pub async fn get_membership_rules(
    client: &AdminServiceClient,
    collection: &EntityRef,
    kind: Option<RuleKind>,
    pattern: Option<&str>,
) -> Result<Vec<MembershipRule>> {
    let glob = pattern.map(GlobPattern::new).transpose()?;
    let key = resolver::resolve(client, &COLLECTION, collection).await?;
    let rules = read_rules(client, &key).await?;
    Ok(select(rules, kind, glob.as_ref()))
}

/// Direct rules of a collection.
pub async fn get_direct_membership_rules(
    client: &AdminServiceClient,
    collection: &EntityRef,
) -> Result<Vec<DirectRule>> {
    let rules = get_membership_rules(client, collection, Some(RuleKind::Direct), None).await?;
    Ok(rules
        .into_iter()
        .filter_map(|r| match r {
            MembershipRule::Direct(d) => Some(d),
            _ => None,
        })
        .collect())
}

// ── Adds ───────────────────────────────────────────────────────────────

async fn call_rule_method(
    client: &AdminServiceClient,
    key: &Key,
    method: &str,
    rule: &MembershipRule,
) -> Result<Value> {
    let path = ResourcePath::instance(COLLECTION.wmi_class, key.clone()).method(method);
    client.post(&path, &json!({ "collectionRule": rule })).await
}

/// Adds any rule to a collection.
///
/// # Errors
///
/// - `AdminError::Validation` — [`MembershipRule::Unknown`].
/// - `AdminError::ProtectedEntity` — built-in collection.
/// - `AdminError::Http` — the server rejected the rule (e.g. duplicate).
pub async fn add_membership_rule(
    client: &AdminServiceClient,
    collection: &EntityRef,
    rule: &MembershipRule,
) -> Result<()> {
    if rule.kind().is_none() {
        return Err(AdminError::Validation("cannot add a rule of unknown type".into()));
    }
    let key = collections::resolve_writable(client, collection).await?;
    call_rule_method(client, &key, ADD_METHOD, rule).await?;
    info!(collection = %key, rule = rule.rule_name(), "added membership rule");
    Ok(())
}

/// Adds a device to a collection by direct rule. The rule is named after
/// the device.
pub async fn add_direct_rule(
    client: &AdminServiceClient,
    collection: &EntityRef,
    device: &EntityRef,
) -> Result<()> {
    if let EntityRef::Key(key) = collection {
        collections::ensure_writable(key)?;
    }
    let device = devices::get_device(client, device).await?;
    let rule = MembershipRule::Direct(DirectRule {
        resource_class_name: system_class(),
        resource_id: device.resource_id,
        rule_name: device.name,
    });
    add_membership_rule(client, collection, &rule).await
}

/// Adds a WQL query rule.
pub async fn add_query_rule(
    client: &AdminServiceClient,
    collection: &EntityRef,
    rule_name: &str,
    query_expression: &str,
) -> Result<()> {
    if rule_name.trim().is_empty() || query_expression.trim().is_empty() {
        return Err(AdminError::Validation(
            "query rules need both a rule name and a query expression".into(),
        ));
    }
    let rule = MembershipRule::Query(QueryRule {
        rule_name: rule_name.to_string(),
        query_expression: query_expression.to_string(),
        query_id: None,
    });
    add_membership_rule(client, collection, &rule).await
}

async fn referenced_collection(
    client: &AdminServiceClient,
    collection: &EntityRef,
    referenced: &EntityRef,
) -> Result<Collection> {
    if let EntityRef::Key(key) = collection {
        collections::ensure_writable(key)?;
    }
    collections::get_collection(client, referenced).await
}

/// Adds an include-collection rule named after the included collection.
pub async fn add_include_rule(
    client: &AdminServiceClient,
    collection: &EntityRef,
    included: &EntityRef,
) -> Result<()> {
    let source = referenced_collection(client, collection, included).await?;
    let rule = MembershipRule::Include(IncludeRule {
        rule_name: source.name,
        include_collection_id: source.collection_id,
    });
    add_membership_rule(client, collection, &rule).await
}

/// Adds an exclude-collection rule named after the excluded collection.
pub async fn add_exclude_rule(
    client: &AdminServiceClient,
    collection: &EntityRef,
    excluded: &EntityRef,
) -> Result<()> {
    let source = referenced_collection(client, collection, excluded).await?;
    let rule = MembershipRule::Exclude(ExcludeRule {
        rule_name: source.name,
        exclude_collection_id: source.collection_id,
    });
    add_membership_rule(client, collection, &rule).await
}

// ── Removes ────────────────────────────────────────────────────────────

/// Removes every rule of `kind` (all kinds when `None`) whose name matches
/// `pattern`, one server call per rule. Rules of a type this crate does not
/// model are left in place.
///
/// # Errors
///
/// `AdminError::NotFound` when no rule matches; per-rule failures are in
/// the report.
pub async fn remove_membership_rules(
    client: &AdminServiceClient,
    collection: &EntityRef,
    kind: Option<RuleKind>,
    pattern: &str,
) -> Result<BatchReport<MembershipRule>> {
    let glob = GlobPattern::new(pattern)?;
    let key = collections::resolve_writable(client, collection).await?;
    // Unknown rules deserialize without their fields, so they cannot be
    // sent back to DeleteMembershipRule.
    let selected = select(read_rules(client, &key).await?, kind, Some(&glob));
    let (matches, unknown): (Vec<_>, Vec<_>) =
        selected.into_iter().partition(|r| r.kind().is_some());
    if !unknown.is_empty() {
        debug!(collection = %key, skipped = unknown.len(), "skipping rules of unknown type");
    }
    if matches.is_empty() {
        return Err(AdminError::NotFound {
            resource_class: "SMS_CollectionRule".into(),
            identifier: format!("{pattern} on collection {key}"),
        });
    }

    let mut report = BatchReport::default();
    for rule in matches {
        let label = rule.rule_name().to_string();
        let outcome = call_rule_method(client, &key, DELETE_METHOD, &rule).await;
        report.record(label, outcome.map(|_| rule));
    }
    info!(
        collection = %key,
        removed = report.succeeded.len(),
        failed = report.failed.len(),
        "removed membership rules"
    );
    Ok(report)
}

/// Removes the direct rule for one resource key.
pub async fn remove_direct_rule(
    client: &AdminServiceClient,
    collection: &EntityRef,
    resource_id: i64,
) -> Result<()> {
    let key = collections::resolve_writable(client, collection).await?;
    let rule = read_rules(client, &key)
        .await?
        .into_iter()
        .find(|r| matches!(r, MembershipRule::Direct(d) if d.resource_id == resource_id))
        .ok_or_else(|| AdminError::NotFound {
            resource_class: "SMS_CollectionRuleDirect".into(),
            identifier: format!("{resource_id} on collection {key}"),
        })?;
    call_rule_method(client, &key, DELETE_METHOD, &rule).await?;
    info!(collection = %key, resource_id, "removed direct rule");
    Ok(())
}
