//! Run Scripts: lookup, invocation and execution status.
//!
//! Running a script is a client operation of type 135. The request carries
//! a base64-encoded `ScriptContent` XML document that pins the script
//! version and hash, plus a parameter block and its SHA-256 hash:
//!
//! ```text
//! <ScriptContent ScriptGuid='...'>
//!   <ScriptVersion>1</ScriptVersion>
//!   <ScriptType>0</ScriptType>
//!   <ScriptHash ScriptHashAlg='SHA256'>...</ScriptHash>
//!   <ScriptParameters>...</ScriptParameters>
//!   <ParameterGroupHash ParameterHashAlg='SHA256'>UPPERCASE-HEX</ParameterGroupHash>
//! </ScriptContent>
//! ```
//!
//! The server answers with an operation ID. Nothing is pushed back; status
//! comes from `SMS_ScriptsExecutionSummary` (per-operation counts) and
//! `SMS_ScriptsExecutionStatus` (per-device output), which the caller
//! queries or polls with [`poll_script_execution`].

use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::client::AdminServiceClient;
use crate::error::{AdminError, Result};
use crate::odata::{Filter, ResourcePath, single_payload};
use crate::resolver::{self, COLLECTION, DEVICE, EntityRef, SCRIPT};

/// `InitiateClientOperationEx` type code for Run Script.
const RUN_SCRIPT_OPERATION: i64 = 135;

/// `ApprovalState` of a script that may run.
const APPROVED: i64 = 3;

const SUMMARY_CLASS: &str = "SMS_ScriptsExecutionSummary";
const STATUS_CLASS: &str = "SMS_ScriptsExecutionStatus";

// ── Script metadata ────────────────────────────────────────────────────

/// A script from the Run Scripts library.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Script {
    /// Canonical key.
    pub script_guid: String,
    /// Display name.
    pub script_name: String,
    /// Version the server expects in the invocation.
    #[serde(default, deserialize_with = "opt_text")]
    pub script_version: Option<String>,
    /// `0` for PowerShell.
    #[serde(default)]
    pub script_type: Option<i64>,
    /// SHA-256 of the script body.
    #[serde(default)]
    pub script_hash: Option<String>,
    /// `3` when approved.
    #[serde(default)]
    pub approval_state: Option<i64>,
    /// Base64 XML describing declared parameters.
    #[serde(default)]
    pub params_definition: Option<String>,
    /// Remaining properties.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accepts a string or a number and keeps it as text.
fn opt_text<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A parameter the script declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptParameter {
    /// Parameter name.
    pub name: String,
    /// .NET type name, e.g. `System.String`.
    pub data_type: String,
    /// Whether the script refuses to run without it.
    pub required: bool,
}

impl Script {
    /// Parameters declared in `ParamsDefinition`. Empty when the script
    /// takes none or the definition cannot be decoded.
    pub fn parameters(&self) -> Vec<ScriptParameter> {
        let Some(encoded) = self.params_definition.as_deref().filter(|s| !s.is_empty()) else {
            return Vec::new();
        };
        match BASE64.decode(encoded.trim()) {
            Ok(bytes) => parse_parameter_definitions(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                debug!(script = %self.script_guid, error = %e, "undecodable ParamsDefinition");
                Vec::new()
            }
        }
    }
}

fn parse_parameter_definitions(xml: &str) -> Vec<ScriptParameter> {
    let (Ok(element), Ok(attribute)) = (
        Regex::new(r"<ScriptParameter\b([^>]*)>"),
        Regex::new(r#"(\w+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#),
    ) else {
        return Vec::new();
    };

    element
        .captures_iter(xml)
        .filter_map(|cap| {
            let attrs = cap.get(1)?.as_str();
            let mut name = None;
            let mut data_type = "System.String".to_string();
            let mut required = false;
            for a in attribute.captures_iter(attrs) {
                let value = a.get(2).or_else(|| a.get(3)).map_or("", |m| m.as_str());
                match &a[1] {
                    "Name" => name = Some(value.to_string()),
                    "Type" => data_type = value.to_string(),
                    "IsRequired" => required = value.eq_ignore_ascii_case("true"),
                    _ => {}
                }
            }
            Some(ScriptParameter {
                name: name?,
                data_type,
                required,
            })
        })
        .collect()
}

/// Lists scripts, optionally narrowed server-side.
pub async fn list_scripts(client: &AdminServiceClient, filter: Option<Filter>) -> Result<Vec<Script>> {
    client
        .get_list(&ResourcePath::class(SCRIPT.wmi_class).maybe_filter(filter))
        .await
}

/// Fetches one script by name (exactly one match) or GUID.
pub async fn get_script(client: &AdminServiceClient, script: &EntityRef) -> Result<Script> {
    resolver::fetch(client, &SCRIPT, script).await
}

// ── Invocation ─────────────────────────────────────────────────────────

/// What a script runs against.
#[derive(Debug, Clone)]
pub enum ScriptTarget {
    /// Every member of a collection.
    Collection(EntityRef),
    /// Specific devices.
    Devices(Vec<EntityRef>),
}

/// Input for [`invoke_script`].
#[derive(Debug, Clone)]
pub struct ScriptInvocation {
    /// Script to run.
    pub script: EntityRef,
    /// Where to run it.
    pub target: ScriptTarget,
    /// Parameter name/value pairs, in any order.
    pub parameters: Vec<(String, String)>,
}

/// A submitted script run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecutionOperation {
    /// Client operation ID; the handle for status queries.
    pub operation_id: u64,
    /// Script that was run.
    pub script_guid: String,
    /// Version that was pinned.
    pub script_version: String,
    /// Target collection; empty when devices were targeted directly.
    pub target_collection_id: String,
    /// Target devices; empty for a collection run.
    pub target_resource_ids: Vec<i64>,
    /// Names of the parameters that were passed.
    pub parameter_names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct InitiateResponse {
    #[serde(rename = "OperationID", alias = "OperationId")]
    operation_id: u64,
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Checks the supplied values against the declared parameters and returns
/// them in declaration order with their types.
fn bind_parameters(
    script: &Script,
    supplied: &[(String, String)],
) -> Result<Vec<(ScriptParameter, String)>> {
    let declared = script.parameters();
    if declared.is_empty() {
        if supplied.is_empty() {
            return Ok(Vec::new());
        }
        return Err(AdminError::Validation(format!(
            "script '{}' does not declare any parameters",
            script.script_name
        )));
    }

    if let Some((unknown, _)) = supplied
        .iter()
        .find(|(name, _)| !declared.iter().any(|p| p.name.eq_ignore_ascii_case(name)))
    {
        return Err(AdminError::Validation(format!(
            "script '{}' has no parameter '{unknown}'",
            script.script_name
        )));
    }

    let mut bound = Vec::new();
    for param in declared {
        match supplied.iter().find(|(name, _)| name.eq_ignore_ascii_case(&param.name)) {
            Some((_, value)) => bound.push((param, value.clone())),
            None if param.required => {
                return Err(AdminError::Validation(format!(
                    "script '{}' requires parameter '{}'",
                    script.script_name, param.name
                )));
            }
            None => {}
        }
    }
    Ok(bound)
}

/// `<ScriptParameters>` block and its upper-case SHA-256. Both are empty
/// strings' worth of content when there are no parameters.
fn parameter_block(bound: &[(ScriptParameter, String)]) -> (String, String) {
    if bound.is_empty() {
        return ("<ScriptParameters></ScriptParameters>".to_string(), String::new());
    }
    let mut xml = String::from("<ScriptParameters>");
    for (param, value) in bound {
        xml.push_str(&format!(
            "<ScriptParameter ParameterGroupGuid=\"\" ParameterGroupName=\"PG_\" \
             ParameterName=\"{}\" ParameterDataType=\"{}\" ParameterVisibility=\"0\" \
             ParameterType=\"0\" ParameterValue=\"{}\"/>",
            xml_escape(&param.name),
            xml_escape(&param.data_type),
            xml_escape(value)
        ));
    }
    xml.push_str("</ScriptParameters>");

    let mut hasher = Sha256::new();
    hasher.update(xml.as_bytes());
    let hash = hex::encode_upper(hasher.finalize());
    (xml, hash)
}

fn script_content(script: &Script, version: &str, hash: &str, bound: &[(ScriptParameter, String)]) -> String {
    let (params_xml, params_hash) = parameter_block(bound);
    format!(
        "<ScriptContent ScriptGuid='{guid}'>\
         <ScriptVersion>{version}</ScriptVersion>\
         <ScriptType>{script_type}</ScriptType>\
         <ScriptHash ScriptHashAlg='SHA256'>{hash}</ScriptHash>\
         {params_xml}\
         <ParameterGroupHash ParameterHashAlg='SHA256'>{params_hash}</ParameterGroupHash>\
         </ScriptContent>",
        guid = xml_escape(&script.script_guid),
        version = xml_escape(version),
        script_type = script.script_type.unwrap_or(0),
        hash = xml_escape(hash),
    )
}

async fn resolve_targets(
    client: &AdminServiceClient,
    target: &ScriptTarget,
) -> Result<(String, Vec<i64>)> {
    match target {
        ScriptTarget::Collection(collection) => {
            let key = resolver::resolve(client, &COLLECTION, collection).await?;
            Ok((key.as_text(), Vec::new()))
        }
        ScriptTarget::Devices(devices) => {
            if devices.is_empty() {
                return Err(AdminError::Validation("at least one target device is required".into()));
            }
            let mut ids = Vec::with_capacity(devices.len());
            for device in devices {
                let key = resolver::resolve(client, &DEVICE, device).await?;
                let id = key.as_number().ok_or_else(|| {
                    AdminError::Validation(format!("device key '{key}' is not numeric"))
                })?;
                ids.push(id);
            }
            // The provider accepts an empty collection ID alongside explicit
            // resource IDs.
            Ok((String::new(), ids))
        }
    }
}

/// Runs an approved script against a collection or a set of devices.
///
/// # Errors
///
/// - `AdminError::NotFound` / `AmbiguousName` — script, collection or a
///   device could not be resolved.
/// - `AdminError::Validation` — the script lacks a hash or version, is not
///   approved, or the parameters do not match its declaration.
/// - `AdminError::Parse` — the server's reply had no operation ID.
pub async fn invoke_script(
    client: &AdminServiceClient,
    invocation: &ScriptInvocation,
) -> Result<ScriptExecutionOperation> {
    let script = get_script(client, &invocation.script).await?;

    let (Some(version), Some(hash)) = (script.script_version.clone(), script.script_hash.clone())
    else {
        return Err(AdminError::Validation(format!(
            "script '{}' is missing its version or hash",
            script.script_name
        )));
    };
    if let Some(state) = script.approval_state {
        if state != APPROVED {
            return Err(AdminError::Validation(format!(
                "script '{}' is not approved (ApprovalState {state})",
                script.script_name
            )));
        }
    }

    let bound = bind_parameters(&script, &invocation.parameters)?;
    let (collection_id, resource_ids) = resolve_targets(client, &invocation.target).await?;

    let content = script_content(&script, &version, &hash, &bound);
    let body = json!({
        "Type": RUN_SCRIPT_OPERATION,
        "TargetCollectionID": collection_id,
        "TargetResourceIDs": resource_ids,
        "RandomizationWindow": 0,
        "Param": BASE64.encode(content.as_bytes()),
    });

    let path = ResourcePath::static_method("SMS_ClientOperation", "InitiateClientOperationEx");
    let reply = client.post(&path, &body).await?;
    let reply: InitiateResponse =
        serde_json::from_value(single_payload(reply).unwrap_or(Value::Null))?;

    info!(
        script = %script.script_name,
        operation_id = reply.operation_id,
        targets = resource_ids.len(),
        "script run submitted"
    );
    Ok(ScriptExecutionOperation {
        operation_id: reply.operation_id,
        script_guid: script.script_guid,
        script_version: version,
        target_collection_id: collection_id,
        target_resource_ids: resource_ids,
        parameter_names: bound.into_iter().map(|(p, _)| p.name).collect(),
    })
}

// ── Status ─────────────────────────────────────────────────────────────

/// Overall state of a script run, derived from its per-device counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutionState {
    /// Every targeted device finished or was not applicable.
    Completed,
    /// Every targeted device failed.
    Failed,
    /// Some devices finished or failed, others have not reported.
    PartiallyCompleted,
    /// Nothing conclusive yet.
    Unknown,
    /// The server has no summary for this operation.
    NotFound,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SummaryRow {
    #[serde(default)]
    script_name: Option<String>,
    #[serde(default)]
    total_clients: u64,
    #[serde(default)]
    completed_clients: u64,
    #[serde(default)]
    failed_clients: u64,
    #[serde(default)]
    offline_clients: u64,
    #[serde(default)]
    not_applicable_clients: u64,
    #[serde(default)]
    unknown_clients: u64,
}

/// Counts and derived state for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptExecutionStatus {
    /// The client operation ID queried.
    pub operation_id: u64,
    /// Derived state.
    pub state: ExecutionState,
    /// Script name, when the summary carries it.
    pub script_name: Option<String>,
    /// Targeted devices.
    pub total: u64,
    /// Devices that finished successfully.
    pub completed: u64,
    /// Devices that reported failure.
    pub failed: u64,
    /// Devices that were offline.
    pub offline: u64,
    /// Devices the script did not apply to.
    pub not_applicable: u64,
    /// Devices with no usable report.
    pub unknown: u64,
}

impl ScriptExecutionStatus {
    fn not_found(operation_id: u64) -> Self {
        ScriptExecutionStatus {
            operation_id,
            state: ExecutionState::NotFound,
            script_name: None,
            total: 0,
            completed: 0,
            failed: 0,
            offline: 0,
            not_applicable: 0,
            unknown: 0,
        }
    }

    fn from_rows(operation_id: u64, rows: Vec<SummaryRow>) -> Self {
        if rows.is_empty() {
            return Self::not_found(operation_id);
        }
        let mut status = Self::not_found(operation_id);
        for row in rows {
            status.script_name = status.script_name.or(row.script_name);
            status.total += row.total_clients;
            status.completed += row.completed_clients;
            status.failed += row.failed_clients;
            status.offline += row.offline_clients;
            status.not_applicable += row.not_applicable_clients;
            status.unknown += row.unknown_clients;
        }
        status.state = derive_state(
            status.total,
            status.completed,
            status.failed,
            status.not_applicable,
        );
        status
    }

    /// `true` once every targeted device has a final outcome, or the
    /// server does not know the operation.
    pub fn is_settled(&self) -> bool {
        match self.state {
            ExecutionState::NotFound => true,
            _ => self.total > 0 && self.completed + self.failed + self.not_applicable >= self.total,
        }
    }
}

fn derive_state(total: u64, completed: u64, failed: u64, not_applicable: u64) -> ExecutionState {
    if total == 0 {
        ExecutionState::Unknown
    } else if completed + not_applicable == total {
        ExecutionState::Completed
    } else if failed == total {
        ExecutionState::Failed
    } else if completed > 0 || failed > 0 {
        ExecutionState::PartiallyCompleted
    } else {
        ExecutionState::Unknown
    }
}

fn by_operation(class: &str, operation_id: u64) -> Result<ResourcePath> {
    let id = i64::try_from(operation_id).map_err(|_| {
        AdminError::Validation(format!("operation ID {operation_id} is out of range"))
    })?;
    Ok(ResourcePath::class(class).filter(Filter::eq("ClientOperationId", id)))
}

/// Summary for one operation. An operation the server does not know
/// yields a status with [`ExecutionState::NotFound`], not an error.
pub async fn get_script_execution_status(
    client: &AdminServiceClient,
    operation_id: u64,
) -> Result<ScriptExecutionStatus> {
    let rows: Vec<SummaryRow> = client.get_list(&by_operation(SUMMARY_CLASS, operation_id)?).await?;
    let status = ScriptExecutionStatus::from_rows(operation_id, rows);
    debug!(operation_id, state = ?status.state, total = status.total, "script execution status");
    Ok(status)
}

/// Output of one device for one operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScriptTargetResult {
    /// Device resource key.
    pub resource_id: i64,
    /// Device name.
    #[serde(default)]
    pub device_name: Option<String>,
    /// `0` success, other values failure.
    #[serde(default)]
    pub script_execution_state: Option<i64>,
    /// Process exit code.
    #[serde(default)]
    pub script_exit_code: Option<i64>,
    /// Captured output.
    #[serde(default)]
    pub script_output: Option<String>,
    /// Remaining properties.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-device results reported so far.
pub async fn get_script_execution_results(
    client: &AdminServiceClient,
    operation_id: u64,
) -> Result<Vec<ScriptTargetResult>> {
    client.get_list(&by_operation(STATUS_CLASS, operation_id)?).await
}

// ── Polling ────────────────────────────────────────────────────────────

/// How often and how long [`poll_script_execution`] waits.
///
/// Defaults: 10 seconds between polls, 10 minutes overall. Devices report
/// script output through the client's fast channel, usually within a
/// minute when online.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Wait between status queries.
    pub interval: Duration,
    /// Give up after this long, measured from the first wait.
    pub timeout: Duration,
}

impl PollConfig {
    /// A config with explicit interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollConfig { interval, timeout }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(600),
        }
    }
}

/// Re-queries the summary until every device has a final outcome.
///
/// An operation the server never reports keeps polling until the timeout;
/// a run where every device failed is returned, not raised.
///
/// # Errors
///
/// - `AdminError::Timeout` — not settled within `config.timeout`. The
///   status is always queried at least once, even when `interval` exceeds
///   `timeout`.
/// - Any transport error from a status query.
pub async fn poll_script_execution(
    client: &AdminServiceClient,
    operation_id: u64,
    config: &PollConfig,
) -> Result<ScriptExecutionStatus> {
    let started = Instant::now();

    loop {
        tokio::time::sleep(config.interval).await;

        let status = get_script_execution_status(client, operation_id).await?;
        if status.state != ExecutionState::NotFound && status.is_settled() {
            return Ok(status);
        }

        if started.elapsed() >= config.timeout {
            return Err(AdminError::Timeout {
                elapsed: started.elapsed(),
                operation_id,
            });
        }
    }
}
