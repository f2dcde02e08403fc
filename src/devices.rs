//! Discovered device lookup (`SMS_R_System`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::AdminServiceClient;
use crate::error::Result;
use crate::odata::{Filter, ResourcePath};
use crate::resolver::{self, DEVICE, EntityRef, GlobPattern, filter_by_pattern, has_wildcards};

/// A discovered system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Device {
    /// Numeric resource key.
    pub resource_id: i64,

    /// NetBIOS name.
    pub name: String,

    /// `1` when the Configuration Manager client is installed.
    #[serde(default)]
    pub client: Option<i64>,

    /// `1` when the client is active.
    #[serde(default)]
    pub active: Option<i64>,

    /// Client GUID, e.g. `GUID:...`.
    #[serde(rename = "SMSUniqueIdentifier", default)]
    pub sms_unique_identifier: Option<String>,

    /// Operating system string as discovered.
    #[serde(rename = "OperatingSystemNameandVersion", default)]
    pub operating_system: Option<String>,

    /// Remaining discovery properties.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Lists devices, optionally narrowed server-side.
pub async fn list_devices(client: &AdminServiceClient, filter: Option<Filter>) -> Result<Vec<Device>> {
    let path = ResourcePath::class(DEVICE.wmi_class).maybe_filter(filter);
    client.get_list(&path).await
}

/// Fetches one device by name (exactly one match) or resource ID.
pub async fn get_device(client: &AdminServiceClient, device: &EntityRef) -> Result<Device> {
    resolver::fetch(client, &DEVICE, device).await
}

/// Devices whose name matches `pattern`. The literal text before the first
/// `*` or `?` is sent as a `startswith` filter, then the full pattern is
/// matched locally. A pattern that starts with a wildcard lists every device.
pub async fn find_devices(client: &AdminServiceClient, pattern: &str) -> Result<Vec<Device>> {
    if !has_wildcards(pattern) {
        return list_devices(client, Some(Filter::eq(DEVICE.name_field, pattern))).await;
    }

    let prefix = pattern.split(['*', '?']).next().unwrap_or_default();
    let server_filter = (!prefix.is_empty()).then(|| Filter::starts_with(DEVICE.name_field, prefix));

    let glob = GlobPattern::new(pattern)?;
    let candidates = list_devices(client, server_filter).await?;
    Ok(filter_by_pattern(candidates, &glob, |d| d.name.as_str()))
}
