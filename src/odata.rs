//! OData path, filter and envelope handling for the `wmi/` route.
//!
//! The Admin Service exposes WMI classes as OData entity sets:
//!
//! - `wmi/{Class}` — list, optionally narrowed with `$filter` / `$select`.
//! - `wmi/{Class}({key})` — one instance. Text keys are quoted.
//! - `wmi/{Class}({key})/AdminService.{Method}` — instance method (POST).
//! - `wmi/{Class}.{Method}` — static method.
//!
//! [`ResourcePath`] builds these, [`Filter`] builds `$filter` expressions
//! with literal escaping in one place, and [`single_payload`] /
//! [`ODataList`] normalize the two response shapes (`{"value": [...]}`
//! envelope vs. a bare object).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Canonical key of a WMI instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Numeric key such as `ResourceId` or an operation ID.
    Number(i64),
    /// Text key such as `CollectionID` or `ScriptGuid`.
    Text(String),
}

impl Key {
    /// Text form of the key.
    pub fn as_text(&self) -> String {
        match self {
            Key::Number(n) => n.to_string(),
            Key::Text(s) => s.clone(),
        }
    }

    /// Numeric value, when the key is numeric or a numeric string.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Key::Number(n) => Some(*n),
            Key::Text(s) => s.parse().ok(),
        }
    }

    /// Reads a key out of a JSON value, accepting strings and integers.
    pub fn from_json(value: &Value) -> Option<Key> {
        match value {
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(Key::Number),
            _ => None,
        }
    }

    /// Key as it appears in a filter or a path segment.
    pub fn to_literal(&self) -> Literal {
        match self {
            Key::Number(n) => Literal::Number(*n),
            Key::Text(s) => Literal::Text(s.clone()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{n}"),
            Key::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Number(value)
    }
}

// ── Filters ────────────────────────────────────────────────────────────

/// A literal on the right-hand side of a filter comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// Rendered as `'text'` with embedded quotes doubled.
    Text(String),
    /// Rendered bare.
    Number(i64),
    /// Rendered as `true` / `false`.
    Bool(bool),
}

impl Literal {
    fn render(&self) -> String {
        match self {
            Literal::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Literal::Number(n) => n.to_string(),
            Literal::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::Text(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::Text(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Number(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

/// Comparison operators supported by the Admin Service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `eq`
    Eq,
    /// `ne`
    Ne,
    /// `gt`
    Gt,
    /// `lt`
    Lt,
}

impl Op {
    fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "eq",
            Op::Ne => "ne",
            Op::Gt => "gt",
            Op::Lt => "lt",
        }
    }
}

/// A `$filter` expression tree.
///
/// Field names are trusted identifiers supplied by this crate; every value
/// goes through [`Literal`] so quoting happens in exactly one place.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field op literal`
    Compare {
        /// Property name.
        field: String,
        /// Operator.
        op: Op,
        /// Right-hand side.
        value: Literal,
    },
    /// `startswith(field, 'prefix')`
    StartsWith {
        /// Property name.
        field: String,
        /// Prefix to match.
        prefix: String,
    },
    /// `contains(field, 'text')`
    Contains {
        /// Property name.
        field: String,
        /// Substring to match.
        text: String,
    },
    /// Conjunction of two filters.
    And(Box<Filter>, Box<Filter>),
    /// Disjunction of two filters.
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    /// `field eq value`
    pub fn eq(field: &str, value: impl Into<Literal>) -> Self {
        Filter::Compare {
            field: field.to_string(),
            op: Op::Eq,
            value: value.into(),
        }
    }

    /// `field ne value`
    pub fn ne(field: &str, value: impl Into<Literal>) -> Self {
        Filter::Compare {
            field: field.to_string(),
            op: Op::Ne,
            value: value.into(),
        }
    }

    /// `startswith(field, 'prefix')`
    pub fn starts_with(field: &str, prefix: &str) -> Self {
        Filter::StartsWith {
            field: field.to_string(),
            prefix: prefix.to_string(),
        }
    }

    /// `contains(field, 'text')`
    pub fn contains(field: &str, text: &str) -> Self {
        Filter::Contains {
            field: field.to_string(),
            text: text.to_string(),
        }
    }

    /// `self and other`
    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    /// `self or other`
    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Renders the expression as it goes into `$filter`.
    pub fn render(&self) -> String {
        match self {
            Filter::Compare { field, op, value } => {
                format!("{field} {} {}", op.as_str(), value.render())
            }
            Filter::StartsWith { field, prefix } => format!(
                "startswith({field},{})",
                Literal::Text(prefix.clone()).render()
            ),
            Filter::Contains { field, text } => format!(
                "contains({field},{})",
                Literal::Text(text.clone()).render()
            ),
            Filter::And(a, b) => format!("({}) and ({})", a.render(), b.render()),
            Filter::Or(a, b) => format!("({}) or ({})", a.render(), b.render()),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ── Resource paths ─────────────────────────────────────────────────────

/// A path under `AdminService/` plus its OData query options.
///
/// Building a path never talks to the server; whether the instance exists
/// is for the request to find out.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePath {
    class: String,
    key: Option<Key>,
    method: Option<String>,
    static_method: bool,
    filter: Option<Filter>,
    select: Vec<String>,
}

impl ResourcePath {
    /// `wmi/{class}`
    pub fn class(class: &str) -> Self {
        ResourcePath {
            class: class.to_string(),
            key: None,
            method: None,
            static_method: false,
            filter: None,
            select: Vec::new(),
        }
    }

    /// `wmi/{class}({key})`
    pub fn instance(class: &str, key: impl Into<Key>) -> Self {
        ResourcePath {
            key: Some(key.into()),
            ..Self::class(class)
        }
    }

    /// `wmi/{class}.{method}`
    pub fn static_method(class: &str, method: &str) -> Self {
        ResourcePath {
            method: Some(method.to_string()),
            static_method: true,
            ..Self::class(class)
        }
    }

    /// Appends `/AdminService.{method}` to an instance path.
    pub fn method(mut self, method: &str) -> Self {
        self.method = Some(method.to_string());
        self.static_method = false;
        self
    }

    /// Sets the `$filter` option.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the `$filter` option when one is given.
    pub fn maybe_filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    /// Adds properties to the `$select` option.
    pub fn select(mut self, fields: &[&str]) -> Self {
        self.select.extend(fields.iter().map(|f| (*f).to_string()));
        self
    }

    /// The WMI class this path addresses.
    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Path segment relative to the service root, without query options.
    pub fn segment(&self) -> String {
        let mut out = format!("wmi/{}", self.class);
        if let Some(key) = &self.key {
            out.push('(');
            out.push_str(&key.to_literal().render());
            out.push(')');
        }
        match (&self.method, self.static_method) {
            (Some(m), true) => {
                out.push('.');
                out.push_str(m);
            }
            (Some(m), false) => {
                out.push_str("/AdminService.");
                out.push_str(m);
            }
            (None, _) => {}
        }
        out
    }

    /// Query options as name/value pairs, unencoded.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(filter) = &self.filter {
            pairs.push(("$filter", filter.render()));
        }
        if !self.select.is_empty() {
            pairs.push(("$select", self.select.join(",")));
        }
        pairs
    }

    /// Resolves against the service root (which must end in `/`).
    pub fn to_url(&self, base: &Url) -> Result<Url, url::ParseError> {
        let mut url = base.join(&self.segment())?;
        let pairs = self.query_pairs();
        if !pairs.is_empty() {
            let mut q = url.query_pairs_mut();
            for (name, value) in &pairs {
                q.append_pair(name, value);
            }
        }
        Ok(url)
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segment())?;
        let pairs = self.query_pairs();
        for (i, (name, value)) in pairs.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{name}={value}")?;
        }
        Ok(())
    }
}

// ── Envelopes ──────────────────────────────────────────────────────────

/// OData collection wrapper: `{ "@odata.context": ..., "value": [...] }`.
#[derive(Debug, Deserialize)]
pub struct ODataList<T> {
    /// The array of result items.
    pub value: Vec<T>,
}

/// `true` when the body is a list envelope (`value` holding an array).
pub fn is_list_envelope(body: &Value) -> bool {
    matches!(body.get("value"), Some(Value::Array(_)))
}

/// Normalizes a response into its items: the `value` array of an
/// envelope, or a single-element list for a bare object.
pub fn list_payload(body: Value) -> Vec<Value> {
    match body {
        Value::Object(mut map) if matches!(map.get("value"), Some(Value::Array(_))) => {
            match map.remove("value") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            }
        }
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Normalizes a response into "the payload, or the first element of the
/// payload list". `None` for an empty list.
pub fn single_payload(body: Value) -> Option<Value> {
    list_payload(body).into_iter().next()
}

/// Removes `@odata.*` annotations so an object can be written back.
pub fn strip_annotations(object: &mut serde_json::Map<String, Value>) {
    object.retain(|k, _| !k.starts_with("@odata."));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_literals_double_embedded_quotes() {
        let f = Filter::eq("Name", "O'Brien's PCs");
        assert_eq!(f.render(), "Name eq 'O''Brien''s PCs'");
    }

    #[test]
    fn numeric_literals_render_bare() {
        assert_eq!(
            Filter::eq("ClientOperationId", 16777300_i64).render(),
            "ClientOperationId eq 16777300"
        );
    }

    #[test]
    fn compound_filters_parenthesize() {
        let f = Filter::eq("CollectionType", 2_i64).and(Filter::starts_with("Name", "Win"));
        assert_eq!(
            f.render(),
            "(CollectionType eq 2) and (startswith(Name,'Win'))"
        );
        let g = Filter::ne("Name", "a").or(Filter::contains("Comment", "x'y"));
        assert_eq!(g.render(), "(Name ne 'a') or (contains(Comment,'x''y'))");
    }

    #[test]
    fn class_and_instance_segments() {
        assert_eq!(ResourcePath::class("SMS_Collection").segment(), "wmi/SMS_Collection");
        assert_eq!(
            ResourcePath::instance("SMS_Collection", "PS100012").segment(),
            "wmi/SMS_Collection('PS100012')"
        );
        assert_eq!(
            ResourcePath::instance("SMS_R_System", 16777220_i64).segment(),
            "wmi/SMS_R_System(16777220)"
        );
    }

    #[test]
    fn method_segments() {
        assert_eq!(
            ResourcePath::instance("SMS_Collection", "PS100012")
                .method("AddMembershipRule")
                .segment(),
            "wmi/SMS_Collection('PS100012')/AdminService.AddMembershipRule"
        );
        assert_eq!(
            ResourcePath::static_method("SMS_ClientOperation", "InitiateClientOperationEx")
                .segment(),
            "wmi/SMS_ClientOperation.InitiateClientOperationEx"
        );
    }

    #[test]
    fn key_quotes_are_escaped_in_paths() {
        assert_eq!(
            ResourcePath::instance("SMS_Collection", "it's").segment(),
            "wmi/SMS_Collection('it''s')"
        );
    }

    #[test]
    fn url_carries_filter_and_select() {
        let base = Url::parse("https://cm01.contoso.com/AdminService/").unwrap();
        let url = ResourcePath::class("SMS_Collection")
            .filter(Filter::eq("Name", "Test Collection"))
            .select(&["CollectionID", "Name"])
            .to_url(&base)
            .unwrap();
        assert_eq!(url.path(), "/AdminService/wmi/SMS_Collection");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("$filter".to_string(), "Name eq 'Test Collection'".to_string()),
                ("$select".to_string(), "CollectionID,Name".to_string()),
            ]
        );
    }

    #[test]
    fn display_shows_unencoded_query() {
        let p = ResourcePath::class("SMS_R_System").filter(Filter::eq("Name", "PC01"));
        assert_eq!(p.to_string(), "wmi/SMS_R_System?$filter=Name eq 'PC01'");
    }

    #[test]
    fn single_payload_unwraps_envelope() {
        let body = json!({"@odata.context": "x", "value": [{"Name": "a"}, {"Name": "b"}]});
        assert_eq!(single_payload(body), Some(json!({"Name": "a"})));
    }

    #[test]
    fn single_payload_passes_bare_object_through() {
        let body = json!({"@odata.context": "x", "CollectionID": "PS100012"});
        let got = single_payload(body).unwrap();
        assert_eq!(got["CollectionID"], "PS100012");
    }

    #[test]
    fn single_payload_of_empty_list_is_none() {
        assert_eq!(single_payload(json!({"value": []})), None);
    }

    #[test]
    fn scalar_value_is_not_a_list_envelope() {
        // Method results such as `{"value": "..."}` are payloads, not lists.
        let body = json!({"value": "PS1"});
        assert!(!is_list_envelope(&body));
        assert_eq!(list_payload(body.clone()), vec![body]);
    }

    #[test]
    fn key_reads_strings_and_numbers() {
        assert_eq!(Key::from_json(&json!("PS100012")), Some(Key::Text("PS100012".into())));
        assert_eq!(Key::from_json(&json!(16777220)), Some(Key::Number(16777220)));
        assert_eq!(Key::from_json(&json!(null)), None);
        assert_eq!(Key::Text("42".into()).as_number(), Some(42));
    }

    #[test]
    fn strip_annotations_keeps_properties() {
        let mut obj = json!({"@odata.context": "x", "@odata.etag": "y", "Name": "a"})
            .as_object()
            .cloned()
            .unwrap();
        strip_annotations(&mut obj);
        assert_eq!(obj.len(), 1);
        assert!(obj.contains_key("Name"));
    }

    #[test]
    fn odata_list_handles_empty_collection() {
        let list: ODataList<Value> = serde_json::from_str(r#"{"value": []}"#).unwrap();
        assert!(list.value.is_empty());
    }
}
