//! Core types for the lookup subsystem.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::fields::FieldSet;

/// Where a host record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Local,
    Remote,
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// A single geolocation attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    /// Convert a scalar JSON value. `Ok(None)` for null, `Err` for arrays and objects.
    pub fn from_json(value: &Value) -> Result<Option<Self>, String> {
        match value {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(Self::Bool(*b))),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Some(Self::Integer(i))),
                None => n
                    .as_f64()
                    .map(|f| Some(Self::Float(f)))
                    .ok_or_else(|| format!("number out of range: {}", n)),
            },
            Value::String(s) => Ok(Some(Self::Text(s.clone()))),
            Value::Array(_) | Value::Object(_) => Err(format!("non-scalar value: {}", value)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Float(f) => Value::from(*f),
            Self::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Field name to value, ordered by name so serialized records are deterministic.
pub type Fields = BTreeMap<String, FieldValue>;

/// One resolved or cached geolocation entry.
///
/// `host`, `fetched_at` and `source` are fixed at construction. The field map
/// can only be changed through an owned value, so a record handed to the cache
/// or to a caller is never mutated behind their back.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRecord {
    host: String,
    fetched_at: DateTime<Utc>,
    source: RecordSource,
    fields: Fields,
}

impl HostRecord {
    pub fn new(
        host: impl Into<String>,
        fetched_at: DateTime<Utc>,
        source: RecordSource,
        fields: Fields,
    ) -> Self {
        Self {
            host: host.into(),
            fetched_at,
            source,
            fields,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn source(&self) -> RecordSource {
        self.source
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// True when every requested field is present. Extra fields are ignored.
    pub fn has_all_fields(&self, fields: &FieldSet) -> bool {
        fields.iter().all(|f| self.fields.contains_key(f))
    }

    /// Copy of this record restricted to the requested fields.
    pub fn project(&self, fields: &FieldSet) -> HostRecord {
        HostRecord {
            host: self.host.clone(),
            fetched_at: self.fetched_at,
            source: self.source,
            fields: self
                .fields
                .iter()
                .filter(|(k, _)| fields.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Status of a single host resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Success,
    Fail,
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Fail => write!(f, "fail"),
        }
    }
}

/// Result of resolving one host. A failure still echoes the requested host so
/// batch results can be matched back to their requests.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Success(HostRecord),
    Fail { host: String, message: String },
}

impl QueryOutcome {
    pub fn fail(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fail {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> QueryStatus {
        match self {
            Self::Success(_) => QueryStatus::Success,
            Self::Fail { .. } => QueryStatus::Fail,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Success(record) => record.host(),
            Self::Fail { host, .. } => host,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::Fail { message, .. } => Some(message),
        }
    }

    pub fn record(&self) -> Option<&HostRecord> {
        match self {
            Self::Success(record) => Some(record),
            Self::Fail { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Render in the upstream response shape: `{query, status, ...fields}` or
    /// `{query, status: "fail", message}`.
    pub fn to_json(&self, opts: ResponseOptions) -> Value {
        let mut obj = Map::new();
        obj.insert("query".into(), Value::String(self.host().to_string()));
        obj.insert("status".into(), Value::String(self.status().to_string()));
        match self {
            Self::Success(record) => {
                for (name, value) in record.fields() {
                    obj.insert(name.clone(), value.to_json());
                }
                if opts.fetched_at {
                    obj.insert(
                        "fetched_at".into(),
                        Value::String(record.fetched_at().to_rfc3339_opts(SecondsFormat::Secs, true)),
                    );
                }
                if opts.data_source {
                    obj.insert("data_source".into(), Value::String(record.source().to_string()));
                }
            }
            Self::Fail { message, .. } => {
                obj.insert("message".into(), Value::String(message.clone()));
            }
        }
        Value::Object(obj)
    }
}

/// Extra record metadata to include when rendering an outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseOptions {
    pub fetched_at: bool,
    pub data_source: bool,
}

/// Local address validation failures. The messages match the upstream
/// service's own wording so local and remote failures look alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid query")]
    InvalidAddress,

    #[error("private range")]
    PrivateRange,
}

/// Hard failures of a lookup. These abort the whole call, single or batch.
#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("Remote error: {status}")]
    Remote { status: u16, body: String },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Malformed upstream payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid remote status: {0}")]
    InvalidUpstreamStatus(String),

    #[error("Invalid batch size: {size}, maximum allowed size is {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Rate limit wait would exceed the lookup deadline after {waited:?}")]
    Timeout { waited: Duration },
}
