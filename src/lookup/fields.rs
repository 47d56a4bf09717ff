//! Requested field sets.
//!
//! System fields (`status`, `message`, `query`) are protocol metadata: they are
//! never part of a caller-visible field set, always appended when asking the
//! upstream service, and stripped from payloads before storage.

use super::types::ResponseOptions;

/// Upstream metadata fields.
pub const SYSTEM_FIELDS: &[&str] = &["status", "message", "query"];

/// Response-only fields that toggle record metadata in rendered responses.
pub const META_FETCHED_AT: &str = "fetched_at";
pub const META_DATA_SOURCE: &str = "data_source";

/// Fields collected when the caller does not name any.
pub const DEFAULT_FIELDS: &[&str] = &[
    "country",
    "countryCode",
    "region",
    "regionName",
    "city",
    "zip",
    "lat",
    "lon",
    "timezone",
    "isp",
    "org",
    "as",
    "mobile",
    "proxy",
    "hosting",
];

/// Split a comma-separated request list into geolocation fields and the
/// response-only `fetched_at` / `data_source` toggles. When the list is absent
/// or leaves nothing caller-visible, the `fallback` list is used, then the
/// default fields.
pub fn parse_request(list: Option<&str>, fallback: Option<&str>) -> (FieldSet, ResponseOptions) {
    let names: Vec<&str> = list
        .map(|l| l.split(',').map(str::trim).collect())
        .unwrap_or_default();
    let opts = ResponseOptions {
        fetched_at: names.contains(&META_FETCHED_AT),
        data_source: names.contains(&META_DATA_SOURCE),
    };
    let fields = FieldSet::try_new(names.into_iter().filter(|n| !is_meta_field(n)))
        .or_else(|| {
            let fallback = fallback?.split(',').map(str::trim);
            FieldSet::try_new(fallback.filter(|n| !is_meta_field(n)))
        })
        .unwrap_or_default();
    (fields, opts)
}

fn is_meta_field(name: &str) -> bool {
    name == META_FETCHED_AT || name == META_DATA_SOURCE
}

pub fn is_system_field(name: &str) -> bool {
    SYSTEM_FIELDS.contains(&name)
}

/// Ordered, de-duplicated set of caller-visible field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSet {
    names: Vec<String>,
}

impl FieldSet {
    /// Build a set from names, dropping blanks, duplicates and system fields.
    /// An empty result falls back to [`DEFAULT_FIELDS`].
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::try_new(names).unwrap_or_default()
    }

    /// Like [`FieldSet::new`] but `None` when nothing caller-visible remains.
    pub fn try_new<I, S>(names: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() || is_system_field(name) || out.iter().any(|n| n == name) {
                continue;
            }
            out.push(name.to_string());
        }
        if out.is_empty() {
            None
        } else {
            Some(Self { names: out })
        }
    }

    /// Parse a comma-separated list, e.g. the `fields` query parameter.
    pub fn parse(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Value of the upstream `fields` parameter: requested fields plus the
    /// system fields the upstream response parser relies on.
    pub fn upstream_param(&self) -> String {
        self.iter()
            .chain(SYSTEM_FIELDS.iter().copied())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for FieldSet {
    fn default() -> Self {
        Self {
            names: DEFAULT_FIELDS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
