//! Decoding the metric definition catalogue into data dictionary rows.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use super::STORE_TARGET;

/// The definition document had no usable shape.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DictionaryError {
    /// Neither the lookup key nor the top level held an object or array of definitions.
    #[error("definition document is not an object or array of definitions")]
    UnexpectedShape,
}

/// One row of the `data_dictionary` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDictionaryEntry {
    /// `lower(stat_type).lower(name)`; matches the fact index.
    pub index: String,
    /// Statistic family, e.g. `CPU`.
    pub stat_type: String,
    /// Statistic name within the family.
    pub name: String,
    /// Value type reported by the vendor.
    pub kind: Option<String>,
    /// Aggregation method.
    pub method: Option<String>,
    /// Unit of measure.
    pub unit: Option<String>,
    /// Display precision.
    pub precision: Option<i64>,
}

impl DataDictionaryEntry {
    /// Builds an entry with only the identifying fields set.
    #[must_use]
    pub fn new(stat_type: impl Into<String>, name: impl Into<String>) -> Self {
        let stat_type = stat_type.into();
        let name = name.into();
        Self {
            index: index_for(&stat_type, &name),
            stat_type,
            name,
            kind: None,
            method: None,
            unit: None,
            precision: None,
        }
    }
}

/// Derives the fact index for a definition.
#[must_use]
pub fn index_for(stat_type: &str, name: &str) -> String {
    format!("{}.{}", stat_type.to_lowercase(), name.to_lowercase())
}

#[derive(Debug, Deserialize)]
struct RawDefinition {
    stat_type: String,
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    precision: Option<Value>,
}

impl From<RawDefinition> for DataDictionaryEntry {
    fn from(raw: RawDefinition) -> Self {
        let mut entry = Self::new(raw.stat_type, raw.name);
        entry.kind = raw.kind;
        entry.method = raw.method;
        entry.unit = raw.unit;
        entry.precision = raw.precision.as_ref().and_then(precision);
        entry
    }
}

fn precision(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Entries decoded from a definition document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Definitions {
    /// Usable entries in document order.
    pub entries: Vec<DataDictionaryEntry>,
    /// Definitions missing `stat_type` or `name`.
    pub skipped: usize,
}

/// Turns the definition command's JSON into dictionary entries.
///
/// Definitions are taken from under `lookup_key` when present, else from the
/// top level; either an object of definitions or an array of them is accepted.
pub fn decode_definitions(document: &Value, lookup_key: &str) -> Result<Definitions, DictionaryError> {
    let container = match document.get(lookup_key) {
        Some(nested @ (Value::Object(_) | Value::Array(_))) => nested,
        _ => document,
    };
    let candidates: Vec<&Value> = match container {
        Value::Object(map) => map.values().collect(),
        Value::Array(items) => items.iter().collect(),
        _ => return Err(DictionaryError::UnexpectedShape),
    };

    let mut definitions = Definitions::default();
    for candidate in candidates {
        match RawDefinition::deserialize(candidate) {
            Ok(raw) => definitions.entries.push(raw.into()),
            Err(error) => {
                warn!(target: STORE_TARGET, %error, "skipping unusable definition");
                definitions.skipped += 1;
            }
        }
    }
    Ok(definitions)
}
