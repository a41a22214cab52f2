//! Reshape stage: flatten the nested sample into `(index, device, value)` rows.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use super::PIPELINE_TARGET;

/// Structural problems that leave a sample unusable.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ReshapeError {
    /// The document's top level was not a JSON object.
    #[error("sample is a JSON {found}, expected an object")]
    NotAnObject {
        /// JSON type that was found instead.
        found: &'static str,
    },
    /// The lookup key was present but did not hold an object.
    #[error("lookup key holds a JSON {found}, expected an object")]
    MalformedLookup {
        /// JSON type that was found instead.
        found: &'static str,
    },
}

/// One metric reading from one device.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    /// Metric index identifier, e.g. `cpu.temp`.
    pub index: String,
    /// Device the reading came from.
    pub device: String,
    /// Numeric reading.
    pub value: f64,
}

impl MetricRow {
    /// Convenience constructor.
    #[must_use]
    pub fn new(index: impl Into<String>, device: impl Into<String>, value: f64) -> Self {
        Self {
            index: index.into(),
            device: device.into(),
            value,
        }
    }
}

/// Where the metric map was found inside a sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleShape<'a> {
    /// Metrics nested under the lookup key.
    Keyed {
        /// Lookup key the metrics were found under.
        key: &'a str,
        /// Index → device → value map.
        metrics: &'a Map<String, Value>,
    },
    /// Metrics at the top level of the document.
    Whole {
        /// Index → device → value map.
        metrics: &'a Map<String, Value>,
    },
}

impl<'a> SampleShape<'a> {
    /// Locates the metric map in `sample`.
    ///
    /// The sub-object under `lookup_key` wins when present; otherwise the
    /// whole top-level object is used.
    pub fn decode(sample: &'a Value, lookup_key: &'a str) -> Result<Self, ReshapeError> {
        let Value::Object(top) = sample else {
            return Err(ReshapeError::NotAnObject {
                found: json_type(sample),
            });
        };
        match top.get(lookup_key) {
            Some(Value::Object(metrics)) if !lookup_key.is_empty() => Ok(Self::Keyed {
                key: lookup_key,
                metrics,
            }),
            Some(other) if !lookup_key.is_empty() => Err(ReshapeError::MalformedLookup {
                found: json_type(other),
            }),
            _ => Ok(Self::Whole { metrics: top }),
        }
    }

    /// The metric map regardless of where it was found.
    #[must_use]
    pub const fn metrics(&self) -> &'a Map<String, Value> {
        match self {
            Self::Keyed { metrics, .. } | Self::Whole { metrics } => metrics,
        }
    }

    /// Flattens the metric map in document order.
    #[must_use]
    pub fn rows(&self) -> Reshaped {
        let mut reshaped = Reshaped::default();
        for (index, devices) in self.metrics() {
            let Value::Object(devices) = devices else {
                debug!(
                    target: PIPELINE_TARGET,
                    %index,
                    "skipping metric entry that is not a device map"
                );
                reshaped.skipped += 1;
                continue;
            };
            for (device, reading) in devices {
                match numeric(reading) {
                    Some(value) => reshaped.rows.push(MetricRow::new(index, device, value)),
                    None => reshaped.skipped += 1,
                }
            }
        }
        if reshaped.skipped > 0 {
            debug!(
                target: PIPELINE_TARGET,
                skipped = reshaped.skipped,
                "skipped non-numeric readings"
            );
        }
        reshaped
    }
}

/// Rows produced by reshaping plus the number of entries left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reshaped {
    /// Flattened rows in document order.
    pub rows: Vec<MetricRow>,
    /// Metric entries and leaves that were not numeric.
    pub skipped: usize,
}

/// Decodes and flattens `sample` in one step.
pub fn reshape(sample: &Value, lookup_key: &str) -> Result<Reshaped, ReshapeError> {
    SampleShape::decode(sample, lookup_key).map(|shape| shape.rows())
}

fn numeric(reading: &Value) -> Option<f64> {
    match reading {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        Value::Bool(flag) => Some(f64::from(u8::from(*flag))),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
    .filter(|value| value.is_finite())
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    fn keyed_sample_flattens_in_document_order() {
        let sample = json!({
            "lookup": {
                "cpu.temp": {"node1": 42, "node2": 45},
                "cpu.power": {"node1": 101},
            },
            "ignored": {"x": 1},
        });
        let shape = SampleShape::decode(&sample, "lookup").expect("object sample");
        assert!(matches!(shape, SampleShape::Keyed { key: "lookup", .. }));
        assert_eq!(
            shape.rows().rows,
            vec![
                MetricRow::new("cpu.temp", "node1", 42.0),
                MetricRow::new("cpu.temp", "node2", 45.0),
                MetricRow::new("cpu.power", "node1", 101.0),
            ]
        );
    }

    #[rstest]
    fn absent_lookup_key_uses_whole_document() {
        let sample = json!({"mem.used": {"node3": 7.5}});
        let shape = SampleShape::decode(&sample, "lookup").expect("object sample");
        assert!(matches!(shape, SampleShape::Whole { .. }));
        assert_eq!(
            shape.rows().rows,
            vec![MetricRow::new("mem.used", "node3", 7.5)]
        );
    }

    #[rstest]
    #[case(json!([1, 2, 3]), "array")]
    #[case(json!("text"), "string")]
    #[case(json!(null), "null")]
    fn non_object_sample_is_rejected(#[case] sample: Value, #[case] found: &'static str) {
        assert_eq!(
            reshape(&sample, "lookup"),
            Err(ReshapeError::NotAnObject { found })
        );
    }

    #[rstest]
    fn scalar_under_lookup_key_is_rejected() {
        let sample = json!({"lookup": 3});
        assert_eq!(
            reshape(&sample, "lookup"),
            Err(ReshapeError::MalformedLookup { found: "number" })
        );
    }

    #[rstest]
    fn odd_leaves_are_coerced_or_skipped() {
        let sample = json!({
            "fan.rpm": {"a": "1200", "b": true, "c": null, "d": [1], "e": "n/a"},
            "flat": 5,
        });
        let reshaped = reshape(&sample, "lookup").expect("object sample");
        assert_eq!(
            reshaped.rows,
            vec![
                MetricRow::new("fan.rpm", "a", 1200.0),
                MetricRow::new("fan.rpm", "b", 1.0),
            ]
        );
        assert_eq!(reshaped.skipped, 4);
    }

    #[rstest]
    fn empty_lookup_key_never_matches() {
        let sample = json!({"": {"cpu.temp": {"n": 1}}, "cpu.load": {"n": 2}});
        let shape = SampleShape::decode(&sample, "").expect("object sample");
        assert!(matches!(shape, SampleShape::Whole { .. }));
    }
}
