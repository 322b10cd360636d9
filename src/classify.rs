//! Response shape detection for analysis-service payloads.
//!
//! The analysis workflow has answered in several shapes over time. [`classify`]
//! maps a parsed JSON value onto exactly one [`Envelope`] variant so the
//! extractor never has to guess.

use serde::Serialize;
use serde_json::{Map, Value};

/// Top-level keys that mark an object as a flat metrics payload.
pub const BUSINESS_KEYS: [&str; 9] = [
    "belegt",
    "frei",
    "belegungsgrad",
    "vertragsdauer_durchschnitt",
    "reminder_automat",
    "social_facebook",
    "social_google",
    "kundenherkunft",
    "zahlungsstatus",
];

/// A classified response, borrowing from the value it was built from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Envelope<'a> {
    /// Non-empty array of rows, e.g. a database export.
    ArrayOfRows { rows: &'a [Value] },
    /// `{"status": ..., "count": ..., "data": {...}}`
    Enveloped {
        outer: &'a Map<String, Value>,
        data: &'a Map<String, Value>,
    },
    /// `{"metrics": {"metrics": {...}}, ...}`, an upstream double wrap.
    DoublyNestedMetrics {
        outer: &'a Map<String, Value>,
        inner: &'a Map<String, Value>,
    },
    /// `{"metrics": ...}` or `{"analysis_result": ...}` without an envelope.
    Direct { outer: &'a Map<String, Value> },
    /// Business fields directly at the top level.
    FlatMetrics { fields: &'a Map<String, Value> },
    /// A JSON document encoded into a string.
    EncodedString { raw: &'a str },
    Unrecognized,
}

/// Variant tag of an [`Envelope`], without the borrowed payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    ArrayOfRows,
    Enveloped,
    DoublyNestedMetrics,
    Direct,
    FlatMetrics,
    EncodedString,
    Unrecognized,
}

impl Envelope<'_> {
    pub fn kind(&self) -> ShapeKind {
        match self {
            Envelope::ArrayOfRows { .. } => ShapeKind::ArrayOfRows,
            Envelope::Enveloped { .. } => ShapeKind::Enveloped,
            Envelope::DoublyNestedMetrics { .. } => ShapeKind::DoublyNestedMetrics,
            Envelope::Direct { .. } => ShapeKind::Direct,
            Envelope::FlatMetrics { .. } => ShapeKind::FlatMetrics,
            Envelope::EncodedString { .. } => ShapeKind::EncodedString,
            Envelope::Unrecognized => ShapeKind::Unrecognized,
        }
    }
}

/// Classify a JSON value. Checks run in a fixed order and the first match wins:
/// arrays, `data` envelopes, doubly nested metrics, direct metrics, flat
/// business fields, encoded strings.
pub fn classify(value: &Value) -> Envelope<'_> {
    match value {
        Value::Array(rows) if !rows.is_empty() => Envelope::ArrayOfRows { rows },
        Value::Object(outer) => classify_object(outer),
        Value::String(raw) if looks_like_json(raw) => Envelope::EncodedString { raw },
        _ => Envelope::Unrecognized,
    }
}

fn classify_object(outer: &Map<String, Value>) -> Envelope<'_> {
    if let Some(data) = outer.get("data").and_then(Value::as_object) {
        return Envelope::Enveloped { outer, data };
    }

    // Must run before the direct check: a double wrap also has a `metrics` key.
    if let Some(inner) = outer
        .get("metrics")
        .and_then(Value::as_object)
        .and_then(|metrics| metrics.get("metrics"))
        .and_then(Value::as_object)
    {
        return Envelope::DoublyNestedMetrics { outer, inner };
    }

    if carries_payload(outer.get("metrics")) || carries_payload(outer.get("analysis_result")) {
        return Envelope::Direct { outer };
    }

    if BUSINESS_KEYS.iter().any(|key| outer.contains_key(*key)) {
        return Envelope::FlatMetrics { fields: outer };
    }

    Envelope::Unrecognized
}

fn carries_payload(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Object(_)) => true,
        Some(Value::String(raw)) => looks_like_json(raw),
        _ => false,
    }
}

/// Cheap pre-check before attempting a second parse pass on a string.
pub fn looks_like_json(raw: &str) -> bool {
    let trimmed = raw.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}
