//! Metrics extraction from classified analysis-service responses.

use log::{debug, warn};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::classify::{Envelope, ShapeKind, classify};
use crate::error::{DashboardError, Result, excerpt};
use crate::metrics::{
    CUSTOMER_SOURCES_KEY, Coerced, CounterMap, MetricsPatch, PAYMENT_STATUS_KEY, ScalarField,
    coerce_number, now_iso, to_count,
};

/// Encoded strings inside encoded strings are followed at most this deep.
const MAX_DEPTH: usize = 4;

const MESSAGE_KEYS: [&str; 2] = ["customer_message", "summary"];
const DATE_KEYS: [&str; 3] = ["analysis_date", "timestamp", "processed_at"];
const ROW_DATE_KEYS: [&str; 2] = ["updated_at", "created_at"];
const RECOMMENDATION_KEYS: [&str; 2] = ["recommendations", "recommendation_list"];
const RECOMMENDATION_TEXT_KEYS: [&str; 3] = ["title", "text", "recommendation"];

/// A value that was present in the response but could not be used.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RejectedField {
    pub field: String,
    pub raw: String,
}

/// Best-effort result of reading one response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Extraction {
    pub shape: ShapeKind,
    pub patch: MetricsPatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decode_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_error: Option<String>,
    /// Excerpt of an embedded payload that matched no known shape.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unrecognized: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedField>,
}

impl Extraction {
    fn empty(shape: ShapeKind) -> Self {
        Extraction {
            shape,
            patch: MetricsPatch::default(),
            decode_error: None,
            upstream_error: None,
            unrecognized: None,
            rejected: Vec::new(),
        }
    }

    pub fn has_metrics(&self) -> bool {
        self.patch.has_metrics()
    }

    /// Why this extraction must not replace the current state, if it must not.
    pub fn failure(&self) -> Option<DashboardError> {
        if let Some(message) = &self.upstream_error {
            return Some(DashboardError::Upstream(message.clone()));
        }
        if let Some(message) = &self.decode_error {
            return Some(DashboardError::InvalidJson {
                excerpt: message.clone(),
            });
        }
        if let Some(payload) = &self.unrecognized {
            return Some(DashboardError::UnrecognizedResponse {
                excerpt: payload.clone(),
            });
        }
        if self.shape == ShapeKind::Unrecognized {
            return Some(DashboardError::UnrecognizedResponse {
                excerpt: "no known envelope".to_string(),
            });
        }
        None
    }

    fn reject(&mut self, field: &str, raw: impl Into<String>) {
        self.rejected.push(RejectedField {
            field: field.to_string(),
            raw: raw.into(),
        });
    }

    fn read_metrics_value(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Object(map) => match map.get("metrics").and_then(Value::as_object) {
                // Tolerate one more wrap wherever it shows up.
                Some(inner) => self.read_metrics(inner),
                None => self.read_metrics(map),
            },
            Value::String(raw) => match decode_nested(raw, depth) {
                Ok(parsed) => self.read_metrics_value(&parsed, depth + 1),
                Err(message) => self.decode_error = Some(message),
            },
            Value::Null => {}
            other => self.reject("metrics", other.to_string()),
        }
    }

    fn read_metrics(&mut self, map: &Map<String, Value>) {
        for field in ScalarField::ALL {
            let Some(value) = map.get(field.key()) else {
                continue;
            };
            match coerce_number(value) {
                Coerced::Number(v) => self.patch.set(field, v),
                Coerced::Unparsable(raw) => self.reject(field.key(), raw),
                Coerced::Missing => {}
            }
        }

        if let Some(value) = map.get(CUSTOMER_SOURCES_KEY) {
            if let Some(counts) = self.read_counters(CUSTOMER_SOURCES_KEY, value) {
                self.patch.customer_sources = Some(counts);
            }
        }
        if let Some(value) = map.get(PAYMENT_STATUS_KEY) {
            if let Some(counts) = self.read_counters(PAYMENT_STATUS_KEY, value) {
                self.patch.payment_status = Some(counts);
            }
        }

        if let Some(labels) = map.get("neukunden_labels").and_then(Value::as_array) {
            self.patch.new_customer_labels = Some(labels.iter().map(value_text).collect());
        }
        if let Some(series) = map.get("neukunden_monat").and_then(Value::as_array) {
            let parsed: Vec<Coerced> = series.iter().map(coerce_number).collect();
            let numbers: Vec<f64> = parsed
                .iter()
                .filter_map(|c| match c {
                    Coerced::Number(v) => Some(*v),
                    _ => None,
                })
                .collect();
            if numbers.len() == series.len() {
                self.patch.new_customers_per_month = Some(numbers);
            } else {
                // A partial series would no longer line up with its labels.
                self.reject("neukunden_monat", Value::Array(series.clone()).to_string());
            }
        }
    }

    fn read_counters(&mut self, field: &str, value: &Value) -> Option<CounterMap> {
        let decoded;
        let map = match value {
            Value::Object(map) => map,
            Value::String(raw) => {
                decoded = serde_json::from_str::<Value>(raw).ok();
                match decoded.as_ref().and_then(Value::as_object) {
                    Some(map) => map,
                    None => {
                        self.reject(field, raw.clone());
                        return None;
                    }
                }
            }
            Value::Null => return None,
            other => {
                self.reject(field, other.to_string());
                return None;
            }
        };

        let mut counts = CounterMap::new();
        for (key, raw) in map {
            match coerce_number(raw) {
                Coerced::Number(v) => match to_count(v) {
                    Some(count) => {
                        counts.insert(key.clone(), count);
                    }
                    None => self.reject(&format!("{field}.{key}"), v.to_string()),
                },
                Coerced::Unparsable(text) => self.reject(&format!("{field}.{key}"), text),
                Coerced::Missing => {}
            }
        }
        Some(counts)
    }

    /// Fill narrative fields from `map`; earlier sources win.
    fn read_metadata(&mut self, map: &Map<String, Value>) {
        if self.patch.recommendations.is_none() {
            if let Some(value) = RECOMMENDATION_KEYS.iter().find_map(|key| map.get(*key)) {
                self.patch.recommendations = Some(recommendation_list(value));
            }
        }
        if self.patch.customer_message.is_none() {
            self.patch.customer_message = first_text(map, &MESSAGE_KEYS);
        }
        if self.patch.analysis_date.is_none() {
            self.patch.analysis_date = first_text(map, &DATE_KEYS);
        }
    }

    fn read_row_dates(&mut self, map: &Map<String, Value>) {
        if self.patch.analysis_date.is_none() {
            self.patch.analysis_date = first_text(map, &ROW_DATE_KEYS);
        }
    }

    fn read_tenant(&mut self, map: &Map<String, Value>) {
        if self.patch.tenant_id.is_none() {
            self.patch.tenant_id = first_text(map, &["tenant_id"]);
        }
    }

    fn read_analysis_result(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Object(map) => {
                match map.get("metrics") {
                    Some(metrics) => self.read_metrics_value(metrics, depth),
                    None => self.read_metrics(map),
                }
                self.read_metadata(map);
            }
            Value::String(raw) => match decode_nested(raw, depth) {
                Ok(parsed) => self.read_analysis_result(&parsed, depth + 1),
                Err(message) => self.decode_error = Some(message),
            },
            _ => {}
        }
    }

    /// Take over everything a nested extraction of `source` found, keeping our own shape.
    fn absorb(&mut self, nested: Extraction, source: &Value) {
        let shape = self.shape;
        let unrecognized = nested.shape == ShapeKind::Unrecognized;
        *self = nested;
        self.shape = shape;
        if unrecognized {
            self.unrecognized = Some(excerpt(&source.to_string()));
        }
    }

    fn finish(mut self) -> Self {
        self.patch.recommendations.get_or_insert_with(Vec::new);
        self.patch.customer_message.get_or_insert_with(String::new);
        if self.patch.analysis_date.is_none() {
            self.patch.analysis_date = Some(now_iso());
        }
        for rejected in &self.rejected {
            warn!(
                "Ignoring unparsable value for {}: {}",
                rejected.field,
                excerpt(&rejected.raw)
            );
        }
        self
    }
}

/// Extract canonical fields from a classified envelope. Never fails.
pub fn extract(envelope: &Envelope<'_>) -> Extraction {
    extract_at(envelope, 0).finish()
}

/// Classify and extract in one go.
pub fn extract_value(value: &Value) -> Extraction {
    extract(&classify(value))
}

/// Parse a raw response body as JSON.
pub fn parse_body(body: &[u8]) -> Result<Value> {
    serde_json::from_slice(body).map_err(|_| DashboardError::InvalidJson {
        excerpt: excerpt(&String::from_utf8_lossy(body)),
    })
}

fn extract_at(envelope: &Envelope<'_>, depth: usize) -> Extraction {
    let mut out = Extraction::empty(envelope.kind());
    debug!("Extracting metrics from {:?} response", out.shape);

    if depth > MAX_DEPTH {
        out.decode_error = Some("response is nested too deeply".to_string());
        return out;
    }

    match *envelope {
        Envelope::Enveloped { outer, data } => {
            if let Some(status) = outer.get("status").and_then(Value::as_str) {
                if !status.eq_ignore_ascii_case("success") {
                    let message = first_text(outer, &["message", "error"])
                        .or_else(|| first_text(data, &["message", "error"]))
                        .unwrap_or_else(|| format!("status {status}"));
                    out.upstream_error = Some(message);
                    return out;
                }
            }
            // `count: 0` means the service has nothing stored for this tenant.
            let empty = outer.get("count").and_then(Value::as_u64) == Some(0);
            if !empty {
                match data.get("metrics") {
                    Some(metrics) => out.read_metrics_value(metrics, depth),
                    None => out.read_metrics(data),
                }
            }
            out.read_metadata(data);
            out.read_tenant(outer);
            out.read_tenant(data);
        }
        Envelope::DoublyNestedMetrics { outer, inner } => {
            out.read_metrics(inner);
            // Only the metrics are double-wrapped upstream, not the narrative.
            out.read_metadata(outer);
            out.read_tenant(outer);
        }
        Envelope::Direct { outer } => {
            match outer.get("metrics") {
                Some(metrics) => out.read_metrics_value(metrics, depth),
                None => {
                    if let Some(result) = outer.get("analysis_result") {
                        out.read_analysis_result(result, depth);
                    }
                }
            }
            out.read_metadata(outer);
            out.read_row_dates(outer);
            out.read_tenant(outer);
        }
        Envelope::FlatMetrics { fields } => {
            out.read_metrics(fields);
            out.read_metadata(fields);
            out.read_tenant(fields);
        }
        Envelope::ArrayOfRows { rows } => {
            // Rows are appended upstream, so the last one is the newest analysis.
            let Some(row) = rows.last() else {
                return out;
            };
            match row.get("analysis_result").and_then(Value::as_str) {
                Some(raw) => match decode_nested(raw, depth) {
                    Ok(parsed) => out.absorb(extract_at(&classify(&parsed), depth + 1), &parsed),
                    Err(message) => out.decode_error = Some(message),
                },
                None => out.absorb(extract_at(&classify(row), depth + 1), row),
            }
            if let Some(map) = row.as_object() {
                out.read_metadata(map);
                out.read_row_dates(map);
                out.read_tenant(map);
            }
        }
        Envelope::EncodedString { raw } => match decode_nested(raw, depth) {
            Ok(parsed) => out.absorb(extract_at(&classify(&parsed), depth + 1), &parsed),
            Err(message) => out.decode_error = Some(message),
        },
        Envelope::Unrecognized => {}
    }

    out
}

fn decode_nested(raw: &str, depth: usize) -> std::result::Result<Value, String> {
    if depth >= MAX_DEPTH {
        return Err("response is nested too deeply".to_string());
    }
    serde_json::from_str(raw).map_err(|e| format!("embedded JSON is invalid ({e}): {}", excerpt(raw)))
}

fn first_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .map(value_text)
        .find(|text| !text.trim().is_empty())
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn recommendation_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(recommendation_text).collect(),
        Value::String(raw) if raw.trim_start().starts_with('[') => {
            match serde_json::from_str::<Value>(raw) {
                Ok(parsed @ Value::Array(_)) => recommendation_list(&parsed),
                _ => vec![raw.clone()],
            }
        }
        other => recommendation_text(other).into_iter().collect(),
    }
}

fn recommendation_text(item: &Value) -> Option<String> {
    let text = match item {
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => RECOMMENDATION_TEXT_KEYS
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| item.to_string()),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}
