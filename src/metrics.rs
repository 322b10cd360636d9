use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Channel names used for customer-source counters
pub const CUSTOMER_CHANNELS: [&str; 3] = ["Online", "Empfehlung", "Vorbeikommen"];

/// Status names used for payment-status counters
pub const PAYMENT_STATUSES: [&str; 3] = ["bezahlt", "offen", "überfällig"];

/// Wire key of the customer-source counter map
pub const CUSTOMER_SOURCES_KEY: &str = "kundenherkunft";

/// Wire key of the payment-status counter map
pub const PAYMENT_STATUS_KEY: &str = "zahlungsstatus";

pub type CounterMap = BTreeMap<String, i64>;

/// Numeric scalar fields of [`CanonicalMetrics`]
///
/// Serialized with the wire key used by the analysis service, which lets a
/// scalar map be written straight into JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarField {
    #[serde(rename = "belegt")]
    OccupiedUnits,
    #[serde(rename = "frei")]
    FreeUnits,
    #[serde(rename = "vertragsdauer_durchschnitt")]
    AvgContractMonths,
    #[serde(rename = "reminder_automat")]
    AutoReminders,
    #[serde(rename = "social_facebook")]
    SocialFacebook,
    #[serde(rename = "social_google")]
    SocialGoogle,
    #[serde(rename = "belegungsgrad")]
    OccupancyPct,
}

impl ScalarField {
    pub const ALL: [ScalarField; 7] = [
        ScalarField::OccupiedUnits,
        ScalarField::FreeUnits,
        ScalarField::AvgContractMonths,
        ScalarField::AutoReminders,
        ScalarField::SocialFacebook,
        ScalarField::SocialGoogle,
        ScalarField::OccupancyPct,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ScalarField::OccupiedUnits => "belegt",
            ScalarField::FreeUnits => "frei",
            ScalarField::AvgContractMonths => "vertragsdauer_durchschnitt",
            ScalarField::AutoReminders => "reminder_automat",
            ScalarField::SocialFacebook => "social_facebook",
            ScalarField::SocialGoogle => "social_google",
            ScalarField::OccupancyPct => "belegungsgrad",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    /// Label shown on KPI tiles and chart captions
    pub fn label(self) -> &'static str {
        match self {
            ScalarField::OccupiedUnits => "Belegte Einheiten",
            ScalarField::FreeUnits => "Freie Einheiten",
            ScalarField::AvgContractMonths => "Ø Vertragsdauer (Monate)",
            ScalarField::AutoReminders => "Auto-Reminder gesendet",
            ScalarField::SocialFacebook => "Facebook-Follower",
            ScalarField::SocialGoogle => "Google Reviews",
            ScalarField::OccupancyPct => "Belegungsgrad (%)",
        }
    }
}

/// The normalized business record handed to the presentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMetrics {
    #[serde(rename = "belegt")]
    pub occupied_units: f64,
    #[serde(rename = "frei")]
    pub free_units: f64,
    #[serde(rename = "vertragsdauer_durchschnitt")]
    pub avg_contract_months: f64,
    #[serde(rename = "reminder_automat")]
    pub auto_reminders: f64,
    pub social_facebook: f64,
    pub social_google: f64,
    #[serde(rename = "belegungsgrad")]
    pub occupancy_pct: f64,
    #[serde(rename = "kundenherkunft", default)]
    pub customer_sources: CounterMap,
    #[serde(rename = "zahlungsstatus", default)]
    pub payment_status: CounterMap,
    #[serde(rename = "neukunden_labels", default)]
    pub new_customer_labels: Vec<String>,
    #[serde(rename = "neukunden_monat", default)]
    pub new_customers_per_month: Vec<f64>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub customer_message: String,
    pub analysis_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl CanonicalMetrics {
    /// The template every analysis cycle starts from.
    pub fn defaults() -> Self {
        CanonicalMetrics {
            occupied_units: 18.0,
            free_units: 6.0,
            avg_contract_months: 7.2,
            auto_reminders: 15.0,
            social_facebook: 280.0,
            social_google: 58.0,
            occupancy_pct: 75.0,
            customer_sources: counters(&[("Online", 12), ("Empfehlung", 6), ("Vorbeikommen", 4)]),
            payment_status: counters(&[("bezahlt", 21), ("offen", 2), ("überfällig", 1)]),
            new_customer_labels: ["Jan", "Feb", "Mär", "Apr", "Mai", "Jun"]
                .iter()
                .map(|label| label.to_string())
                .collect(),
            new_customers_per_month: vec![5.0, 4.0, 7.0, 6.0, 8.0, 9.0],
            recommendations: Vec::new(),
            customer_message: String::new(),
            analysis_date: now_iso(),
            tenant_id: None,
        }
    }

    pub fn scalar(&self, field: ScalarField) -> f64 {
        match field {
            ScalarField::OccupiedUnits => self.occupied_units,
            ScalarField::FreeUnits => self.free_units,
            ScalarField::AvgContractMonths => self.avg_contract_months,
            ScalarField::AutoReminders => self.auto_reminders,
            ScalarField::SocialFacebook => self.social_facebook,
            ScalarField::SocialGoogle => self.social_google,
            ScalarField::OccupancyPct => self.occupancy_pct,
        }
    }

    pub fn scalar_mut(&mut self, field: ScalarField) -> &mut f64 {
        match field {
            ScalarField::OccupiedUnits => &mut self.occupied_units,
            ScalarField::FreeUnits => &mut self.free_units,
            ScalarField::AvgContractMonths => &mut self.avg_contract_months,
            ScalarField::AutoReminders => &mut self.auto_reminders,
            ScalarField::SocialFacebook => &mut self.social_facebook,
            ScalarField::SocialGoogle => &mut self.social_google,
            ScalarField::OccupancyPct => &mut self.occupancy_pct,
        }
    }

    pub fn social_engagement(&self) -> f64 {
        self.social_facebook + self.social_google
    }

    /// Share of referral customers over all units, in percent.
    pub fn referral_rate(&self) -> f64 {
        let referrals = *self.customer_sources.get("Empfehlung").unwrap_or(&0) as f64;
        let units = (self.occupied_units + self.free_units).max(1.0);
        (1000.0 * referrals / units).round() / 10.0
    }

    /// Date part of `analysis_date`, for display.
    pub fn analysis_day(&self) -> &str {
        self.analysis_date.get(..10).unwrap_or(&self.analysis_date)
    }
}

impl Default for CanonicalMetrics {
    fn default() -> Self {
        Self::defaults()
    }
}

/// A partial [`CanonicalMetrics`]: every field may be absent.
///
/// Produced by the extractor and by spreadsheet ingestion, consumed by
/// [`crate::merge::merge`].
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MetricsPatch {
    pub scalars: BTreeMap<ScalarField, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_sources: Option<CounterMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<CounterMap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_customer_labels: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_customers_per_month: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl MetricsPatch {
    pub fn get(&self, field: ScalarField) -> Option<f64> {
        self.scalars.get(&field).copied()
    }

    pub fn set(&mut self, field: ScalarField, value: f64) {
        self.scalars.insert(field, value);
    }

    /// True when the patch carries any business figure (narrative fields don't count).
    pub fn has_metrics(&self) -> bool {
        !self.scalars.is_empty()
            || self.customer_sources.is_some()
            || self.payment_status.is_some()
            || self.new_customers_per_month.is_some()
    }

    /// Copy of this patch with the narrative fields dropped.
    pub fn figures_only(&self) -> MetricsPatch {
        MetricsPatch {
            scalars: self.scalars.clone(),
            customer_sources: self.customer_sources.clone(),
            payment_status: self.payment_status.clone(),
            new_customer_labels: self.new_customer_labels.clone(),
            new_customers_per_month: self.new_customers_per_month.clone(),
            ..MetricsPatch::default()
        }
    }
}

/// Outcome of coercing a loosely typed JSON value into a number.
#[derive(Clone, Debug, PartialEq)]
pub enum Coerced {
    Number(f64),
    /// Present but not numeric; the original text is kept so callers can log it.
    Unparsable(String),
    /// Null, absent or blank
    Missing,
}

pub fn coerce_number(value: &Value) -> Coerced {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(v) if v.is_finite() => Coerced::Number(v),
            _ => Coerced::Unparsable(n.to_string()),
        },
        Value::String(s) => parse_numeric_str(s),
        Value::Null => Coerced::Missing,
        other => Coerced::Unparsable(other.to_string()),
    }
}

/// Parse a number out of free text. Accepts a single decimal comma ("7,5").
pub fn parse_numeric_str(text: &str) -> Coerced {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Coerced::Missing;
    }
    if let Ok(v) = trimmed.parse::<f64>() {
        if v.is_finite() {
            return Coerced::Number(v);
        }
        return Coerced::Unparsable(trimmed.to_string());
    }
    if trimmed.matches(',').count() == 1 && !trimmed.contains('.') {
        if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
            if v.is_finite() {
                return Coerced::Number(v);
            }
        }
    }
    Coerced::Unparsable(trimmed.to_string())
}

/// Counters are whole numbers; fractional inputs (spreadsheet means, "3.0") are rounded.
///
/// Values outside the `i64` range have no exact count and give `None`.
pub fn to_count(value: f64) -> Option<i64> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded.abs() >= i64::MAX as f64 {
        return None;
    }
    Some(rounded as i64)
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn counters(pairs: &[(&str, i64)]) -> CounterMap {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_serialize_with_wire_keys() {
        let value = serde_json::to_value(CanonicalMetrics::defaults()).unwrap();
        assert_eq!(value["belegt"], json!(18.0));
        assert_eq!(value["kundenherkunft"]["Online"], json!(12));
        assert_eq!(value["zahlungsstatus"]["überfällig"], json!(1));
        assert!(value.get("tenant_id").is_none());
    }

    #[test]
    fn canonical_metrics_deserializes_missing_counters_as_empty_maps() {
        let value = json!({
            "belegt": 1, "frei": 2, "vertragsdauer_durchschnitt": 3,
            "reminder_automat": 4, "social_facebook": 5, "social_google": 6,
            "belegungsgrad": 7, "analysis_date": "2024-05-01T10:00:00"
        });
        let metrics: CanonicalMetrics = serde_json::from_value(value).unwrap();
        assert!(metrics.customer_sources.is_empty());
        assert!(metrics.payment_status.is_empty());
        assert_eq!(metrics.analysis_day(), "2024-05-01");
    }

    #[test]
    fn scalar_accessors_cover_every_field() {
        let mut metrics = CanonicalMetrics::defaults();
        for (i, field) in ScalarField::ALL.into_iter().enumerate() {
            *metrics.scalar_mut(field) = i as f64;
            assert_eq!(metrics.scalar(field), i as f64);
            assert_eq!(ScalarField::from_key(field.key()), Some(field));
        }
        assert_eq!(ScalarField::from_key("umsatz"), None);
    }

    #[test]
    fn coerce_number_accepts_numbers_and_numeric_text() {
        assert_eq!(coerce_number(&json!(20)), Coerced::Number(20.0));
        assert_eq!(coerce_number(&json!(" 7.5 ")), Coerced::Number(7.5));
        assert_eq!(coerce_number(&json!("7,5")), Coerced::Number(7.5));
        assert_eq!(coerce_number(&json!("42")), Coerced::Number(42.0));
    }

    #[test]
    fn coerce_number_rejects_garbage_instead_of_passing_it_through() {
        assert_eq!(coerce_number(&json!("viele")), Coerced::Unparsable("viele".into()));
        assert_eq!(coerce_number(&json!("NaN")), Coerced::Unparsable("NaN".into()));
        assert_eq!(coerce_number(&json!(true)), Coerced::Unparsable("true".into()));
        assert_eq!(coerce_number(&json!("1,234.5")), Coerced::Unparsable("1,234.5".into()));
        assert_eq!(coerce_number(&json!(null)), Coerced::Missing);
        assert_eq!(coerce_number(&json!("  ")), Coerced::Missing);
    }

    #[test]
    fn counts_round_and_refuse_out_of_range_values() {
        assert_eq!(to_count(2.6), Some(3));
        assert_eq!(to_count(-1.2), Some(-1));
        assert_eq!(to_count(1e19), None);
        assert_eq!(to_count(-1e19), None);
        assert_eq!(to_count(f64::NAN), None);
    }

    #[test]
    fn referral_rate_uses_all_units() {
        let metrics = CanonicalMetrics::defaults();
        // 6 referrals over 24 units
        assert_eq!(metrics.referral_rate(), 25.0);
    }

    #[test]
    fn figures_only_drops_narrative() {
        let mut patch = MetricsPatch::default();
        patch.set(ScalarField::FreeUnits, 3.0);
        patch.recommendations = Some(vec!["x".into()]);
        patch.customer_message = Some("hi".into());
        let figures = patch.figures_only();
        assert_eq!(figures.get(ScalarField::FreeUnits), Some(3.0));
        assert!(figures.recommendations.is_none());
        assert!(figures.customer_message.is_none());
        assert!(figures.has_metrics());
    }
}
