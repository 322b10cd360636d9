//! Merge engine: folds a [`MetricsPatch`] into a [`CanonicalMetrics`].
//!
//! Scalars and narrative fields present in the patch replace the base value.
//! The two counter maps are additive: incoming counts are added per key.

use crate::metrics::{CanonicalMetrics, CounterMap, MetricsPatch};

/// Apply `patch` on top of `base`. Neither input is modified.
pub fn merge(base: &CanonicalMetrics, patch: &MetricsPatch) -> CanonicalMetrics {
    let mut merged = base.clone();

    for (&field, &value) in &patch.scalars {
        *merged.scalar_mut(field) = value;
    }

    if let Some(incoming) = &patch.customer_sources {
        add_counts(&mut merged.customer_sources, incoming);
    }
    if let Some(incoming) = &patch.payment_status {
        add_counts(&mut merged.payment_status, incoming);
    }

    replace(&mut merged.new_customer_labels, &patch.new_customer_labels);
    replace(&mut merged.new_customers_per_month, &patch.new_customers_per_month);
    replace(&mut merged.recommendations, &patch.recommendations);
    replace(&mut merged.customer_message, &patch.customer_message);
    replace(&mut merged.analysis_date, &patch.analysis_date);
    if patch.tenant_id.is_some() {
        merged.tenant_id = patch.tenant_id.clone();
    }

    merged
}

/// Combine two patches with the same rules as [`merge`]; `later` wins.
pub fn merge_patches(earlier: &MetricsPatch, later: &MetricsPatch) -> MetricsPatch {
    let mut combined = earlier.clone();

    for (&field, &value) in &later.scalars {
        combined.scalars.insert(field, value);
    }

    combine_counts(&mut combined.customer_sources, &later.customer_sources);
    combine_counts(&mut combined.payment_status, &later.payment_status);

    prefer_later(&mut combined.new_customer_labels, &later.new_customer_labels);
    prefer_later(&mut combined.new_customers_per_month, &later.new_customers_per_month);
    prefer_later(&mut combined.recommendations, &later.recommendations);
    prefer_later(&mut combined.customer_message, &later.customer_message);
    prefer_later(&mut combined.analysis_date, &later.analysis_date);
    prefer_later(&mut combined.tenant_id, &later.tenant_id);

    combined
}

/// Add every count of `incoming` onto `base`, creating missing keys.
///
/// Sums saturate at the `i64` bounds.
pub fn add_counts(base: &mut CounterMap, incoming: &CounterMap) {
    for (key, count) in incoming {
        let slot = base.entry(key.clone()).or_insert(0);
        *slot = slot.saturating_add(*count);
    }
}

fn combine_counts(base: &mut Option<CounterMap>, incoming: &Option<CounterMap>) {
    if let Some(incoming) = incoming {
        add_counts(base.get_or_insert_with(CounterMap::new), incoming);
    }
}

fn prefer_later<T: Clone>(target: &mut Option<T>, incoming: &Option<T>) {
    if incoming.is_some() {
        *target = incoming.clone();
    }
}

fn replace<T: Clone>(target: &mut T, incoming: &Option<T>) {
    if let Some(value) = incoming {
        *target = value.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ScalarField;

    fn counts(pairs: &[(&str, i64)]) -> CounterMap {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn empty_patch_is_identity() {
        let base = CanonicalMetrics::defaults();
        assert_eq!(merge(&base, &MetricsPatch::default()), base);
    }

    #[test]
    fn scalars_overwrite_and_counters_add() {
        let base = CanonicalMetrics::defaults();
        let mut patch = MetricsPatch::default();
        patch.set(ScalarField::OccupiedUnits, 20.0);
        patch.customer_sources = Some(counts(&[("Online", 3)]));

        let merged = merge(&base, &patch);
        assert_eq!(merged.occupied_units, 20.0);
        assert_eq!(merged.free_units, 6.0);
        assert_eq!(merged.customer_sources["Online"], 15);
        assert_eq!(merged.customer_sources["Empfehlung"], 6);
        assert_eq!(merged.payment_status, base.payment_status);
    }

    #[test]
    fn unknown_counter_keys_are_created() {
        let base = CanonicalMetrics::defaults();
        let patch = MetricsPatch {
            payment_status: Some(counts(&[("storniert", 2)])),
            ..MetricsPatch::default()
        };
        let merged = merge(&base, &patch);
        assert_eq!(merged.payment_status["storniert"], 2);
        assert_eq!(merged.payment_status["bezahlt"], 21);
    }

    #[test]
    fn huge_counts_saturate_instead_of_overflowing() {
        let mut base = CanonicalMetrics::defaults();
        base.customer_sources.insert("Online".to_string(), i64::MAX - 1);
        base.payment_status.insert("offen".to_string(), i64::MIN + 1);
        let patch = MetricsPatch {
            customer_sources: Some(counts(&[("Online", 5)])),
            payment_status: Some(counts(&[("offen", -5)])),
            ..MetricsPatch::default()
        };

        let merged = merge(&base, &patch);
        assert_eq!(merged.customer_sources["Online"], i64::MAX);
        assert_eq!(merged.payment_status["offen"], i64::MIN);

        let twice = merge_patches(&patch, &patch);
        assert_eq!(twice.customer_sources, Some(counts(&[("Online", 10)])));
    }

    #[test]
    fn recommendations_are_replaced_not_appended() {
        let mut base = CanonicalMetrics::defaults();
        base.recommendations = vec!["alt".to_string()];
        let patch = MetricsPatch {
            recommendations: Some(vec!["neu 1".to_string(), "neu 2".to_string()]),
            customer_message: Some("Hallo".to_string()),
            ..MetricsPatch::default()
        };
        let merged = merge(&base, &patch);
        assert_eq!(merged.recommendations, vec!["neu 1", "neu 2"]);
        assert_eq!(merged.customer_message, "Hallo");
    }

    #[test]
    fn merge_does_not_touch_inputs() {
        let base = CanonicalMetrics::defaults();
        let snapshot = base.clone();
        let patch = MetricsPatch {
            customer_sources: Some(counts(&[("Online", 1)])),
            ..MetricsPatch::default()
        };
        let _ = merge(&base, &patch);
        assert_eq!(base, snapshot);
    }

    #[test]
    fn patches_combine_with_the_same_rules() {
        let mut first = MetricsPatch::default();
        first.set(ScalarField::OccupiedUnits, 10.0);
        first.set(ScalarField::FreeUnits, 2.0);
        first.customer_sources = Some(counts(&[("Online", 2)]));

        let mut second = MetricsPatch::default();
        second.set(ScalarField::OccupiedUnits, 12.0);
        second.customer_sources = Some(counts(&[("Online", 1), ("Empfehlung", 4)]));
        second.tenant_id = Some("firma_test_456".to_string());

        let combined = merge_patches(&first, &second);
        assert_eq!(combined.get(ScalarField::OccupiedUnits), Some(12.0));
        assert_eq!(combined.get(ScalarField::FreeUnits), Some(2.0));
        assert_eq!(combined.customer_sources, Some(counts(&[("Empfehlung", 4), ("Online", 3)])));
        assert_eq!(combined.tenant_id.as_deref(), Some("firma_test_456"));
        assert!(combined.payment_status.is_none());
    }
}
