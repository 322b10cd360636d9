//! KPI tiles: value, change against the comparison baseline, badge colour.

use serde::Serialize;

use crate::metrics::{CanonicalMetrics, ScalarField};

pub const COLOR_BETTER: &str = "#22C55E";
pub const COLOR_WORSE: &str = "#EF4444";
pub const COLOR_NEUTRAL: &str = "#A9A9A9";

/// Fields shown as tiles, in display order.
pub const TILE_FIELDS: [ScalarField; 6] = [
    ScalarField::OccupiedUnits,
    ScalarField::FreeUnits,
    ScalarField::OccupancyPct,
    ScalarField::AvgContractMonths,
    ScalarField::SocialGoogle,
    ScalarField::SocialFacebook,
];

/// Whether a rising value is good news for `field`. `None` means no preference.
pub fn higher_is_better(field: ScalarField) -> Option<bool> {
    match field {
        ScalarField::FreeUnits => Some(false),
        ScalarField::AutoReminders => None,
        _ => Some(true),
    }
}

/// Absolute change and percent change from `before` to `after`.
/// The percentage is `None` when `before` is zero.
pub fn delta(before: f64, after: f64) -> (f64, Option<f64>) {
    let abs = after - before;
    let pct = (before != 0.0).then(|| abs / before * 100.0);
    (abs, pct)
}

/// Badge text like `+2 (+11.1%)` or `−3 (−50.0%)`.
pub fn badge_delta(abs: f64, pct: Option<f64>) -> String {
    match pct {
        None => format!("{abs:+.0}"),
        Some(pct) => {
            let sign = if abs >= 0.0 { "+" } else { "−" };
            format!("{sign}{:.0} ({sign}{:.1}%)", abs.abs(), pct.abs())
        }
    }
}

pub fn color_for_change(field: ScalarField, before: f64, after: f64) -> &'static str {
    if after == before {
        return COLOR_NEUTRAL;
    }
    let improved = match higher_is_better(field) {
        Some(false) => after < before,
        _ => after > before,
    };
    if improved { COLOR_BETTER } else { COLOR_WORSE }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct KpiTile {
    pub key: &'static str,
    pub label: &'static str,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    pub color: &'static str,
}

/// Build the tile row. Badges are only present when a baseline is given.
pub fn kpi_tiles(current: &CanonicalMetrics, baseline: Option<&CanonicalMetrics>) -> Vec<KpiTile> {
    TILE_FIELDS
        .iter()
        .map(|&field| {
            let now = current.scalar(field);
            let (badge, color) = match baseline {
                Some(before) => {
                    let then = before.scalar(field);
                    let (abs, pct) = delta(then, now);
                    (Some(badge_delta(abs, pct)), color_for_change(field, then, now))
                }
                None => (None, COLOR_NEUTRAL),
            };
            KpiTile {
                key: field.key(),
                label: field.label(),
                value: format_value(field, now),
                badge,
                color,
            }
        })
        .collect()
}

fn format_value(field: ScalarField, value: f64) -> String {
    match field {
        ScalarField::OccupancyPct => format!("{value:.1} %"),
        ScalarField::AvgContractMonths => format!("{value:.1}"),
        _ => format!("{value:.0}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_and_badge() {
        let (abs, pct) = delta(18.0, 20.0);
        assert_eq!(abs, 2.0);
        assert_eq!(badge_delta(abs, pct), "+2 (+11.1%)");

        let (abs, pct) = delta(6.0, 3.0);
        assert_eq!(badge_delta(abs, pct), "−3 (−50.0%)");
    }

    #[test]
    fn zero_baseline_has_no_percentage() {
        assert_eq!(delta(0.0, 4.0), (4.0, None));
        assert_eq!(badge_delta(4.0, None), "+4");
        assert_eq!(badge_delta(-4.0, None), "-4");
    }

    #[test]
    fn colours_follow_direction_rules() {
        assert_eq!(color_for_change(ScalarField::OccupiedUnits, 18.0, 20.0), COLOR_BETTER);
        assert_eq!(color_for_change(ScalarField::FreeUnits, 6.0, 8.0), COLOR_WORSE);
        assert_eq!(color_for_change(ScalarField::FreeUnits, 6.0, 4.0), COLOR_BETTER);
        assert_eq!(color_for_change(ScalarField::AutoReminders, 15.0, 10.0), COLOR_WORSE);
        assert_eq!(color_for_change(ScalarField::SocialGoogle, 58.0, 58.0), COLOR_NEUTRAL);
    }

    #[test]
    fn tiles_with_and_without_baseline() {
        let before = CanonicalMetrics::defaults();
        let mut after = before.clone();
        after.occupied_units = 20.0;
        after.free_units = 4.0;

        let plain = kpi_tiles(&after, None);
        assert_eq!(plain.len(), TILE_FIELDS.len());
        assert!(plain.iter().all(|t| t.badge.is_none() && t.color == COLOR_NEUTRAL));

        let tiles = kpi_tiles(&after, Some(&before));
        assert_eq!(tiles[0].key, "belegt");
        assert_eq!(tiles[0].value, "20");
        assert_eq!(tiles[0].badge.as_deref(), Some("+2 (+11.1%)"));
        assert_eq!(tiles[1].color, COLOR_BETTER);
        assert_eq!(tiles[2].value, "75.0 %");
    }
}
