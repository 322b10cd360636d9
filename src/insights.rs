//! Rule-based recommendations.
//!
//! [`fallback_recommendations`] fills in when the analysis service sends
//! none. [`build_insights`] produces the prioritised action cards shown on
//! the dashboard.

use serde::Serialize;

use crate::metrics::CanonicalMetrics;

/// Plain-text recommendations derived from the figures alone.
pub fn fallback_recommendations(tenant_name: &str, data: &CanonicalMetrics) -> Vec<String> {
    let mut recommendations = Vec::new();

    if data.occupancy_pct > 80.0 {
        recommendations.push(format!("Hohe Auslastung bei {tenant_name} - Erwäge Erweiterung"));
    } else if data.occupancy_pct < 50.0 {
        recommendations.push(format!(
            "Geringe Auslastung bei {tenant_name} - Marketing intensivieren"
        ));
    }

    if data.avg_contract_months < 6.0 {
        recommendations.push("Vertragsdauer erhöhen durch Rabatte für Langzeitmieten".to_string());
    }

    if data.social_engagement() < 100.0 {
        recommendations.push("Social Media Präsenz ausbauen".to_string());
    }

    recommendations.push("Regelmäßige Kundenbefragungen durchführen".to_string());
    recommendations.push("Automatische Zahlungserinnerungen einrichten".to_string());
    recommendations
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

/// One prioritised action card.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Insight {
    pub title: &'static str,
    /// "hoch", "mittel" or "niedrig"
    pub impact: &'static str,
    /// 0 to 10
    pub impact_score: u8,
    pub effort: Effort,
    /// Estimated monthly saving or extra revenue
    pub savings_eur: f64,
    pub kpis: Vec<&'static str>,
    pub analysis: String,
    pub actions: Vec<&'static str>,
}

/// Evaluate every rule against `data`, highest impact first, then highest saving.
pub fn build_insights(data: &CanonicalMetrics) -> Vec<Insight> {
    let occupied = data.occupied_units.round() as i64;
    let total = occupied
        .saturating_add(data.free_units.round() as i64)
        .max(1);
    let occupancy = occupied as f64 / total as f64 * 100.0;
    let contract = data.avg_contract_months;

    let count = |map: &crate::metrics::CounterMap, key: &str| map.get(key).copied().unwrap_or(0);
    let paid = count(&data.payment_status, "bezahlt");
    let open = count(&data.payment_status, "offen");
    let overdue = count(&data.payment_status, "überfällig");
    let online = count(&data.customer_sources, "Online");
    let referral = count(&data.customer_sources, "Empfehlung");
    let walk_in = count(&data.customer_sources, "Vorbeikommen");
    let google = data.social_google.round() as i64;
    let facebook = data.social_facebook.round() as i64;

    let mut out = Vec::new();

    if occupancy < 85.0 {
        out.push(Insight {
            title: "Auslastung steigern (Kurzfrist-Aktion)",
            impact: "hoch",
            impact_score: 9,
            effort: Effort::Low,
            savings_eur: 300.0,
            kpis: vec!["Belegungsgrad", "Belegt", "Frei"],
            analysis: format!(
                "Aktuelle Auslastung {occupancy:.1} % bei {occupied}/{total} Einheiten."
            ),
            actions: vec![
                "2-Wochen-Aktion: −10 % für Neukunden (Mindestlaufzeit ≥ 3 Monate).",
                "Bundles: Vorauszahlung → 1. Monat gratis.",
                "Preisstaffel für kleine Einheiten.",
            ],
        });
    } else if occupancy >= 95.0 {
        out.push(Insight {
            title: "Preisoptimierung bei Vollauslastung",
            impact: "mittel",
            impact_score: 7,
            effort: Effort::Low,
            savings_eur: 200.0,
            kpis: vec!["Belegungsgrad"],
            analysis: format!("Sehr hohe Auslastung ({occupancy:.1} %): Preissensitivität sinkt."),
            actions: vec![
                "Preise kleiner Einheiten testweise +3–5 %.",
                "Warteliste & Lead-Capture auf Landingpage.",
            ],
        });
    }

    if overdue > 0 || open > 0 {
        out.push(Insight {
            title: "Mahnwesen automatisieren",
            impact: "hoch",
            impact_score: 8,
            effort: Effort::Medium,
            savings_eur: 250.0,
            kpis: vec!["Zahlungsstatus"],
            analysis: format!("{paid} bezahlt, {open} offen, {overdue} überfällig."),
            actions: vec![
                "E-Mail + SMS am Fälligkeitstag; nach 7 Tagen Mahnstufe 1.",
                "Skonto 2 % bei Zahlung ≤ 7 Tage (Cashflow-Boost).",
            ],
        });
    }

    // Zero means "unknown" here, not "no contracts".
    if contract > 0.0 && contract < 6.0 {
        out.push(Insight {
            title: "Retention-Programm (Vertragsverlängerung)",
            impact: "mittel",
            impact_score: 6,
            effort: Effort::Medium,
            savings_eur: 150.0,
            kpis: vec!["Ø Vertragsdauer", "Belegt"],
            analysis: format!("Ø Vertragsdauer {contract:.1} Monate → erhöhtes Kündigungsrisiko."),
            actions: vec![
                "4 Wochen vor Ende: Upgrade-Angebot (größere Einheit −5 % im 1. Monat).",
                "Reminder-Sequenz (E-Mail/SMS) inkl. Vorteilsargumentation.",
            ],
        });
    }

    if online.saturating_add(referral).saturating_add(walk_in) > 0 && online < referral {
        out.push(Insight {
            title: "Online-Leads skalieren",
            impact: "mittel",
            impact_score: 7,
            effort: Effort::Low,
            savings_eur: 120.0,
            kpis: vec!["Social/Online", "Leads"],
            analysis: format!(
                "Lead-Mix: Online {online}, Empfehlung {referral}, Vorbeikommen {walk_in}."
            ),
            actions: vec![
                "Google Business: 10 neue Fotos + 5 frische Bewertungen.",
                "LP-Optimierung (sofortige Preisabfrage).",
            ],
        });
    }

    if referral < 5 {
        out.push(Insight {
            title: "Referral-Programm",
            impact: "niedrig",
            impact_score: 5,
            effort: Effort::Low,
            savings_eur: 80.0,
            kpis: vec!["Leads", "Empfehlungen"],
            analysis: "Empfehlungsrate ist gering.".to_string(),
            actions: vec![
                "25 € Guthaben pro geworbenem Neukunden.",
                "Dankes-Karte + QR-Code zur Bewertung.",
            ],
        });
    }

    if google < 60 {
        out.push(Insight {
            title: "Review-Boost (Google)",
            impact: "mittel",
            impact_score: 6,
            effort: Effort::Low,
            savings_eur: 60.0,
            kpis: vec!["Google Reviews"],
            analysis: format!("Nur {google} Google-Reviews → Social Proof ausbaufähig."),
            actions: vec!["2-wöchige Bewertungsaktion mit Follow-up E-Mail."],
        });
    }

    if facebook > 200 && occupancy < 90.0 {
        out.push(Insight {
            title: "FB-Targeting schärfen",
            impact: "niedrig",
            impact_score: 4,
            effort: Effort::Medium,
            savings_eur: 50.0,
            kpis: vec!["Facebook", "Belegungsgrad"],
            analysis: format!("Hoher FB-Traffic ({facebook}) bei Auslastung {occupancy:.0} %."),
            actions: vec![
                "Zielgruppe: Umzug/Studierende, Click-to-Call.",
                "Budget auf performante Anzeigengruppen bündeln.",
            ],
        });
    }

    out.sort_by(|a, b| {
        b.impact_score
            .cmp(&a.impact_score)
            .then_with(|| b.savings_eur.total_cmp(&a.savings_eur))
    });
    out
}
