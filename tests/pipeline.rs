//! End-to-end checks of the classify → extract → merge pipeline and the
//! session operations built on top of it.

use serde_json::{Value, json};
use storage_dashboard::config::Config;
use storage_dashboard::error::DashboardError;
use storage_dashboard::export;
use storage_dashboard::extract::parse_body;
use storage_dashboard::ingest::{IngestReport, Upload, ingest_uploads};
use storage_dashboard::session::{AnalysisSource, DashboardSession, OutcomeStatus};
use storage_dashboard::tenants::authenticate;
use storage_dashboard::webhook::WebhookReply;
use storage_dashboard::{
    CanonicalMetrics, ScalarField, ShapeKind, classify, extract, extract_value, merge,
};

fn base() -> CanonicalMetrics {
    let mut base = CanonicalMetrics::defaults();
    base.occupied_units = 18.0;
    base.free_units = 6.0;
    base.customer_sources.insert("Online".to_string(), 12);
    base
}

fn reply(value: Value) -> storage_dashboard::Result<WebhookReply> {
    Ok(WebhookReply {
        excerpt: value.to_string(),
        value,
    })
}

fn logged_in(email: &str) -> DashboardSession {
    let mut config = Config::default();
    config.base_url = String::new();
    let mut session = DashboardSession::new(&config);
    session.login(authenticate(email, "").unwrap());
    session
}

#[test]
fn every_known_shape_is_recognised() {
    let cases = [
        (json!([{"analysis_result": "{\"metrics\":{\"belegt\":1}}"}]), ShapeKind::ArrayOfRows),
        (json!({"status": "success", "data": {"metrics": {"belegt": 1}}}), ShapeKind::Enveloped),
        (json!({"metrics": {"metrics": {"belegt": 1}}}), ShapeKind::DoublyNestedMetrics),
        (json!({"metrics": {"belegt": 1}}), ShapeKind::Direct),
        (json!({"belegt": 1, "frei": 2}), ShapeKind::FlatMetrics),
        (json!("{\"belegt\": 1}"), ShapeKind::EncodedString),
    ];
    for (value, expected) in cases {
        let envelope = classify(&value);
        assert_eq!(envelope.kind(), expected, "{value}");
        let extraction = extract(&envelope);
        assert_eq!(extraction.patch.get(ScalarField::OccupiedUnits), Some(1.0), "{value}");
    }
}

#[test]
fn junk_extracts_to_nothing_without_panicking() {
    for value in [
        json!(null),
        json!(42),
        json!("plain text"),
        json!({}),
        json!([]),
        json!({"foo": {"bar": 1}}),
        json!({"metrics": "{broken"}),
    ] {
        let extraction = extract_value(&value);
        assert!(!extraction.has_metrics(), "{value}");
        assert_eq!(extraction.patch.customer_message.as_deref(), Some(""));
        assert_eq!(extraction.patch.recommendations.as_deref(), Some(&[][..]));
    }
}

#[test]
fn merged_envelope_reproduces_its_scalars() {
    let value = json!({
        "status": "success",
        "data": {"metrics": {
            "belegt": 21, "frei": 3, "vertragsdauer_durchschnitt": 9.5,
            "reminder_automat": 4, "social_facebook": 300, "social_google": 61,
            "belegungsgrad": 87.5
        }}
    });
    let merged = merge(&CanonicalMetrics::defaults(), &extract_value(&value).patch);
    assert_eq!(merged.occupied_units, 21.0);
    assert_eq!(merged.free_units, 3.0);
    assert_eq!(merged.avg_contract_months, 9.5);
    assert_eq!(merged.auto_reminders, 4.0);
    assert_eq!(merged.social_facebook, 300.0);
    assert_eq!(merged.social_google, 61.0);
    assert_eq!(merged.occupancy_pct, 87.5);
}

#[test]
fn envelope_update_adds_counters_and_replaces_scalars() {
    let value = json!({"data": {"metrics": {"belegt": 20, "kundenherkunft": {"Online": 3}}}});
    let merged = merge(&base(), &extract_value(&value).patch);

    assert_eq!(merged.occupied_units, 20.0);
    assert_eq!(merged.free_units, 6.0);
    assert_eq!(merged.customer_sources["Online"], 15);
    assert_eq!(merged.customer_sources["Empfehlung"], 6);
}

#[test]
fn incoming_recommendations_replace_the_old_list() {
    let mut start = base();
    start.recommendations = vec!["alt".to_string(), "veraltet".to_string()];
    let value = json!({"metrics": {"belegt": 19}, "recommendations": ["neu"]});

    let merged = merge(&start, &extract_value(&value).patch);
    assert_eq!(merged.recommendations, vec!["neu".to_string()]);
}

#[test]
fn doubly_wrapped_metrics_are_unwrapped() {
    let extraction = extract_value(&json!({"metrics": {"metrics": {"belegt": 5}}}));
    assert_eq!(extraction.shape, ShapeKind::DoublyNestedMetrics);
    assert_eq!(extraction.patch.get(ScalarField::OccupiedUnits), Some(5.0));
}

#[test]
fn oversized_counts_are_dropped_during_an_analysis() {
    let mut session = logged_in("demo@kunde.de");
    let outcome = session
        .complete_analysis(
            IngestReport::default(),
            vec![],
            reply(json!({
                "status": "success",
                "data": {"metrics": {"belegt": 20, "kundenherkunft": {"Online": 1e19, "Empfehlung": 1}}}
            })),
        )
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(session.current.customer_sources["Online"], 12);
    assert_eq!(session.current.customer_sources["Empfehlung"], 7);
}

#[test]
fn rows_of_plain_values_are_reported_as_unrecognised() {
    let extraction = extract_value(&json!(["<html>502</html>", 1]));
    assert_eq!(extraction.shape, ShapeKind::ArrayOfRows);
    assert!(matches!(
        extraction.failure(),
        Some(DashboardError::UnrecognizedResponse { .. })
    ));
}

#[test]
fn database_rows_yield_metrics_and_recommendations() {
    let analysis = json!({
        "metrics": {"belegt": 22, "zahlungsstatus": {"offen": 1}},
        "recommendations": ["Mahnwesen automatisieren"],
        "customer_message": "Stabile Entwicklung"
    });
    let rows = json!([
        {"tenant_id": "kunde_demo_123", "analysis_result": "{\"metrics\":{\"belegt\":1}}"},
        {"tenant_id": "kunde_demo_123", "analysis_result": analysis.to_string(),
         "created_at": "2024-06-02T09:00:00Z"}
    ]);

    let extraction = extract_value(&rows);
    assert_eq!(extraction.shape, ShapeKind::ArrayOfRows);
    assert_eq!(extraction.patch.get(ScalarField::OccupiedUnits), Some(22.0));
    assert_eq!(
        extraction.patch.recommendations,
        Some(vec!["Mahnwesen automatisieren".to_string()])
    );
    assert_eq!(extraction.patch.customer_message.as_deref(), Some("Stabile Entwicklung"));

    let merged = merge(&CanonicalMetrics::defaults(), &extraction.patch);
    assert_eq!(merged.payment_status["offen"], 3);
}

#[test]
fn html_error_page_leaves_state_untouched() {
    let err = parse_body(b"<html>502 Bad Gateway</html>").unwrap_err();
    assert!(matches!(&err, DashboardError::InvalidJson { excerpt } if excerpt.contains("502")));

    let mut session = logged_in("demo@kunde.de");
    let before = session.current.clone();
    let outcome = session
        .complete_analysis(IngestReport::default(), vec!["leer.json".into()], Err(err))
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Error);
    assert!(outcome.warnings.iter().any(|w| w.contains("502 Bad Gateway")));
    assert_eq!(session.current, before);
    assert!(session.tenant_history().is_empty());
    assert_eq!(session.analyses_used(), 0);
}

#[test]
fn unrecognised_json_counts_as_failed_reply() {
    let mut session = logged_in("demo@kunde.de");
    let outcome = session
        .complete_analysis(IngestReport::default(), vec![], reply(json!({"hello": "world"})))
        .unwrap();
    assert_eq!(outcome.status, OutcomeStatus::Error);
    assert_eq!(session.current.occupied_units, 18.0);
}

#[test]
fn spreadsheet_and_webhook_cycle_lands_in_history_and_exports() {
    let mut session = logged_in("test@firma.de");
    let uploads = [
        Upload::new("standort_a.csv", "Belegt;Frei;Kundenherkunft\n10;2;Online\n12;1;Empfehlung\n"),
        Upload::new("notizen.txt", "keine Zahlen"),
    ];
    let ingest = ingest_uploads(&uploads);
    assert_eq!(ingest.used_files, vec!["standort_a.csv"]);
    assert_eq!(ingest.warnings.len(), 1);

    let files = uploads.iter().map(|u| u.filename.clone()).collect();
    let outcome = session
        .complete_analysis(
            ingest,
            files,
            reply(json!({
                "status": "success",
                "data": {"metrics": {"social_google": 70}, "recommendations": []}
            })),
        )
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Success);
    assert_eq!(outcome.warnings.len(), 1);
    assert_eq!(session.current.occupied_units, 22.0);
    assert_eq!(session.current.free_units, 3.0);
    assert_eq!(session.current.social_google, 70.0);
    // empty list from the service is replaced by rule-based advice
    assert!(!session.current.recommendations.is_empty());

    let history = session.tenant_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, AnalysisSource::N8n);
    assert_eq!(history[0].tenant_id, "firma_test_456");

    let csv = export::to_csv(&session.current).unwrap();
    let mut lines = csv.lines();
    let header: Vec<&str> = lines.next().unwrap().split(',').collect();
    let row: Vec<&str> = lines.next().unwrap().split(',').collect();
    let belegt = header.iter().position(|h| *h == "belegt").unwrap();
    assert_eq!(row[belegt], "22");

    let (before, after) = session.comparison().unwrap();
    let comparison: Value =
        serde_json::from_str(&export::comparison_json(before, after).unwrap()).unwrap();
    assert_eq!(comparison["vorher"]["belegt"], 18.0);
    assert_eq!(comparison["nachher"]["belegt"], 22.0);
}

#[test]
fn history_is_kept_per_tenant_across_logins() {
    let mut session = logged_in("demo@kunde.de");
    session
        .complete_analysis(
            IngestReport::default(),
            vec!["a.json".into()],
            reply(json!({"belegt": 19})),
        )
        .unwrap();

    session.login(authenticate("test@firma.de", "").unwrap());
    assert!(session.tenant_history().is_empty());
    assert_eq!(session.current.occupied_units, 18.0);

    session.login(authenticate("demo@kunde.de", "").unwrap());
    assert_eq!(session.tenant_history().len(), 1);
    assert_eq!(session.analyses_used(), 1);

    session.load_history_entry(0).unwrap();
    assert_eq!(session.current.occupied_units, 19.0);
    assert_eq!(
        session.load_history_entry(3).unwrap_err(),
        DashboardError::HistoryIndex(3)
    );
}
