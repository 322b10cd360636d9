//! HTTP surface: router, shared state and request handlers.

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::Utc;
use handlebars::Handlebars;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::services::ServeDir;

use crate::charts::{self, ChartKind};
use crate::config::Config;
use crate::error::{DashboardError, Result};
use crate::export::{self, export_filename};
use crate::ingest::{Upload, ingest_uploads};
use crate::insights::build_insights;
use crate::kpi::kpi_tiles;
use crate::session::{DashboardSession, Outcome, OutcomeStatus, SessionStore, display_ts};
use crate::tenants::{SessionId, handle_login, handle_logout, require_auth, serve_login_page};
use crate::webhook::AnalysisClient;

/// Largest accepted request body, uploads included.
const UPLOAD_LIMIT: usize = 25 * 1024 * 1024;

pub struct AppState {
    pub config: Config,
    pub client: AnalysisClient,
    sessions: Mutex<SessionStore>,
    templates: Handlebars<'static>,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let client = AnalysisClient::new(&config)?;

        let mut templates = Handlebars::new();
        for (name, source) in [
            ("login", include_str!("./static/login.html")),
            ("dashboard", include_str!("./static/dashboard.html")),
        ] {
            templates
                .register_template_string(name, source)
                .map_err(|e| DashboardError::Config(format!("template {name}: {e}")))?;
        }

        Ok(AppState {
            config,
            client,
            sessions: Mutex::new(SessionStore::new()),
            templates,
        })
    }

    pub fn create_session(&self, session: DashboardSession) -> String {
        self.store().create(session)
    }

    /// Run `f` on the session with `id`, if it is still alive.
    ///
    /// The store is locked for the duration of `f`, so `f` must not block.
    pub fn with_session<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut DashboardSession) -> R,
    ) -> Option<R> {
        self.store().get_mut(id).map(f)
    }

    fn store(&self) -> MutexGuard<'_, SessionStore> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Body of every JSON API answer.
#[derive(Serialize)]
struct ApiReply<T: Serialize> {
    #[serde(flatten)]
    outcome: Outcome,
    data: T,
}

#[derive(Deserialize)]
struct SettingsUpdate {
    base_url: Option<String>,
    debug: Option<bool>,
}

pub async fn run(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let bind_addr = config.bind_addr.clone();
    if config.base_url.is_empty() {
        warn!("No webhook base URL configured, analyses use uploaded spreadsheets only");
    }
    let state = Arc::new(AppState::new(config)?);
    let app = router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/dashboard", get(serve_dashboard))
        .route("/api/state", get(api_state))
        .route("/api/analyze", post(api_analyze))
        .route("/api/reload", post(api_reload))
        .route("/api/settings", post(api_settings))
        .route("/api/comparison/reset", post(api_reset_comparison))
        .route("/api/reset", post(api_reset))
        .route("/api/history", get(api_history).delete(api_clear_history))
        .route("/api/history/:index/load", post(api_load_history))
        .route("/export/current.csv", get(export_current_csv))
        .route("/export/current.json", get(export_current_json))
        .route("/export/current.xlsx", get(export_current_xlsx))
        .route("/export/comparison.json", get(export_comparison))
        .route("/export/history.json", get(export_history))
        .route("/charts/:file", get(serve_chart))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/", get(serve_login_page))
        .route("/login", post(handle_login))
        .route("/logout", get(handle_logout))
        .merge(protected)
        .nest_service("/static", ServeDir::new("static"))
        .layer(
            ServiceBuilder::new()
                .layer(middleware::from_fn(log_requests))
                .layer(DefaultBodyLimit::max(UPLOAD_LIMIT)),
        )
        .with_state(state)
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        "{} {} -> {} ({} ms)",
        method,
        path,
        response.status().as_u16(),
        started.elapsed().as_millis()
    );
    response
}

/// Render a registered template, or a JSON error if rendering fails.
pub fn render_page(state: &AppState, name: &str, data: &impl Serialize) -> Response {
    match state.templates.render(name, data) {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            error!("Rendering {} failed: {}", name, e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &DashboardError::Export(format!("template {name}: {e}")),
            )
        }
    }
}

pub fn error_response(code: StatusCode, err: &DashboardError) -> Response {
    let body = json!({
        "status": OutcomeStatus::Error,
        "message": err.to_string(),
        "warnings": [],
        "data": null,
    });
    (code, Json(body)).into_response()
}

fn status_for(err: &DashboardError) -> StatusCode {
    if err.is_malformed_response() {
        return StatusCode::BAD_GATEWAY;
    }
    match err {
        DashboardError::NotAuthenticated => StatusCode::UNAUTHORIZED,
        DashboardError::HistoryIndex(_) | DashboardError::NoUsableData(_) => StatusCode::NOT_FOUND,
        DashboardError::Config(_) | DashboardError::Spreadsheet { .. } => StatusCode::BAD_REQUEST,
        DashboardError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: DashboardError) -> Response {
    error_response(status_for(&err), &err)
}

/// Like [`AppState::with_session`], treating a vanished session as logged out.
fn session_call<R>(
    state: &AppState,
    id: &str,
    f: impl FnOnce(&mut DashboardSession) -> Result<R>,
) -> Result<R> {
    state
        .with_session(id, f)
        .unwrap_or(Err(DashboardError::NotAuthenticated))
}

fn view_value(session: &DashboardSession) -> Value {
    serde_json::to_value(session.view()).unwrap_or_default()
}

fn reply(outcome: Outcome, data: Value) -> Response {
    let code = match outcome.status {
        OutcomeStatus::Error => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::OK,
    };
    (code, Json(ApiReply { outcome, data })).into_response()
}

/// Fetch the tenant's last stored analysis and make it the current state.
///
/// The session lock is released while waiting for the webhook.
pub async fn load_last_analysis(state: &AppState, session_id: &str) -> Result<Outcome> {
    let (enabled, base_url, tenant_id) = session_call(state, session_id, |s| {
        Ok((
            s.webhook_enabled(),
            s.base_url.clone(),
            s.tenant()?.tenant_id.clone(),
        ))
    })?;

    if !enabled {
        return session_call(state, session_id, |s| {
            Ok(s.use_defaults("Keine Webhook-URL konfiguriert."))
        });
    }

    let answer = state.client.last_analysis(&base_url, &tenant_id).await;
    session_call(state, session_id, |s| s.apply_last_analysis(answer))
}

async fn serve_dashboard(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    let page = session_call(&state, &id, |s| {
        let tenant = s.tenant()?;
        let baseline = s.comparison().map(|(before, _)| before);
        let history: Vec<Value> = s
            .tenant_history()
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                json!({
                    "index": index,
                    "ts": display_ts(&entry.ts),
                    "files": entry.files.join(", "),
                    "kind": entry.kind,
                    "source": entry.source,
                })
            })
            .collect();

        Ok(json!({
            "tenant": tenant,
            "analyses_used": s.analyses_used(),
            "tiles": kpi_tiles(&s.current, baseline),
            "insights": build_insights(&s.current),
            "recommendations": s.current.recommendations,
            "customer_message": s.current.customer_message,
            "analysis_day": s.current.analysis_day(),
            "show_comparison": baseline.is_some(),
            "show_history_chart": history.len() >= 2,
            "history": history,
            "base_url": s.base_url,
            "debug": s.debug,
            "last_analysis_loaded": s.last_analysis_loaded,
        }))
    });

    match page {
        Ok(page) => render_page(&state, "dashboard", &page),
        Err(_) => Redirect::to("/").into_response(),
    }
}

async fn api_state(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    match session_call(&state, &id, |s| Ok(view_value(s))) {
        Ok(view) => reply(Outcome::new(OutcomeStatus::Success, "OK"), view),
        Err(e) => failure(e),
    }
}

/// Run one analysis cycle over the uploaded `file` fields.
///
/// Every file is read locally; the first one is also sent to the webhook.
async fn api_analyze(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
    mut multipart: Multipart,
) -> Response {
    let mut uploads = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("file") {
                    continue;
                }
                let filename = field.file_name().unwrap_or("upload").to_string();
                let content_type = field.content_type().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => uploads.push(Upload {
                        filename,
                        content_type,
                        bytes: bytes.to_vec(),
                    }),
                    Err(e) => return failure(DashboardError::spreadsheet(filename, e)),
                }
            }
            Ok(None) => break,
            Err(e) => {
                return failure(DashboardError::Config(format!("invalid upload: {e}")));
            }
        }
    }
    let Some(first) = uploads.first() else {
        return failure(DashboardError::Config("no file uploaded".to_string()));
    };

    let target = session_call(&state, &id, |s| {
        Ok((
            s.webhook_enabled(),
            s.base_url.clone(),
            s.tenant()?.tenant_id.clone(),
        ))
    });
    let (enabled, base_url, tenant_id) = match target {
        Ok(target) => target,
        Err(e) => return failure(e),
    };

    let ingest = ingest_uploads(&uploads);
    let files: Vec<String> = uploads.iter().map(|u| u.filename.clone()).collect();
    info!("Analysing {} file(s) for {}", files.len(), tenant_id);

    let answer = if enabled {
        state.client.analyze(&base_url, &tenant_id, first).await
    } else {
        Err(DashboardError::Config("webhook base URL is not set".to_string()))
    };

    let result = session_call(&state, &id, |s| {
        let outcome = s.complete_analysis(ingest, files, answer)?;
        Ok((outcome, view_value(s)))
    });
    match result {
        Ok((outcome, view)) => reply(outcome, view),
        Err(e) => failure(e),
    }
}

async fn api_reload(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    let outcome = match load_last_analysis(&state, &id).await {
        Ok(outcome) => outcome,
        Err(e) => return failure(e),
    };
    match session_call(&state, &id, |s| Ok(view_value(s))) {
        Ok(view) => reply(outcome, view),
        Err(e) => failure(e),
    }
}

async fn api_settings(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    let result = session_call(&state, &id, |s| {
        s.apply_settings(update.base_url, update.debug);
        Ok(view_value(s))
    });
    match result {
        Ok(view) => reply(
            Outcome::new(OutcomeStatus::Success, "Einstellungen gespeichert."),
            view,
        ),
        Err(e) => failure(e),
    }
}

async fn api_reset_comparison(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    let result = session_call(&state, &id, |s| {
        s.reset_comparison();
        Ok(view_value(s))
    });
    match result {
        Ok(view) => reply(
            Outcome::new(OutcomeStatus::Success, "Vergleich zurückgesetzt."),
            view,
        ),
        Err(e) => failure(e),
    }
}

async fn api_reset(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    let result = session_call(&state, &id, |s| {
        s.reset_all();
        Ok(view_value(s))
    });
    match result {
        Ok(view) => reply(
            Outcome::new(OutcomeStatus::Success, "Daten auf Standardwerte zurückgesetzt."),
            view,
        ),
        Err(e) => failure(e),
    }
}

async fn api_history(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    let result = session_call(&state, &id, |s| {
        serde_json::to_value(s.tenant_history()).map_err(|e| DashboardError::Export(e.to_string()))
    });
    match result {
        Ok(history) => reply(Outcome::new(OutcomeStatus::Success, "OK"), history),
        Err(e) => failure(e),
    }
}

async fn api_clear_history(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    let result = session_call(&state, &id, |s| {
        let removed = s.clear_history()?;
        Ok((removed, view_value(s)))
    });
    match result {
        Ok((removed, view)) => reply(
            Outcome::new(
                OutcomeStatus::Success,
                format!("{removed} Analysen aus dem Verlauf gelöscht."),
            ),
            view,
        ),
        Err(e) => failure(e),
    }
}

async fn api_load_history(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
    Path(index): Path<usize>,
) -> Response {
    let result = session_call(&state, &id, |s| {
        s.load_history_entry(index)?;
        Ok(view_value(s))
    });
    match result {
        Ok(view) => reply(
            Outcome::new(OutcomeStatus::Success, "Analyse aus dem Verlauf geladen."),
            view,
        ),
        Err(e) => failure(e),
    }
}

/// Build a download from the session and name it after the tenant and today.
fn download(
    state: &AppState,
    id: &str,
    kind: &str,
    ext: &str,
    content_type: &'static str,
    build: impl FnOnce(&DashboardSession) -> Result<Vec<u8>>,
) -> Response {
    let result = session_call(state, id, |s| {
        let tenant_id = s.tenant()?.tenant_id.clone();
        Ok((tenant_id, build(s)?))
    });
    match result {
        Ok((tenant_id, bytes)) => {
            let filename = export_filename(kind, &tenant_id, Utc::now().date_naive(), ext);
            (
                [
                    (header::CONTENT_TYPE, content_type.to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                Body::from(bytes),
            )
                .into_response()
        }
        Err(e) => failure(e),
    }
}

async fn export_current_csv(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    download(&state, &id, "current", "csv", "text/csv; charset=utf-8", |s| {
        export::to_csv(&s.current).map(String::into_bytes)
    })
}

async fn export_current_json(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    download(&state, &id, "current", "json", "application/json", |s| {
        export::to_json(&s.current).map(String::into_bytes)
    })
}

async fn export_current_xlsx(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    download(
        &state,
        &id,
        "current",
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        |s| export::to_xlsx(&s.current),
    )
}

async fn export_comparison(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    download(&state, &id, "comparison", "json", "application/json", |s| {
        let (before, after) = s
            .comparison()
            .ok_or_else(|| DashboardError::NoUsableData("no comparison shown".to_string()))?;
        export::comparison_json(before, after).map(String::into_bytes)
    })
}

async fn export_history(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
) -> Response {
    download(&state, &id, "history", "json", "application/json", |s| {
        export::history_json(&s.tenant_history()).map(String::into_bytes)
    })
}

async fn serve_chart(
    State(state): State<Arc<AppState>>,
    Extension(SessionId(id)): Extension<SessionId>,
    Path(file): Path<String>,
) -> Response {
    let Some(kind) = file.strip_suffix(".svg").and_then(ChartKind::from_name) else {
        return failure(DashboardError::NoUsableData(format!("unknown chart {file}")));
    };
    match session_call(&state, &id, |s| charts::render(kind, s)) {
        Ok(svg) => ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response(),
        Err(e) => failure(e),
    }
}
