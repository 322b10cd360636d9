//! Tenant accounts and the login flow.
//!
//! Accounts come from a fixed table keyed by e-mail address. Any password is
//! accepted; the login only selects which tenant's data the session shows.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    pub plan: String,
    pub analyses_limit: u32,
}

lazy_static! {
    static ref TENANTS: HashMap<&'static str, Tenant> = {
        let mut m = HashMap::new();
        m.insert(
            "demo@kunde.de",
            Tenant {
                tenant_id: "kunde_demo_123".to_string(),
                name: "Demo Kunde GmbH".to_string(),
                plan: "pro".to_string(),
                analyses_limit: 50,
            },
        );
        m.insert(
            "test@firma.de",
            Tenant {
                tenant_id: "firma_test_456".to_string(),
                name: "Test Firma AG".to_string(),
                plan: "business".to_string(),
                analyses_limit: 200,
            },
        );
        m
    };
}

/// Login form data
#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Look up the tenant for an e-mail address. The password is not checked.
pub fn authenticate(email: &str, _password: &str) -> Option<Tenant> {
    let email = email.trim().to_lowercase();
    TENANTS.get(email.as_str()).cloned()
}

/// All known login addresses, sorted, for the login page hint.
pub fn known_emails() -> Vec<&'static str> {
    let mut emails: Vec<&'static str> = TENANTS.keys().copied().collect();
    emails.sort_unstable();
    emails
}

#[cfg(feature = "web")]
pub use web::{
    SESSION_COOKIE, SessionId, handle_login, handle_logout, require_auth, serve_login_page,
};

#[cfg(feature = "web")]
mod web {
    use axum::{
        Form,
        extract::State,
        http::StatusCode,
        response::{Html, IntoResponse, Redirect, Response},
    };
    use axum_extra::extract::cookie::{Cookie, CookieJar};
    use log::{info, warn};
    use std::sync::Arc;

    use super::{LoginForm, authenticate, known_emails};
    use crate::app::{AppState, error_response, load_last_analysis, render_page};
    use crate::error::DashboardError;
    use crate::session::DashboardSession;

    pub const SESSION_COOKIE: &str = "session";

    /// Render the login page, or go straight to the dashboard when logged in.
    pub async fn serve_login_page(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
        let logged_in = jar
            .get(SESSION_COOKIE)
            .and_then(|cookie| state.with_session(cookie.value(), |s| s.tenant.is_some()));
        if logged_in == Some(true) {
            return Redirect::to("/dashboard").into_response();
        }
        render_page(
            &state,
            "login",
            &serde_json::json!({ "emails": known_emails() }),
        )
    }

    /// Handle login form submissions
    ///
    /// An existing valid session is reused, so history survives a tenant switch.
    /// The tenant's last analysis is loaded before redirecting.
    pub async fn handle_login(
        State(state): State<Arc<AppState>>,
        jar: CookieJar,
        Form(form): Form<LoginForm>,
    ) -> Response {
        let Some(tenant) = authenticate(&form.email, &form.password) else {
            warn!("Login rejected for unknown address {}", form.email.trim());
            return (
                StatusCode::UNAUTHORIZED,
                Html("Unbekannte E-Mail-Adresse. <a href=\"/\">Zurück</a>".to_string()),
            )
                .into_response();
        };

        let existing = jar
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .filter(|id| state.with_session(id, |_| ()).is_some());

        let session_id = match existing {
            Some(id) => {
                state.with_session(&id, |session| session.login(tenant.clone()));
                id
            }
            None => {
                let mut session = DashboardSession::new(&state.config);
                session.login(tenant.clone());
                state.create_session(session)
            }
        };
        info!("{} logged in as {}", tenant.name, tenant.tenant_id);

        match load_last_analysis(&state, &session_id).await {
            Ok(outcome) => info!("{}", outcome.message),
            Err(e) => warn!("Could not load last analysis: {}", e),
        }

        let cookie = Cookie::build((SESSION_COOKIE, session_id))
            .path("/")
            .http_only(true)
            .build();
        (jar.add(cookie), Redirect::to("/dashboard")).into_response()
    }

    /// Clear the tenant. The session and its history stay alive.
    pub async fn handle_logout(
        State(state): State<Arc<AppState>>,
        jar: CookieJar,
    ) -> (CookieJar, Redirect) {
        if let Some(cookie) = jar.get(SESSION_COOKIE) {
            state.with_session(cookie.value(), |session| session.logout());
        }
        (jar, Redirect::to("/"))
    }

    /// Authentication middleware
    ///
    /// Lets requests through when the session cookie belongs to a logged-in
    /// session and stores the session id as a request extension. Other
    /// requests get 401 on `/api/` and `/export/` paths and a redirect elsewhere.
    pub async fn require_auth(
        State(state): State<Arc<AppState>>,
        jar: CookieJar,
        mut request: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> Response {
        if let Some(cookie) = jar.get(SESSION_COOKIE) {
            let id = cookie.value().to_string();
            if state.with_session(&id, |s| s.tenant.is_some()) == Some(true) {
                request.extensions_mut().insert(SessionId(id));
                return next.run(request).await;
            }
        }

        let path = request.uri().path();
        if path.starts_with("/api/") || path.starts_with("/export/") || path.starts_with("/charts/")
        {
            error_response(StatusCode::UNAUTHORIZED, &DashboardError::NotAuthenticated)
        } else {
            Redirect::to("/").into_response()
        }
    }

    /// Session id of an authenticated request
    #[derive(Clone, Debug)]
    pub struct SessionId(pub String);
}
