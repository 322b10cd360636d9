//! Per-session dashboard state and the analysis-cycle operations on it.
//!
//! A [`DashboardSession`] is owned by the [`SessionStore`]; handlers borrow it
//! only between awaits. Every operation here is synchronous and never calls
//! out: webhook replies arrive as arguments.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

use crate::classify::ShapeKind;
use crate::config::Config;
use crate::error::{DashboardError, Result};
use crate::extract::{Extraction, RejectedField, extract_value};
use crate::ingest::IngestReport;
use crate::insights::fallback_recommendations;
use crate::merge::merge;
use crate::metrics::{CanonicalMetrics, now_iso};
use crate::tenants::Tenant;
use crate::webhook::WebhookReply;

/// Sessions expire this long after creation.
pub const SESSION_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    AiAnalysis,
    ExcelAnalysis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisSource {
    N8n,
    Fallback,
}

/// One completed analysis cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub ts: String,
    pub data: CanonicalMetrics,
    pub files: Vec<String>,
    pub tenant_id: String,
    pub tenant_name: String,
    #[serde(rename = "type")]
    pub kind: AnalysisKind,
    pub source: AnalysisSource,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    /// State was updated from a secondary source (spreadsheets or defaults).
    Fallback,
    /// State is unchanged.
    Error,
}

/// Raw response details, only filled in when debug mode is on.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DebugInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<ShapeKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedField>,
}

/// What the user is told after an operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

impl Outcome {
    pub fn new(status: OutcomeStatus, message: impl Into<String>) -> Self {
        Outcome {
            status,
            message: message.into(),
            warnings: Vec::new(),
            debug: None,
        }
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Result of reading one webhook reply, before it touches any state.
struct Reading {
    extraction: Option<Extraction>,
    failure: Option<DashboardError>,
    debug: DebugInfo,
}

impl Reading {
    fn from_reply(reply: Result<WebhookReply>) -> Self {
        match reply {
            Ok(reply) => {
                let extraction = extract_value(&reply.value);
                let failure = extraction.failure();
                let debug = DebugInfo {
                    shape: Some(extraction.shape),
                    excerpt: Some(reply.excerpt),
                    rejected: extraction.rejected.clone(),
                };
                Reading {
                    extraction: Some(extraction),
                    failure,
                    debug,
                }
            }
            Err(err) => {
                let excerpt = match &err {
                    DashboardError::HttpStatus { excerpt, .. }
                    | DashboardError::InvalidJson { excerpt } => Some(excerpt.clone()),
                    _ => None,
                };
                Reading {
                    extraction: None,
                    failure: Some(err),
                    debug: DebugInfo {
                        excerpt,
                        ..DebugInfo::default()
                    },
                }
            }
        }
    }

    /// The extraction, when it carries figures that may replace the current state.
    fn usable(&self) -> Option<&Extraction> {
        self.extraction
            .as_ref()
            .filter(|e| self.failure.is_none() && e.has_metrics())
    }

    fn problem(&self) -> String {
        match &self.failure {
            Some(err) => err.to_string(),
            None => "Analysis service returned no metrics".to_string(),
        }
    }
}

/// Everything one browser session sees.
#[derive(Clone, Debug)]
pub struct DashboardSession {
    pub tenant: Option<Tenant>,
    pub current: CanonicalMetrics,
    pub before: Option<CanonicalMetrics>,
    pub after: Option<CanonicalMetrics>,
    pub show_comparison: bool,
    /// Entries of every tenant logged in during this session, oldest first.
    pub history: Vec<HistoryEntry>,
    /// Successful AI analyses per tenant id
    pub usage: BTreeMap<String, u32>,
    pub base_url: String,
    pub debug: bool,
    pub last_analysis_loaded: bool,
}

impl DashboardSession {
    pub fn new(config: &Config) -> Self {
        DashboardSession {
            tenant: None,
            current: CanonicalMetrics::defaults(),
            before: None,
            after: None,
            show_comparison: false,
            history: Vec::new(),
            usage: BTreeMap::new(),
            base_url: config.base_url.clone(),
            debug: config.debug,
            last_analysis_loaded: false,
        }
    }

    /// Switch to `tenant`, starting from defaults. History is kept.
    pub fn login(&mut self, tenant: Tenant) {
        self.tenant = Some(tenant);
        self.current = CanonicalMetrics::defaults();
        self.before = None;
        self.after = None;
        self.show_comparison = false;
        self.last_analysis_loaded = false;
    }

    pub fn logout(&mut self) {
        self.tenant = None;
        self.show_comparison = false;
    }

    pub fn tenant(&self) -> Result<&Tenant> {
        self.tenant.as_ref().ok_or(DashboardError::NotAuthenticated)
    }

    pub fn analyses_used(&self) -> u32 {
        self.tenant
            .as_ref()
            .and_then(|t| self.usage.get(&t.tenant_id).copied())
            .unwrap_or(0)
    }

    /// Whether outbound calls are configured for this session.
    pub fn webhook_enabled(&self) -> bool {
        !self.base_url.trim().is_empty()
    }

    /// Baseline and current figures while a comparison is shown.
    pub fn comparison(&self) -> Option<(&CanonicalMetrics, &CanonicalMetrics)> {
        match (&self.before, self.show_comparison) {
            (Some(before), true) => Some((before, &self.current)),
            _ => None,
        }
    }

    /// Keep defaults as the starting point because no webhook is configured.
    pub fn use_defaults(&mut self, reason: &str) -> Outcome {
        self.current = CanonicalMetrics::defaults();
        self.before = Some(self.current.clone());
        Outcome::new(OutcomeStatus::Fallback, "Standarddaten werden verwendet.").warn(reason)
    }

    /// Apply the reply of the last-analysis lookup.
    ///
    /// On any failure the current figures stay as they are and become the
    /// comparison baseline.
    pub fn apply_last_analysis(&mut self, reply: Result<WebhookReply>) -> Result<Outcome> {
        let tenant_id = self.tenant()?.tenant_id.clone();
        let reading = Reading::from_reply(reply);

        let mut outcome = match reading.usable() {
            Some(extraction) => {
                let mut loaded = merge(&CanonicalMetrics::defaults(), &extraction.patch);
                if loaded.customer_message.trim().is_empty() {
                    loaded.customer_message = format!("Letzte Analyse für {tenant_id} geladen");
                }
                loaded.tenant_id = Some(tenant_id.clone());
                info!("Loaded last analysis for {} from {}", tenant_id, loaded.analysis_day());
                let message = format!("Letzte Analyse vom {} geladen.", loaded.analysis_day());
                self.current = loaded;
                self.before = Some(self.current.clone());
                self.last_analysis_loaded = true;
                Outcome::new(OutcomeStatus::Success, message)
            }
            None => {
                let problem = reading.problem();
                warn!("No previous analysis for {}: {}", tenant_id, problem);
                self.before = Some(self.current.clone());
                Outcome::new(
                    OutcomeStatus::Fallback,
                    "Keine vorherige Analyse gefunden. Bisherige Daten bleiben aktiv.",
                )
                .warn(problem)
            }
        };
        if self.debug {
            outcome.debug = Some(reading.debug);
        }
        Ok(outcome)
    }

    /// Finish an analysis cycle.
    ///
    /// The new figures are `defaults ⊕ spreadsheets ⊕ webhook`. When the
    /// webhook fails, readable spreadsheets alone are used; when neither
    /// produced figures, nothing changes.
    pub fn complete_analysis(
        &mut self,
        ingest: IngestReport,
        files: Vec<String>,
        reply: Result<WebhookReply>,
    ) -> Result<Outcome> {
        let tenant = self.tenant()?.clone();
        let reading = Reading::from_reply(reply);
        let defaults = CanonicalMetrics::defaults();

        let mut outcome = if let Some(extraction) = reading.usable() {
            let mut result = merge(&merge(&defaults, &ingest.patch), &extraction.patch);
            if result.recommendations.is_empty() {
                result.recommendations = fallback_recommendations(&tenant.name, &result);
            }
            if result.customer_message.trim().is_empty() {
                result.customer_message = format!("Analyse für {} abgeschlossen.", tenant.name);
            }
            result.tenant_id = Some(tenant.tenant_id.clone());

            self.commit(&tenant, result, files, AnalysisKind::AiAnalysis, AnalysisSource::N8n);
            *self.usage.entry(tenant.tenant_id.clone()).or_insert(0) += 1;
            info!("AI analysis finished for {}", tenant.tenant_id);
            Outcome::new(
                OutcomeStatus::Success,
                format!("KI-Analyse erfolgreich für {}!", tenant.name),
            )
        } else if ingest.has_metrics() {
            let problem = reading.problem();
            warn!("AI analysis failed for {}, using spreadsheets: {}", tenant.tenant_id, problem);

            let mut result = merge(&defaults, &ingest.patch);
            result.recommendations = fallback_recommendations(&tenant.name, &result);
            result.customer_message = format!("Analyse basierend auf Excel-Daten für {}", tenant.name);
            result.analysis_date = now_iso();
            result.tenant_id = Some(tenant.tenant_id.clone());

            self.commit(
                &tenant,
                result,
                files,
                AnalysisKind::ExcelAnalysis,
                AnalysisSource::Fallback,
            );
            Outcome::new(
                OutcomeStatus::Fallback,
                format!("Excel-Analyse erfolgreich für {}.", tenant.name),
            )
            .warn(format!("KI-Analyse fehlgeschlagen: {problem}"))
        } else {
            let problem = reading.problem();
            warn!("Analysis for {} produced no data: {}", tenant.tenant_id, problem);
            Outcome::new(OutcomeStatus::Error, "Keine analysierbaren Daten gefunden.")
                .warn(format!("KI-Analyse fehlgeschlagen: {problem}"))
        };

        let mut warnings = ingest.warnings;
        warnings.append(&mut outcome.warnings);
        outcome.warnings = warnings;
        if self.debug {
            outcome.debug = Some(reading.debug);
        }
        Ok(outcome)
    }

    fn commit(
        &mut self,
        tenant: &Tenant,
        result: CanonicalMetrics,
        files: Vec<String>,
        kind: AnalysisKind,
        source: AnalysisSource,
    ) {
        self.before = Some(self.current.clone());
        self.after = Some(result.clone());
        self.history.push(HistoryEntry {
            ts: now_iso(),
            data: result.clone(),
            files,
            tenant_id: tenant.tenant_id.clone(),
            tenant_name: tenant.name.clone(),
            kind,
            source,
        });
        self.current = result;
        self.show_comparison = true;
    }

    /// History of the logged-in tenant, newest first.
    pub fn tenant_history(&self) -> Vec<&HistoryEntry> {
        let Some(tenant) = &self.tenant else {
            return Vec::new();
        };
        self.history
            .iter()
            .rev()
            .filter(|entry| entry.tenant_id == tenant.tenant_id)
            .collect()
    }

    /// Make entry `index` of [`Self::tenant_history`] the current figures.
    pub fn load_history_entry(&mut self, index: usize) -> Result<()> {
        self.tenant()?;
        let data = self
            .tenant_history()
            .get(index)
            .map(|entry| entry.data.clone())
            .ok_or(DashboardError::HistoryIndex(index))?;
        self.before = Some(data.clone());
        self.current = data;
        self.show_comparison = false;
        Ok(())
    }

    /// Drop the tenant's history and go back to defaults.
    pub fn clear_history(&mut self) -> Result<usize> {
        let tenant_id = self.tenant()?.tenant_id.clone();
        let before = self.history.len();
        self.history.retain(|entry| entry.tenant_id != tenant_id);
        self.current = CanonicalMetrics::defaults();
        self.show_comparison = false;
        Ok(before - self.history.len())
    }

    pub fn reset_comparison(&mut self) {
        self.show_comparison = false;
    }

    pub fn reset_all(&mut self) {
        self.current = CanonicalMetrics::defaults();
        self.before = None;
        self.after = None;
        self.show_comparison = false;
    }

    pub fn apply_settings(&mut self, base_url: Option<String>, debug: Option<bool>) {
        if let Some(url) = base_url {
            self.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(debug) = debug {
            self.debug = debug;
        }
    }

    /// JSON view of the session for the API and the page template.
    pub fn view(&self) -> SessionView<'_> {
        SessionView {
            tenant: self.tenant.as_ref(),
            analyses_used: self.analyses_used(),
            current: &self.current,
            before: self.comparison().map(|(before, _)| before),
            show_comparison: self.show_comparison,
            history_len: self.tenant_history().len(),
            last_analysis_loaded: self.last_analysis_loaded,
            base_url: &self.base_url,
            debug: self.debug,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView<'a> {
    pub tenant: Option<&'a Tenant>,
    pub analyses_used: u32,
    pub current: &'a CanonicalMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<&'a CanonicalMetrics>,
    pub show_comparison: bool,
    pub history_len: usize,
    pub last_analysis_loaded: bool,
    pub base_url: &'a str,
    pub debug: bool,
}

struct StoredSession {
    state: DashboardSession,
    expires_at: SystemTime,
}

/// All live sessions, keyed by a random id.
#[derive(Default)]
pub struct SessionStore {
    sessions: HashMap<String, StoredSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, state: DashboardSession) -> String {
        self.purge_expired();
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            StoredSession {
                state,
                expires_at: SystemTime::now() + SESSION_DURATION,
            },
        );
        id
    }

    /// The session for `id`, if it exists and has not expired.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut DashboardSession> {
        let now = SystemTime::now();
        self.sessions
            .get_mut(id)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| &mut stored.state)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn purge_expired(&mut self) {
        let now = SystemTime::now();
        self.sessions.retain(|_, stored| stored.expires_at > now);
    }

    #[cfg(test)]
    fn expire(&mut self, id: &str) {
        if let Some(stored) = self.sessions.get_mut(id) {
            stored.expires_at = SystemTime::now() - Duration::from_secs(1);
        }
    }
}

/// Timestamp of a history entry for display, e.g. `2024-06-01 08:00`.
pub fn display_ts(ts: &str) -> String {
    DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.with_timezone(&Utc).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|_| ts.chars().take(16).collect())
}
