//! Outbound client for the analysis workflow.
//!
//! Both endpoints take a JSON body and answer with one of the envelope shapes
//! understood by [`crate::classify`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use uuid::Uuid;

use crate::ingest::Upload;
use crate::metrics::now_iso;

pub const ANALYZE_ACTION: &str = "analyze_with_deepseek";
pub const LAST_ANALYSIS_ACTION: &str = "get_last_analysis";
pub const REQUEST_SOURCE: &str = "storage-dashboard";

#[derive(Clone, Debug, Serialize)]
pub struct FilePayload {
    pub filename: String,
    pub content_type: String,
    /// Base64 of the raw file bytes
    pub data: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RequestMetadata {
    pub source: &'static str,
    pub timestamp: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AnalyzeRequest {
    pub tenant_id: String,
    pub uuid: String,
    pub action: &'static str,
    pub file: FilePayload,
    pub metadata: RequestMetadata,
}

impl AnalyzeRequest {
    pub fn new(tenant_id: &str, upload: &Upload) -> Self {
        AnalyzeRequest {
            tenant_id: tenant_id.to_string(),
            uuid: Uuid::new_v4().to_string(),
            action: ANALYZE_ACTION,
            file: FilePayload {
                filename: upload.filename.clone(),
                content_type: upload.mime_type().to_string(),
                data: BASE64.encode(&upload.bytes),
            },
            metadata: RequestMetadata {
                source: REQUEST_SOURCE,
                timestamp: now_iso(),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct LastAnalysisRequest {
    pub tenant_id: String,
    pub uuid: String,
    pub action: &'static str,
}

impl LastAnalysisRequest {
    pub fn new(tenant_id: &str) -> Self {
        LastAnalysisRequest {
            tenant_id: tenant_id.to_string(),
            uuid: Uuid::new_v4().to_string(),
            action: LAST_ANALYSIS_ACTION,
        }
    }
}

/// Join a base URL and an endpoint path with exactly one slash.
pub fn endpoint(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// A successfully parsed reply, with the raw excerpt kept for debug output.
#[derive(Clone, Debug)]
pub struct WebhookReply {
    pub value: serde_json::Value,
    pub excerpt: String,
}

#[cfg(feature = "web")]
pub use client::AnalysisClient;

#[cfg(feature = "web")]
mod client {
    use log::{debug, info};
    use serde::Serialize;
    use std::time::Duration;

    use super::{AnalyzeRequest, LastAnalysisRequest, WebhookReply, endpoint};
    use crate::config::Config;
    use crate::error::{DashboardError, Result, excerpt};
    use crate::extract::parse_body;
    use crate::ingest::Upload;

    #[derive(Clone, Debug)]
    pub struct AnalysisClient {
        http: reqwest::Client,
        analyze_path: String,
        last_analysis_path: String,
        analyze_timeout: Duration,
        lookup_timeout: Duration,
    }

    impl AnalysisClient {
        pub fn new(config: &Config) -> Result<Self> {
            let http = reqwest::Client::builder()
                .user_agent(concat!("storage-dashboard/", env!("CARGO_PKG_VERSION")))
                .build()
                .map_err(|e| DashboardError::Config(format!("HTTP client: {e}")))?;
            Ok(AnalysisClient {
                http,
                analyze_path: config.analyze_path.clone(),
                last_analysis_path: config.last_analysis_path.clone(),
                analyze_timeout: config.analyze_timeout,
                lookup_timeout: config.lookup_timeout,
            })
        }

        /// Send one file for analysis.
        pub async fn analyze(
            &self,
            base_url: &str,
            tenant_id: &str,
            upload: &Upload,
        ) -> Result<WebhookReply> {
            let url = endpoint(base_url, &self.analyze_path);
            info!("Sending {} for analysis to {}", upload.filename, url);
            let body = AnalyzeRequest::new(tenant_id, upload);
            self.post(&url, &body, self.analyze_timeout).await
        }

        /// Fetch the most recent stored analysis of a tenant.
        pub async fn last_analysis(&self, base_url: &str, tenant_id: &str) -> Result<WebhookReply> {
            let url = endpoint(base_url, &self.last_analysis_path);
            info!("Loading last analysis for {} from {}", tenant_id, url);
            let body = LastAnalysisRequest::new(tenant_id);
            self.post(&url, &body, self.lookup_timeout).await
        }

        async fn post<T: Serialize>(
            &self,
            url: &str,
            body: &T,
            timeout: Duration,
        ) -> Result<WebhookReply> {
            let resp = self
                .http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .timeout(timeout)
                .json(body)
                .send()
                .await
                .map_err(|e| transport_error(e, timeout))?;

            let status = resp.status();
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| transport_error(e, timeout))?;
            let text = String::from_utf8_lossy(&bytes);
            debug!("Webhook answered {}: {}", status, excerpt(&text));

            if !status.is_success() {
                return Err(DashboardError::HttpStatus {
                    code: status.as_u16(),
                    excerpt: excerpt(&text),
                });
            }

            let value = parse_body(&bytes)?;
            Ok(WebhookReply {
                value,
                excerpt: excerpt(&text),
            })
        }
    }

    fn transport_error(err: reqwest::Error, timeout: Duration) -> DashboardError {
        if err.is_timeout() {
            DashboardError::Transport(format!("no answer within {}s", timeout.as_secs()))
        } else {
            DashboardError::Transport(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_with_single_slash() {
        assert_eq!(
            endpoint("https://x.example/webhook/", "/get-last-analysis-only"),
            "https://x.example/webhook/get-last-analysis-only"
        );
        assert_eq!(endpoint("http://h", "a"), "http://h/a");
    }

    #[test]
    fn analyze_request_carries_base64_file() {
        let upload = Upload::new("daten.csv", "belegt\n1\n");
        let request = AnalyzeRequest::new("kunde_demo_123", &upload);
        let body = serde_json::to_value(&request).unwrap();

        assert_eq!(body["action"], "analyze_with_deepseek");
        assert_eq!(body["tenant_id"], "kunde_demo_123");
        assert_eq!(body["file"]["filename"], "daten.csv");
        assert_eq!(body["file"]["content_type"], "text/csv");
        assert_eq!(body["file"]["data"], "YmVsZWd0CjEK");
        assert_eq!(body["metadata"]["source"], REQUEST_SOURCE);
        assert!(Uuid::parse_str(body["uuid"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn last_analysis_request_shape() {
        let body = serde_json::to_value(LastAnalysisRequest::new("firma_test_456")).unwrap();
        assert_eq!(body["action"], "get_last_analysis");
        assert_eq!(body["tenant_id"], "firma_test_456");
        assert_eq!(body.as_object().unwrap().len(), 3);
    }
}
