//! Runtime configuration, read from the environment.

use std::time::Duration;

use crate::error::{DashboardError, Result};

pub const DEFAULT_BASE_URL: &str = "https://tundtelectronics.app.n8n.cloud/webhook";
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_ANALYZE_PATH: &str = "analyze-with-deepseek";
pub const DEFAULT_LAST_ANALYSIS_PATH: &str = "get-last-analysis-only";

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Webhook base URL. Empty disables all outbound calls.
    pub base_url: String,
    pub bind_addr: String,
    pub analyze_path: String,
    pub last_analysis_path: String,
    pub analyze_timeout: Duration,
    pub lookup_timeout: Duration,
    /// Include raw response excerpts in API responses.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: DEFAULT_BASE_URL.to_string(),
            bind_addr: DEFAULT_BIND.to_string(),
            analyze_path: DEFAULT_ANALYZE_PATH.to_string(),
            last_analysis_path: DEFAULT_LAST_ANALYSIS_PATH.to_string(),
            analyze_timeout: Duration::from_secs(120),
            lookup_timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source.
    ///
    /// `PORT` takes precedence over `DASHBOARD_BIND` and binds on all interfaces,
    /// which is what container platforms expect.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();

        if let Some(url) = lookup("N8N_BASE_URL") {
            config.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(bind) = lookup("DASHBOARD_BIND") {
            config.bind_addr = bind.trim().to_string();
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|_| DashboardError::Config(format!("PORT is not a valid port: {port}")))?;
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(path) = lookup("ANALYZE_PATH") {
            config.analyze_path = path.trim().to_string();
        }
        if let Some(path) = lookup("LAST_ANALYSIS_PATH") {
            config.last_analysis_path = path.trim().to_string();
        }
        if let Some(secs) = lookup("ANALYZE_TIMEOUT_SECS") {
            config.analyze_timeout = parse_secs("ANALYZE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(secs) = lookup("LOOKUP_TIMEOUT_SECS") {
            config.lookup_timeout = parse_secs("LOOKUP_TIMEOUT_SECS", &secs)?;
        }
        if let Some(flag) = lookup("DASHBOARD_DEBUG") {
            config.debug = matches!(flag.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }

        Ok(config)
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<Duration> {
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(DashboardError::Config(format!(
            "{name} must be a positive number of seconds, got {raw:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.analyze_timeout, Duration::from_secs(120));
        assert_eq!(config.lookup_timeout, Duration::from_secs(30));
    }

    #[test]
    fn port_overrides_bind_address() {
        let config = Config::from_lookup(lookup_from(&[
            ("DASHBOARD_BIND", "127.0.0.1:8080"),
            ("PORT", "9000"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("N8N_BASE_URL", "http://localhost:5678/webhook/"),
            ("ANALYZE_TIMEOUT_SECS", "5"),
            ("DASHBOARD_DEBUG", "true"),
        ]))
        .unwrap();
        assert_eq!(config.base_url, "http://localhost:5678/webhook");
        assert_eq!(config.analyze_timeout, Duration::from_secs(5));
        assert!(config.debug);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let err = Config::from_lookup(lookup_from(&[("LOOKUP_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, DashboardError::Config(_)));
        let err = Config::from_lookup(lookup_from(&[("PORT", "70000")])).unwrap_err();
        assert!(matches!(err, DashboardError::Config(_)));
    }
}
