//! Error types for the dashboard.
//!
//! Every variant renders as a human-readable sentence, since these strings are
//! shown to the user as warnings next to the last good state.

use thiserror::Error;

/// Result type alias using the dashboard error type.
pub type Result<T> = std::result::Result<T, DashboardError>;

/// Maximum number of characters of a raw response kept for diagnostics.
pub const EXCERPT_LEN: usize = 200;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DashboardError {
    /// Timeout, refused connection, DNS failure and the like
    #[error("Connection to the analysis service failed: {0}")]
    Transport(String),

    /// The analysis service answered with a non-success status
    #[error("Analysis service returned HTTP {code}: {excerpt}")]
    HttpStatus { code: u16, excerpt: String },

    /// The response body is not JSON at all
    #[error("Response is not valid JSON: {excerpt}")]
    InvalidJson { excerpt: String },

    /// JSON that matches none of the known envelope shapes
    #[error("Unrecognized response format: {excerpt}")]
    UnrecognizedResponse { excerpt: String },

    /// The service itself reported a failure inside a well-formed envelope
    #[error("Analysis service reported an error: {0}")]
    Upstream(String),

    #[error("Could not read {file}: {message}")]
    Spreadsheet { file: String, message: String },

    #[error("Export failed: {0}")]
    Export(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not logged in")]
    NotAuthenticated,

    #[error("No analysis with index {0} in the history")]
    HistoryIndex(usize),

    #[error("No usable data: {0}")]
    NoUsableData(String),
}

impl DashboardError {
    pub fn spreadsheet(file: impl Into<String>, message: impl ToString) -> Self {
        Self::Spreadsheet {
            file: file.into(),
            message: message.to_string(),
        }
    }

    /// True for failures where the remote side was reachable but said something useless.
    pub fn is_malformed_response(&self) -> bool {
        matches!(
            self,
            Self::HttpStatus { .. }
                | Self::InvalidJson { .. }
                | Self::UnrecognizedResponse { .. }
                | Self::Upstream(_)
        )
    }
}

/// Truncate `text` to at most [`EXCERPT_LEN`] characters without splitting a char.
pub fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(EXCERPT_LEN) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_keeps_short_text() {
        assert_eq!(excerpt("  <html>502 Bad Gateway</html> "), "<html>502 Bad Gateway</html>");
    }

    #[test]
    fn excerpt_cuts_on_char_boundary() {
        let long = "ü".repeat(EXCERPT_LEN + 50);
        let cut = excerpt(&long);
        assert_eq!(cut.chars().count(), EXCERPT_LEN + 1);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn malformed_response_classification() {
        assert!(DashboardError::InvalidJson { excerpt: String::new() }.is_malformed_response());
        assert!(!DashboardError::Transport("timeout".into()).is_malformed_response());
    }
}
