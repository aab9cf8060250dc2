//! Typed errors for the publish engine and the wiki migration walk.

use serde::Deserialize;

/// Rejection returned by the destination when it refuses a write.
///
/// Mirrors the JSON error body Confluence sends back
/// (`{"statusCode": 400, "message": "...", "reason": "Bad Request"}`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{status_code}:{message}-{reason}")]
pub struct Rejection {
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
}

impl Rejection {
    pub fn new(status_code: u16, message: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
            reason: reason.into(),
        }
    }

    /// Rejection for failures that never produced an HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(0, message, "transport error")
    }
}

/// A response counts as successful when it carries no status, or the
/// status' leading digit is 2.
pub fn is_success_status(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(code) => code.to_string().starts_with('2'),
    }
}

/// Error from [`crate::publish::publish_page`].
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The destination refused the page for a reason escaping cannot fix.
    #[error("destination rejected page \"{title}\": {rejection}")]
    Fatal { title: String, rejection: Rejection },

    /// The destination kept rejecting a directive and the body could not be
    /// repaired within the attempt budget.
    #[error(
        "unknown directive \"{directive}\" in page \"{title}\" could not be escaped after {attempts} attempt(s)"
    )]
    UnrecoverableDirective {
        title: String,
        directive: String,
        attempts: usize,
    },
}

/// Error from the wiki migration walk.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("page hierarchy cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("source wiki page not found: {0}")]
    PageNotFound(String),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Service(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_status_accepts_missing_and_2xx() {
        assert!(is_success_status(None));
        assert!(is_success_status(Some(200)));
        assert!(is_success_status(Some(204)));
        assert!(!is_success_status(Some(400)));
        assert!(!is_success_status(Some(0)));
    }

    #[test]
    fn rejection_parses_confluence_error_body() {
        let rejection: Rejection = serde_json::from_str(
            r#"{"statusCode":400,"data":{},"message":"Unknown macro: 'fnlist'","reason":"Bad Request"}"#,
        )
        .expect("parse rejection");
        assert_eq!(rejection.status_code, 400);
        assert_eq!(rejection.to_string(), "400:Unknown macro: 'fnlist'-Bad Request");
    }

    #[test]
    fn cycle_error_lists_path() {
        let error = MigrationError::Cycle {
            path: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        };
        assert_eq!(error.to_string(), "page hierarchy cycle detected: A -> B -> A");
    }
}
