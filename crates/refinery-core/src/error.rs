use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse failure class, used for retry decisions and run diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, rate limits, dropped connections. Retried with backoff.
    Transient,
    /// Malformed input/output or an ownership violation. Never retried.
    Validation,
    /// The delegate refused the request outright.
    Delegate,
    /// The stage graph is malformed. Raised at startup only.
    GraphConstruction,
    /// The agent endpoint reported unhealthy.
    Unavailable,
    /// The run was cancelled by the caller.
    Cancelled,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Delegate => "delegate",
            ErrorClass::GraphConstruction => "graph_construction",
            ErrorClass::Unavailable => "unavailable",
            ErrorClass::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Error returned by an agent delegate for a single invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegateError {
    #[error("Delegate timed out after {0}ms")]
    Timeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Agent endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid delegate output: {0}")]
    InvalidOutput(String),

    #[error("Delegate rejected request: {0}")]
    Rejected(String),
}

impl DelegateError {
    /// Whether a retry of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DelegateError::Timeout(_) | DelegateError::RateLimited(_) | DelegateError::Connection(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum RefineryError {
    // Context errors
    #[error("Key '{key}' is owned by stage '{owner}'; write from '{writer}' rejected")]
    OwnershipViolation {
        key: String,
        owner: String,
        writer: String,
    },

    #[error("Missing dependency: '{key}' has not been produced")]
    MissingDependency { key: String },

    #[error("Stage {stage} produced invalid output for '{key}': {message}")]
    InvalidOutput {
        stage: String,
        key: String,
        message: String,
    },

    // Graph errors
    #[error("Invalid workflow graph: {0}")]
    InvalidGraph(String),

    // Stage execution errors
    #[error("Stage {stage} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last: DelegateError,
    },

    #[error("Stage {stage} rejected by delegate: {message}")]
    DelegateRejected { stage: String, message: String },

    #[error("Agent endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RefineryError {
    /// Classify this error for retry and reporting purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            RefineryError::RetriesExhausted { .. } => ErrorClass::Transient,
            RefineryError::InvalidGraph(_) => ErrorClass::GraphConstruction,
            RefineryError::DelegateRejected { .. } => ErrorClass::Delegate,
            RefineryError::Unavailable(_) => ErrorClass::Unavailable,
            RefineryError::Cancelled => ErrorClass::Cancelled,
            RefineryError::OwnershipViolation { .. }
            | RefineryError::MissingDependency { .. }
            | RefineryError::InvalidOutput { .. }
            | RefineryError::Config(_)
            | RefineryError::ConfigNotFound(_)
            | RefineryError::Io(_)
            | RefineryError::Json(_) => ErrorClass::Validation,
        }
    }

    /// The context key involved in this error, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            RefineryError::OwnershipViolation { key, .. }
            | RefineryError::MissingDependency { key }
            | RefineryError::InvalidOutput { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Convert a delegate failure into a run-level error for `stage`.
    ///
    /// `attempts` is the number of invocations made, including the first.
    pub fn from_delegate(stage: &str, key: &str, attempts: u32, err: DelegateError) -> Self {
        match err {
            e if e.is_transient() => RefineryError::RetriesExhausted {
                stage: stage.to_string(),
                attempts,
                last: e,
            },
            DelegateError::Unavailable(msg) => RefineryError::Unavailable(msg),
            DelegateError::InvalidOutput(message) => RefineryError::InvalidOutput {
                stage: stage.to_string(),
                key: key.to_string(),
                message,
            },
            DelegateError::Rejected(message) => RefineryError::DelegateRejected {
                stage: stage.to_string(),
                message,
            },
            other => RefineryError::DelegateRejected {
                stage: stage.to_string(),
                message: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, RefineryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_delegate_errors() {
        assert!(DelegateError::Timeout(10).is_transient());
        assert!(DelegateError::RateLimited("429".into()).is_transient());
        assert!(DelegateError::Connection("reset".into()).is_transient());
        assert!(!DelegateError::Unavailable("down".into()).is_transient());
        assert!(!DelegateError::Rejected("bad".into()).is_transient());
        assert!(!DelegateError::InvalidOutput("null".into()).is_transient());
    }

    #[test]
    fn from_delegate_classification() {
        let err = RefineryError::from_delegate("implement", "implementation", 4, DelegateError::Timeout(5));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(matches!(err, RefineryError::RetriesExhausted { attempts: 4, .. }));

        let err = RefineryError::from_delegate(
            "implement",
            "implementation",
            1,
            DelegateError::InvalidOutput("empty".into()),
        );
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.key(), Some("implementation"));

        let err = RefineryError::from_delegate("design", "design", 1, DelegateError::Unavailable("503".into()));
        assert_eq!(err.class(), ErrorClass::Unavailable);

        let err = RefineryError::from_delegate("design", "design", 1, DelegateError::Rejected("400".into()));
        assert_eq!(err.class(), ErrorClass::Delegate);
    }

    #[test]
    fn ownership_violation_carries_key() {
        let err = RefineryError::OwnershipViolation {
            key: "design".into(),
            owner: "design".into(),
            writer: "implement".into(),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.key(), Some("design"));
        assert!(err.to_string().contains("implement"));
    }

    #[test]
    fn error_class_display() {
        assert_eq!(ErrorClass::GraphConstruction.to_string(), "graph_construction");
        assert_eq!(ErrorClass::Transient.to_string(), "transient");
    }
}
