// ── Core error types ──
//
// Every failure a caller can observe from mongate-core. Driver failures
// are carried verbatim in `Driver`; the only error the core ever turns
// into a success is the "ns not found" outcome of `Collection::drop`.

use thiserror::Error;

/// Message the backing store reports when a namespace does not exist.
pub const NS_NOT_FOUND: &str = "ns not found";

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to {uri}: {reason}")]
    ConnectionFailed { uri: String, reason: String },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Namespace not found: {namespace}")]
    NamespaceNotFound { namespace: String },

    #[error("Driver error: {message}")]
    Driver {
        message: String,
        /// Server error code, when the driver reports one.
        code: Option<i32>,
    },

    // ── Programming errors ───────────────────────────────────────────
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Unknown service method: {name}")]
    UnknownMethod { name: String },

    // ── Service errors ───────────────────────────────────────────────
    #[error("findOne: more than one document returned for query {query}")]
    MoreThanOne { query: String },

    #[error("Timeout after {waited_ms}ms while waiting for query: {query}")]
    Timeout { waited_ms: u64, query: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Operation abandoned before completion: {operation}")]
    OperationAbandoned { operation: &'static str },
}

impl CoreError {
    /// Shorthand for a driver error without a server code.
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
            code: None,
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether this error means the target namespace does not exist.
    ///
    /// Drivers disagree on how they report it: some return a dedicated
    /// error, others a generic one whose message is `"ns not found"`.
    pub fn is_namespace_not_found(&self) -> bool {
        match self {
            Self::NamespaceNotFound { .. } => true,
            Self::Driver { message, .. } => message == NS_NOT_FOUND,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_not_found_detection() {
        assert!(
            CoreError::NamespaceNotFound {
                namespace: "app.users".into()
            }
            .is_namespace_not_found()
        );
        assert!(CoreError::driver("ns not found").is_namespace_not_found());
        assert!(!CoreError::driver("ns not found: app.users").is_namespace_not_found());
        assert!(!CoreError::invalid_argument("ns not found").is_namespace_not_found());
    }

    #[test]
    fn display_messages() {
        let err = CoreError::ConnectionFailed {
            uri: "mongodb://localhost/app".into(),
            reason: "refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot connect to mongodb://localhost/app: refused"
        );

        let err = CoreError::UnknownMethod {
            name: "createByName".into(),
        };
        assert_eq!(err.to_string(), "Unknown service method: createByName");
    }
}
