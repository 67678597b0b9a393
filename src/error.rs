//! Error taxonomy for the recon engine
//!
//! Every failure that can happen inside a run is represented here:
//! - Transient probe errors (network failures, timeouts, rate limiting)
//! - Seed and target errors (invalid root target, unparseable names)
//! - Probe and rule errors (a probe or factor rule misbehaving)
//! - IO and serialization errors (snapshots, findings export)
//!
//! Errors are `Clone + Serialize` so they can be attached to envelopes,
//! findings and snapshots as structured diagnostics.

use std::{fmt, io};
use thiserror::Error;

/// Main result type used throughout the crate
pub type Result<T> = std::result::Result<T, ReconError>;

#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ReconError {
    /// Configuration related errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Network connectivity errors (connection refused, reset, DNS failure)
    #[error("Network error: {message}")]
    Network { message: String },

    /// Per-call timeout expired
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// External API told us to slow down
    #[error("Rate limit exceeded: {resource} - {message}")]
    RateLimit { resource: String, message: String },

    /// The seed target set is missing or unusable; fatal before dispatch
    #[error("Invalid seed: {reason}")]
    InvalidSeed { reason: String },

    /// A name could not be used as a target
    #[error("Invalid target: {target} - {reason}")]
    InvalidTarget { target: String, reason: String },

    /// A probe failed on a target for a non-transient reason
    #[error("Probe error: {probe} on {target} - {message}")]
    Probe {
        probe: String,
        target: String,
        message: String,
    },

    /// A probe worker panicked
    #[error("Probe panicked: {probe} - {message}")]
    ProbePanicked { probe: String, message: String },

    /// A factor rule failed while evaluating a target
    #[error("Rule error: {rule} - {message}")]
    Rule { rule: String, message: String },

    /// File I/O errors
    #[error("IO error: {operation} - {message}")]
    Io { operation: String, message: String },

    /// Snapshot or export (de)serialization errors
    #[error("Serialization error: {format} - {message}")]
    Serialization { format: String, message: String },

    /// Generic internal errors with context
    #[error("Internal error: {context} - {message}")]
    Internal { context: String, message: String },
}

impl ReconError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout<O: Into<String>>(operation: O, duration_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms,
        }
    }

    pub fn rate_limit<R: Into<String>, M: Into<String>>(resource: R, message: M) -> Self {
        Self::RateLimit {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn invalid_seed<S: Into<String>>(reason: S) -> Self {
        Self::InvalidSeed {
            reason: reason.into(),
        }
    }

    pub fn invalid_target<T: Into<String>, R: Into<String>>(target: T, reason: R) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn probe<P: Into<String>, T: Into<String>, M: Into<String>>(
        probe: P,
        target: T,
        message: M,
    ) -> Self {
        Self::Probe {
            probe: probe.into(),
            target: target.into(),
            message: message.into(),
        }
    }

    pub fn probe_panicked<P: Into<String>, M: Into<String>>(probe: P, message: M) -> Self {
        Self::ProbePanicked {
            probe: probe.into(),
            message: message.into(),
        }
    }

    pub fn rule<R: Into<String>, M: Into<String>>(rule: R, message: M) -> Self {
        Self::Rule {
            rule: rule.into(),
            message: message.into(),
        }
    }

    pub fn io<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Io {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn serialization<F: Into<String>, M: Into<String>>(format: F, message: M) -> Self {
        Self::Serialization {
            format: format.into(),
            message: message.into(),
        }
    }

    pub fn internal<C: Into<String>, M: Into<String>>(context: C, message: M) -> Self {
        Self::Internal {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Transient errors are retried inside a probe attempt before the
    /// attempt is recorded as failed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimit { .. }
        )
    }

    /// Only seed errors abort a run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidSeed { .. } | Self::Configuration { .. })
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Internal { .. } | Self::InvalidSeed { .. } => ErrorSeverity::Critical,
            Self::Configuration { .. } | Self::ProbePanicked { .. } => ErrorSeverity::High,
            Self::Probe { .. } | Self::Rule { .. } | Self::Io { .. } => ErrorSeverity::Medium,
            Self::Serialization { .. } => ErrorSeverity::Medium,
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimit { .. } => {
                ErrorSeverity::Low
            }
            Self::InvalidTarget { .. } => ErrorSeverity::Low,
        }
    }
}

/// Error severity levels for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl From<io::Error> for ReconError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut => Self::timeout("io", 0),
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::network(error.to_string()),
            _ => Self::io("IO operation", error.to_string()),
        }
    }
}

impl From<serde_json::Error> for ReconError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization("json", error.to_string())
    }
}

impl From<config::ConfigError> for ReconError {
    fn from(error: config::ConfigError) -> Self {
        Self::config(error.to_string())
    }
}

impl From<anyhow::Error> for ReconError {
    fn from(error: anyhow::Error) -> Self {
        Self::internal("anyhow", format!("{:#}", error))
    }
}

/// Adds probe/target context to lower-level errors
pub trait ErrorContext<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;

    fn with_probe_context(self, probe: &str, target: &str) -> Result<T>;
}

impl<T, E: Into<ReconError>> ErrorContext<T> for std::result::Result<T, E> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let original = e.into();
            ReconError::internal(f(), original.to_string())
        })
    }

    fn with_probe_context(self, probe: &str, target: &str) -> Result<T> {
        self.map_err(|e| match e.into() {
            // transient errors keep their class so the retry policy still sees them
            transient if transient.is_transient() => transient,
            ReconError::Io { message, .. } | ReconError::Internal { message, .. } => {
                ReconError::probe(probe, target, message)
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = ReconError::network("Connection refused");
        assert!(matches!(error, ReconError::Network { .. }));
        assert!(error.is_transient());
        assert!(!error.is_fatal());
    }

    #[test]
    fn test_error_severity() {
        let seed_error = ReconError::invalid_seed("empty root");
        assert_eq!(seed_error.severity(), ErrorSeverity::Critical);
        assert!(seed_error.is_fatal());

        let timeout = ReconError::timeout("http_get", 5000);
        assert_eq!(timeout.severity(), ErrorSeverity::Low);
        assert!(timeout.is_transient());
    }

    #[test]
    fn test_io_error_classification() {
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(ReconError::from(reset).is_transient());

        let missing = io::Error::new(io::ErrorKind::NotFound, "no such file");
        assert!(!ReconError::from(missing).is_transient());
    }

    #[test]
    fn test_probe_context() {
        let result: std::result::Result<(), io::Error> = Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let error = result.with_probe_context("cert-lookup", "example.com").unwrap_err();
        assert!(matches!(error, ReconError::Probe { .. }));

        let result: std::result::Result<(), ReconError> = Err(ReconError::network("reset"));
        let error = result.with_probe_context("cert-lookup", "example.com").unwrap_err();
        assert!(error.is_transient());
    }
}
