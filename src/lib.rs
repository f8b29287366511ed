use std::time::Duration;

use thiserror::Error;

use controllers::workloads::reconcilers::webhook::WebhookValidationError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("The {kind} {namespace}/{name} does not exist")]
    WorkloadNotFound {
        kind: String,
        namespace: String,
        name: String,
    },

    #[error("The {0} changed while it was being patched")]
    Conflict(String),

    #[error("Gave up patching {0} after {1} conflicting writes")]
    ConflictRetriesExhausted(String, u32),

    #[error("Injection webhook is unavailable: {0}")]
    WebhookUnavailable(String),

    #[error("Injection webhook response failed validation: {0}")]
    WebhookValidation(#[from] WebhookValidationError),

    #[error("Workload cannot be reconciled: {0}")]
    InvalidWorkload(String),

    #[error("Refusing to continue, invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Reconcile did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to register metrics: {0}")]
    MetricsError(#[from] prometheus::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the reconciler should treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Requeue with backoff
    Transient,
    /// The object is gone; nothing left to do
    NotFound,
    /// Untrusted input was rejected; wait for the next external event
    Validation,
    /// Must not happen in correct operation
    Fatal,
}

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::WorkloadNotFound { .. } => "WorkloadNotFound",
            Error::Conflict(_) => "Conflict",
            Error::ConflictRetriesExhausted(_, _) => "ConflictRetriesExhausted",
            Error::WebhookUnavailable(_) => "WebhookUnavailable",
            Error::WebhookValidation(_) => "WebhookValidation",
            Error::InvalidWorkload(_) => "InvalidWorkload",
            Error::InvariantViolation(_) => "InvariantViolation",
            Error::Timeout(_) => "Timeout",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::MetricsError(_) => "MetricsError",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => match resp.code {
                404 => ErrorClass::NotFound,
                409 | 429 => ErrorClass::Transient,
                code if code >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Fatal,
            },
            Error::KubeError(_) => ErrorClass::Transient,
            Error::WorkloadNotFound { .. } => ErrorClass::NotFound,
            Error::Conflict(_)
            | Error::ConflictRetriesExhausted(_, _)
            | Error::WebhookUnavailable(_)
            | Error::Timeout(_) => ErrorClass::Transient,
            Error::WebhookValidation(_) | Error::InvalidWorkload(_) => ErrorClass::Validation,
            Error::SerializationError(_)
            | Error::InvariantViolation(_)
            | Error::InvalidConfig(_)
            | Error::MetricsError(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}

/// Reconcile configuration
pub mod config;

pub mod controllers;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use config::Config;
pub use controllers::{run, Diagnostics, State};
pub use metrics::Metrics;

/// Workload model and the Kubernetes API surface we consume
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        }))
    }

    #[test]
    fn api_errors_are_classified_by_status_code() {
        assert_eq!(api_error(404, "NotFound").class(), ErrorClass::NotFound);
        assert_eq!(api_error(409, "Conflict").class(), ErrorClass::Transient);
        assert_eq!(api_error(503, "ServiceUnavailable").class(), ErrorClass::Transient);
        assert_eq!(api_error(422, "Invalid").class(), ErrorClass::Fatal);
    }

    #[test]
    fn conflicts_are_recognised_from_both_sources() {
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(Error::Conflict("Deployment ns/web".into()).is_conflict());
        assert!(!api_error(500, "InternalError").is_conflict());
    }

    #[test]
    fn webhook_failures_are_split_by_kind() {
        assert_eq!(
            Error::WebhookUnavailable("timed out".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            Error::WebhookValidation(WebhookValidationError::MissingPatch).class(),
            ErrorClass::Validation
        );
    }
}
