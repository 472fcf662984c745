//! Actuator error types
//!
//! The variants follow the reconcile error taxonomy:
//! - absence (`NotFound`), handled as success on delete paths
//! - incomplete state (`VariablesNotFound`), which carries the values that were found
//! - transient failures (`Provider`, `Kube`, job deadlines), left to the outer retry
//! - `Fatal` configuration or invariant violations, never coerced into defaults

use std::collections::BTreeMap;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("variables not found in terraform state: {}", .missing.join(", "))]
    VariablesNotFound {
        /// Requested keys missing from the state
        missing: Vec<String>,
        /// Requested keys that were present
        found: BTreeMap<String, String>,
    },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("invalid configuration: {0}")]
    Fatal(String),

    #[error("terraformer job {job} failed: {reason}")]
    JobFailed { job: String, reason: String },

    #[error("terraformer job {job} did not finish within {}s", .deadline.as_secs())]
    DeadlineExceeded { job: String, deadline: Duration },

    #[error("terraformer pod of job {job} did not start within {}s", .deadline.as_secs())]
    PodDeadlineExceeded { job: String, deadline: Duration },

    #[error("cancelled while waiting for terraformer job {job}")]
    Cancelled { job: String },

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("template error: {0}")]
    Template(#[from] tera::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_yaml::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// True for absent objects, including a kube API 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Kube(e) => crate::k8s_client::is_not_found(e),
            _ => false,
        }
    }

    pub fn is_variables_not_found(&self) -> bool {
        matches!(self, Self::VariablesNotFound { .. })
    }

    /// Errors expected to clear up on their own with a retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Provider(_)
            | Self::DeadlineExceeded { .. }
            | Self::PodDeadlineExceeded { .. }
            | Self::Cancelled { .. } => true,
            Self::Kube(e) => !crate::k8s_client::is_not_found(e),
            _ => false,
        }
    }

    /// Configuration or invariant violations that no retry will fix
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Template(_) | Self::Manifest(_))
    }
}
