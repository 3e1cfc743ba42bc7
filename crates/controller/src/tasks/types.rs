use crate::tasks::config::ControllerConfig;
use crate::tasks::dump::DumpReconciler;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer used to drop per-resource controller state when a `DumpRequest` is deleted
pub const DUMP_FINALIZER_NAME: &str = "diagnostics.platform/dump-finalizer";

/// Shared state handed to every reconciliation
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub reconciler: Arc<DumpReconciler>,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Remote command failed or the target is temporarily unreachable
    #[error("Transient exec error: {0}")]
    TransientExec(String),

    /// Artifact not detected within the detection window
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Target pod or convention directory does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Status write kept colliding with concurrent writers
    #[error("Status update conflict for {name} after {attempts} attempt(s)")]
    Conflict { name: String, attempts: u32 },

    #[error("Status ordering violation: {0}")]
    OrderingViolation(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl Error {
    /// Terminal errors are recorded as Completed=False instead of being retried
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::NotFound(_))
    }

    /// 409 from the API server, or a conflict surfaced by the status reporter
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 409,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
