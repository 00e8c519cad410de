use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Northbound {op} of {object} failed: {reason}")]
    Northbound {
        op: &'static str,
        object: String,
        reason: String,
    },

    #[error("{kind} {name} exists but is not owned by {owner}")]
    ForeignObject {
        kind: &'static str,
        name: String,
        owner: String,
    },

    #[error("Teardown incomplete, {} object(s) left behind: {}", .0.len(), .0.join("; "))]
    Teardown(Vec<String>),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl CoreError {
    pub fn northbound(op: &'static str, object: impl Into<String>, reason: impl ToString) -> Self {
        CoreError::Northbound {
            op,
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error comes from invalid or incomplete intent rather than
    /// from a failed remote call
    pub fn is_precondition(&self) -> bool {
        matches!(self, CoreError::Precondition(_) | CoreError::InvalidAddress(_))
    }

    /// Short machine-readable reason, suitable as a metric label or a
    /// condition reason
    pub fn reason(&self) -> &'static str {
        match self {
            CoreError::Precondition(_) => "PreconditionFailed",
            CoreError::Northbound { .. } => "NorthboundError",
            CoreError::ForeignObject { .. } => "ForeignObject",
            CoreError::Teardown(_) => "TeardownIncomplete",
            CoreError::InvalidAddress(_) => "InvalidAddress",
            CoreError::KubernetesError(_) => "KubernetesError",
            CoreError::SerializationError(_) => "SerializationError",
        }
    }
}
