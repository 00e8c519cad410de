use egress_core::CoreError;
use kube_runtime::finalizer;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    InvalidConfig {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Gateway is missing its {0}")]
    MissingObjectKey(&'static str),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<finalizer::Error<Error>>),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
}

impl Error {
    /// Label of the error in the reconcile metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Error::InvalidConfig { .. } => "InvalidConfig",
            Error::MissingObjectKey(_) => "MissingObjectKey",
            Error::Core(e) => e.reason(),
            Error::KubernetesError(_) => "KubernetesError",
            Error::Finalizer(e) => match e.as_ref() {
                finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e.reason(),
                _ => "FinalizerError",
            },
            Error::MetricsError(_) => "MetricsError",
        }
    }
}

impl From<finalizer::Error<Error>> for Error {
    fn from(e: finalizer::Error<Error>) -> Self {
        Error::Finalizer(Box::new(e))
    }
}
