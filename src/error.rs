//! Error types for the Vertica operator core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API request failed
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The finalizer helper failed while applying or cleaning up
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// A command run inside a pod container failed
    #[error("exec in pod {pod} (container {container}) failed: {message}")]
    ExecError {
        pod: String,
        container: String,
        message: String,
        stderr: String,
    },

    /// Output of the pod-fact gather script could not be parsed
    #[error("failed to unmarshal gather script output: {0}")]
    GatherParseError(#[from] serde_yaml::Error),

    /// admintools.conf content could not be parsed
    #[error("admintools.conf parse error at line {line}: {message}")]
    ConfigParseError { line: usize, message: String },

    /// Node details returned by the server were malformed
    #[error("failed to fetch node details: {0}")]
    NodeDetailsError(String),

    /// HTTP request to the Vertica HTTPS service failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Local file handling failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Invalid operator or resource configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A required object does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether a reconcile that failed with this error should be retried soon
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_)
                | Error::ExecError { .. }
                | Error::HttpError(_)
                | Error::IoError(_)
                | Error::FinalizerError(_)
        )
    }

    /// True for a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 404)
    }

    /// True for a Kubernetes 409 (optimistic concurrency conflict)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(resp)) if resp.code == 409)
    }
}

impl<E> From<kube::runtime::finalizer::Error<E>> for Error
where
    E: std::error::Error + 'static,
{
    fn from(e: kube::runtime::finalizer::Error<E>) -> Self {
        Error::FinalizerError(e.to_string())
    }
}
