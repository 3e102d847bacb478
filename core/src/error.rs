//! Error types for the kubeadm runtime

use thiserror::Error;

/// Main error type for runtime operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A remote command or file transfer failed on `host`
    #[error("remote operation on {host} failed: {message}")]
    Remote {
        /// Address of the host the operation targeted
        host: String,
        /// Transport or command output describing the failure
        message: String,
    },

    /// Pushing the lvscare static pod to a worker failed
    #[error("update lvscare static pod failed {host}: {source}")]
    ProxySync {
        /// Worker the sync task targeted
        host: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// A per-host sync task panicked before producing a result
    #[error("sync task for {host} panicked")]
    TaskPanicked {
        /// Worker the sync task targeted
        host: String,
    },

    /// An operation needed master0 but the cluster has no masters
    #[error("cluster has no master hosts")]
    NoMasters,

    /// The API server URL derived from master0 is not a valid URI
    #[error("invalid api server url {url}: {message}")]
    InvalidApiServer {
        /// The rejected URL
        url: String,
        /// Parser message
        message: String,
    },

    /// Admin kubeconfig could not be loaded
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Local filesystem or process error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid cluster or settings content
    #[error("validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Create a remote error for `host` with the given message
    pub fn remote(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Wrap `source` as the proxy sync failure of `host`
    pub fn proxy_sync(host: impl Into<String>, source: Error) -> Self {
        Self::ProxySync {
            host: host.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Host the error is attributed to, if any
    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Remote { host, .. }
            | Self::ProxySync { host, .. }
            | Self::TaskPanicked { host } => Some(host),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
