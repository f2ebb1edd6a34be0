//! Error types for hcloud-talos
//!
//! Errors are structured with fields so that a failed provisioning run can be
//! diagnosed from a single log line. Variants fall into four groups:
//! validation (fail before any side effect), not-found, infrastructure
//! (cloud, kubernetes, remote shell, external command, unsettled resources)
//! and configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for hcloud-talos operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid operation input, raised before anything is touched
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// A named cloud resource does not exist
    #[error("{kind} {name:?} could not be found")]
    NotFound {
        /// Resource kind (network, server, ...)
        kind: &'static str,
        /// Deterministic resource name that was looked up
        name: String,
    },

    /// The cluster state file is missing from the working directory
    #[error("cluster state not found at {}", .path.display())]
    StateNotFound {
        /// Path that was checked
        path: PathBuf,
    },

    /// Bootstrap target directory already has content
    #[error("directory {} must be empty", .path.display())]
    DirectoryNotEmpty {
        /// Offending directory
        path: PathBuf,
    },

    /// Malformed configuration material
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// Cloud provider API error
    #[error("cloud error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Cloud {
        /// Description returned by the API or the transport
        message: String,
        /// HTTP status code if the request reached the API
        status: Option<u16>,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Remote shell command failed
    #[error("remote command on {host} failed: {message}")]
    Remote {
        /// Target host
        host: String,
        /// Error plus combined command output
        message: String,
    },

    /// Local external command (talosctl) failed
    #[error("command {command} failed: {message}")]
    Command {
        /// Command line that was executed
        command: String,
        /// Error plus combined command output
        message: String,
    },

    /// A resource exists but has not reached the awaited condition yet
    #[error("not ready: {message}")]
    Pending {
        /// Condition that is still missing
        message: String,
    },

    /// No free node name left in a pool
    #[error("unable to find next node name for pool {pool} with prefix {prefix}")]
    PoolExhausted {
        /// Pool being reconciled
        pool: String,
        /// Node name prefix that was searched
        prefix: String,
    },

    /// Filesystem error
    #[error("io error: {source}")]
    Io {
        /// The underlying I/O error
        #[from]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where it happened
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a not-found error for a named resource
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a cloud error that never reached the API (transport, decoding)
    pub fn cloud(msg: impl Into<String>) -> Self {
        Self::Cloud {
            message: msg.into(),
            status: None,
        }
    }

    /// Create a cloud error from an API response
    pub fn cloud_status(status: u16, msg: impl Into<String>) -> Self {
        Self::Cloud {
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create an error for a resource that has not settled yet
    pub fn pending(msg: impl Into<String>) -> Self {
        Self::Pending {
            message: msg.into(),
        }
    }

    /// Create a remote shell error
    pub fn remote(host: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Remote {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create an external command error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the failed call could plausibly succeed.
    ///
    /// Authentication failures and malformed input are permanent; rate limits,
    /// unsettled resources and refused connections are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Validation { .. }
            | Error::NotFound { .. }
            | Error::StateNotFound { .. }
            | Error::DirectoryNotEmpty { .. }
            | Error::Config { .. }
            | Error::PoolExhausted { .. }
            | Error::Serialization { .. } => false,
            Error::Cloud {
                status: Some(401 | 403 | 422),
                ..
            } => false,
            Error::Cloud { .. }
            | Error::Kube { .. }
            | Error::Remote { .. }
            | Error::Command { .. }
            | Error::Pending { .. }
            | Error::Io { .. }
            | Error::Internal { .. } => true,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
