//! Error types for the VM controller
//!
//! Errors are structured with fields so log lines and API responses can say
//! which VM, file or resource kind an operation failed on.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Main error type for VM controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Caller-supplied parameters failed the injection guard
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// No API endpoint mapping exists for a group/version/kind
    #[error("discovery error: no resource mapping for {api_version}/{kind}")]
    Discovery {
        /// apiVersion of the unmapped object (e.g. "kubevirt.io/v1")
        api_version: String,
        /// Kind of the unmapped object
        kind: String,
    },

    /// A manifest block could not be decoded into a resource object
    #[error("failed to decode manifest {file}: {message}")]
    Decode {
        /// File the offending block came from
        file: PathBuf,
        /// Parser message
        message: String,
    },

    /// Resource creation failed for a reason other than "already exists"
    #[error("failed to create {kind} {name}: {message}")]
    Apply {
        /// Kind of the resource being created
        kind: String,
        /// Name of the resource being created
        name: String,
        /// Underlying cause
        message: String,
    },

    /// Observed VM status never matched before the poll timeout
    #[error("timeout after {waited:?} waiting for VM {vm} to become {desired}")]
    Timeout {
        /// VM name
        vm: String,
        /// Status that was awaited
        desired: String,
        /// How long we waited
        waited: Duration,
    },

    /// Every port in the allocator band is held by an active VM
    #[error("no available ports in range {min}-{max}")]
    PortsExhausted {
        /// Lowest port of the band
        min: u16,
        /// Highest port of the band (inclusive)
        max: u16,
    },

    /// Uniqueness constraint violated in the VM store
    #[error("conflict: {message}")]
    Conflict {
        /// Which constraint was violated
        message: String,
    },

    /// VM record not found
    #[error("virtual machine not found: {name}")]
    NotFound {
        /// VM name that was looked up
        name: String,
    },

    /// Lifecycle work could not be queued
    #[error("dispatch error: {message}")]
    Dispatch {
        /// Why the job was rejected
        message: String,
    },

    /// Reading manifests from disk failed
    #[error("io error on {path}: {source}")]
    Io {
        /// Path being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Client or configuration construction failed
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a discovery error for an unmapped apiVersion/kind
    pub fn discovery(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Discovery {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a decode error naming the offending file
    pub fn decode(file: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Decode {
            file: file.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error for a resource
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a status wait
    pub fn timeout(vm: impl Into<String>, desired: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            vm: vm.into(),
            desired: desired.into(),
            waited,
        }
    }

    /// Create a uniqueness conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create a dispatch error
    pub fn dispatch(msg: impl Into<String>) -> Self {
        Self::Dispatch {
            message: msg.into(),
        }
    }

    /// Create an I/O error for a path
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, discovery, decode and configuration errors need a change
    /// in input or deployment before a retry can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => {
                !matches!(source, kube::Error::Api(ae) if (400..500).contains(&ae.code))
            }
            Error::Validation { .. } => false,
            Error::Discovery { .. } => false,
            Error::Decode { .. } => false,
            Error::Apply { .. } => true,
            Error::Timeout { .. } => true,
            Error::PortsExhausted { .. } => true,
            Error::Conflict { .. } => false,
            Error::NotFound { .. } => false,
            Error::Dispatch { .. } => true,
            Error::Io { .. } => false,
            Error::Config { .. } => false,
        }
    }
}
