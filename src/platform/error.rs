//! Error taxonomy for remote computations.

use thiserror::Error;

/// Substring the platform uses when a computation's output exceeds its limits.
pub const RESOURCE_EXCEEDED_MARKER: &str = "Output of image computation is too large";

/// Failure reported by a [`ComputePlatform`](super::ComputePlatform).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// The computation's output is too large; a larger tile scale may succeed.
    #[error("{message}")]
    ResourceExceeded { message: String },

    /// Anything else: transport, authentication, bad input, quota, decoding.
    #[error("{kind}: {message}")]
    Opaque { kind: String, message: String },
}

impl PlatformError {
    /// Classify a free-text platform message.
    ///
    /// Only the presence of [`RESOURCE_EXCEEDED_MARKER`] matters; `kind` is
    /// kept for reporting opaque errors.
    pub fn classify(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        if message.contains(RESOURCE_EXCEEDED_MARKER) {
            PlatformError::ResourceExceeded { message }
        } else {
            PlatformError::Opaque {
                kind: kind.into(),
                message,
            }
        }
    }

    /// An error that is never treated as recoverable.
    pub fn opaque(kind: impl Into<String>, message: impl Into<String>) -> Self {
        PlatformError::Opaque {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn is_resource_exceeded(&self) -> bool {
        matches!(self, PlatformError::ResourceExceeded { .. })
    }

    /// Short name of the error kind.
    pub fn kind(&self) -> &str {
        match self {
            PlatformError::ResourceExceeded { .. } => "ResourceExceeded",
            PlatformError::Opaque { kind, .. } => kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            PlatformError::ResourceExceeded { message } => message,
            PlatformError::Opaque { message, .. } => message,
        }
    }
}
