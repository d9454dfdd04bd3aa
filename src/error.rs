//! Error types for the node security core

use thiserror::Error;

/// Main error type for security operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SecurityError {
    /// Filesystem read/write error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing or construction error
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Private key parsing error, or key does not pair with its certificate
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Local signing failed
    #[error("certificate signing failed: {0}")]
    Signing(String),

    /// A presented chain does not verify under the trusted root pool
    #[error("certificate chain verification failed: {0}")]
    ChainVerification(String),

    /// No root CA material exists on disk
    #[error("no local root CA certificate found")]
    NoLocalRootCa,

    /// A fetched root CA does not match the digest pinned in the join token
    #[error("remote root CA digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the caller pinned
        expected: String,
        /// The digest of the material actually fetched
        actual: String,
    },

    /// The join token is not in the expected four-segment form
    #[error("invalid join token")]
    InvalidJoinToken,

    /// Unknown role value
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// The node certificate's validity window has already closed
    #[error("TLS certificate is expired")]
    CertificateExpired,

    /// TLS configuration construction or swap error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// Remote-CA RPC failure (transient; callers may retry)
    #[error("remote CA request failed: {0}")]
    Rpc(String),

    /// Caller-supplied configuration is unusable (bad paths, missing base directory)
    #[error("configuration error: {0}")]
    Config(String),

    /// The operation was cancelled; not a failure
    #[error("operation cancelled")]
    Cancelled,
}

impl SecurityError {
    /// Create an invalid-certificate error with the given message
    pub fn invalid_certificate(msg: impl Into<String>) -> Self {
        Self::InvalidCertificate(msg.into())
    }

    /// Create an invalid-key error with the given message
    pub fn invalid_key(msg: impl Into<String>) -> Self {
        Self::InvalidKey(msg.into())
    }

    /// Create a signing error with the given message
    pub fn signing(msg: impl Into<String>) -> Self {
        Self::Signing(msg.into())
    }

    /// Create a chain-verification error with the given message
    pub fn chain(msg: impl Into<String>) -> Self {
        Self::ChainVerification(msg.into())
    }

    /// Create a TLS-configuration error with the given message
    pub fn tls_config(msg: impl Into<String>) -> Self {
        Self::TlsConfig(msg.into())
    }

    /// Create a transient RPC error with the given message
    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type alias for security operations
pub type Result<T> = std::result::Result<T, SecurityError>;
