//! Error types for the mTLS trust subsystem

use std::io;

use thiserror::Error;

/// Result type alias for the trust subsystem
pub type Result<T> = std::result::Result<T, Error>;

/// Trust subsystem errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A subject, certificate or file map failed validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Certificate signing failed (including signing with a validation-only CA)
    #[error("Signing error: {0}")]
    Signing(String),

    /// Certificate material could not be parsed or encoded
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// A certificate and private key do not form a key pair
    #[error("Certificate and private key do not match: {0}")]
    KeyMismatch(String),

    /// A TLS config was requested before any snapshot was published
    #[error("no TLS config available")]
    NoTlsConfig,

    /// The published snapshot has zero server certificates
    #[error("no certificate configured")]
    NoCertificate,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS library error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` for errors caused by the caller's input rather than by
    /// the environment (files, sockets) or the TLS stack.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::KeyMismatch(_))
    }
}
