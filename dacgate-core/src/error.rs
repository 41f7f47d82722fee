//! Error types for the dacgate session protocol

use thiserror::Error;

/// Result type for dacgate operations
pub type Result<T> = std::result::Result<T, Error>;

/// dacgate-specific error types
#[derive(Error, Debug)]
pub enum Error {
    /// Entropy source or key generation failed
    #[error("Key generation failed: {0}")]
    KeyGen(String),

    /// Peer ephemeral public value is outside the valid group
    #[error("Invalid peer key")]
    InvalidPeerKey,

    /// Any cryptographic verification failure. Length, tag and signature
    /// failures are indistinguishable.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Plaintext does not fit in a single frame
    #[error("Frame too large: {len} bytes exceeds {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Network transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Read or write budget elapsed
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// No session slot became free within the admission window
    #[error("Admission rejected: session limit reached")]
    AdmissionRejected,

    /// Malformed or unexpected handshake message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not permitted in the current session phase
    #[error("Invalid session phase: {0}")]
    InvalidPhase(String),

    /// Identity key material could not be loaded or parsed
    #[error("Identity error: {0}")]
    Identity(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error ends only the session rather than the process
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Error::KeyGen(_) | Error::Config(_) | Error::Identity(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            std::io::ErrorKind::TimedOut => Error::Timeout(err.to_string()),
            _ => Error::Transport(err.to_string()),
        }
    }
}

impl From<postcard::Error> for Error {
    fn from(err: postcard::Error) -> Self {
        Error::Protocol(format!("Malformed handshake payload: {}", err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Protocol(format!("Serialization error: {}", err))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("TOML parsing error: {}", err))
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::Identity(format!("Invalid hex encoding: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(err.to_string())
    }
}
