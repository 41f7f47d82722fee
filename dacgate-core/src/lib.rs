//! dacgate Core - authenticated session protocol for the access-control gateway
//!
//! This crate provides the handshake (signed X25519 exchange bound to a
//! BLAKE3 transcript), the per-direction key schedule, the framed
//! ChaCha20-Poly1305 channel, the session state machine and the
//! single-session listener that fronts the local policy engine.

pub mod admission;
pub mod audit;
pub mod channel;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod listener;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use admission::{AdmissionGate, SessionPermit};
pub use audit::{AuditAction, AuditEvent, AuditLogger, AuditResult};
pub use channel::{FrameOpener, FrameSealer, SecureChannel};
pub use config::GatewayConfig;
pub use crypto::{EphemeralKeyPair, KeySet, SharedSecret, TranscriptHash};
pub use dispatch::{Dispatch, Dispatcher, JsonCommandDispatcher};
pub use error::{Error, Result};
pub use identity::{LocalIdentity, TrustStore};
pub use listener::{Listener, ListenerSettings, ListenerStats};
pub use session::{Role, Session, SessionLimits, SessionPhase, SessionStatistics};
pub use transport::{StreamTransport, Transport};

/// Default TCP port of the gateway
pub const DEFAULT_PORT: u16 = 9998;

/// Maximum ciphertext+tag length a frame may declare (16-bit length field)
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Poly1305 authentication tag length
pub const TAG_LEN: usize = 16;

/// Largest plaintext that fits in one frame
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

/// Upper bound for an unencrypted handshake record
pub const MAX_HANDSHAKE_RECORD_LEN: usize = 1024;

/// Maximum identification string length in bytes
pub const MAX_IDENTIFICATION_LEN: usize = 64;

/// Listener poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// How long a pending connection may wait for a session slot
pub const DEFAULT_ADMISSION_TIMEOUT_MS: u64 = 350;

/// Concurrent sessions admitted by default
pub const DEFAULT_MAX_SESSIONS: usize = 1;

/// Handshake budget in milliseconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Per-message budget while a session is active
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 30_000;
