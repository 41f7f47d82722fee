//! Gateway configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty file
//! is a valid (if untrusting) configuration.

use crate::error::{Error, Result};
use crate::identity::{validate_identification, LocalIdentity, TrustStore};
use crate::listener::ListenerSettings;
use crate::session::SessionLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    /// Trusted peers
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Directory relative key paths are resolved against
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// Listening socket, admission and timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Accept poll interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a pending connection may wait for a session slot
    #[serde(default = "default_admission_timeout_ms")]
    pub admission_timeout_ms: u64,

    /// Concurrent sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Per-message budget while a session is active
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    /// Zeroize a received frame buffer that fails authentication
    #[serde(default = "default_true")]
    pub release_buffer_on_auth_failure: bool,
}

/// Local identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_identification")]
    pub identification: String,

    /// Hex-encoded Ed25519 seed
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
}

/// One trusted peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub identification: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    crate::DEFAULT_PORT
}

fn default_poll_interval_ms() -> u64 {
    crate::DEFAULT_POLL_INTERVAL_MS
}

fn default_admission_timeout_ms() -> u64 {
    crate::DEFAULT_ADMISSION_TIMEOUT_MS
}

fn default_max_sessions() -> usize {
    crate::DEFAULT_MAX_SESSIONS
}

fn default_handshake_timeout_ms() -> u64 {
    crate::DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_message_timeout_ms() -> u64 {
    crate::DEFAULT_MESSAGE_TIMEOUT_MS
}

fn default_true() -> bool {
    true
}

fn default_identification() -> String {
    "server-1".to_string()
}

fn default_key_file() -> PathBuf {
    PathBuf::from("server.key")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            poll_interval_ms: default_poll_interval_ms(),
            admission_timeout_ms: default_admission_timeout_ms(),
            max_sessions: default_max_sessions(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            release_buffer_on_auth_failure: default_true(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            identification: default_identification(),
            key_file: default_key_file(),
        }
    }
}

impl NetworkConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            message_timeout: Duration::from_millis(self.message_timeout_ms),
            release_buffer_on_auth_failure: self.release_buffer_on_auth_failure,
        }
    }

    pub fn listener_settings(&self) -> ListenerSettings {
        ListenerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            admission_timeout: Duration::from_millis(self.admission_timeout_ms),
            max_sessions: self.max_sessions,
            limits: self.session_limits(),
        }
    }
}

impl GatewayConfig {
    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let mut config = Self::from_toml_str(&content)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let network = &self.network;
        if network.max_sessions == 0 {
            return Err(Error::Config("network.max_sessions must be at least 1".to_string()));
        }
        for (name, value) in [
            ("poll_interval_ms", network.poll_interval_ms),
            ("admission_timeout_ms", network.admission_timeout_ms),
            ("handshake_timeout_ms", network.handshake_timeout_ms),
            ("message_timeout_ms", network.message_timeout_ms),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("network.{} must be non-zero", name)));
            }
        }

        validate_identification(&self.identity.identification)
            .map_err(|e| Error::Config(format!("identity.identification: {}", e)))?;
        for peer in &self.peers {
            validate_identification(&peer.identification)
                .map_err(|e| Error::Config(format!("peer {:?}: {}", peer.identification, e)))?;
        }
        Ok(())
    }

    /// `bind_address:port`
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.network.bind_address, self.network.port)
    }

    /// Build the trust store from the `[[peers]]` entries
    pub fn trust_store(&self) -> Result<TrustStore> {
        let mut store = TrustStore::new();
        for peer in &self.peers {
            store
                .add_hex(peer.identification.clone(), &peer.public_key)
                .map_err(|e| Error::Config(format!("peer {}: {}", peer.identification, e)))?;
        }
        Ok(store)
    }

    /// Path of the identity key, resolved against the config file directory
    pub fn key_path(&self) -> PathBuf {
        match &self.base_dir {
            Some(base) if self.identity.key_file.is_relative() => {
                base.join(&self.identity.key_file)
            }
            _ => self.identity.key_file.clone(),
        }
    }

    pub fn load_identity(&self) -> Result<LocalIdentity> {
        LocalIdentity::load(self.identity.identification.clone(), self.key_path())
    }
}
