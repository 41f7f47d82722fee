//! dacgate client implementation

use dacgate_core::identity::LocalIdentity;
use dacgate_core::session::{SessionPhase, OPTION_PEER_IDENTITY};
use dacgate_core::{Error, Result, Role, Session, SessionLimits, StreamTransport, TrustStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Gateway address
    pub server_address: String,
    /// Gateway port
    pub server_port: u16,
    /// Our identification string
    pub identification: String,
    /// Hex seed file of our identity key
    pub key_path: Option<PathBuf>,
    /// Identification the gateway must present
    pub server_identification: String,
    /// Gateway identity public key (hex)
    pub server_public_key: Option<String>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Per-request timeout in milliseconds
    pub message_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost".to_string(),
            server_port: dacgate_core::DEFAULT_PORT,
            identification: "client-1".to_string(),
            key_path: None,
            server_identification: "server-1".to_string(),
            server_public_key: None,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: dacgate_core::DEFAULT_HANDSHAKE_TIMEOUT_MS,
            message_timeout_ms: dacgate_core::DEFAULT_MESSAGE_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.server_address, self.server_port)
    }

    fn limits(&self) -> SessionLimits {
        SessionLimits {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            message_timeout: Duration::from_millis(self.message_timeout_ms),
            release_buffer_on_auth_failure: true,
        }
    }
}

/// dacgate client
pub struct GatewayClient {
    config: ClientConfig,
    identity: Arc<LocalIdentity>,
    trust: Arc<TrustStore>,
    session: Option<Session<StreamTransport<TcpStream>>>,
}

impl GatewayClient {
    /// Create a client from an already loaded identity and trust store
    pub fn new(config: ClientConfig, identity: Arc<LocalIdentity>, trust: Arc<TrustStore>) -> Self {
        Self {
            config,
            identity,
            trust,
            session: None,
        }
    }

    /// Load the identity key and gateway key named in `config`
    pub fn from_config(config: ClientConfig) -> Result<Self> {
        let key_path = config
            .key_path
            .clone()
            .ok_or_else(|| Error::Config("no identity key file given".to_string()))?;
        let identity = LocalIdentity::load(config.identification.clone(), key_path)?;

        let server_key = config
            .server_public_key
            .as_deref()
            .ok_or_else(|| Error::Config("no gateway public key given".to_string()))?;
        let mut trust = TrustStore::new();
        trust.add_hex(config.server_identification.clone(), server_key)?;

        Ok(Self::new(config, Arc::new(identity), Arc::new(trust)))
    }

    /// Connect and authenticate
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let address = self.config.address();
        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let transport = StreamTransport::connect(&address, connect_timeout).await?;

        let mut session = Session::new(
            Role::Initiator,
            transport,
            self.identity.clone(),
            self.trust.clone(),
            self.config.limits(),
        );
        session.set_option(OPTION_PEER_IDENTITY, self.config.server_identification.clone())?;
        session.handshake().await?;

        tracing::info!(
            "Connected to {} as {}",
            address,
            self.identity.identification()
        );
        self.session = Some(session);
        Ok(())
    }

    fn session_mut(&mut self) -> Result<&mut Session<StreamTransport<TcpStream>>> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::InvalidPhase("not connected".to_string()))
    }

    /// Send one request and wait for the response
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let session = self.session_mut()?;
        let result = session.request(payload).await;
        if session.phase() != SessionPhase::Active {
            self.disconnect().await?;
        }
        result
    }

    /// Send a JSON command and parse the JSON response
    pub async fn command(&mut self, command: &serde_json::Value) -> Result<serde_json::Value> {
        let payload = serde_json::to_vec(command)?;
        let response = self.request(&payload).await?;
        Ok(serde_json::from_slice(&response)?)
    }

    /// Round-trip a ping; true when the gateway answered pong
    pub async fn ping(&mut self) -> Result<bool> {
        let response = self.command(&serde_json::json!({ "cmd": "ping" })).await?;
        Ok(response.get("cmd").and_then(|v| v.as_str()) == Some("pong"))
    }

    /// Close the session
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.close().await?;
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.phase() == SessionPhase::Active)
            .unwrap_or(false)
    }
}
