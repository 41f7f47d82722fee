//! Session state machine
//!
//! A `Session` owns everything belonging to one connected peer: the
//! transport, the handshake results and the secure channel. Phases only move
//! forward:
//!
//! ```text
//! Idle -> Accepting -> Handshaking -> Active -> Closing -> Closed
//!             \             \           \
//!              +-------------+-----------+--> Failed -> Closed
//! ```

use crate::channel::SecureChannel;
use crate::crypto::{TranscriptHash, PUBLIC_KEY_LEN};
use crate::dispatch::{Dispatch, Dispatcher};
use crate::error::{Error, Result};
use crate::handshake::{self, HandshakeContext};
use crate::identity::{validate_identification, LocalIdentity, TrustStore};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use crate::protocol::Role;

/// Session option pinning the identification the peer must present
pub const OPTION_PEER_IDENTITY: &str = "peer_identity";

/// Budget for the best-effort reject sent after a failed handshake
const REJECT_BUDGET: Duration = Duration::from_millis(250);

/// Session lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Not yet bound to a connection
    Idle,
    /// Connection accepted, options may still be set
    Accepting,
    /// Key exchange and authentication in progress
    Handshaking,
    /// Authenticated, frames flowing
    Active,
    /// Tearing down after a normal or peer-initiated end
    Closing,
    /// Transport released, keys zeroed
    Closed,
    /// Handshake or channel failure
    Failed,
}

impl SessionPhase {
    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Idle, Accepting)
                | (Accepting, Handshaking)
                | (Accepting, Failed)
                | (Handshaking, Active)
                | (Handshaking, Failed)
                | (Active, Closing)
                | (Active, Failed)
                | (Closing, Closed)
                | (Failed, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SessionPhase::Closed
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionPhase::Idle => "idle",
            SessionPhase::Accepting => "accepting",
            SessionPhase::Handshaking => "handshaking",
            SessionPhase::Active => "active",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
            SessionPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Time budgets and buffer policy for a session
#[derive(Debug, Clone)]
pub struct SessionLimits {
    /// Whole-handshake budget
    pub handshake_timeout: Duration,
    /// Budget for each frame read or write while active
    pub message_timeout: Duration,
    /// Zeroize a received frame buffer that fails authentication
    pub release_buffer_on_auth_failure: bool,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(crate::DEFAULT_HANDSHAKE_TIMEOUT_MS),
            message_timeout: Duration::from_millis(crate::DEFAULT_MESSAGE_TIMEOUT_MS),
            release_buffer_on_auth_failure: true,
        }
    }
}

/// Session statistics
#[derive(Debug, Clone, Default)]
pub struct SessionStatistics {
    /// Frame bytes sent
    pub bytes_sent: u64,
    /// Frame bytes received
    pub bytes_received: u64,
    /// Messages sent
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Errors encountered
    pub errors: u64,
}

/// Session information
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Session ID
    pub session_id: Uuid,
    /// Which end this session is
    pub role: Role,
    /// Current phase
    pub phase: SessionPhase,
    /// Remote address
    pub peer_address: String,
    /// Peer identification, once authenticated
    pub peer_identification: Option<String>,
    /// Session start time
    pub started_at: DateTime<Utc>,
    /// Last activity time
    pub last_activity: DateTime<Utc>,
    /// Session statistics
    pub statistics: SessionStatistics,
    /// Every phase entered, in order
    pub history: Vec<SessionPhase>,
}

enum Link<T> {
    Plain(T),
    Secure(SecureChannel<T>),
    Released,
}

/// One authenticated session over a transport
pub struct Session<T> {
    info: SessionInfo,
    link: Link<T>,
    identity: Arc<LocalIdentity>,
    trust: Arc<TrustStore>,
    limits: SessionLimits,
    options: HashMap<String, String>,
    own_ephemeral: Option<[u8; PUBLIC_KEY_LEN]>,
    peer_ephemeral: Option<[u8; PUBLIC_KEY_LEN]>,
    transcript_hash: Option<TranscriptHash>,
}

impl<T: Transport> Session<T> {
    /// Bind a freshly accepted (or connected) transport. The session starts
    /// in `Accepting`.
    pub fn new(
        role: Role,
        transport: T,
        identity: Arc<LocalIdentity>,
        trust: Arc<TrustStore>,
        limits: SessionLimits,
    ) -> Self {
        let now = Utc::now();
        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            role,
            phase: SessionPhase::Accepting,
            peer_address: transport.peer_address().to_string(),
            peer_identification: None,
            started_at: now,
            last_activity: now,
            statistics: SessionStatistics::default(),
            history: vec![SessionPhase::Idle, SessionPhase::Accepting],
        };
        debug!(
            session_id = %info.session_id,
            role = %role,
            peer = %info.peer_address,
            "Session created"
        );

        Self {
            info,
            link: Link::Plain(transport),
            identity,
            trust,
            limits,
            options: HashMap::new(),
            own_ephemeral: None,
            peer_ephemeral: None,
            transcript_hash: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn role(&self) -> Role {
        self.info.role
    }

    pub fn phase(&self) -> SessionPhase {
        self.info.phase
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn statistics(&self) -> &SessionStatistics {
        &self.info.statistics
    }

    pub fn history(&self) -> &[SessionPhase] {
        &self.info.history
    }

    pub fn peer_identification(&self) -> Option<&str> {
        self.info.peer_identification.as_deref()
    }

    pub fn transcript_hash(&self) -> Option<&TranscriptHash> {
        self.transcript_hash.as_ref()
    }

    /// Ephemeral public values (own, peer) once the handshake succeeded
    pub fn ephemeral_keys(&self) -> Option<([u8; PUBLIC_KEY_LEN], [u8; PUBLIC_KEY_LEN])> {
        self.own_ephemeral.zip(self.peer_ephemeral)
    }

    /// Set a negotiated option. Only legal before the handshake starts.
    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        if !matches!(self.info.phase, SessionPhase::Idle | SessionPhase::Accepting) {
            return Err(Error::Protocol(format!(
                "Options cannot change once the session is {}",
                self.info.phase
            )));
        }
        let key = key.into();
        let value = value.into();
        if key == OPTION_PEER_IDENTITY {
            validate_identification(&value)?;
        }
        self.options.insert(key, value);
        Ok(())
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    fn advance(&mut self, next: SessionPhase) -> Result<()> {
        if !self.info.phase.can_advance_to(next) {
            return Err(Error::InvalidPhase(format!("{} -> {}", self.info.phase, next)));
        }
        debug!(
            session_id = %self.info.session_id,
            from = %self.info.phase,
            to = %next,
            "Session phase change"
        );
        self.info.phase = next;
        self.info.history.push(next);
        Ok(())
    }

    fn touch(&mut self) {
        self.info.last_activity = Utc::now();
    }

    /// Run the handshake for this session's role.
    ///
    /// On success the session is `Active`. On any failure it is `Failed`,
    /// the transport has been released and (as responder) a generic reject
    /// was attempted.
    pub async fn handshake(&mut self) -> Result<()> {
        if self.info.phase != SessionPhase::Accepting {
            return Err(Error::InvalidPhase(format!(
                "handshake requires accepting, session is {}",
                self.info.phase
            )));
        }
        let mut transport = match std::mem::replace(&mut self.link, Link::Released) {
            Link::Plain(transport) => transport,
            other => {
                self.link = other;
                return Err(Error::InvalidPhase("transport already secured".to_string()));
            }
        };
        self.advance(SessionPhase::Handshaking)?;

        let role = self.info.role;
        let result = {
            let ctx = HandshakeContext {
                identity: &self.identity,
                trust: &self.trust,
                pinned_peer: self.options.get(OPTION_PEER_IDENTITY).map(String::as_str),
                budget: self.limits.handshake_timeout,
            };
            let run = async {
                match role {
                    Role::Initiator => handshake::run_initiator(&mut transport, &ctx).await,
                    Role::Responder => handshake::run_responder(&mut transport, &ctx).await,
                }
            };
            match tokio::time::timeout(self.limits.handshake_timeout, run).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout("handshake".to_string())),
            }
        };
        self.touch();

        match result {
            Ok(outcome) => {
                self.link = Link::Secure(SecureChannel::new(
                    transport,
                    &outcome.keys,
                    role,
                    self.limits.release_buffer_on_auth_failure,
                ));
                self.own_ephemeral = Some(outcome.own_ephemeral);
                self.peer_ephemeral = Some(outcome.peer_ephemeral);
                self.transcript_hash = Some(outcome.transcript_hash);
                self.info.peer_identification = Some(outcome.peer_identification);
                self.advance(SessionPhase::Active)?;
                info!(
                    session_id = %self.info.session_id,
                    peer = ?self.info.peer_identification,
                    "Session established"
                );
                Ok(())
            }
            Err(err) => {
                self.info.statistics.errors += 1;
                if role == Role::Responder && !is_transport_failure(&err) {
                    handshake::send_reject(&mut transport, REJECT_BUDGET).await;
                }
                if let Err(e) = transport.shutdown().await {
                    debug!("Transport shutdown after failed handshake: {}", e);
                }
                drop(transport);
                self.advance(SessionPhase::Failed)?;
                warn!(session_id = %self.info.session_id, "Handshake failed: {}", err);
                Err(err)
            }
        }
    }

    fn channel(&mut self) -> Result<&mut SecureChannel<T>> {
        if self.info.phase != SessionPhase::Active {
            return Err(Error::InvalidPhase(format!("session is {}", self.info.phase)));
        }
        match &mut self.link {
            Link::Secure(channel) => Ok(channel),
            _ => Err(Error::InvalidPhase("no secure channel".to_string())),
        }
    }

    /// Encrypt and send one message.
    ///
    /// An oversized message is rejected without touching the transport and
    /// leaves the session active; any other failure moves it to `Closing`.
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<()> {
        let budget = self.limits.message_timeout;
        let result = self.channel()?.send(plaintext, budget).await;
        match result {
            Ok(written) => {
                self.info.statistics.bytes_sent += written as u64;
                self.info.statistics.messages_sent += 1;
                self.touch();
                Ok(())
            }
            Err(err @ Error::FrameTooLarge { .. }) => {
                self.info.statistics.errors += 1;
                Err(err)
            }
            Err(err) => {
                self.info.statistics.errors += 1;
                self.advance(SessionPhase::Closing)?;
                Err(err)
            }
        }
    }

    /// Receive and decrypt one message. Any failure moves the session to
    /// `Closing`.
    pub async fn receive(&mut self) -> Result<Vec<u8>> {
        let budget = self.limits.message_timeout;
        let result = self.channel()?.recv(budget).await;
        match result {
            Ok(plaintext) => {
                self.info.statistics.bytes_received += plaintext.len() as u64;
                self.info.statistics.messages_received += 1;
                self.touch();
                Ok(plaintext)
            }
            Err(err) => {
                if !matches!(err, Error::ConnectionClosed) {
                    self.info.statistics.errors += 1;
                }
                self.advance(SessionPhase::Closing)?;
                Err(err)
            }
        }
    }

    /// Send one request and wait for its response
    pub async fn request(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.send(plaintext).await?;
        self.receive().await
    }

    /// Serve requests until the peer leaves, the dispatcher closes, or
    /// `shutdown` fires.
    ///
    /// Strictly one request at a time: a response is sent before the next
    /// frame is read. A clean peer close returns `Ok`.
    pub async fn serve<D: Dispatcher + ?Sized>(
        &mut self,
        dispatcher: &D,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => None,
                result = self.receive() => Some(result),
            };

            let request = match received {
                None => {
                    debug!(session_id = %self.info.session_id, "Shutdown requested");
                    if self.info.phase == SessionPhase::Active {
                        self.advance(SessionPhase::Closing)?;
                    }
                    return Ok(());
                }
                Some(Err(Error::ConnectionClosed)) => return Ok(()),
                Some(Err(err)) => return Err(err),
                Some(Ok(request)) => request,
            };

            let (response, close_after) = match dispatcher.dispatch(request).await {
                Dispatch::Reply(response) => (Some(response), false),
                Dispatch::ReplyAndClose(response) => (Some(response), true),
                Dispatch::Close => (None, true),
            };

            if let Some(response) = response {
                if let Err(err) = self.send(&response).await {
                    if self.info.phase == SessionPhase::Active {
                        self.advance(SessionPhase::Closing)?;
                    }
                    return Err(err);
                }
            }
            if close_after {
                self.advance(SessionPhase::Closing)?;
                return Ok(());
            }
        }
    }

    /// Release the transport and zero the keys.
    ///
    /// `Active` goes through `Closing`; `Accepting` (never handshaken) goes
    /// through `Failed`. Closing a closed session is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        match self.info.phase {
            SessionPhase::Closed => return Ok(()),
            SessionPhase::Active => self.advance(SessionPhase::Closing)?,
            SessionPhase::Accepting => self.advance(SessionPhase::Failed)?,
            SessionPhase::Closing | SessionPhase::Failed => {}
            SessionPhase::Idle | SessionPhase::Handshaking => {
                return Err(Error::InvalidPhase(format!("cannot close while {}", self.info.phase)));
            }
        }

        let shutdown = match &mut self.link {
            Link::Plain(transport) => transport.shutdown().await,
            Link::Secure(channel) => channel.shutdown().await,
            Link::Released => Ok(()),
        };
        if let Err(e) = shutdown {
            debug!(session_id = %self.info.session_id, "Transport shutdown: {}", e);
        }
        self.link = Link::Released;
        self.advance(SessionPhase::Closed)?;
        info!(
            session_id = %self.info.session_id,
            messages_received = self.info.statistics.messages_received,
            messages_sent = self.info.statistics.messages_sent,
            "Session closed"
        );
        Ok(())
    }
}

fn is_transport_failure(err: &Error) -> bool {
    matches!(
        err,
        Error::Transport(_) | Error::Timeout(_) | Error::ConnectionClosed
    )
}
