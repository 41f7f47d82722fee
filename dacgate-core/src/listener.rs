//! Gateway listener loop
//!
//! Polls the listening socket with a bounded wait, passes each connection
//! through the admission gate and runs admitted sessions on their own task.
//! The loop never sees why a session ended, only that it did.

use crate::admission::{AdmissionGate, SessionPermit};
use crate::audit::{AuditAction, AuditEvent, AuditLogger, AuditResult};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::identity::{LocalIdentity, TrustStore};
use crate::session::{Role, Session, SessionLimits};
use crate::transport::StreamTransport;
use metrics::increment_counter;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listener tuning
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Bounded wait of each accept poll
    pub poll_interval: Duration,
    /// How long a connection may wait for a session slot
    pub admission_timeout: Duration,
    /// Concurrent sessions
    pub max_sessions: usize,
    /// Per-session budgets
    pub limits: SessionLimits,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(crate::DEFAULT_POLL_INTERVAL_MS),
            admission_timeout: Duration::from_millis(crate::DEFAULT_ADMISSION_TIMEOUT_MS),
            max_sessions: crate::DEFAULT_MAX_SESSIONS,
            limits: SessionLimits::default(),
        }
    }
}

/// Connection counters
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    handshakes_failed: AtomicU64,
    completed: AtomicU64,
}

impl ListenerStats {
    /// Connections admitted to a session
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections closed by the admission gate
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn handshakes_failed(&self) -> u64 {
        self.handshakes_failed.load(Ordering::Relaxed)
    }

    /// Sessions whose task has finished
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Everything a session task needs, shared across tasks
struct SessionContext<D: ?Sized> {
    identity: Arc<LocalIdentity>,
    trust: Arc<TrustStore>,
    dispatcher: Arc<D>,
    limits: SessionLimits,
    stats: Arc<ListenerStats>,
    audit: AuditLogger,
    shutdown: CancellationToken,
}

/// TCP listener running the gateway session protocol
pub struct Listener<D: ?Sized> {
    socket: TcpListener,
    settings: ListenerSettings,
    gate: AdmissionGate,
    context: Arc<SessionContext<D>>,
}

impl<D: Dispatcher + ?Sized + 'static> Listener<D> {
    /// Bind the listening socket
    pub async fn bind(
        address: &str,
        settings: ListenerSettings,
        identity: Arc<LocalIdentity>,
        trust: Arc<TrustStore>,
        dispatcher: Arc<D>,
    ) -> Result<Self> {
        let gate = AdmissionGate::new(settings.max_sessions, settings.admission_timeout)?;
        let socket = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Transport(format!("Failed to bind {}: {}", address, e)))?;

        let context = Arc::new(SessionContext {
            identity,
            trust,
            dispatcher,
            limits: settings.limits.clone(),
            stats: Arc::new(ListenerStats::default()),
            audit: AuditLogger::default(),
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            socket,
            settings,
            gate,
            context,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> Arc<ListenerStats> {
        self.context.stats.clone()
    }

    /// Cancelling this token stops the loop and asks sessions to close
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    /// Accept connections until the shutdown token fires
    pub async fn run(self) -> Result<()> {
        let address = self.local_addr()?;
        info!(
            %address,
            identification = self.context.identity.identification(),
            max_sessions = self.settings.max_sessions,
            "Gateway listening"
        );

        let shutdown = self.context.shutdown.clone();
        let poll_interval = self.settings.poll_interval;
        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = tokio::time::timeout(poll_interval, self.socket.accept()) => polled,
            };

            let (stream, peer) = match polled {
                Err(_) => continue,
                Ok(Err(e)) => {
                    warn!("Accept failed: {}", e);
                    if !pause(&shutdown, poll_interval).await {
                        break;
                    }
                    continue;
                }
                Ok(Ok(connection)) => connection,
            };
            debug!(%peer, "Connection pending admission");

            let admitted = tokio::select! {
                _ = shutdown.cancelled() => break,
                admitted = self.gate.admit() => admitted,
            };
            match admitted {
                Ok(permit) => self.spawn_session(stream, peer, permit),
                Err(err) => self.reject(stream, peer, &err),
            }
        }

        info!("Listener stopping, waiting for active sessions");
        drop(self.socket);
        let grace = self.settings.limits.handshake_timeout + self.settings.poll_interval;
        if let Err(e) = self.gate.drain(grace).await {
            warn!("Sessions still running at shutdown: {}", e);
        }
        Ok(())
    }

    fn reject(&self, stream: TcpStream, peer: SocketAddr, err: &Error) {
        self.context.stats.rejected.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dacgate_sessions_rejected_total");
        warn!(%peer, "Connection refused: session limit reached");

        let event = AuditEvent::new(AuditAction::AdmissionRejected, AuditResult::Denied)
            .with_peer_address(peer.to_string())
            .with_error(err);
        if let Err(e) = self.context.audit.log_event(&event) {
            error!("Audit failure: {}", e);
        }
        drop(stream);
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, permit: SessionPermit) {
        self.context.stats.accepted.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dacgate_sessions_accepted_total");

        let context = self.context.clone();
        tokio::spawn(async move {
            match StreamTransport::from_tcp(stream) {
                Ok(transport) => run_session(transport, &context).await,
                Err(e) => warn!(%peer, "Failed to configure connection: {}", e),
            }
            context.stats.completed.fetch_add(1, Ordering::Relaxed);
            drop(permit);
        });
    }
}

async fn run_session<D: Dispatcher + ?Sized>(
    transport: StreamTransport<TcpStream>,
    context: &SessionContext<D>,
) {
    let started = Instant::now();
    let mut session = Session::new(
        Role::Responder,
        transport,
        context.identity.clone(),
        context.trust.clone(),
        context.limits.clone(),
    );
    let session_id = session.id();
    let peer_address = session.info().peer_address.clone();
    audit(
        context,
        AuditEvent::new(AuditAction::SessionStart, AuditResult::Success)
            .with_session_id(session_id)
            .with_peer_address(peer_address.clone()),
    );

    match session.handshake().await {
        Ok(()) => {
            let peer = session.peer_identification().unwrap_or_default().to_string();
            audit(
                context,
                AuditEvent::new(AuditAction::Authentication, AuditResult::Success)
                    .with_session_id(session_id)
                    .with_peer_address(peer_address.clone())
                    .with_peer_identification(peer),
            );
            if let Err(e) = session.serve(context.dispatcher.as_ref(), &context.shutdown).await {
                debug!(%session_id, "Session ended with error: {}", e);
            }
        }
        Err(err) => {
            context.stats.handshakes_failed.fetch_add(1, Ordering::Relaxed);
            increment_counter!("dacgate_handshakes_failed_total");
            audit(
                context,
                AuditEvent::new(AuditAction::Authentication, AuditResult::Failure)
                    .with_session_id(session_id)
                    .with_peer_address(peer_address.clone())
                    .with_error(&err),
            );
        }
    }

    if let Err(e) = session.close().await {
        debug!(%session_id, "Close failed: {}", e);
    }

    let statistics = session.statistics();
    audit(
        context,
        AuditEvent::new(AuditAction::SessionEnd, AuditResult::Success)
            .with_session_id(session_id)
            .with_peer_address(peer_address)
            .with_duration(started.elapsed().as_millis() as u64)
            .with_metadata("messages_received", statistics.messages_received.to_string())
            .with_metadata("messages_sent", statistics.messages_sent.to_string()),
    );
}

/// Wait out `interval` before polling again. False if shutdown fired first.
async fn pause(shutdown: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

fn audit<D: ?Sized>(context: &SessionContext<D>, event: AuditEvent) {
    if let Err(e) = context.audit.log_event(&event) {
        error!("Audit failure: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::JsonCommandDispatcher;
    use crate::handshake::{self, HandshakeContext};
    use crate::protocol;
    use tokio::io::AsyncReadExt;
    use crate::transport::Transport;

    struct Setup {
        client: LocalIdentity,
        client_trust: TrustStore,
        listener: Listener<JsonCommandDispatcher>,
    }

    async fn setup(admission_timeout: Duration) -> Setup {
        let client = LocalIdentity::generate("client-1").unwrap();
        let server = LocalIdentity::generate("server-1").unwrap();
        let mut client_trust = TrustStore::new();
        client_trust.add("server-1", server.public_key()).unwrap();
        let mut server_trust = TrustStore::new();
        server_trust.add("client-1", client.public_key()).unwrap();

        let settings = ListenerSettings {
            admission_timeout,
            ..ListenerSettings::default()
        };
        let listener = Listener::bind(
            "127.0.0.1:0",
            settings,
            Arc::new(server),
            Arc::new(server_trust),
            Arc::new(JsonCommandDispatcher::new()),
        )
        .await
        .unwrap();

        Setup {
            client,
            client_trust,
            listener,
        }
    }

    const BUDGET: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_pause_after_accept_error_waits_or_stops() {
        let token = CancellationToken::new();
        let started = Instant::now();
        assert!(pause(&token, Duration::from_millis(50)).await);
        assert!(started.elapsed() >= Duration::from_millis(50));

        token.cancel();
        let started = Instant::now();
        assert!(!pause(&token, Duration::from_secs(5)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_second_connection_refused_without_handshake() {
        let setup = setup(Duration::from_millis(100)).await;
        let address = setup.listener.local_addr().unwrap().to_string();
        let stats = setup.listener.stats();
        let token = setup.listener.shutdown_token();
        let server = tokio::spawn(setup.listener.run());

        // First client completes the handshake and stays connected
        let mut first = StreamTransport::connect(&address, BUDGET).await.unwrap();
        let ctx = HandshakeContext {
            identity: &setup.client,
            trust: &setup.client_trust,
            pinned_peer: Some("server-1"),
            budget: BUDGET,
        };
        handshake::run_initiator(&mut first, &ctx).await.unwrap();

        // Second connection gets closed with no data once the window elapses
        let mut second = TcpStream::connect(&address).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(BUDGET, second.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        assert_eq!(stats.accepted(), 1);
        assert_eq!(stats.rejected(), 1);
        assert_eq!(stats.handshakes_failed(), 0);

        drop(first);
        token.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_released_slot_admits_next_connection() {
        let setup = setup(Duration::from_secs(2)).await;
        let address = setup.listener.local_addr().unwrap().to_string();
        let stats = setup.listener.stats();
        let token = setup.listener.shutdown_token();
        let server = tokio::spawn(setup.listener.run());

        let ctx = HandshakeContext {
            identity: &setup.client,
            trust: &setup.client_trust,
            pinned_peer: None,
            budget: BUDGET,
        };

        let mut first = StreamTransport::connect(&address, BUDGET).await.unwrap();
        handshake::run_initiator(&mut first, &ctx).await.unwrap();

        // Connect while the first session still holds the slot, then free it
        let mut second = StreamTransport::connect(&address, BUDGET).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first);

        handshake::run_initiator(&mut second, &ctx).await.unwrap();
        assert_eq!(stats.accepted(), 2);
        assert_eq!(stats.rejected(), 0);

        drop(second);
        token.cancel();
        server.await.unwrap().unwrap();
        assert_eq!(stats.completed(), 2);
    }

    #[tokio::test]
    async fn test_failed_handshake_is_contained() {
        let setup = setup(Duration::from_millis(500)).await;
        let address = setup.listener.local_addr().unwrap().to_string();
        let stats = setup.listener.stats();
        let token = setup.listener.shutdown_token();
        let server = tokio::spawn(setup.listener.run());

        // Unknown client identity
        let stranger = LocalIdentity::generate("client-9").unwrap();
        let ctx = HandshakeContext {
            identity: &stranger,
            trust: &setup.client_trust,
            pinned_peer: None,
            budget: BUDGET,
        };
        let mut transport = StreamTransport::connect(&address, BUDGET).await.unwrap();
        let result = handshake::run_initiator(&mut transport, &ctx).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
        drop(transport);

        // Listener keeps serving afterwards
        let ctx = HandshakeContext {
            identity: &setup.client,
            trust: &setup.client_trust,
            pinned_peer: None,
            budget: BUDGET,
        };
        let mut transport = StreamTransport::connect(&address, BUDGET).await.unwrap();
        handshake::run_initiator(&mut transport, &ctx).await.unwrap();
        assert_eq!(stats.handshakes_failed(), 1);

        drop(transport);
        token.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_garbage_client_gets_generic_reject() {
        let setup = setup(Duration::from_millis(500)).await;
        let address = setup.listener.local_addr().unwrap().to_string();
        let token = setup.listener.shutdown_token();
        let server = tokio::spawn(setup.listener.run());

        let mut transport = StreamTransport::connect(&address, BUDGET).await.unwrap();
        let record = protocol::encode_record(&[0x7f, 1, 2, 3]).unwrap();
        transport.write_all(&record, BUDGET).await.unwrap();
        let reply = protocol::receive_message(&mut transport, BUDGET).await.unwrap();
        assert_eq!(reply, protocol::HandshakeMessage::Reject);

        drop(transport);
        token.cancel();
        server.await.unwrap().unwrap();
    }
}
