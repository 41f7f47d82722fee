//! Mutual-authentication handshake
//!
//! ```text
//! initiator                                   responder
//!   ClientHello(Vc, Qc)            -->
//!                                  <--  ServerHello(Vs, Qs, sig_s(H))
//!   ClientAuth(sig_c(H), confirm_c) -->
//!                                  <--  ServerFinished(confirm_s)
//! ```
//!
//! `H` is the transcript hash over both identifications, both ephemeral
//! public values and the shared secret. Every verification failure surfaces
//! as `Error::AuthenticationFailed` without saying which check failed.

use crate::crypto::{self, Identification, KeySet, TranscriptHash, PUBLIC_KEY_LEN};
use crate::error::{Error, Result};
use crate::identity::{self, LocalIdentity, TrustStore, IDENTITY_PUBLIC_KEY_LEN};
use crate::protocol::{
    self, ClientAuth, ClientHello, HandshakeMessage, Role, ServerFinished, ServerHello,
};
use crate::transport::Transport;
use std::time::Duration;
use tracing::{debug, trace};

/// Everything the handshake needs from the local side
pub struct HandshakeContext<'a> {
    pub identity: &'a LocalIdentity,
    pub trust: &'a TrustStore,
    /// Identification the peer must present, if pinned
    pub pinned_peer: Option<&'a str>,
    /// Budget for each individual read or write
    pub budget: Duration,
}

/// Result of a completed handshake
pub struct HandshakeOutcome {
    pub peer_identification: String,
    pub own_ephemeral: [u8; PUBLIC_KEY_LEN],
    pub peer_ephemeral: [u8; PUBLIC_KEY_LEN],
    pub transcript_hash: TranscriptHash,
    pub keys: KeySet,
}

impl std::fmt::Debug for HandshakeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeOutcome")
            .field("peer_identification", &self.peer_identification)
            .field("transcript_hash", &self.transcript_hash)
            .finish_non_exhaustive()
    }
}

impl<'a> HandshakeContext<'a> {
    /// Resolve the peer's identity key, applying the pin first
    fn authorize_peer(&self, identification: &str) -> Result<[u8; IDENTITY_PUBLIC_KEY_LEN]> {
        if identity::validate_identification(identification).is_err() {
            return Err(Error::Protocol("Malformed peer identification".to_string()));
        }
        if let Some(pinned) = self.pinned_peer {
            if pinned != identification {
                debug!("Peer identification does not match pin");
                return Err(Error::AuthenticationFailed);
            }
        }
        self.trust.get(identification).copied().ok_or_else(|| {
            debug!("Peer identification not in trust store");
            Error::AuthenticationFailed
        })
    }
}

async fn expect_message<T: Transport + ?Sized>(
    transport: &mut T,
    budget: Duration,
) -> Result<HandshakeMessage> {
    match protocol::receive_message(transport, budget).await? {
        HandshakeMessage::Reject => Err(Error::AuthenticationFailed),
        message => Ok(message),
    }
}

fn unexpected(expected: &str, got: &HandshakeMessage) -> Error {
    Error::Protocol(format!("Expected {}, got {:?}", expected, got.message_type()))
}

/// Run the handshake as the connecting side
pub async fn run_initiator<T: Transport + ?Sized>(
    transport: &mut T,
    ctx: &HandshakeContext<'_>,
) -> Result<HandshakeOutcome> {
    let ephemeral = crypto::generate_keypair()?;
    let own_ephemeral = *ephemeral.public_key();
    let own_identification = ctx.identity.identification();

    let hello = HandshakeMessage::ClientHello(ClientHello {
        identification: own_identification.to_string(),
        ephemeral_public: own_ephemeral,
    });
    protocol::send_message(transport, &hello, ctx.budget).await?;
    trace!("Sent ClientHello");

    let server_hello = match expect_message(transport, ctx.budget).await? {
        HandshakeMessage::ServerHello(hello) => hello,
        other => return Err(unexpected("ServerHello", &other)),
    };
    let server_key = ctx.authorize_peer(&server_hello.identification)?;

    let secret = crypto::compute_shared_secret(ephemeral, &server_hello.ephemeral_public)?;
    let names = Identification {
        client: own_identification,
        server: &server_hello.identification,
    };
    let (transcript_hash, keys) = crypto::derive_session_materials(
        Role::Initiator,
        &names,
        &own_ephemeral,
        &server_hello.ephemeral_public,
        &secret,
    );
    drop(secret);

    if !identity::verify_transcript(
        &server_key,
        Role::Responder,
        &transcript_hash,
        &server_hello.signature,
    ) {
        debug!("Responder transcript signature rejected");
        return Err(Error::AuthenticationFailed);
    }

    let auth = HandshakeMessage::ClientAuth(ClientAuth {
        signature: ctx.identity.sign_transcript(Role::Initiator, &transcript_hash).to_vec(),
        confirmation: keys.confirmation(Role::Initiator, &transcript_hash),
    });
    protocol::send_message(transport, &auth, ctx.budget).await?;
    trace!("Sent ClientAuth");

    let finished = match expect_message(transport, ctx.budget).await? {
        HandshakeMessage::ServerFinished(finished) => finished,
        other => return Err(unexpected("ServerFinished", &other)),
    };
    if !keys.verify_confirmation(Role::Responder, &transcript_hash, &finished.confirmation) {
        debug!("Responder key confirmation rejected");
        return Err(Error::AuthenticationFailed);
    }

    Ok(HandshakeOutcome {
        peer_identification: server_hello.identification,
        own_ephemeral,
        peer_ephemeral: server_hello.ephemeral_public,
        transcript_hash,
        keys,
    })
}

/// Run the handshake as the accepting side
pub async fn run_responder<T: Transport + ?Sized>(
    transport: &mut T,
    ctx: &HandshakeContext<'_>,
) -> Result<HandshakeOutcome> {
    let client_hello = match expect_message(transport, ctx.budget).await? {
        HandshakeMessage::ClientHello(hello) => hello,
        other => return Err(unexpected("ClientHello", &other)),
    };
    let client_key = ctx.authorize_peer(&client_hello.identification)?;
    trace!("Received ClientHello");

    let ephemeral = crypto::generate_keypair()?;
    let own_ephemeral = *ephemeral.public_key();
    let secret = crypto::compute_shared_secret(ephemeral, &client_hello.ephemeral_public)?;
    let names = Identification {
        client: &client_hello.identification,
        server: ctx.identity.identification(),
    };
    let (transcript_hash, keys) = crypto::derive_session_materials(
        Role::Responder,
        &names,
        &own_ephemeral,
        &client_hello.ephemeral_public,
        &secret,
    );
    drop(secret);

    let hello = HandshakeMessage::ServerHello(ServerHello {
        identification: ctx.identity.identification().to_string(),
        ephemeral_public: own_ephemeral,
        signature: ctx.identity.sign_transcript(Role::Responder, &transcript_hash).to_vec(),
    });
    protocol::send_message(transport, &hello, ctx.budget).await?;
    trace!("Sent ServerHello");

    let auth = match expect_message(transport, ctx.budget).await? {
        HandshakeMessage::ClientAuth(auth) => auth,
        other => return Err(unexpected("ClientAuth", &other)),
    };
    let signature_ok = identity::verify_transcript(
        &client_key,
        Role::Initiator,
        &transcript_hash,
        &auth.signature,
    );
    let confirmation_ok =
        keys.verify_confirmation(Role::Initiator, &transcript_hash, &auth.confirmation);
    if !(signature_ok & confirmation_ok) {
        debug!("Initiator authentication rejected");
        return Err(Error::AuthenticationFailed);
    }

    let finished = HandshakeMessage::ServerFinished(ServerFinished {
        confirmation: keys.confirmation(Role::Responder, &transcript_hash),
    });
    protocol::send_message(transport, &finished, ctx.budget).await?;
    trace!("Sent ServerFinished");

    Ok(HandshakeOutcome {
        peer_identification: client_hello.identification,
        own_ephemeral,
        peer_ephemeral: client_hello.ephemeral_public,
        transcript_hash,
        keys,
    })
}

/// Send a generic rejection; failures are ignored
pub async fn send_reject<T: Transport + ?Sized>(transport: &mut T, budget: Duration) {
    if let Err(e) = protocol::send_message(transport, &HandshakeMessage::Reject, budget).await {
        trace!("Reject not delivered: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPurpose;
    use crate::transport::StreamTransport;

    struct Peers {
        client: LocalIdentity,
        server: LocalIdentity,
        client_trust: TrustStore,
        server_trust: TrustStore,
    }

    fn peers() -> Peers {
        let client = LocalIdentity::generate("client-1").unwrap();
        let server = LocalIdentity::generate("server-1").unwrap();
        let mut client_trust = TrustStore::new();
        client_trust.add("server-1", server.public_key()).unwrap();
        let mut server_trust = TrustStore::new();
        server_trust.add("client-1", client.public_key()).unwrap();
        Peers {
            client,
            server,
            client_trust,
            server_trust,
        }
    }

    const BUDGET: Duration = Duration::from_secs(5);

    async fn run_pair(
        peers: &Peers,
        client_pin: Option<&str>,
    ) -> (Result<HandshakeOutcome>, Result<HandshakeOutcome>) {
        let (a, b) = tokio::io::duplex(4096);
        let mut client_transport = StreamTransport::new(a, "server");
        let mut server_transport = StreamTransport::new(b, "client");

        let client_ctx = HandshakeContext {
            identity: &peers.client,
            trust: &peers.client_trust,
            pinned_peer: client_pin,
            budget: BUDGET,
        };
        let server_ctx = HandshakeContext {
            identity: &peers.server,
            trust: &peers.server_trust,
            pinned_peer: None,
            budget: BUDGET,
        };

        let client = async {
            let result = run_initiator(&mut client_transport, &client_ctx).await;
            drop(client_transport);
            result
        };
        let server = async {
            let result = run_responder(&mut server_transport, &server_ctx).await;
            drop(server_transport);
            result
        };
        tokio::join!(client, server)
    }

    #[tokio::test]
    async fn test_handshake_agrees_on_transcript_and_keys() {
        let peers = peers();
        let (client, server) = run_pair(&peers, Some("server-1")).await;
        let client = client.unwrap();
        let server = server.unwrap();

        assert_eq!(client.peer_identification, "server-1");
        assert_eq!(server.peer_identification, "client-1");
        assert_eq!(client.transcript_hash, server.transcript_hash);
        assert_eq!(client.own_ephemeral, server.peer_ephemeral);
        for purpose in KeyPurpose::ALL {
            assert_eq!(client.keys.material(purpose), server.keys.material(purpose));
        }
    }

    #[tokio::test]
    async fn test_pin_mismatch_fails() {
        let peers = peers();
        let (client, server) = run_pair(&peers, Some("server-2")).await;
        assert!(matches!(client, Err(Error::AuthenticationFailed)));
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_unknown_client_rejected() {
        let mut peers = peers();
        peers.server_trust = TrustStore::new();
        let (client, server) = run_pair(&peers, None).await;
        assert!(matches!(server, Err(Error::AuthenticationFailed)));
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_wrong_server_key_rejected() {
        let mut peers = peers();
        let impostor = LocalIdentity::generate("server-1").unwrap();
        peers.client_trust = TrustStore::new();
        peers.client_trust.add("server-1", impostor.public_key()).unwrap();

        let (client, server) = run_pair(&peers, None).await;
        assert!(matches!(client, Err(Error::AuthenticationFailed)));
        assert!(server.is_err());
    }

    #[tokio::test]
    async fn test_reject_is_reported_as_authentication_failure() {
        let peers = peers();
        let (a, b) = tokio::io::duplex(4096);
        let mut client_transport = StreamTransport::new(a, "server");
        let mut server_transport = StreamTransport::new(b, "client");

        let ctx = HandshakeContext {
            identity: &peers.client,
            trust: &peers.client_trust,
            pinned_peer: None,
            budget: BUDGET,
        };
        let server = async {
            let _ = protocol::receive_message(&mut server_transport, BUDGET).await.unwrap();
            send_reject(&mut server_transport, BUDGET).await;
        };
        let (result, _) = tokio::join!(run_initiator(&mut client_transport, &ctx), server);
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_out_of_order_message_is_protocol_error() {
        let peers = peers();
        let (a, b) = tokio::io::duplex(4096);
        let mut client_transport = StreamTransport::new(a, "server");
        let mut server_transport = StreamTransport::new(b, "client");

        let ctx = HandshakeContext {
            identity: &peers.server,
            trust: &peers.server_trust,
            pinned_peer: None,
            budget: BUDGET,
        };
        let finished = HandshakeMessage::ServerFinished(ServerFinished { confirmation: [0u8; 32] });
        protocol::send_message(&mut client_transport, &finished, BUDGET).await.unwrap();

        let result = run_responder(&mut server_transport, &ctx).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_small_order_ephemeral_rejected() {
        let peers = peers();
        let (a, b) = tokio::io::duplex(4096);
        let mut client_transport = StreamTransport::new(a, "server");
        let mut server_transport = StreamTransport::new(b, "client");

        let ctx = HandshakeContext {
            identity: &peers.server,
            trust: &peers.server_trust,
            pinned_peer: None,
            budget: BUDGET,
        };
        let hello = HandshakeMessage::ClientHello(ClientHello {
            identification: "client-1".to_string(),
            ephemeral_public: [0u8; 32],
        });
        protocol::send_message(&mut client_transport, &hello, BUDGET).await.unwrap();

        let result = run_responder(&mut server_transport, &ctx).await;
        assert!(matches!(result, Err(Error::InvalidPeerKey)));
    }
}
