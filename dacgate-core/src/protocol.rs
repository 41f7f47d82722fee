//! dacgate handshake wire format
//!
//! Before the session keys exist, peers exchange plain records:
//! a 2-byte big-endian length followed by a body of
//! `[message type (1 byte)][postcard payload]`. The same length prefix
//! carries encrypted frames once the channel is up.

use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::MAX_HANDSHAKE_RECORD_LEN;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length prefix size shared by handshake records and frames
pub const LENGTH_PREFIX_LEN: usize = 2;

/// Which end of the connection a session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Connecting side (client)
    Initiator,
    /// Accepting side (gateway)
    Responder,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

/// Handshake message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client identification and ephemeral key
    ClientHello = 0x01,
    /// Server identification, ephemeral key and transcript signature
    ServerHello = 0x02,
    /// Client transcript signature and key confirmation
    ClientAuth = 0x03,
    /// Server key confirmation
    ServerFinished = 0x04,
    /// Generic rejection, carries nothing
    Reject = 0x05,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(MessageType::ClientHello),
            0x02 => Ok(MessageType::ServerHello),
            0x03 => Ok(MessageType::ClientAuth),
            0x04 => Ok(MessageType::ServerFinished),
            0x05 => Ok(MessageType::Reject),
            _ => Err(Error::Protocol(format!("Unknown message type: 0x{:02x}", value))),
        }
    }
}

/// ClientHello payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHello {
    /// Client identification string
    pub identification: String,
    /// Client ephemeral X25519 public value
    pub ephemeral_public: [u8; 32],
}

/// ServerHello payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Server identification string
    pub identification: String,
    /// Server ephemeral X25519 public value
    pub ephemeral_public: [u8; 32],
    /// Server identity signature over the transcript hash
    pub signature: Vec<u8>,
}

/// ClientAuth payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuth {
    /// Client identity signature over the transcript hash
    pub signature: Vec<u8>,
    /// Keyed hash proving possession of the client-to-server integrity key
    pub confirmation: [u8; 32],
}

/// ServerFinished payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFinished {
    /// Keyed hash proving possession of the server-to-client integrity key
    pub confirmation: [u8; 32],
}

/// A decoded handshake record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeMessage {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    ClientAuth(ClientAuth),
    ServerFinished(ServerFinished),
    Reject,
}

impl HandshakeMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            HandshakeMessage::ClientHello(_) => MessageType::ClientHello,
            HandshakeMessage::ServerHello(_) => MessageType::ServerHello,
            HandshakeMessage::ClientAuth(_) => MessageType::ClientAuth,
            HandshakeMessage::ServerFinished(_) => MessageType::ServerFinished,
            HandshakeMessage::Reject => MessageType::Reject,
        }
    }

    /// Serialize to a record body (without length prefix)
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = vec![self.message_type() as u8];
        let payload = match self {
            HandshakeMessage::ClientHello(p) => postcard::to_allocvec(p)?,
            HandshakeMessage::ServerHello(p) => postcard::to_allocvec(p)?,
            HandshakeMessage::ClientAuth(p) => postcard::to_allocvec(p)?,
            HandshakeMessage::ServerFinished(p) => postcard::to_allocvec(p)?,
            HandshakeMessage::Reject => Vec::new(),
        };
        body.extend_from_slice(&payload);
        Ok(body)
    }

    /// Parse a record body. Trailing bytes are a protocol error.
    pub fn decode(body: &[u8]) -> Result<Self> {
        let (&type_byte, payload) = body
            .split_first()
            .ok_or_else(|| Error::Protocol("Empty handshake record".to_string()))?;

        let message = match MessageType::try_from(type_byte)? {
            MessageType::ClientHello => HandshakeMessage::ClientHello(decode_exact(payload)?),
            MessageType::ServerHello => HandshakeMessage::ServerHello(decode_exact(payload)?),
            MessageType::ClientAuth => HandshakeMessage::ClientAuth(decode_exact(payload)?),
            MessageType::ServerFinished => {
                HandshakeMessage::ServerFinished(decode_exact(payload)?)
            }
            MessageType::Reject => {
                if !payload.is_empty() {
                    return Err(Error::Protocol("Reject carries no payload".to_string()));
                }
                HandshakeMessage::Reject
            }
        };
        Ok(message)
    }
}

fn decode_exact<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    let (value, rest) = postcard::take_from_bytes(payload)?;
    if !rest.is_empty() {
        return Err(Error::Protocol(format!(
            "{} trailing bytes after handshake payload",
            rest.len()
        )));
    }
    Ok(value)
}

/// Prefix `body` with its 2-byte big-endian length
pub fn encode_record(body: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(body.len()).map_err(|_| Error::FrameTooLarge {
        len: body.len(),
        max: u16::MAX as usize,
    })?;
    let mut record = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    record.extend_from_slice(&len.to_be_bytes());
    record.extend_from_slice(body);
    Ok(record)
}

/// Write one handshake message as a single length-prefixed record
pub async fn send_message<T: Transport + ?Sized>(
    transport: &mut T,
    message: &HandshakeMessage,
    budget: Duration,
) -> Result<()> {
    let body = message.encode()?;
    if body.len() > MAX_HANDSHAKE_RECORD_LEN {
        return Err(Error::FrameTooLarge {
            len: body.len(),
            max: MAX_HANDSHAKE_RECORD_LEN,
        });
    }
    let record = encode_record(&body)?;
    transport.write_all(&record, budget).await
}

/// Read and decode one handshake record.
///
/// The declared length is checked against the handshake ceiling before any
/// buffer is allocated.
pub async fn receive_message<T: Transport + ?Sized>(
    transport: &mut T,
    budget: Duration,
) -> Result<HandshakeMessage> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    transport.read_exact(&mut prefix, budget).await?;

    let len = u16::from_be_bytes(prefix) as usize;
    if len == 0 || len > MAX_HANDSHAKE_RECORD_LEN {
        return Err(Error::Protocol(format!("Handshake record length {} out of range", len)));
    }

    let mut body = vec![0u8; len];
    transport.read_exact(&mut body, budget).await?;
    HandshakeMessage::decode(&body)
}
