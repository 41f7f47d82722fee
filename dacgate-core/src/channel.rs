//! Framed ChaCha20-Poly1305 channel
//!
//! Wire layout of a frame: `[u16 BE length][ciphertext || tag]`. The length
//! prefix is authenticated as associated data and the nonce is the direction
//! IV XOR a 64-bit big-endian sequence number, so frames cannot be reordered,
//! replayed or truncated without detection.

use crate::crypto::{DirectionKeys, KeySet, IV_LEN};
use crate::error::{Error, Result};
use crate::protocol::{Role, LENGTH_PREFIX_LEN};
use crate::transport::Transport;
use crate::{MAX_FRAME_LEN, MAX_PLAINTEXT_LEN, TAG_LEN};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::time::Duration;
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

fn frame_nonce(iv: &[u8; IV_LEN], sequence: u64) -> [u8; IV_LEN] {
    let mut nonce = *iv;
    for (n, s) in nonce[IV_LEN - 8..].iter_mut().zip(sequence.to_be_bytes()) {
        *n ^= s;
    }
    nonce
}

/// One cipher instance per direction; the crate zeroizes its key copy on drop
fn direction_cipher(keys: &DirectionKeys) -> ChaCha20Poly1305 {
    let key = Zeroizing::new(keys.encryption);
    ChaCha20Poly1305::new(Key::from_slice(&key[..]))
}

/// Encrypts outgoing frames for one direction
pub struct FrameSealer {
    cipher: ChaCha20Poly1305,
    iv: [u8; IV_LEN],
    sequence: u64,
}

impl FrameSealer {
    pub fn new(keys: &DirectionKeys) -> Self {
        Self {
            cipher: direction_cipher(keys),
            iv: keys.iv,
            sequence: 0,
        }
    }

    /// Frames sealed so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Seal `plaintext` into a complete frame.
    ///
    /// Oversized input fails with `FrameTooLarge` before any work is done.
    pub fn encode_frame(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(Error::FrameTooLarge {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        if self.sequence == u64::MAX {
            return Err(Error::Protocol("Frame sequence exhausted".to_string()));
        }

        let header = ((plaintext.len() + TAG_LEN) as u16).to_be_bytes();
        let nonce = frame_nonce(&self.iv, self.sequence);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| Error::Protocol("Frame encryption failed".to_string()))?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + ciphertext.len());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&ciphertext);
        self.sequence += 1;
        Ok(frame)
    }
}

impl Drop for FrameSealer {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

/// Decrypts and verifies incoming frames for one direction
pub struct FrameOpener {
    cipher: ChaCha20Poly1305,
    iv: [u8; IV_LEN],
    sequence: u64,
}

impl FrameOpener {
    pub fn new(keys: &DirectionKeys) -> Self {
        Self {
            cipher: direction_cipher(keys),
            iv: keys.iv,
            sequence: 0,
        }
    }

    /// Frames opened so far
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Verify and decrypt one complete frame.
    ///
    /// Every failure (short input, length mismatch, tag mismatch) is reported
    /// as `AuthenticationFailed`. The sequence only advances on success.
    pub fn decode_frame(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < LENGTH_PREFIX_LEN + TAG_LEN
            || frame.len() > LENGTH_PREFIX_LEN + MAX_FRAME_LEN
        {
            return Err(Error::AuthenticationFailed);
        }
        let (header, body) = frame.split_at(LENGTH_PREFIX_LEN);
        let declared = u16::from_be_bytes([header[0], header[1]]) as usize;
        if declared != body.len() {
            return Err(Error::AuthenticationFailed);
        }

        let nonce = frame_nonce(&self.iv, self.sequence);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: body,
                    aad: header,
                },
            )
            .map_err(|_| Error::AuthenticationFailed)?;

        self.sequence += 1;
        Ok(plaintext)
    }
}

impl Drop for FrameOpener {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

/// Transport wrapped with the session's frame keys
pub struct SecureChannel<T> {
    transport: T,
    sealer: FrameSealer,
    opener: FrameOpener,
    release_buffer_on_auth_failure: bool,
}

impl<T: Transport> SecureChannel<T> {
    /// Bind `transport` to the keys `role` sends and receives with
    pub fn new(
        transport: T,
        keys: &KeySet,
        role: Role,
        release_buffer_on_auth_failure: bool,
    ) -> Self {
        Self {
            transport,
            sealer: FrameSealer::new(keys.outbound(role)),
            opener: FrameOpener::new(keys.inbound(role)),
            release_buffer_on_auth_failure,
        }
    }

    /// Encrypt and send one frame. Returns the number of bytes written.
    pub async fn send(&mut self, plaintext: &[u8], budget: Duration) -> Result<usize> {
        let frame = self.sealer.encode_frame(plaintext)?;
        self.transport.write_all(&frame, budget).await?;
        Ok(frame.len())
    }

    /// Receive, verify and decrypt one frame
    pub async fn recv(&mut self, budget: Duration) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; LENGTH_PREFIX_LEN];
        self.transport.read_exact(&mut frame, budget).await?;

        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        if declared < TAG_LEN {
            return Err(Error::AuthenticationFailed);
        }
        frame.resize(LENGTH_PREFIX_LEN + declared, 0);
        self.transport
            .read_exact(&mut frame[LENGTH_PREFIX_LEN..], budget)
            .await?;

        match self.opener.decode_frame(&frame) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                if self.release_buffer_on_auth_failure {
                    frame.zeroize();
                    debug!("Released receive buffer after authentication failure");
                }
                Err(err)
            }
        }
    }

    pub fn peer_address(&self) -> &str {
        self.transport.peer_address()
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.transport.shutdown().await
    }

    /// Drop the keys and hand back the transport
    pub fn into_transport(self) -> T {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_key_set;
    use crate::transport::StreamTransport;
    use async_trait::async_trait;

    fn pair() -> (FrameSealer, FrameOpener) {
        let (_, keys) = test_key_set();
        (
            FrameSealer::new(keys.outbound(Role::Initiator)),
            FrameOpener::new(keys.inbound(Role::Responder)),
        )
    }

    #[test]
    fn test_round_trip_boundary_lengths() {
        let (mut sealer, mut opener) = pair();
        for len in [0usize, 1, 1024, MAX_PLAINTEXT_LEN] {
            let plaintext: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = sealer.encode_frame(&plaintext).unwrap();
            assert_eq!(frame.len(), LENGTH_PREFIX_LEN + len + TAG_LEN);
            assert_eq!(opener.decode_frame(&frame).unwrap(), plaintext);
        }
        assert_eq!(sealer.sequence(), 4);
        assert_eq!(opener.sequence(), 4);
    }

    #[test]
    fn test_direction_cipher_zeroizes_on_drop() {
        fn assert_zeroize_on_drop<T: zeroize::ZeroizeOnDrop>() {}
        assert_zeroize_on_drop::<ChaCha20Poly1305>();
    }

    #[test]
    fn test_every_bit_flip_fails_authentication() {
        let (_, keys) = test_key_set();
        let mut sealer = FrameSealer::new(keys.outbound(Role::Initiator));
        let frame = sealer.encode_frame(br#"{"cmd":"ping"}"#).unwrap();

        for byte in 0..frame.len() {
            for bit in 0..8 {
                let mut opener = FrameOpener::new(keys.inbound(Role::Responder));
                let mut tampered = frame.clone();
                tampered[byte] ^= 1 << bit;
                assert!(matches!(
                    opener.decode_frame(&tampered),
                    Err(Error::AuthenticationFailed)
                ));
                assert_eq!(opener.sequence(), 0);
            }
        }
    }

    #[test]
    fn test_truncated_and_short_frames_fail_uniformly() {
        let (mut sealer, mut opener) = pair();
        let frame = sealer.encode_frame(b"hello").unwrap();
        assert!(matches!(
            opener.decode_frame(&frame[..frame.len() - 1]),
            Err(Error::AuthenticationFailed)
        ));
        assert!(matches!(opener.decode_frame(&[]), Err(Error::AuthenticationFailed)));
        assert!(matches!(opener.decode_frame(&[0, 0]), Err(Error::AuthenticationFailed)));
        assert_eq!(opener.decode_frame(&frame).unwrap(), b"hello");
    }

    #[test]
    fn test_oversized_plaintext_rejected() {
        let (mut sealer, _) = pair();
        let result = sealer.encode_frame(&vec![0u8; 70_000]);
        assert!(matches!(
            result,
            Err(Error::FrameTooLarge { len: 70_000, max: MAX_PLAINTEXT_LEN })
        ));
        assert!(matches!(
            sealer.encode_frame(&vec![0u8; MAX_PLAINTEXT_LEN + 1]),
            Err(Error::FrameTooLarge { .. })
        ));
        assert_eq!(sealer.sequence(), 0);
    }

    #[test]
    fn test_replay_and_reorder_rejected() {
        let (mut sealer, mut opener) = pair();
        let first = sealer.encode_frame(b"first").unwrap();
        let second = sealer.encode_frame(b"second").unwrap();

        assert!(matches!(opener.decode_frame(&second), Err(Error::AuthenticationFailed)));
        assert_eq!(opener.decode_frame(&first).unwrap(), b"first");
        assert!(matches!(opener.decode_frame(&first), Err(Error::AuthenticationFailed)));
        assert_eq!(opener.decode_frame(&second).unwrap(), b"second");
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let (_, keys) = test_key_set();
        let mut initiator_sealer = FrameSealer::new(keys.outbound(Role::Initiator));
        let mut initiator_opener = FrameOpener::new(keys.inbound(Role::Initiator));
        let frame = initiator_sealer.encode_frame(b"reflected").unwrap();
        assert!(matches!(
            initiator_opener.decode_frame(&frame),
            Err(Error::AuthenticationFailed)
        ));
    }

    /// Records every write without sending it anywhere
    struct RecordingTransport {
        written: Vec<u8>,
        writes: usize,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn read_exact(&mut self, _buf: &mut [u8], _budget: Duration) -> Result<()> {
            Err(Error::ConnectionClosed)
        }

        async fn write_all(&mut self, buf: &[u8], _budget: Duration) -> Result<()> {
            self.written.extend_from_slice(buf);
            self.writes += 1;
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Ok(())
        }

        fn peer_address(&self) -> &str {
            "recorder"
        }
    }

    #[tokio::test]
    async fn test_oversized_send_writes_nothing() {
        let (_, keys) = test_key_set();
        let transport = RecordingTransport {
            written: Vec::new(),
            writes: 0,
        };
        let mut channel = SecureChannel::new(transport, &keys, Role::Initiator, true);

        let result = channel.send(&vec![7u8; 70_000], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::FrameTooLarge { .. })));

        let transport = channel.into_transport();
        assert_eq!(transport.writes, 0);
        assert!(transport.written.is_empty());
    }

    #[tokio::test]
    async fn test_channel_exchange_over_one_byte_pipe() {
        let (_, keys) = test_key_set();
        let (a, b) = tokio::io::duplex(1);
        let client_transport = StreamTransport::new(a, "server");
        let server_transport = StreamTransport::new(b, "client");
        let mut client = SecureChannel::new(client_transport, &keys, Role::Initiator, true);
        let mut server = SecureChannel::new(server_transport, &keys, Role::Responder, true);
        let budget = Duration::from_secs(5);

        let sender = tokio::spawn(async move {
            client.send(br#"{"cmd":"ping"}"#, budget).await.unwrap();
            let reply = client.recv(budget).await.unwrap();
            (client, reply)
        });

        let request = server.recv(budget).await.unwrap();
        assert_eq!(request, br#"{"cmd":"ping"}"#);
        server.send(br#"{"cmd":"pong"}"#, budget).await.unwrap();

        let (_client, reply) = sender.await.unwrap();
        assert_eq!(reply, br#"{"cmd":"pong"}"#);
    }

    #[tokio::test]
    async fn test_recv_rejects_declared_length_below_tag() {
        let (_, keys) = test_key_set();
        let (a, b) = tokio::io::duplex(64);
        let mut raw = StreamTransport::new(a, "server");
        let server_transport = StreamTransport::new(b, "client");
        let mut server = SecureChannel::new(server_transport, &keys, Role::Responder, false);
        let budget = Duration::from_secs(1);

        raw.write_all(&[0x00, 0x03, 1, 2, 3], budget).await.unwrap();
        assert!(matches!(server.recv(budget).await, Err(Error::AuthenticationFailed)));
    }
}
