//! Key exchange and key schedule for dacgate sessions
//!
//! Ephemeral X25519 agreement, the BLAKE3 transcript hash that
//! identifies a session, and the per-direction key set derived from it.
//!
//! Every derived value is `BLAKE3-XOF(discriminator || K || H)`, read out to
//! the length its purpose needs. Discriminators follow the classic
//! `'A'..='F'` assignment: IVs, then encryption keys, then integrity keys,
//! client-to-server before server-to-client.

use crate::error::{Error, Result};
use crate::protocol::Role;
use ring::rand::{SecureRandom, SystemRandom};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, Zeroizing};

/// X25519 public value length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Shared secret length
pub const SHARED_SECRET_LEN: usize = 32;

/// Transcript hash length (BLAKE3 default output)
pub const TRANSCRIPT_HASH_LEN: usize = 32;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const IV_LEN: usize = 12;

/// Integrity (key confirmation) key length
pub const INTEGRITY_KEY_LEN: usize = 32;

const TRANSCRIPT_LABEL: &[u8] = b"dacgate session transcript";
const INITIATOR_CONFIRM_LABEL: &[u8] = b"dacgate initiator finished";
const RESPONDER_CONFIRM_LABEL: &[u8] = b"dacgate responder finished";

/// X25519 u-coordinates of small order (and their non-canonical aliases).
/// Any of these forces the shared secret into a tiny subgroup.
const SMALL_ORDER_POINTS: [[u8; PUBLIC_KEY_LEN]; 7] = [
    [0u8; 32],
    [
        1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        0, 0, 0,
    ],
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f, 0xc4,
        0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16, 0x5f, 0x49,
        0xb8, 0x00,
    ],
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83, 0xef,
        0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd, 0xd0, 0x9f,
        0x11, 0x57,
    ],
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0x7f,
    ],
];

/// Purpose of a derived key. The discriminator byte of each variant is unique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyPurpose {
    /// Client-to-server nonce base
    ClientToServerIv = b'A',
    /// Server-to-client nonce base
    ServerToClientIv = b'B',
    /// Client-to-server encryption key
    ClientToServerEncryption = b'C',
    /// Server-to-client encryption key
    ServerToClientEncryption = b'D',
    /// Client-to-server integrity key
    ClientToServerIntegrity = b'E',
    /// Server-to-client integrity key
    ServerToClientIntegrity = b'F',
}

impl KeyPurpose {
    /// All purposes in derivation order
    pub const ALL: [KeyPurpose; 6] = [
        KeyPurpose::ClientToServerIv,
        KeyPurpose::ServerToClientIv,
        KeyPurpose::ClientToServerEncryption,
        KeyPurpose::ServerToClientEncryption,
        KeyPurpose::ClientToServerIntegrity,
        KeyPurpose::ServerToClientIntegrity,
    ];

    /// Single-character discriminator fed into the derivation hash
    pub fn discriminator(self) -> u8 {
        self as u8
    }

    /// Output length required by the purpose
    pub fn output_len(self) -> usize {
        match self {
            KeyPurpose::ClientToServerIv | KeyPurpose::ServerToClientIv => IV_LEN,
            KeyPurpose::ClientToServerEncryption | KeyPurpose::ServerToClientEncryption => KEY_LEN,
            KeyPurpose::ClientToServerIntegrity | KeyPurpose::ServerToClientIntegrity => {
                INTEGRITY_KEY_LEN
            }
        }
    }
}

/// Ephemeral X25519 key pair, usable for exactly one agreement
pub struct EphemeralKeyPair {
    private_key: StaticSecret,
    public_key: [u8; PUBLIC_KEY_LEN],
}

impl EphemeralKeyPair {
    /// Public value sent to the peer
    pub fn public_key(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public_key
    }
}

impl std::fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

/// Diffie-Hellman shared secret, zeroed on drop
pub struct SharedSecret(Zeroizing<[u8; SHARED_SECRET_LEN]>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Session identifier: hash of the ordered handshake transcript
#[derive(Clone, Copy)]
pub struct TranscriptHash([u8; TRANSCRIPT_HASH_LEN]);

impl TranscriptHash {
    pub fn as_bytes(&self) -> &[u8; TRANSCRIPT_HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for TranscriptHash {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for TranscriptHash {}

impl std::fmt::Debug for TranscriptHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TranscriptHash({})", self.to_hex())
    }
}

/// Identification strings of both peers, in transcript order
#[derive(Debug, Clone, Copy)]
pub struct Identification<'a> {
    pub client: &'a str,
    pub server: &'a str,
}

/// Key material for one direction of traffic
pub struct DirectionKeys {
    pub(crate) iv: [u8; IV_LEN],
    pub(crate) encryption: [u8; KEY_LEN],
    pub(crate) integrity: [u8; INTEGRITY_KEY_LEN],
}

impl DirectionKeys {
    fn derive(
        iv: KeyPurpose,
        encryption: KeyPurpose,
        integrity: KeyPurpose,
        secret: &SharedSecret,
        hash: &TranscriptHash,
    ) -> Self {
        let mut keys = Self {
            iv: [0u8; IV_LEN],
            encryption: [0u8; KEY_LEN],
            integrity: [0u8; INTEGRITY_KEY_LEN],
        };
        expand_key(iv, secret, hash, &mut keys.iv);
        expand_key(encryption, secret, hash, &mut keys.encryption);
        expand_key(integrity, secret, hash, &mut keys.integrity);
        keys
    }
}

impl Drop for DirectionKeys {
    fn drop(&mut self) {
        self.iv.zeroize();
        self.encryption.zeroize();
        self.integrity.zeroize();
    }
}

/// Purpose-separated keys for both directions of a session
pub struct KeySet {
    client_to_server: DirectionKeys,
    server_to_client: DirectionKeys,
}

impl KeySet {
    /// Derive every key of the set from the shared secret and transcript hash
    pub fn derive(secret: &SharedSecret, hash: &TranscriptHash) -> Self {
        Self {
            client_to_server: DirectionKeys::derive(
                KeyPurpose::ClientToServerIv,
                KeyPurpose::ClientToServerEncryption,
                KeyPurpose::ClientToServerIntegrity,
                secret,
                hash,
            ),
            server_to_client: DirectionKeys::derive(
                KeyPurpose::ServerToClientIv,
                KeyPurpose::ServerToClientEncryption,
                KeyPurpose::ServerToClientIntegrity,
                secret,
                hash,
            ),
        }
    }

    /// Keys protecting traffic sent by `role`
    pub fn outbound(&self, role: Role) -> &DirectionKeys {
        match role {
            Role::Initiator => &self.client_to_server,
            Role::Responder => &self.server_to_client,
        }
    }

    /// Keys protecting traffic received by `role`
    pub fn inbound(&self, role: Role) -> &DirectionKeys {
        self.outbound(role.peer())
    }

    /// Raw bytes of one purpose, mostly useful for inspection and tests
    pub fn material(&self, purpose: KeyPurpose) -> &[u8] {
        match purpose {
            KeyPurpose::ClientToServerIv => &self.client_to_server.iv,
            KeyPurpose::ServerToClientIv => &self.server_to_client.iv,
            KeyPurpose::ClientToServerEncryption => &self.client_to_server.encryption,
            KeyPurpose::ServerToClientEncryption => &self.server_to_client.encryption,
            KeyPurpose::ClientToServerIntegrity => &self.client_to_server.integrity,
            KeyPurpose::ServerToClientIntegrity => &self.server_to_client.integrity,
        }
    }

    /// Key confirmation value `role` sends at the end of the handshake
    pub fn confirmation(&self, role: Role, hash: &TranscriptHash) -> [u8; 32] {
        let label = match role {
            Role::Initiator => INITIATOR_CONFIRM_LABEL,
            Role::Responder => RESPONDER_CONFIRM_LABEL,
        };
        let mut hasher = blake3::Hasher::new_keyed(&self.outbound(role).integrity);
        hasher.update(label);
        hasher.update(hash.as_bytes());
        *hasher.finalize().as_bytes()
    }

    /// Constant-time check of a confirmation value received from `role`
    pub fn verify_confirmation(&self, role: Role, hash: &TranscriptHash, received: &[u8]) -> bool {
        let expected = self.confirmation(role, hash);
        received.len() == expected.len() && bool::from(expected[..].ct_eq(received))
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeySet(..)")
    }
}

/// Generate a fresh ephemeral key pair from the system CSPRNG
pub fn generate_keypair() -> Result<EphemeralKeyPair> {
    let rng = SystemRandom::new();
    let mut seed = Zeroizing::new([0u8; 32]);
    rng.fill(&mut seed[..])
        .map_err(|_| Error::KeyGen("system random source unavailable".to_string()))?;

    let private_key = StaticSecret::from(*seed);
    let public_key = PublicKey::from(&private_key).to_bytes();

    Ok(EphemeralKeyPair {
        private_key,
        public_key,
    })
}

/// Agree on a shared secret with the peer's public value.
///
/// Consumes the key pair. Wrong-length, non-canonical and small-order peer
/// values are rejected before the agreement runs, and an all-zero result is
/// rejected after it.
pub fn compute_shared_secret(own: EphemeralKeyPair, peer_public: &[u8]) -> Result<SharedSecret> {
    let peer: [u8; PUBLIC_KEY_LEN] = peer_public.try_into().map_err(|_| Error::InvalidPeerKey)?;
    validate_peer_public(&peer)?;

    let shared = own.private_key.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(Error::InvalidPeerKey);
    }
    let secret = Zeroizing::new(*shared.as_bytes());

    if bool::from(secret[..].ct_eq(&[0u8; SHARED_SECRET_LEN][..])) {
        return Err(Error::InvalidPeerKey);
    }

    Ok(SharedSecret(secret))
}

/// Hash the ordered transcript and derive the session key set.
///
/// `own_public` and `peer_public` are placed in client/server order according
/// to `role`, so both ends produce identical output.
pub fn derive_session_materials(
    role: Role,
    identification: &Identification<'_>,
    own_public: &[u8; PUBLIC_KEY_LEN],
    peer_public: &[u8; PUBLIC_KEY_LEN],
    secret: &SharedSecret,
) -> (TranscriptHash, KeySet) {
    let (client_public, server_public) = match role {
        Role::Initiator => (own_public, peer_public),
        Role::Responder => (peer_public, own_public),
    };

    let hash = transcript_hash(identification, client_public, server_public, secret);
    let keys = KeySet::derive(secret, &hash);
    (hash, keys)
}

/// BLAKE3 over the length-prefixed transcript fields
pub fn transcript_hash(
    identification: &Identification<'_>,
    client_public: &[u8; PUBLIC_KEY_LEN],
    server_public: &[u8; PUBLIC_KEY_LEN],
    secret: &SharedSecret,
) -> TranscriptHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(TRANSCRIPT_LABEL);
    for field in [
        identification.client.as_bytes(),
        identification.server.as_bytes(),
        &client_public[..],
        &server_public[..],
        &secret.as_bytes()[..],
    ] {
        hasher.update(&(field.len() as u32).to_be_bytes());
        hasher.update(field);
    }
    TranscriptHash(*hasher.finalize().as_bytes())
}

fn expand_key(purpose: KeyPurpose, secret: &SharedSecret, hash: &TranscriptHash, out: &mut [u8]) {
    debug_assert_eq!(out.len(), purpose.output_len());
    let mut hasher = blake3::Hasher::new();
    hasher.update(&[purpose.discriminator()]);
    hasher.update(secret.as_bytes());
    hasher.update(hash.as_bytes());
    hasher.finalize_xof().fill(out);
}

fn validate_peer_public(peer: &[u8; PUBLIC_KEY_LEN]) -> Result<()> {
    if !is_canonical_field_element(peer) {
        return Err(Error::InvalidPeerKey);
    }

    let mut masked = *peer;
    masked[31] &= 0x7f;
    let small_order = SMALL_ORDER_POINTS
        .iter()
        .fold(subtle::Choice::from(0), |acc, point| acc | masked[..].ct_eq(&point[..]));
    if bool::from(small_order) {
        return Err(Error::InvalidPeerKey);
    }
    Ok(())
}

/// Whether a little-endian curve25519 field encoding (top bit ignored) is
/// below p = 2^255 - 19
pub(crate) fn is_canonical_field_element(bytes: &[u8; 32]) -> bool {
    let top = bytes[31] & 0x7f;
    if top != 0x7f {
        return true;
    }
    if bytes[1..31].iter().any(|b| *b != 0xff) {
        return true;
    }
    bytes[0] < 0xed
}

#[cfg(test)]
pub(crate) fn test_key_set() -> (TranscriptHash, KeySet) {
    let client = generate_keypair().unwrap();
    let server = generate_keypair().unwrap();
    let client_public = *client.public_key();
    let server_public = *server.public_key();
    let secret = compute_shared_secret(client, &server_public).unwrap();
    let names = Identification {
        client: "client-1",
        server: "server-1",
    };
    derive_session_materials(Role::Initiator, &names, &client_public, &server_public, &secret)
}
