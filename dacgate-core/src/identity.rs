//! Long-lived identities and transcript signatures
//!
//! Each gateway and client owns an Ed25519 identity key. During the handshake
//! each side signs the transcript hash with it, which binds the ephemeral
//! exchange to an identity the peer already trusts.

use crate::crypto::{is_canonical_field_element, TranscriptHash};
use crate::error::{Error, Result};
use crate::protocol::Role;
use crate::MAX_IDENTIFICATION_LEN;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::path::Path;
use zeroize::Zeroizing;

/// Ed25519 public key length
pub const IDENTITY_PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 seed length
pub const IDENTITY_SEED_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

const INITIATOR_SIGNATURE_CONTEXT: &[u8] = b"dacgate initiator transcript signature";
const RESPONDER_SIGNATURE_CONTEXT: &[u8] = b"dacgate responder transcript signature";

/// Local identity: identification string plus Ed25519 signing key
pub struct LocalIdentity {
    identification: String,
    signing_key: SigningKey,
}

impl LocalIdentity {
    /// Create a fresh identity from the system CSPRNG
    pub fn generate(identification: impl Into<String>) -> Result<Self> {
        let rng = SystemRandom::new();
        let mut seed = Zeroizing::new([0u8; IDENTITY_SEED_LEN]);
        rng.fill(&mut seed[..])
            .map_err(|_| Error::KeyGen("system random source unavailable".to_string()))?;
        Self::from_seed(identification, &seed)
    }

    pub fn from_seed(
        identification: impl Into<String>,
        seed: &[u8; IDENTITY_SEED_LEN],
    ) -> Result<Self> {
        let identification = identification.into();
        validate_identification(&identification)?;
        Ok(Self {
            identification,
            signing_key: SigningKey::from_bytes(seed),
        })
    }

    /// Parse a hex-encoded seed
    pub fn from_seed_hex(identification: impl Into<String>, seed_hex: &str) -> Result<Self> {
        let bytes = Zeroizing::new(hex::decode(seed_hex.trim())?);
        if bytes.len() != IDENTITY_SEED_LEN {
            return Err(Error::Identity(format!("Seed must be {} bytes", IDENTITY_SEED_LEN)));
        }
        let mut seed = Zeroizing::new([0u8; IDENTITY_SEED_LEN]);
        seed.copy_from_slice(&bytes);
        Self::from_seed(identification, &seed)
    }

    /// Load a hex seed file
    pub fn load(identification: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|e| {
            Error::Identity(format!("Failed to read key file {}: {}", path.display(), e))
        })?);
        Self::from_seed_hex(identification, &contents)
    }

    /// Write the seed as hex. On Unix the file is created with mode 0600.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        use std::io::Write;

        let path = path.as_ref();
        let encoded = Zeroizing::new(hex::encode(self.signing_key.to_bytes()));

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path).map_err(|e| {
            Error::Identity(format!("Failed to create key file {}: {}", path.display(), e))
        })?;
        // `mode` only applies on creation; tighten an existing file too
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn identification(&self) -> &str {
        &self.identification
    }

    pub fn public_key(&self) -> [u8; IDENTITY_PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key())
    }

    /// Sign the transcript hash as `signer`
    pub fn sign_transcript(&self, signer: Role, hash: &TranscriptHash) -> [u8; SIGNATURE_LEN] {
        let message = signed_message(signer, hash);
        self.signing_key.sign(&message).to_bytes()
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("identification", &self.identification)
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Verify a transcript signature produced by `signer`.
///
/// Returns `false` for any malformed key or signature, a non-canonical or
/// small-order public key, or a signature mismatch. Never panics.
pub fn verify_transcript(
    peer_public_key: &[u8],
    signer: Role,
    hash: &TranscriptHash,
    signature: &[u8],
) -> bool {
    let Some(key) = parse_identity_key(peer_public_key) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    let message = signed_message(signer, hash);
    key.verify_strict(&message, &signature).is_ok()
}

/// Decode an Ed25519 public key, enforcing canonical y, on-curve and
/// non-small-order
fn parse_identity_key(bytes: &[u8]) -> Option<VerifyingKey> {
    let bytes: [u8; IDENTITY_PUBLIC_KEY_LEN] = bytes.try_into().ok()?;
    if !is_canonical_field_element(&bytes) {
        return None;
    }
    let key = VerifyingKey::from_bytes(&bytes).ok()?;
    if key.is_weak() {
        return None;
    }
    Some(key)
}

fn signed_message(signer: Role, hash: &TranscriptHash) -> Vec<u8> {
    let context = match signer {
        Role::Initiator => INITIATOR_SIGNATURE_CONTEXT,
        Role::Responder => RESPONDER_SIGNATURE_CONTEXT,
    };
    let mut message = Vec::with_capacity(context.len() + 32);
    message.extend_from_slice(context);
    message.extend_from_slice(hash.as_bytes());
    message
}

/// Identification strings are 1..=64 bytes of printable ASCII
pub fn validate_identification(identification: &str) -> Result<()> {
    if identification.is_empty() || identification.len() > MAX_IDENTIFICATION_LEN {
        return Err(Error::Identity(format!(
            "Identification must be 1..={} bytes, got {}",
            MAX_IDENTIFICATION_LEN,
            identification.len()
        )));
    }
    if !identification.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(Error::Identity(
            "Identification must be printable ASCII".to_string(),
        ));
    }
    Ok(())
}

/// Known peers, keyed by identification
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    peers: HashMap<String, [u8; IDENTITY_PUBLIC_KEY_LEN]>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust `public_key` for `identification`, replacing any earlier entry
    pub fn add(
        &mut self,
        identification: impl Into<String>,
        public_key: [u8; IDENTITY_PUBLIC_KEY_LEN],
    ) -> Result<()> {
        let identification = identification.into();
        validate_identification(&identification)?;
        if parse_identity_key(&public_key).is_none() {
            return Err(Error::Identity(format!(
                "Public key for {} is not a valid Ed25519 key",
                identification
            )));
        }
        self.peers.insert(identification, public_key);
        Ok(())
    }

    pub fn add_hex(
        &mut self,
        identification: impl Into<String>,
        public_key_hex: &str,
    ) -> Result<()> {
        let bytes = hex::decode(public_key_hex.trim())?;
        let key: [u8; IDENTITY_PUBLIC_KEY_LEN] = bytes[..].try_into().map_err(|_| {
            Error::Identity(format!("Public key must be {} bytes", IDENTITY_PUBLIC_KEY_LEN))
        })?;
        self.add(identification, key)
    }

    pub fn get(&self, identification: &str) -> Option<&[u8; IDENTITY_PUBLIC_KEY_LEN]> {
        self.peers.get(identification)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::test_key_set;

    #[test]
    fn test_sign_and_verify() {
        let identity = LocalIdentity::generate("server-1").unwrap();
        let (hash, _) = test_key_set();
        let signature = identity.sign_transcript(Role::Responder, &hash);

        assert!(verify_transcript(&identity.public_key(), Role::Responder, &hash, &signature));
        // Same signature presented as the other role
        assert!(!verify_transcript(&identity.public_key(), Role::Initiator, &hash, &signature));
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let identity = LocalIdentity::generate("server-1").unwrap();
        let other = LocalIdentity::generate("server-2").unwrap();
        let (hash, _) = test_key_set();
        let (other_hash, _) = test_key_set();
        let signature = identity.sign_transcript(Role::Responder, &hash);

        let mut flipped = signature;
        flipped[10] ^= 0x01;
        assert!(!verify_transcript(&identity.public_key(), Role::Responder, &hash, &flipped));
        assert!(!verify_transcript(&other.public_key(), Role::Responder, &hash, &signature));
        assert!(!verify_transcript(
            &identity.public_key(),
            Role::Responder,
            &other_hash,
            &signature
        ));
    }

    #[test]
    fn test_verify_never_panics_on_malformed_input() {
        let identity = LocalIdentity::generate("server-1").unwrap();
        let (hash, _) = test_key_set();
        let signature = identity.sign_transcript(Role::Responder, &hash);

        let key = identity.public_key();
        assert!(!verify_transcript(&key, Role::Responder, &hash, &signature[..63]));
        assert!(!verify_transcript(&key, Role::Responder, &hash, &[]));
        assert!(!verify_transcript(&key[..31], Role::Responder, &hash, &signature));
        assert!(!verify_transcript(&[0xffu8; 32], Role::Responder, &hash, &signature));
    }

    #[test]
    fn test_small_order_identity_key_rejected() {
        // Encoding of the identity point (y = 1)
        let mut identity_point = [0u8; 32];
        identity_point[0] = 1;
        assert!(parse_identity_key(&identity_point).is_none());

        let mut store = TrustStore::new();
        assert!(store.add("weak", identity_point).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_seed_hex_round_trip() {
        let identity = LocalIdentity::generate("client-1").unwrap();
        let seed_hex = hex::encode(identity.signing_key.to_bytes());
        let restored =
            LocalIdentity::from_seed_hex("client-1", &format!("{}\n", seed_hex)).unwrap();
        assert_eq!(identity.public_key(), restored.public_key());

        assert!(LocalIdentity::from_seed_hex("client-1", "abcd").is_err());
        assert!(LocalIdentity::from_seed_hex("client-1", "not hex").is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("dacgate-identity-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.key");

        let identity = LocalIdentity::generate("server-1").unwrap();
        identity.save(&path).unwrap();
        let loaded = LocalIdentity::load("server-1", &path).unwrap();
        assert_eq!(identity.public_key(), loaded.public_key());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_save_tightens_existing_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join(format!("dacgate-identity-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("server.key");
        std::fs::write(&path, "stale\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let identity = LocalIdentity::generate("server-1").unwrap();
        identity.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let loaded = LocalIdentity::load("server-1", &path).unwrap();
        assert_eq!(loaded.public_key(), identity.public_key());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_identification_validation() {
        assert!(validate_identification("client-1").is_ok());
        assert!(validate_identification("").is_err());
        assert!(validate_identification(&"x".repeat(65)).is_err());
        assert!(validate_identification(&"x".repeat(64)).is_ok());
        assert!(validate_identification("bad\nname").is_err());
        assert!(validate_identification("caf\u{e9}").is_err());
    }

    #[test]
    fn test_trust_store_lookup() {
        let identity = LocalIdentity::generate("client-1").unwrap();
        let mut store = TrustStore::new();
        store.add_hex("client-1", &identity.public_key_hex()).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("client-1"), Some(&identity.public_key()));
        assert!(store.get("client-2").is_none());
        assert!(store.add_hex("client-2", "00").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let identity = LocalIdentity::generate("server-1").unwrap();
        let seed_hex = hex::encode(identity.signing_key.to_bytes());
        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("server-1"));
        assert!(!rendered.contains(&seed_hex));
    }
}
