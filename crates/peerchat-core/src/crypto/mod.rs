//! Pluggable message ciphers.
//!
//! A [`Cipher`] turns user text into an opaque ciphertext for one peer's
//! public key. Keys and ciphertexts travel as bytes payloads tagged with an
//! 8-byte trailing marker unique to the cipher:
//!
//! ```text
//! key packet:        base64(public key)  || key_marker(8)
//! ciphertext packet: base64(ciphertext)  || message_marker(8)
//! ```
//!
//! [`CipherRegistry::identify`] inspects the marker once and reports which
//! cipher and which packet kind a payload is, so the Session never sniffs
//! byte suffixes itself.
//!
//! The bundled cipher is [`ElGamal`] (`eg`), hashed ElGamal over Curve25519
//! with ChaCha20-Poly1305 as the data cipher.

mod elgamal;

pub use elgamal::{ElGamal, ELGAMAL_KEY_MARKER, ELGAMAL_MESSAGE_MARKER};

use crate::error::{Error, Result};
use crate::logging::{Redacted, ShortHex};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of every cipher marker.
pub const MARKER_LEN: usize = 8;

/// Opaque public key material for some cipher.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", ShortHex(&self.0))
    }
}

/// Opaque private key material. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    ///
    /// # Security
    /// Handle with care - this exposes secret key material.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({:?})", Redacted(&self.0))
    }
}

/// A cipher's keypair.
#[derive(Debug)]
pub struct Keypair {
    /// Shareable half.
    pub public: PublicKey,
    /// Secret half.
    pub private: PrivateKey,
}

/// Contract every message cipher implements.
///
/// The packing methods have base64 + marker defaults; a cipher only needs
/// its own key generation and encryption primitives.
pub trait Cipher: Send + Sync {
    /// Short id used to select the cipher (`eg`).
    fn id(&self) -> &'static str;

    /// Marker appended to packed public keys.
    fn key_marker(&self) -> &[u8; MARKER_LEN];

    /// Marker appended to packed ciphertexts.
    fn message_marker(&self) -> &[u8; MARKER_LEN];

    /// Generate a fresh keypair.
    fn generate_keypair(&self) -> Keypair;

    /// Encrypt text to a peer's public key.
    fn encrypt(&self, plaintext: &str, peer: &PublicKey) -> Result<Vec<u8>>;

    /// Decrypt a ciphertext produced by [`Cipher::encrypt`].
    fn decrypt(&self, ciphertext: &[u8], private: &PrivateKey) -> Result<String>;

    /// Public key as a marker-tagged packet.
    fn pack_public_key(&self, key: &PublicKey) -> Vec<u8> {
        pack(key.as_bytes(), self.key_marker())
    }

    /// Inverse of [`Cipher::pack_public_key`].
    fn unpack_public_key(&self, packet: &[u8]) -> Result<PublicKey> {
        unpack(packet, self.key_marker())
            .map(PublicKey::from_bytes)
            .map_err(|e| Error::InvalidKey(e.to_string()))
    }

    /// Ciphertext as a marker-tagged packet.
    fn pack_ciphertext(&self, ciphertext: &[u8]) -> Vec<u8> {
        pack(ciphertext, self.message_marker())
    }

    /// Inverse of [`Cipher::pack_ciphertext`].
    fn unpack_ciphertext(&self, packet: &[u8]) -> Result<Vec<u8>> {
        unpack(packet, self.message_marker())
    }
}

fn pack(body: &[u8], marker: &[u8; MARKER_LEN]) -> Vec<u8> {
    let mut packet = BASE64.encode(body).into_bytes();
    packet.extend_from_slice(marker);
    packet
}

fn unpack(packet: &[u8], marker: &[u8; MARKER_LEN]) -> Result<Vec<u8>> {
    let body = packet
        .strip_suffix(marker.as_slice())
        .ok_or_else(|| Error::Encoding("missing cipher marker".into()))?;
    BASE64
        .decode(body)
        .map_err(|e| Error::Encoding(format!("bad base64 body: {e}")))
}

/// What a marker-tagged payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// A packed public key.
    PublicKey,
    /// A packed ciphertext.
    Ciphertext,
}

/// Result of [`CipherRegistry::identify`].
#[derive(Clone)]
pub struct CipherPacket {
    /// Key or ciphertext.
    pub kind: PacketKind,
    /// Cipher whose marker matched.
    pub cipher: Arc<dyn Cipher>,
}

impl fmt::Debug for CipherPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherPacket")
            .field("kind", &self.kind)
            .field("cipher", &self.cipher.id())
            .finish()
    }
}

/// The set of ciphers a node understands.
#[derive(Clone)]
pub struct CipherRegistry {
    ciphers: Vec<Arc<dyn Cipher>>,
}

impl CipherRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self { ciphers: Vec::new() }
    }

    /// Add a cipher, replacing any cipher with the same id.
    pub fn register(&mut self, cipher: Arc<dyn Cipher>) {
        self.ciphers.retain(|c| c.id() != cipher.id());
        self.ciphers.push(cipher);
    }

    /// Look up a cipher by id.
    pub fn get(&self, id: &str) -> Result<Arc<dyn Cipher>> {
        self.ciphers
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or_else(|| Error::UnknownCipher(id.to_string()))
    }

    /// Ids of every registered cipher.
    pub fn ids(&self) -> Vec<&'static str> {
        self.ciphers.iter().map(|c| c.id()).collect()
    }

    /// Classify a bytes payload by its trailing marker.
    pub fn identify(&self, bytes: &[u8]) -> Option<CipherPacket> {
        self.ciphers.iter().find_map(|cipher| {
            let kind = if bytes.ends_with(cipher.message_marker()) {
                PacketKind::Ciphertext
            } else if bytes.ends_with(cipher.key_marker()) {
                PacketKind::PublicKey
            } else {
                return None;
            };
            Some(CipherPacket {
                kind,
                cipher: Arc::clone(cipher),
            })
        })
    }
}

impl Default for CipherRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ElGamal));
        registry
    }
}

impl fmt::Debug for CipherRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

/// Derive keys using HKDF-SHA256.
pub(crate) fn hkdf_derive(
    salt: Option<&[u8]>,
    input_key_material: &[u8],
    info: &[u8],
    output_length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    let hkdf = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = Zeroizing::new(vec![0u8; output_length]);
    hkdf.expand(info, &mut output)
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}
