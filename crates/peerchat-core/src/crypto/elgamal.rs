//! Hashed ElGamal over Curve25519.
//!
//! Each message gets a fresh ephemeral X25519 secret. The shared point is run
//! through HKDF-SHA256 (bound to both public keys) to key ChaCha20-Poly1305:
//!
//! ```text
//! ephemeral_pub(32) || nonce(12) || ciphertext || tag(16)
//! ```

use super::{hkdf_derive, unpack, Cipher, Keypair, PrivateKey, PublicKey, MARKER_LEN};
use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as DalekPublic, StaticSecret};

/// `"5eg"` as BOM-prefixed UTF-16LE.
pub const ELGAMAL_KEY_MARKER: [u8; MARKER_LEN] = [0xFF, 0xFE, b'5', 0x00, b'e', 0x00, b'g', 0x00];

/// `"2eg"` as BOM-prefixed UTF-16LE.
pub const ELGAMAL_MESSAGE_MARKER: [u8; MARKER_LEN] =
    [0xFF, 0xFE, b'2', 0x00, b'e', 0x00, b'g', 0x00];

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = KEY_SIZE + NONCE_SIZE;
const KDF_INFO: &[u8] = b"peerchat eg v1";

/// The `eg` cipher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ElGamal;

fn key_array(bytes: &[u8]) -> Result<[u8; KEY_SIZE]> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("expected {KEY_SIZE} bytes, got {}", bytes.len())))
}

fn message_key(
    shared: &[u8; KEY_SIZE],
    ephemeral: &[u8; KEY_SIZE],
    recipient: &[u8; KEY_SIZE],
) -> Result<ChaCha20Poly1305> {
    let mut info = Vec::with_capacity(KDF_INFO.len() + 2 * KEY_SIZE);
    info.extend_from_slice(KDF_INFO);
    info.extend_from_slice(ephemeral);
    info.extend_from_slice(recipient);
    let okm = hkdf_derive(None, shared, &info, KEY_SIZE)?;
    Ok(ChaCha20Poly1305::new(Key::from_slice(&okm)))
}

impl Cipher for ElGamal {
    fn id(&self) -> &'static str {
        "eg"
    }

    fn key_marker(&self) -> &[u8; MARKER_LEN] {
        &ELGAMAL_KEY_MARKER
    }

    fn message_marker(&self) -> &[u8; MARKER_LEN] {
        &ELGAMAL_MESSAGE_MARKER
    }

    fn generate_keypair(&self) -> Keypair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = DalekPublic::from(&secret);
        Keypair {
            public: PublicKey::from_bytes(public.as_bytes().to_vec()),
            private: PrivateKey::from_bytes(secret.to_bytes().to_vec()),
        }
    }

    fn unpack_public_key(&self, packet: &[u8]) -> Result<PublicKey> {
        let body = unpack(packet, self.key_marker()).map_err(|e| Error::InvalidKey(e.to_string()))?;
        key_array(&body)?;
        Ok(PublicKey::from_bytes(body))
    }

    fn encrypt(&self, plaintext: &str, peer: &PublicKey) -> Result<Vec<u8>> {
        let recipient = key_array(peer.as_bytes())?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_pub = DalekPublic::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&DalekPublic::from(recipient));
        if !shared.was_contributory() {
            return Err(Error::InvalidKey("low-order public key".into()));
        }

        let cipher = message_key(shared.as_bytes(), ephemeral_pub.as_bytes(), &recipient)?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: ephemeral_pub.as_bytes(),
                },
            )
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
        out.extend_from_slice(ephemeral_pub.as_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8], private: &PrivateKey) -> Result<String> {
        if ciphertext.len() < HEADER_SIZE + TAG_SIZE {
            return Err(Error::Crypto("ciphertext too short".into()));
        }
        let (ephemeral, rest) = ciphertext.split_at(KEY_SIZE);
        let (nonce, sealed) = rest.split_at(NONCE_SIZE);
        let ephemeral = key_array(ephemeral)?;

        let secret = StaticSecret::from(key_array(private.as_bytes())?);
        let own_public = DalekPublic::from(&secret);
        let shared = secret.diffie_hellman(&DalekPublic::from(ephemeral));
        if !shared.was_contributory() {
            return Err(Error::Crypto("low-order ephemeral key".into()));
        }

        let cipher = message_key(shared.as_bytes(), &ephemeral, own_public.as_bytes())?;
        let plain = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: &ephemeral,
                },
            )
            .map_err(|_| Error::Crypto("decryption failed".into()))?;

        String::from_utf8(plain).map_err(|_| Error::Crypto("plaintext is not UTF-8".into()))
    }
}
