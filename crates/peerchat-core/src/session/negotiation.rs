//! Per-peer encryption negotiation.
//!
//! ```text
//! peer:  NoRecord ──(key packet)──▶ KeyKnown ──(key packet)──▶ KeyKnown (replaced)
//! local: disabled ──(enable)──▶ enabled, key unsent ──(first send)──▶ enabled, key sent
//! ```
//!
//! Sending to a peer whose key we know always encrypts, whether or not our
//! own encryption is enabled. Our own key rides with the next outgoing
//! message after encryption is enabled or a new peer connects.

use crate::crypto::{Cipher, CipherRegistry, Keypair, PacketKind, PublicKey};
use crate::error::Result;
use crate::protocol::{Payload, PeerId, Record, RecordContent};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A peer's public key, as learned from its key packet.
#[derive(Clone)]
pub struct PeerEncryptionRecord {
    /// Owner of the key.
    pub peer_id: PeerId,
    /// The key.
    pub public_key: PublicKey,
    /// Cipher the key belongs to.
    pub cipher: Arc<dyn Cipher>,
}

impl PeerEncryptionRecord {
    /// Id of the cipher the key belongs to.
    pub fn cipher_kind(&self) -> &'static str {
        self.cipher.id()
    }
}

impl fmt::Debug for PeerEncryptionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerEncryptionRecord")
            .field("peer_id", &self.peer_id)
            .field("public_key", &self.public_key)
            .field("cipher", &self.cipher.id())
            .finish()
    }
}

struct ActiveCipher {
    cipher: Arc<dyn Cipher>,
    keypair: Keypair,
}

/// Our own encryption settings.
#[derive(Default)]
pub struct LocalEncryptionState {
    active: Option<ActiveCipher>,
    has_sent_own_key: bool,
}

impl LocalEncryptionState {
    /// Whether a cipher is enabled.
    pub fn enabled(&self) -> bool {
        self.active.is_some()
    }

    /// Id of the enabled cipher.
    pub fn cipher_kind(&self) -> Option<&'static str> {
        self.active.as_ref().map(|a| a.cipher.id())
    }

    /// Marker our peers put on ciphertext meant for us.
    pub fn message_marker(&self) -> Option<&[u8]> {
        self.active
            .as_ref()
            .map(|a| a.cipher.message_marker().as_slice())
    }

    /// Our current public key.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.active.as_ref().map(|a| &a.keypair.public)
    }

    /// Whether our key already went out to the current peer.
    pub fn has_sent_own_key(&self) -> bool {
        self.has_sent_own_key
    }
}

impl fmt::Debug for LocalEncryptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEncryptionState")
            .field("cipher", &self.cipher_kind())
            .field("has_sent_own_key", &self.has_sent_own_key)
            .finish()
    }
}

/// Why an inbound bytes payload was not used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// No registered cipher marker at the end.
    NoMarker,
    /// Ciphertext arrived while our encryption is off.
    EncryptionDisabled,
    /// Ciphertext for a cipher other than the one we enabled.
    CipherMismatch,
    /// Ciphertext did not decrypt with our key.
    DecryptFailed,
    /// Key packet could not be unpacked.
    BadKey,
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            DiscardReason::NoMarker => "no cipher marker",
            DiscardReason::EncryptionDisabled => "encryption disabled",
            DiscardReason::CipherMismatch => "cipher mismatch",
            DiscardReason::DecryptFailed => "decryption failed",
            DiscardReason::BadKey => "malformed key packet",
        };
        f.write_str(reason)
    }
}

/// What an inbound bytes payload turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundBytes {
    /// Decrypted user text.
    Plaintext(String),
    /// Stored or replaced the sender's key.
    KeyStored {
        /// Cipher id of the key.
        cipher: &'static str,
    },
    /// Dropped.
    Discarded(DiscardReason),
}

/// Negotiation state for one Session.
pub struct Negotiator {
    ciphers: CipherRegistry,
    local: LocalEncryptionState,
    peers: HashMap<PeerId, PeerEncryptionRecord>,
}

impl Negotiator {
    /// Start with encryption off and no peer keys.
    pub fn new(ciphers: CipherRegistry) -> Self {
        Self {
            ciphers,
            local: LocalEncryptionState::default(),
            peers: HashMap::new(),
        }
    }

    /// Our own encryption settings.
    pub fn local(&self) -> &LocalEncryptionState {
        &self.local
    }

    /// Key record for a peer.
    pub fn peer_record(&self, peer: &PeerId) -> Option<&PeerEncryptionRecord> {
        self.peers.get(peer)
    }

    /// Enable a cipher with a fresh keypair. Nothing is sent until the next
    /// outgoing message.
    pub fn enable(&mut self, cipher_id: &str) -> Result<()> {
        let cipher = self.ciphers.get(cipher_id)?;
        let keypair = cipher.generate_keypair();
        debug!(cipher = cipher.id(), key = ?keypair.public, "local encryption enabled");
        self.local.active = Some(ActiveCipher { cipher, keypair });
        self.local.has_sent_own_key = false;
        Ok(())
    }

    /// Make our key ride with the next outgoing message again.
    pub fn reset_key_sent(&mut self) {
        self.local.has_sent_own_key = false;
    }

    /// Payloads to send for one line of user text, in order.
    pub fn outgoing(
        &mut self,
        peer: &PeerId,
        text: &str,
        timestamp: DateTime<Utc>,
        as_record: bool,
    ) -> Result<Vec<Payload>> {
        let body = match self.peers.get(peer) {
            Some(record) => {
                let ciphertext = record.cipher.encrypt(text, &record.public_key)?;
                Payload::Bytes(record.cipher.pack_ciphertext(&ciphertext))
            }
            None if as_record => Payload::Record(Record {
                timestamp,
                content: RecordContent::Text(text.to_string()),
            }),
            None => Payload::Text(text.to_string()),
        };

        let mut out = Vec::with_capacity(2);
        if let Some(active) = &self.local.active {
            if !self.local.has_sent_own_key {
                out.push(Payload::Bytes(
                    active.cipher.pack_public_key(&active.keypair.public),
                ));
                self.local.has_sent_own_key = true;
            }
        }
        out.push(body);
        Ok(out)
    }

    /// Classify and act on a bytes payload from `from`.
    pub fn inbound_bytes(&mut self, from: &PeerId, bytes: &[u8]) -> InboundBytes {
        let Some(packet) = self.ciphers.identify(bytes) else {
            return InboundBytes::Discarded(DiscardReason::NoMarker);
        };

        match packet.kind {
            PacketKind::Ciphertext => {
                let Some(active) = &self.local.active else {
                    return InboundBytes::Discarded(DiscardReason::EncryptionDisabled);
                };
                if active.cipher.id() != packet.cipher.id() {
                    return InboundBytes::Discarded(DiscardReason::CipherMismatch);
                }
                let decrypted = active
                    .cipher
                    .unpack_ciphertext(bytes)
                    .and_then(|ct| active.cipher.decrypt(&ct, &active.keypair.private));
                match decrypted {
                    Ok(text) => InboundBytes::Plaintext(text),
                    Err(e) => {
                        debug!(peer = %from, error = %e, "ciphertext rejected");
                        InboundBytes::Discarded(DiscardReason::DecryptFailed)
                    }
                }
            }
            PacketKind::PublicKey => match packet.cipher.unpack_public_key(bytes) {
                Ok(public_key) => {
                    let cipher = packet.cipher.id();
                    self.peers.insert(
                        from.clone(),
                        PeerEncryptionRecord {
                            peer_id: from.clone(),
                            public_key,
                            cipher: packet.cipher,
                        },
                    );
                    InboundBytes::KeyStored { cipher }
                }
                Err(e) => {
                    debug!(peer = %from, error = %e, "key packet rejected");
                    InboundBytes::Discarded(DiscardReason::BadKey)
                }
            },
        }
    }
}

impl fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Negotiator")
            .field("ciphers", &self.ciphers)
            .field("local", &self.local)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ElGamal, ELGAMAL_MESSAGE_MARKER};

    fn id(s: &str) -> PeerId {
        PeerId::parse(s).expect("id")
    }

    fn bytes(payload: &Payload) -> &[u8] {
        match payload {
            Payload::Bytes(b) => b,
            other => panic!("expected bytes, got {other:?}"),
        }
    }

    #[test]
    fn test_plain_when_nothing_negotiated() {
        let mut n = Negotiator::new(CipherRegistry::default());
        let out = n.outgoing(&id("bob"), "hi", Utc::now(), false).expect("encode");
        assert_eq!(out, vec![Payload::Text("hi".into())]);

        let out = n.outgoing(&id("bob"), "hi", Utc::now(), true).expect("encode");
        assert!(matches!(&out[..], [Payload::Record(_)]));
    }

    #[test]
    fn test_key_rides_with_first_message_only() {
        let mut n = Negotiator::new(CipherRegistry::default());
        n.enable("eg").expect("enable");
        assert!(n.local().enabled());
        assert!(!n.local().has_sent_own_key());

        let out = n.outgoing(&id("bob"), "hi", Utc::now(), false).expect("encode");
        assert_eq!(out.len(), 2);
        assert!(bytes(&out[0]).ends_with(ElGamal.key_marker()));
        assert_eq!(out[1], Payload::Text("hi".into()));
        assert!(n.local().has_sent_own_key());

        let out = n.outgoing(&id("bob"), "again", Utc::now(), false).expect("encode");
        assert_eq!(out.len(), 1);

        n.reset_key_sent();
        let out = n.outgoing(&id("bob"), "new peer", Utc::now(), false).expect("encode");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_full_exchange() {
        let mut alice = Negotiator::new(CipherRegistry::default());
        let mut bob = Negotiator::new(CipherRegistry::default());
        alice.enable("eg").expect("enable");

        let out = alice.outgoing(&id("bob"), "hi", Utc::now(), false).expect("encode");
        let stored = bob.inbound_bytes(&id("alice"), bytes(&out[0]));
        assert_eq!(stored, InboundBytes::KeyStored { cipher: "eg" });
        assert_eq!(
            bob.peer_record(&id("alice")).map(|r| r.cipher_kind()),
            Some("eg")
        );

        // Bob never enabled encryption but still encrypts to Alice's key.
        let out = bob.outgoing(&id("alice"), "yo", Utc::now(), true).expect("encode");
        assert_eq!(out.len(), 1);
        assert!(bytes(&out[0]).ends_with(&ELGAMAL_MESSAGE_MARKER));

        let got = alice.inbound_bytes(&id("bob"), bytes(&out[0]));
        assert_eq!(got, InboundBytes::Plaintext("yo".into()));
    }

    #[test]
    fn test_key_record_replaced_whole() {
        let mut alice = Negotiator::new(CipherRegistry::default());
        let mut bob = Negotiator::new(CipherRegistry::default());

        alice.enable("eg").expect("enable");
        let first = alice.local().public_key().cloned().expect("key");
        let out = alice.outgoing(&id("bob"), "1", Utc::now(), false).expect("encode");
        bob.inbound_bytes(&id("alice"), bytes(&out[0]));

        alice.enable("eg").expect("re-key");
        let second = alice.local().public_key().cloned().expect("key");
        assert_ne!(first, second);
        let out = alice.outgoing(&id("bob"), "2", Utc::now(), false).expect("encode");
        bob.inbound_bytes(&id("alice"), bytes(&out[0]));

        let record = bob.peer_record(&id("alice")).expect("record");
        assert_eq!(record.public_key, second);
    }

    #[test]
    fn test_unrecognized_bytes() {
        let mut n = Negotiator::new(CipherRegistry::default());
        assert_eq!(
            n.inbound_bytes(&id("bob"), &[0xFF, 0x00, 0x01]),
            InboundBytes::Discarded(DiscardReason::NoMarker)
        );

        // Ciphertext while our encryption is off.
        let keys = ElGamal.generate_keypair();
        let ct = ElGamal.encrypt("x", &keys.public).expect("encrypt");
        let packet = ElGamal.pack_ciphertext(&ct);
        assert_eq!(
            n.inbound_bytes(&id("bob"), &packet),
            InboundBytes::Discarded(DiscardReason::EncryptionDisabled)
        );

        // Ciphertext for somebody else's key.
        n.enable("eg").expect("enable");
        assert_eq!(
            n.inbound_bytes(&id("bob"), &packet),
            InboundBytes::Discarded(DiscardReason::DecryptFailed)
        );

        let mut bad_key = b"!!!not base64!!!".to_vec();
        bad_key.extend_from_slice(ElGamal.key_marker());
        assert_eq!(
            n.inbound_bytes(&id("bob"), &bad_key),
            InboundBytes::Discarded(DiscardReason::BadKey)
        );
    }

    #[test]
    fn test_unknown_cipher_rejected() {
        let mut n = Negotiator::new(CipherRegistry::default());
        assert!(n.enable("rsa").is_err());
        assert!(!n.local().enabled());
        assert_eq!(n.local().message_marker(), None);
    }
}
