//! Packet protection backends
//!
//! The engine never looks inside packet protection: every outbound payload is
//! sealed and every inbound payload opened through the [`PacketProtection`]
//! a [`CryptoProvider`] hands out for the connection. Handshakes are out of
//! scope, so the only keyed backend uses a pre-shared key.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use sha2::{Digest, Sha256};

use crate::config::{CryptoBackend, CryptoConfig};
use crate::quic::connection::{ConnectionId, Side};
use crate::quic::error::{CryptoError, Result};

const KEY_LABEL: &[u8] = b"quux-packet-v1";
const TAG_LEN: usize = 16;

/// Seals and opens the payload of individual packets
pub trait PacketProtection: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Bytes added to every sealed payload
    fn overhead(&self) -> usize;

    /// Seal `payload` sent by `sender`; `header` is authenticated, not encrypted.
    fn seal(&self, sender: Side, packet_number: u64, header: &[u8], payload: &[u8]) -> Result<Vec<u8>>;

    /// Open a payload sealed by `sender`.
    fn open(&self, sender: Side, packet_number: u64, header: &[u8], payload: &[u8]) -> Result<Vec<u8>>;
}

/// Creates the packet protection for each new connection
pub trait CryptoProvider: fmt::Debug {
    fn name(&self) -> &'static str;

    fn packet_protection(&self, connection_id: &ConnectionId) -> Result<Box<dyn PacketProtection>>;
}

/// Build the provider selected by configuration
pub fn provider_from_config(config: &CryptoConfig) -> Result<Box<dyn CryptoProvider>> {
    match config.backend {
        CryptoBackend::Plaintext => Ok(Box::new(PlaintextProvider)),
        CryptoBackend::ChaCha20Poly1305 => {
            let key = config
                .pre_shared_key
                .as_deref()
                .ok_or_else(|| CryptoError::InvalidKey("pre_shared_key is required".to_string()))?;
            Ok(Box::new(PreSharedKeyProvider::from_hex(key)?))
        }
    }
}

/// Payloads travel unmodified
#[derive(Debug, Clone, Copy, Default)]
pub struct Plaintext;

impl PacketProtection for Plaintext {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn overhead(&self) -> usize {
        0
    }

    fn seal(&self, _sender: Side, _packet_number: u64, _header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }

    fn open(&self, _sender: Side, _packet_number: u64, _header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        Ok(payload.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextProvider;

impl CryptoProvider for PlaintextProvider {
    fn name(&self) -> &'static str {
        "plaintext"
    }

    fn packet_protection(&self, _connection_id: &ConnectionId) -> Result<Box<dyn PacketProtection>> {
        Ok(Box::new(Plaintext))
    }
}

/// ChaCha20-Poly1305 keyed per connection from a pre-shared key
#[derive(Clone)]
pub struct PreSharedKeyProvider {
    key: [u8; 32],
}

impl PreSharedKeyProvider {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Parse a 64 character hex key
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| CryptoError::InvalidKey(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self::new(key))
    }
}

impl fmt::Debug for PreSharedKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreSharedKeyProvider").finish_non_exhaustive()
    }
}

impl CryptoProvider for PreSharedKeyProvider {
    fn name(&self) -> &'static str {
        "chacha20-poly1305-psk"
    }

    fn packet_protection(&self, connection_id: &ConnectionId) -> Result<Box<dyn PacketProtection>> {
        Ok(Box::new(ChaChaProtection::new(&self.key, connection_id)?))
    }
}

/// Derive the key for one connection so packet numbers never repeat a nonce
/// under the same key.
pub fn derive_connection_key(psk: &[u8; 32], connection_id: &ConnectionId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_LABEL);
    hasher.update(psk);
    hasher.update(connection_id.as_bytes());
    hasher.finalize().into()
}

pub struct ChaChaProtection {
    cipher: ChaCha20Poly1305,
}

impl ChaChaProtection {
    pub fn new(psk: &[u8; 32], connection_id: &ConnectionId) -> Result<Self> {
        let key = derive_connection_key(psk, connection_id);
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|_| CryptoError::KeyDerivation("invalid ChaCha20-Poly1305 key".to_string()))?;
        Ok(Self { cipher })
    }

    // Nonce: sender byte, three zero bytes, 64-bit packet number.
    fn nonce(sender: Side, packet_number: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0] = match sender {
            Side::Client => 0x01,
            Side::Server => 0x02,
        };
        nonce[4..12].copy_from_slice(&packet_number.to_be_bytes());
        nonce
    }
}

impl fmt::Debug for ChaChaProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaProtection").finish_non_exhaustive()
    }
}

impl PacketProtection for ChaChaProtection {
    fn name(&self) -> &'static str {
        "chacha20-poly1305"
    }

    fn overhead(&self) -> usize {
        TAG_LEN
    }

    fn seal(&self, sender: Side, packet_number: u64, header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(sender, packet_number);
        self.cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::Encryption(format!("packet {}", packet_number)).into())
    }

    fn open(&self, sender: Side, packet_number: u64, header: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
        let nonce = Self::nonce(sender, packet_number);
        self.cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: payload,
                    aad: header,
                },
            )
            .map_err(|_| CryptoError::Decryption(format!("packet {}", packet_number)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(byte: u8) -> ConnectionId {
        ConnectionId::from_bytes([byte; 8])
    }

    #[test]
    fn test_chacha_round_trip() {
        let protection = ChaChaProtection::new(&[7u8; 32], &cid(1)).unwrap();
        let sealed = protection.seal(Side::Client, 42, b"hdr", b"frames").unwrap();
        assert_eq!(sealed.len(), b"frames".len() + protection.overhead());
        let opened = protection.open(Side::Client, 42, b"hdr", &sealed).unwrap();
        assert_eq!(opened, b"frames");
    }

    #[test]
    fn test_chacha_rejects_wrong_context() {
        let protection = ChaChaProtection::new(&[7u8; 32], &cid(1)).unwrap();
        let sealed = protection.seal(Side::Client, 42, b"hdr", b"frames").unwrap();

        assert!(protection.open(Side::Server, 42, b"hdr", &sealed).is_err());
        assert!(protection.open(Side::Client, 43, b"hdr", &sealed).is_err());
        assert!(protection.open(Side::Client, 42, b"HDR", &sealed).is_err());

        let other = ChaChaProtection::new(&[7u8; 32], &cid(2)).unwrap();
        assert!(other.open(Side::Client, 42, b"hdr", &sealed).is_err());
    }

    #[test]
    fn test_provider_from_config() {
        let plain = provider_from_config(&CryptoConfig::default()).unwrap();
        assert_eq!(plain.name(), "plaintext");

        let mut config = CryptoConfig {
            backend: CryptoBackend::ChaCha20Poly1305,
            pre_shared_key: None,
        };
        assert!(provider_from_config(&config).is_err());

        config.pre_shared_key = Some("ab".repeat(31));
        assert!(provider_from_config(&config).is_err());

        config.pre_shared_key = Some("ab".repeat(32));
        let provider = provider_from_config(&config).unwrap();
        let protection = provider.packet_protection(&cid(3)).unwrap();
        assert_eq!(protection.overhead(), TAG_LEN);
    }
}
