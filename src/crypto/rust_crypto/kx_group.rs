//! Ephemeral key exchange using RustCrypto and dalek.

use p256::ecdh::EphemeralSecret as P256Secret;
use p256::PublicKey as P256PublicKey;
use rand::rngs::OsRng;
use x25519_dalek::{EphemeralSecret as X25519Secret, PublicKey as X25519PublicKey};

use crate::buffer::Buf;
use crate::crypto::ActiveKeyExchange;

/// Key exchange group used by a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KxGroup {
    X25519,
    P256,
}

impl KxGroup {
    pub(super) fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, String> {
        let kx = match self {
            KxGroup::X25519 => {
                let secret = X25519Secret::random_from_rng(OsRng);
                let public_key = Buf::from_slice(X25519PublicKey::from(&secret).as_bytes());
                EcdhKeyExchange::X25519 { secret, public_key }
            }
            KxGroup::P256 => {
                let secret = P256Secret::random(&mut OsRng);
                let public_key = Buf::from_slice(&P256PublicKey::from(&secret).to_sec1_bytes());
                EcdhKeyExchange::P256 { secret, public_key }
            }
        };
        Ok(Box::new(kx))
    }
}

/// ECDHE key exchange in progress.
enum EcdhKeyExchange {
    X25519 {
        secret: X25519Secret,
        public_key: Buf,
    },
    P256 {
        secret: P256Secret,
        public_key: Buf,
    },
}

impl std::fmt::Debug for EcdhKeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EcdhKeyExchange::X25519 { public_key, .. } => f
                .debug_struct("EcdhKeyExchange::X25519")
                .field("public_key_len", &public_key.len())
                .finish_non_exhaustive(),
            EcdhKeyExchange::P256 { public_key, .. } => f
                .debug_struct("EcdhKeyExchange::P256")
                .field("public_key_len", &public_key.len())
                .finish_non_exhaustive(),
        }
    }
}

impl ActiveKeyExchange for EcdhKeyExchange {
    fn build_message(&self, out: &mut Buf) {
        let public_key = match self {
            EcdhKeyExchange::X25519 { public_key, .. } => public_key,
            EcdhKeyExchange::P256 { public_key, .. } => public_key,
        };
        out.extend_from_slice(public_key);
    }

    fn consume_peer_message(
        self: Box<Self>,
        peer_message: &[u8],
        out: &mut Buf,
    ) -> Result<(), String> {
        out.clear();
        match *self {
            EcdhKeyExchange::X25519 { secret, .. } => {
                let peer: [u8; 32] = peer_message
                    .try_into()
                    .map_err(|_| "Invalid X25519 public key length".to_string())?;
                let shared = secret.diffie_hellman(&X25519PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err("Non-contributory X25519 public key".to_string());
                }
                out.extend_from_slice(shared.as_bytes());
            }
            EcdhKeyExchange::P256 { secret, .. } => {
                let peer = P256PublicKey::from_sec1_bytes(peer_message)
                    .map_err(|_| "Invalid P-256 public key".to_string())?;
                let shared = secret.diffie_hellman(&peer);
                out.extend_from_slice(shared.raw_secret_bytes().as_slice());
            }
        }
        Ok(())
    }
}
