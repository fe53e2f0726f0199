//! Cipher suite contract for pluggable record protection and key exchange.
//!
//! A [`CipherSuite`] bundles everything the handshake needs from cryptography:
//! the PRF and transcript hash, key derivation, a factory for per-direction
//! [`RecordCipher`]s and a factory for [`ActiveKeyExchange`]s. Suites are
//! registered as `&'static dyn CipherSuite` in a priority-ordered table (see
//! [`Config::cipher_suites`](crate::Config::cipher_suites)). The built-in
//! implementations live in [`rust_crypto`].
//!
//! # Implementing a suite
//!
//! ```
//! use datagram_tls::crypto::{ActiveKeyExchange, CipherSuite, CipherSuiteId};
//! use datagram_tls::crypto::{DirectionKeys, KeyMaterial, RecordCipher};
//! use datagram_tls::Buf;
//!
//! #[derive(Debug)]
//! struct MySuite;
//!
//! impl CipherSuite for MySuite {
//!     fn id(&self) -> CipherSuiteId {
//!         CipherSuiteId(0xFF01)
//!     }
//!     fn priority(&self) -> u8 {
//!         1
//!     }
//!     fn record_overhead(&self) -> usize {
//!         0
//!     }
//!     fn hash(&self, _data: &[u8], _out: &mut Buf) {}
//!     fn prf(&self, _: &[u8], _: &str, _: &[u8], _: &mut Buf, _: usize) -> Result<(), String> {
//!         Err("not implemented".into())
//!     }
//!     fn derive_keys(&self, _: &[u8], _: &[u8; 32], _: &[u8; 32], _: u16) -> Result<KeyMaterial, String> {
//!         Err("not implemented".into())
//!     }
//!     fn create_cipher(&self, _: &DirectionKeys) -> Result<Box<dyn RecordCipher>, String> {
//!         Err("not implemented".into())
//!     }
//!     fn start_key_exchange(&self) -> Result<Box<dyn ActiveKeyExchange>, String> {
//!         Err("not implemented".into())
//!     }
//! }
//!
//! static MY_SUITE: MySuite = MySuite;
//! static MY_SUITES: &[&dyn CipherSuite] = &[&MY_SUITE];
//! ```
//!
//! # Thread Safety
//!
//! All traits require [`CryptoSafe`] so suites can be shared between
//! endpoints on different threads.

use std::fmt::{self, Debug};
use std::panic::{RefUnwindSafe, UnwindSafe};

use nom::number::complete::be_u16;
use nom::IResult;
use zeroize::Zeroizing;

pub mod rust_crypto;

pub use crate::buffer::Buf;
pub use crate::message::{ContentType, ProtocolVersion, Sequence};

/// Length of the Finished verify data.
pub const VERIFY_DATA_LEN: usize = 12;

/// Length of the master secret.
pub const MASTER_SECRET_LEN: usize = 48;

/// Marker for types that are safe to use as crypto components.
pub trait CryptoSafe: Send + Sync + Debug + UnwindSafe + RefUnwindSafe {}

impl<T: Send + Sync + Debug + UnwindSafe + RefUnwindSafe> CryptoSafe for T {}

/// IANA-style 16 bit cipher suite identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CipherSuiteId(pub u16);

impl CipherSuiteId {
    /// TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256
    pub const ECDHE_PSK_AES128_GCM_SHA256: CipherSuiteId = CipherSuiteId(0xD001);
    /// TLS_ECDHE_PSK_WITH_AES_256_GCM_SHA384
    pub const ECDHE_PSK_AES256_GCM_SHA384: CipherSuiteId = CipherSuiteId(0xD002);

    pub(crate) fn parse(input: &[u8]) -> IResult<&[u8], CipherSuiteId> {
        let (input, v) = be_u16(input)?;
        Ok((input, CipherSuiteId(v)))
    }
}

impl fmt::Debug for CipherSuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CipherSuiteId(0x{:04X})", self.0)
    }
}

/// A negotiable cipher suite.
pub trait CipherSuite: CryptoSafe {
    /// Identifier on the wire.
    fn id(&self) -> CipherSuiteId;

    /// Negotiation priority. Higher is preferred.
    fn priority(&self) -> u8;

    /// Bytes added to every protected record.
    fn record_overhead(&self) -> usize;

    /// Hash used for the handshake transcript.
    fn hash(&self, data: &[u8], out: &mut Buf);

    /// TLS 1.2 PRF. Writes exactly `len` bytes to `out`.
    fn prf(
        &self,
        secret: &[u8],
        label: &str,
        seed: &[u8],
        out: &mut Buf,
        len: usize,
    ) -> Result<(), String>;

    /// Derive the traffic keys for `epoch` from the master secret.
    fn derive_keys(
        &self,
        master_secret: &[u8],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
        epoch: u16,
    ) -> Result<KeyMaterial, String>;

    /// Create the record protection for one direction.
    fn create_cipher(&self, keys: &DirectionKeys) -> Result<Box<dyn RecordCipher>, String>;

    /// Start a key exchange. The returned value builds our key exchange
    /// message and consumes the peer's.
    fn start_key_exchange(&self) -> Result<Box<dyn ActiveKeyExchange>, String>;

    /// Derive the master secret from the pre-master secret.
    fn derive_master_secret(
        &self,
        pre_master_secret: &[u8],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
        out: &mut Buf,
    ) -> Result<(), String> {
        let mut seed = [0u8; 64];
        seed[..32].copy_from_slice(client_random);
        seed[32..].copy_from_slice(server_random);
        self.prf(
            pre_master_secret,
            "master secret",
            &seed,
            out,
            MASTER_SECRET_LEN,
        )
    }
}

/// Protection for records in one direction of one epoch.
pub trait RecordCipher: CryptoSafe {
    /// Replace the plaintext in `payload` with the protected fragment.
    ///
    /// `header.length` is the plaintext length.
    fn encrypt(&mut self, header: &RecordHeader, payload: &mut Buf) -> Result<(), String>;

    /// Replace the protected fragment in `payload` with the plaintext.
    ///
    /// `header.length` is the protected fragment length. Any error is treated
    /// as an authentication failure.
    fn decrypt(&mut self, header: &RecordHeader, payload: &mut Buf) -> Result<(), String>;
}

/// An ephemeral key exchange in progress.
pub trait ActiveKeyExchange: CryptoSafe {
    /// Our key exchange message.
    fn build_message(&self, out: &mut Buf);

    /// Consume the peer's key exchange message and write the shared secret.
    fn consume_peer_message(
        self: Box<Self>,
        peer_message: &[u8],
        out: &mut Buf,
    ) -> Result<(), String>;
}

/// Record header fields that are authenticated with the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub content_type: ContentType,
    pub version: ProtocolVersion,
    pub sequence: Sequence,
    pub length: u16,
}

impl RecordHeader {
    /// Additional data: seq_num(epoch + seq) || type || version || length.
    pub fn aad(&self, plaintext_len: u16) -> [u8; 13] {
        let mut aad = [0u8; 13];
        aad[..8].copy_from_slice(&self.sequence.to_bytes());
        aad[8] = self.content_type.as_u8();
        aad[9..11].copy_from_slice(&self.version.as_u16().to_be_bytes());
        aad[11..13].copy_from_slice(&plaintext_len.to_be_bytes());
        aad
    }
}

/// Keys for one direction.
pub struct DirectionKeys {
    pub mac_key: Zeroizing<Vec<u8>>,
    pub key: Zeroizing<Vec<u8>>,
    pub iv: Zeroizing<Vec<u8>>,
}

impl DirectionKeys {
    pub fn new(mac_key: &[u8], key: &[u8], iv: &[u8]) -> Self {
        DirectionKeys {
            mac_key: Zeroizing::new(mac_key.to_vec()),
            key: Zeroizing::new(key.to_vec()),
            iv: Zeroizing::new(iv.to_vec()),
        }
    }
}

impl Debug for DirectionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("mac_key_len", &self.mac_key.len())
            .field("key_len", &self.key.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

/// Traffic keys for both directions.
#[derive(Debug)]
pub struct KeyMaterial {
    pub client_write: DirectionKeys,
    pub server_write: DirectionKeys,
}

impl KeyMaterial {
    /// Split a key block laid out as in TLS 1.2: mac keys, enc keys, ivs.
    pub fn from_key_block(
        block: &[u8],
        mac_len: usize,
        key_len: usize,
        iv_len: usize,
    ) -> Result<Self, String> {
        let need = 2 * (mac_len + key_len + iv_len);
        if block.len() < need {
            return Err(format!("key block too short: {} < {}", block.len(), need));
        }

        let (client_mac, rest) = block.split_at(mac_len);
        let (server_mac, rest) = rest.split_at(mac_len);
        let (client_key, rest) = rest.split_at(key_len);
        let (server_key, rest) = rest.split_at(key_len);
        let (client_iv, rest) = rest.split_at(iv_len);
        let server_iv = &rest[..iv_len];

        Ok(KeyMaterial {
            client_write: DirectionKeys::new(client_mac, client_key, client_iv),
            server_write: DirectionKeys::new(server_mac, server_key, server_iv),
        })
    }
}

/// Select the first suite in `ours` (priority order) that the peer offered.
pub(crate) fn negotiate(
    ours: &[&'static dyn CipherSuite],
    offered: &[CipherSuiteId],
) -> Option<&'static dyn CipherSuite> {
    ours.iter().copied().find(|s| offered.contains(&s.id()))
}

/// Pre-master secret for ECDHE_PSK style suites.
///
/// `u16 len || other_secret || u16 len || psk`. An absent psk is encoded empty.
pub(crate) fn pre_master_secret(other_secret: &[u8], psk: Option<&[u8]>, out: &mut Buf) {
    let psk = psk.unwrap_or(&[]);
    out.clear();
    out.extend_from_slice(&(other_secret.len() as u16).to_be_bytes());
    out.extend_from_slice(other_secret);
    out.extend_from_slice(&(psk.len() as u16).to_be_bytes());
    out.extend_from_slice(psk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_crypto::{ECDHE_PSK_AES128_GCM_SHA256, ECDHE_PSK_AES256_GCM_SHA384};

    #[test]
    fn negotiate_prefers_our_order() {
        let ours: [&'static dyn CipherSuite; 2] =
            [&ECDHE_PSK_AES256_GCM_SHA384, &ECDHE_PSK_AES128_GCM_SHA256];
        let offered = [
            CipherSuiteId::ECDHE_PSK_AES128_GCM_SHA256,
            CipherSuiteId::ECDHE_PSK_AES256_GCM_SHA384,
        ];
        let chosen = negotiate(&ours, &offered).unwrap();
        assert_eq!(chosen.id(), CipherSuiteId::ECDHE_PSK_AES256_GCM_SHA384);
    }

    #[test]
    fn negotiate_none_in_common() {
        let ours: [&'static dyn CipherSuite; 1] = [&ECDHE_PSK_AES128_GCM_SHA256];
        assert!(negotiate(&ours, &[CipherSuiteId(0x1301)]).is_none());
        assert!(negotiate(&ours, &[]).is_none());
    }

    #[test]
    fn pre_master_layout() {
        let mut out = Buf::new();
        pre_master_secret(&[1, 2], Some(&[9]), &mut out);
        assert_eq!(&*out, &[0, 2, 1, 2, 0, 1, 9]);
        pre_master_secret(&[1], None, &mut out);
        assert_eq!(&*out, &[0, 1, 1, 0, 0]);
    }

    #[test]
    fn key_block_split() {
        let block: Vec<u8> = (0..40).collect();
        let km = KeyMaterial::from_key_block(&block, 0, 16, 4).unwrap();
        assert_eq!(&km.client_write.key[..], &block[0..16]);
        assert_eq!(&km.server_write.key[..], &block[16..32]);
        assert_eq!(&km.client_write.iv[..], &block[32..36]);
        assert_eq!(&km.server_write.iv[..], &block[36..40]);
        assert!(KeyMaterial::from_key_block(&block[..39], 0, 16, 4).is_err());
    }

    #[test]
    fn aad_layout() {
        let h = RecordHeader {
            content_type: ContentType::ApplicationData,
            version: ProtocolVersion::DTLS1_2,
            sequence: Sequence::new(1, 5),
            length: 99,
        };
        assert_eq!(
            h.aad(3),
            [0, 1, 0, 0, 0, 0, 0, 5, 23, 0xFE, 0xFD, 0, 3]
        );
    }
}
