//! AES-GCM cipher suites using RustCrypto.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Key, Nonce};
use hmac::Hmac;
use sha2::{Digest, Sha256, Sha384};

use super::hmac::prf;
use super::kx_group::KxGroup;
use crate::buffer::Buf;
use crate::crypto::{
    ActiveKeyExchange, CipherSuite, CipherSuiteId, DirectionKeys, KeyMaterial, RecordCipher,
    RecordHeader,
};

/// Explicit nonce carried in front of every AEAD record.
const EXPLICIT_NONCE_LEN: usize = 8;

/// GCM authentication tag length.
const GCM_TAG_LEN: usize = 16;

/// Fixed part of the nonce, derived with the keys.
const FIXED_IV_LEN: usize = 4;

/// Overhead per AEAD record (explicit nonce + tag).
const AEAD_OVERHEAD: usize = EXPLICIT_NONCE_LEN + GCM_TAG_LEN;

/// AES-GCM record protection.
enum AesGcm {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// AES-GCM keyed for one direction, with its fixed IV.
struct AesGcmCipher {
    aead: AesGcm,
    fixed_iv: [u8; FIXED_IV_LEN],
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.aead {
            AesGcm::Aes128(_) => "AesGcm::Aes128",
            AesGcm::Aes256(_) => "AesGcm::Aes256",
        };
        f.debug_tuple(name).finish()
    }
}

impl AesGcmCipher {
    fn new(keys: &DirectionKeys) -> Result<Self, String> {
        let aead = match keys.key.len() {
            16 => AesGcm::Aes128(Box::new(Aes128Gcm::new(Key::<Aes128Gcm>::from_slice(
                &keys.key,
            )))),
            32 => AesGcm::Aes256(Box::new(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(
                &keys.key,
            )))),
            n => return Err(format!("Invalid key size for AES-GCM: {}", n)),
        };

        let fixed_iv: [u8; FIXED_IV_LEN] = keys
            .iv
            .as_slice()
            .try_into()
            .map_err(|_| format!("Invalid fixed IV length: {}", keys.iv.len()))?;

        Ok(AesGcmCipher { aead, fixed_iv })
    }

    fn nonce(&self, explicit: &[u8]) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..FIXED_IV_LEN].copy_from_slice(&self.fixed_iv);
        nonce[FIXED_IV_LEN..].copy_from_slice(explicit);
        nonce
    }
}

impl RecordCipher for AesGcmCipher {
    fn encrypt(&mut self, header: &RecordHeader, payload: &mut Buf) -> Result<(), String> {
        // The record sequence is unique per key, which makes it a safe explicit nonce.
        let explicit = header.sequence.to_bytes();
        let nonce = self.nonce(&explicit);
        let nonce = Nonce::from_slice(&nonce);
        let aad = header.aad(payload.len() as u16);

        match &self.aead {
            AesGcm::Aes128(c) => c.encrypt_in_place(nonce, &aad, payload),
            AesGcm::Aes256(c) => c.encrypt_in_place(nonce, &aad, payload),
        }
        .map_err(|_| "AES-GCM encryption failed".to_string())?;

        payload.prepend(&explicit);
        Ok(())
    }

    fn decrypt(&mut self, header: &RecordHeader, payload: &mut Buf) -> Result<(), String> {
        let Some(plain_len) = payload.len().checked_sub(AEAD_OVERHEAD) else {
            return Err(format!("Ciphertext too short: {}", payload.len()));
        };

        let nonce = self.nonce(&payload[..EXPLICIT_NONCE_LEN]);
        let nonce = Nonce::from_slice(&nonce);
        let aad = header.aad(plain_len as u16);

        payload.drain_front(EXPLICIT_NONCE_LEN);

        // decrypt_in_place strips the tag
        match &self.aead {
            AesGcm::Aes128(c) => c.decrypt_in_place(nonce, &aad, payload),
            AesGcm::Aes256(c) => c.decrypt_in_place(nonce, &aad, payload),
        }
        .map_err(|_| "AES-GCM decryption failed".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrfHash {
    Sha256,
    Sha384,
}

/// ECDHE(+PSK) key exchange with AES-GCM record protection.
#[derive(Debug)]
pub struct EcdhePskAesGcm {
    id: CipherSuiteId,
    priority: u8,
    key_len: usize,
    hash: PrfHash,
    group: KxGroup,
}

impl CipherSuite for EcdhePskAesGcm {
    fn id(&self) -> CipherSuiteId {
        self.id
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn record_overhead(&self) -> usize {
        AEAD_OVERHEAD
    }

    fn hash(&self, data: &[u8], out: &mut Buf) {
        out.clear();
        match self.hash {
            PrfHash::Sha256 => out.extend_from_slice(&Sha256::digest(data)),
            PrfHash::Sha384 => out.extend_from_slice(&Sha384::digest(data)),
        }
    }

    fn prf(
        &self,
        secret: &[u8],
        label: &str,
        seed: &[u8],
        out: &mut Buf,
        len: usize,
    ) -> Result<(), String> {
        match self.hash {
            PrfHash::Sha256 => prf::<Hmac<Sha256>>(secret, label, seed, out, len),
            PrfHash::Sha384 => prf::<Hmac<Sha384>>(secret, label, seed, out, len),
        }
    }

    fn derive_keys(
        &self,
        master_secret: &[u8],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
        epoch: u16,
    ) -> Result<KeyMaterial, String> {
        let mut seed = Vec::with_capacity(66);
        seed.extend_from_slice(server_random);
        seed.extend_from_slice(client_random);
        // Epoch 1 uses the plain TLS 1.2 expansion. Later epochs are
        // separated by the epoch number.
        if epoch > 1 {
            seed.extend_from_slice(&epoch.to_be_bytes());
        }

        let len = 2 * (self.key_len + FIXED_IV_LEN);
        let mut block = Buf::new();
        self.prf(master_secret, "key expansion", &seed, &mut block, len)?;

        let keys = KeyMaterial::from_key_block(&block, 0, self.key_len, FIXED_IV_LEN);
        zeroize::Zeroize::zeroize(&mut block);
        keys
    }

    fn create_cipher(&self, keys: &DirectionKeys) -> Result<Box<dyn RecordCipher>, String> {
        Ok(Box::new(AesGcmCipher::new(keys)?))
    }

    fn start_key_exchange(&self) -> Result<Box<dyn ActiveKeyExchange>, String> {
        self.group.start()
    }
}

/// TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256 over X25519.
pub static ECDHE_PSK_AES128_GCM_SHA256: EcdhePskAesGcm = EcdhePskAesGcm {
    id: CipherSuiteId::ECDHE_PSK_AES128_GCM_SHA256,
    priority: 20,
    key_len: 16,
    hash: PrfHash::Sha256,
    group: KxGroup::X25519,
};

/// TLS_ECDHE_PSK_WITH_AES_256_GCM_SHA384 over P-256.
pub static ECDHE_PSK_AES256_GCM_SHA384: EcdhePskAesGcm = EcdhePskAesGcm {
    id: CipherSuiteId::ECDHE_PSK_AES256_GCM_SHA384,
    priority: 10,
    key_len: 32,
    hash: PrfHash::Sha384,
    group: KxGroup::P256,
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ContentType, ProtocolVersion, Sequence};

    fn header(seq: u64, len: usize) -> RecordHeader {
        RecordHeader {
            content_type: ContentType::ApplicationData,
            version: ProtocolVersion::DTLS1_2,
            sequence: Sequence::new(1, seq),
            length: len as u16,
        }
    }

    fn ciphers(suite: &EcdhePskAesGcm) -> (Box<dyn RecordCipher>, Box<dyn RecordCipher>) {
        let km = suite
            .derive_keys(&[7; 48], &[1; 32], &[2; 32], 1)
            .unwrap();
        let enc = suite.create_cipher(&km.client_write).unwrap();
        let dec = suite.create_cipher(&km.client_write).unwrap();
        (enc, dec)
    }

    #[test]
    fn seal_and_open() {
        for suite in [&ECDHE_PSK_AES128_GCM_SHA256, &ECDHE_PSK_AES256_GCM_SHA384] {
            let (mut enc, mut dec) = ciphers(suite);

            let mut payload = Buf::from_slice(b"hello world");
            enc.encrypt(&header(3, 11), &mut payload).unwrap();
            assert_eq!(payload.len(), 11 + AEAD_OVERHEAD);
            assert_eq!(&payload[..8], &Sequence::new(1, 3).to_bytes());

            let len = payload.len();
            dec.decrypt(&header(3, len), &mut payload).unwrap();
            assert_eq!(&*payload, b"hello world");
        }
    }

    #[test]
    fn tampered_record_fails() {
        let (mut enc, mut dec) = ciphers(&ECDHE_PSK_AES128_GCM_SHA256);
        let mut payload = Buf::from_slice(b"data");
        enc.encrypt(&header(0, 4), &mut payload).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 1;
        let len = payload.len();
        assert!(dec.decrypt(&header(0, len), &mut payload).is_err());
    }

    #[test]
    fn wrong_header_fails() {
        let (mut enc, mut dec) = ciphers(&ECDHE_PSK_AES128_GCM_SHA256);
        let mut payload = Buf::from_slice(b"data");
        enc.encrypt(&header(0, 4), &mut payload).unwrap();
        let mut h = header(0, payload.len());
        h.content_type = ContentType::Handshake;
        assert!(dec.decrypt(&h, &mut payload).is_err());
    }

    #[test]
    fn short_record_fails() {
        let (_, mut dec) = ciphers(&ECDHE_PSK_AES128_GCM_SHA256);
        let mut payload = Buf::from_slice(&[0; 23]);
        assert!(dec.decrypt(&header(0, 23), &mut payload).is_err());
    }

    #[test]
    fn epochs_derive_different_keys() {
        let s = &ECDHE_PSK_AES128_GCM_SHA256;
        let k1 = s.derive_keys(&[7; 48], &[1; 32], &[2; 32], 1).unwrap();
        let k2 = s.derive_keys(&[7; 48], &[1; 32], &[2; 32], 2).unwrap();
        assert_ne!(&k1.client_write.key[..], &k2.client_write.key[..]);
        assert_ne!(&k1.client_write.key[..], &k1.server_write.key[..]);
    }
}
