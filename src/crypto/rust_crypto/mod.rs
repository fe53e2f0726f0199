//! Built-in cipher suites using crates from the
//! [RustCrypto](https://github.com/RustCrypto) organization.
//!
//! # Supported Cipher Suites
//!
//! - `TLS_ECDHE_PSK_WITH_AES_128_GCM_SHA256` (0xD001), X25519 key exchange
//! - `TLS_ECDHE_PSK_WITH_AES_256_GCM_SHA384` (0xD002), P-256 key exchange
//!
//! Both mix the credential's pre-shared key (if any) into the pre-master
//! secret.
//!
//! ```
//! use datagram_tls::Config;
//! use datagram_tls::crypto::rust_crypto;
//!
//! let config = Config::builder()
//!     .cipher_suites(&[&rust_crypto::ECDHE_PSK_AES128_GCM_SHA256])
//!     .build()
//!     .unwrap();
//! assert_eq!(config.cipher_suites().len(), 1);
//! ```

mod cipher_suite;
pub(crate) mod hmac;
mod kx_group;

pub use cipher_suite::{EcdhePskAesGcm, ECDHE_PSK_AES128_GCM_SHA256, ECDHE_PSK_AES256_GCM_SHA384};

use super::CipherSuite;

/// All built-in suites, most preferred first.
pub static ALL_CIPHER_SUITES: &[&dyn CipherSuite] =
    &[&ECDHE_PSK_AES128_GCM_SHA256, &ECDHE_PSK_AES256_GCM_SHA384];
