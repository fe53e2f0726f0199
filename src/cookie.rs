//! Stateless HelloVerifyRequest cookies.
//!
//! A cookie is an HMAC over the client's transport address and its hello
//! parameters, keyed with a process-wide secret. The secret rotates on a fixed
//! period; cookies minted under the current or the previous secret verify.
//!
//! The secret state is read-mostly. Readers clone an `Arc` snapshot under a
//! short read lock, rotation swaps in a new snapshot under the write lock. One
//! `Arc<CookieSecrets>` can be shared by endpoints on several threads.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::crypto::rust_crypto::hmac::{hmac_sha256, verify_hmac_sha256};
use crate::message::{ClientHello, Cookie};
use crate::Error;

type Secret = Zeroizing<[u8; 32]>;

struct Snapshot {
    current: Secret,
    previous: Option<Secret>,
    rotated_at: Instant,
}

/// Rotating secret used to mint and check cookies.
pub struct CookieSecrets {
    rotation: Duration,
    snapshot: RwLock<Arc<Snapshot>>,
}

impl CookieSecrets {
    /// Initialize with a fresh random secret that rotates every `rotation`.
    pub fn new(rotation: Duration, now: Instant) -> Arc<Self> {
        Arc::new(CookieSecrets {
            rotation,
            snapshot: RwLock::new(Arc::new(Snapshot {
                current: fresh_secret(),
                previous: None,
                rotated_at: now,
            })),
        })
    }

    /// The rotation period.
    pub fn rotation(&self) -> Duration {
        self.rotation
    }

    /// When the next rotation is due.
    pub fn next_rotation(&self) -> Instant {
        self.load().rotated_at + self.rotation
    }

    /// Rotate now. The current secret becomes the previous one.
    pub fn rotate(&self, now: Instant) {
        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(Snapshot {
            current: fresh_secret(),
            previous: Some(guard.current.clone()),
            rotated_at: now,
        });
        debug!("Cookie secret rotated");
    }

    /// Rotate if the period elapsed. Returns whether a rotation happened.
    pub fn rotate_if_due(&self, now: Instant) -> bool {
        if now < self.next_rotation() {
            return false;
        }

        let mut guard = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        // Another endpoint may have rotated while we waited for the lock.
        if now < guard.rotated_at + self.rotation {
            return false;
        }
        *guard = Arc::new(Snapshot {
            current: fresh_secret(),
            previous: Some(guard.current.clone()),
            rotated_at: now,
        });
        debug!("Cookie secret rotated");
        true
    }

    /// Mint the cookie for this peer and hello.
    pub(crate) fn issue(&self, peer: SocketAddr, hello: &ClientHello) -> Result<Cookie, Error> {
        let snapshot = self.load();
        let addr = addr_bytes(peer);
        let params = hello_bytes(hello);
        let tag =
            hmac_sha256(&snapshot.current[..], &[&addr, &params]).map_err(Error::CryptoError)?;
        Cookie::try_new(&tag).map_err(|e| Error::CryptoError(e.to_string()))
    }

    /// Check the cookie echoed in `hello` against the current and previous
    /// secrets.
    pub(crate) fn verify(&self, peer: SocketAddr, hello: &ClientHello) -> bool {
        if hello.cookie.is_empty() {
            return false;
        }

        let snapshot = self.load();
        let addr = addr_bytes(peer);
        let params = hello_bytes(hello);

        let parts: [&[u8]; 2] = [&addr, &params];
        if verify_hmac_sha256(&snapshot.current[..], &parts, &hello.cookie) {
            return true;
        }

        match &snapshot.previous {
            Some(prev) => verify_hmac_sha256(&prev[..], &parts, &hello.cookie),
            None => false,
        }
    }

    fn load(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for CookieSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSecrets")
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

fn fresh_secret() -> Secret {
    let mut secret = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut secret[..]);
    secret
}

fn addr_bytes(addr: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(18);
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

// The hello parameters the cookie commits to. The cookie field itself is not
// part of it, so the echoed hello hashes the same as the first one.
fn hello_bytes(hello: &ClientHello) -> Vec<u8> {
    let mut out = Vec::with_capacity(34 + hello.cipher_suites.len() * 2);
    out.extend_from_slice(&hello.client_version.as_u16().to_be_bytes());
    out.extend_from_slice(&hello.random.to_bytes());
    for s in &hello.cipher_suites {
        out.extend_from_slice(&s.0.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CipherSuiteId;
    use crate::message::{ProtocolVersion, Random};

    fn hello(random: u8) -> ClientHello {
        ClientHello::new(
            ProtocolVersion::DTLS1_2,
            Random {
                gmt_unix_time: 1,
                random_bytes: [random; 28],
            },
            Cookie::empty(),
            [CipherSuiteId::ECDHE_PSK_AES128_GCM_SHA256],
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn echoed(mut h: ClientHello, cookie: Cookie) -> ClientHello {
        h.cookie = cookie;
        h
    }

    #[test]
    fn issued_cookie_verifies() {
        let now = Instant::now();
        let secrets = CookieSecrets::new(Duration::from_secs(60), now);
        let c = secrets.issue(addr(1), &hello(1)).unwrap();
        assert_eq!(c.len(), 32);
        assert!(secrets.verify(addr(1), &echoed(hello(1), c)));
    }

    #[test]
    fn cookie_is_deterministic() {
        let secrets = CookieSecrets::new(Duration::from_secs(60), Instant::now());
        let a = secrets.issue(addr(1), &hello(1)).unwrap();
        let b = secrets.issue(addr(1), &hello(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cookie_bound_to_address_and_hello() {
        let secrets = CookieSecrets::new(Duration::from_secs(60), Instant::now());
        let c = secrets.issue(addr(1), &hello(1)).unwrap();
        assert!(!secrets.verify(addr(2), &echoed(hello(1), c)));
        assert!(!secrets.verify(addr(1), &echoed(hello(2), c)));
        assert!(!secrets.verify(addr(1), &hello(1)));
    }

    #[test]
    fn survives_one_rotation_not_two() {
        let now = Instant::now();
        let secrets = CookieSecrets::new(Duration::from_secs(60), now);
        let c = secrets.issue(addr(1), &hello(1)).unwrap();

        assert!(!secrets.rotate_if_due(now + Duration::from_secs(30)));
        assert!(secrets.rotate_if_due(now + Duration::from_secs(61)));
        assert!(secrets.verify(addr(1), &echoed(hello(1), c)));

        secrets.rotate(now + Duration::from_secs(62));
        assert!(!secrets.verify(addr(1), &echoed(hello(1), c)));
    }

    #[test]
    fn next_rotation_moves() {
        let now = Instant::now();
        let secrets = CookieSecrets::new(Duration::from_secs(10), now);
        assert_eq!(secrets.next_rotation(), now + Duration::from_secs(10));
        secrets.rotate(now + Duration::from_secs(3));
        assert_eq!(secrets.next_rotation(), now + Duration::from_secs(13));
    }

    #[test]
    fn shared_between_threads() {
        let now = Instant::now();
        let secrets = CookieSecrets::new(Duration::from_secs(60), now);
        let c = secrets.issue(addr(1), &hello(1)).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&secrets);
                std::thread::spawn(move || s.verify(addr(1), &echoed(hello(1), c)))
            })
            .collect();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}
