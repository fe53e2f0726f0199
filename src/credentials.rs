//! Credential collaborator: local identity, pre-shared key and peer
//! verification.

use std::fmt;

use zeroize::Zeroizing;

/// Supplies local credentials and judges the peer's identity.
///
/// Called by the handshake when the peer's Certificate message arrives. Any
/// `Err` fails the handshake with a fatal `bad_certificate` alert.
pub trait Credentials: Send + Sync + fmt::Debug {
    /// Identity chain sent in our Certificate message. May be empty.
    fn certificate_chain(&self) -> &[Vec<u8>];

    /// Pre-shared key mixed into the pre-master secret.
    fn pre_shared_key(&self) -> Option<&[u8]>;

    /// Validate the peer's identity chain.
    fn verify_peer(&self, chain: &[&[u8]]) -> Result<(), String>;
}

/// Pre-shared key credentials with an opaque identity.
///
/// Both peers must hold the same key for the Finished check to pass. When an
/// allow-list is set, the peer's first chain entry must be on it.
pub struct PskCredentials {
    chain: Vec<Vec<u8>>,
    key: Zeroizing<Vec<u8>>,
    allowed_peers: Option<Vec<Vec<u8>>>,
}

impl PskCredentials {
    pub fn new(identity: &[u8], key: &[u8]) -> Self {
        PskCredentials {
            chain: vec![identity.to_vec()],
            key: Zeroizing::new(key.to_vec()),
            allowed_peers: None,
        }
    }

    /// Only accept peers presenting one of these identities.
    pub fn with_allowed_peers<I, T>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.allowed_peers = Some(peers.into_iter().map(|p| p.as_ref().to_vec()).collect());
        self
    }

    pub fn identity(&self) -> &[u8] {
        &self.chain[0]
    }
}

impl fmt::Debug for PskCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskCredentials")
            .field("identity", &String::from_utf8_lossy(self.identity()))
            .field("allowed_peers", &self.allowed_peers.as_ref().map(|p| p.len()))
            .finish_non_exhaustive()
    }
}

impl Credentials for PskCredentials {
    fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    fn pre_shared_key(&self) -> Option<&[u8]> {
        Some(&self.key)
    }

    fn verify_peer(&self, chain: &[&[u8]]) -> Result<(), String> {
        let Some(identity) = chain.first() else {
            return Err("peer presented no identity".into());
        };

        match &self.allowed_peers {
            Some(allowed) if !allowed.iter().any(|a| a.as_slice() == *identity) => Err(format!(
                "peer identity not allowed: {}",
                String::from_utf8_lossy(identity)
            )),
            _ => Ok(()),
        }
    }
}
