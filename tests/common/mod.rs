//! Shared helpers for the integration tests.
//!
//! Import from test files via `mod common;`.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datagram_tls::crypto::rust_crypto::ECDHE_PSK_AES128_GCM_SHA256;
use datagram_tls::crypto::{ActiveKeyExchange, CipherSuite, CipherSuiteId};
use datagram_tls::crypto::{DirectionKeys, KeyMaterial, RecordCipher, RecordHeader};
use datagram_tls::{Buf, Config, CookieSecrets, Credentials, Endpoint, Event, Output};
use datagram_tls::{PskCredentials, SessionId};

pub const CLIENT_ADDR: &str = "10.0.0.1:5000";
pub const SERVER_ADDR: &str = "10.0.0.2:4433";

pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
pub const CONTENT_ALERT: u8 = 21;
pub const CONTENT_HANDSHAKE: u8 = 22;
pub const CONTENT_APPLICATION_DATA: u8 = 23;

pub const CLIENT_HELLO: u8 = 1;
pub const HELLO_VERIFY_REQUEST: u8 = 3;
pub const FINISHED: u8 = 20;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn client_addr() -> SocketAddr {
    CLIENT_ADDR.parse().unwrap()
}

pub fn server_addr() -> SocketAddr {
    SERVER_ADDR.parse().unwrap()
}

pub fn config() -> Config {
    Config::builder().rng_seed(7).build().unwrap()
}

pub fn psk(identity: &str) -> Arc<dyn Credentials> {
    Arc::new(PskCredentials::new(identity.as_bytes(), b"correct horse battery staple"))
}

/// Parsed record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecHdr {
    pub ctype: u8,
    pub epoch: u16,
    pub seq: u64,
    /// Offset of the record in the datagram.
    pub offset: usize,
    pub len: usize,
}

/// Parse the record headers of a datagram.
pub fn parse_records(datagram: &[u8]) -> Vec<RecHdr> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 13 <= datagram.len() {
        let ctype = datagram[i];
        let epoch = u16::from_be_bytes([datagram[i + 3], datagram[i + 4]]);
        let mut seq = [0u8; 8];
        seq[2..].copy_from_slice(&datagram[i + 5..i + 11]);
        let len = u16::from_be_bytes([datagram[i + 11], datagram[i + 12]]) as usize;
        out.push(RecHdr {
            ctype,
            epoch,
            seq: u64::from_be_bytes(seq),
            offset: i,
            len,
        });
        i += 13 + len;
    }
    out
}

/// Handshake message type of the first plaintext handshake record.
pub fn first_handshake_type(datagram: &[u8]) -> Option<u8> {
    let first = parse_records(datagram).into_iter().next()?;
    (first.ctype == CONTENT_HANDSHAKE && first.epoch == 0).then(|| datagram[first.offset + 13])
}

/// Something that identifies "the same" datagram across retransmissions.
///
/// Record sequence numbers differ between a send and its resend, so they are
/// left out.
pub fn signature(datagram: &[u8]) -> Vec<u8> {
    let Some(first) = parse_records(datagram).into_iter().next() else {
        return datagram.to_vec();
    };

    let mut sig = vec![first.ctype];
    sig.extend_from_slice(&first.epoch.to_be_bytes());

    let body = &datagram[first.offset + 13..];
    if first.ctype == CONTENT_HANDSHAKE && first.epoch == 0 && body.len() >= 12 {
        // msg_type, message_seq and fragment offset.
        sig.push(body[0]);
        sig.extend_from_slice(&body[4..9]);
    } else {
        sig.extend_from_slice(&(first.len as u16).to_be_bytes());
    }
    sig
}

/// An unprotected epoch 0 record holding one handshake fragment, as anyone on
/// the path could forge it.
pub fn plaintext_handshake(
    record_seq: u64,
    msg_type: u8,
    length: u32,
    message_seq: u16,
    offset: u32,
    fragment: &[u8],
) -> Vec<u8> {
    let mut body = vec![msg_type];
    body.extend_from_slice(&length.to_be_bytes()[1..]);
    body.extend_from_slice(&message_seq.to_be_bytes());
    body.extend_from_slice(&offset.to_be_bytes()[1..]);
    body.extend_from_slice(&(fragment.len() as u32).to_be_bytes()[1..]);
    body.extend_from_slice(fragment);

    let mut d = vec![CONTENT_HANDSHAKE, 0xFE, 0xFD, 0, 0];
    d.extend_from_slice(&record_seq.to_be_bytes()[2..]);
    d.extend_from_slice(&(body.len() as u16).to_be_bytes());
    d.extend_from_slice(&body);
    d
}

/// Drain everything an endpoint has to say until it only has a timeout left.
pub fn drain(endpoint: &mut Endpoint, events: &mut Vec<Event>) -> Vec<Vec<u8>> {
    let mut datagrams = Vec::new();
    loop {
        match endpoint.poll_output() {
            Output::Transmit(t) => datagrams.push(t.contents),
            Output::Event(e) => events.push(e),
            Output::Timeout(_) => break,
        }
    }
    datagrams
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// A client and a server endpoint talking to each other.
pub struct Pair {
    pub now: Instant,
    pub client: Endpoint,
    pub server: Endpoint,
    pub server_cookies: Arc<CookieSecrets>,
    pub client_events: Vec<Event>,
    pub server_events: Vec<Event>,
}

impl Pair {
    pub fn new() -> Self {
        Self::with(config(), config(), psk("client"), psk("server"))
    }

    pub fn with(
        client_config: Config,
        server_config: Config,
        client_credentials: Arc<dyn Credentials>,
        server_credentials: Arc<dyn Credentials>,
    ) -> Self {
        init_log();
        let now = Instant::now();

        let client = Endpoint::new(
            Arc::new(client_config),
            client_credentials,
            CookieSecrets::new(Duration::from_secs(3600), now),
        );

        let server_cookies = CookieSecrets::new(Duration::from_secs(3600), now);
        let server = Endpoint::new(
            Arc::new(server_config),
            server_credentials,
            server_cookies.clone(),
        );

        Pair {
            now,
            client,
            server,
            server_cookies,
            client_events: Vec::new(),
            server_events: Vec::new(),
        }
    }

    pub fn connect(&mut self) -> SessionId {
        self.client.connect(server_addr(), self.now).unwrap()
    }

    pub fn drain_client(&mut self) -> Vec<Vec<u8>> {
        drain(&mut self.client, &mut self.client_events)
    }

    pub fn drain_server(&mut self) -> Vec<Vec<u8>> {
        drain(&mut self.server, &mut self.server_events)
    }

    pub fn to_server(&mut self, datagram: &[u8]) {
        self.server.accept_incoming(datagram, client_addr(), self.now);
    }

    pub fn to_client(&mut self, datagram: &[u8]) {
        self.client.accept_incoming(datagram, server_addr(), self.now);
    }

    /// One exchange in each direction. `keep` decides which datagrams arrive.
    ///
    /// Returns whether any datagram was produced.
    pub fn pump_with(&mut self, keep: &mut impl FnMut(Side, &[u8]) -> bool) -> bool {
        let from_client = self.drain_client();
        let mut moved = !from_client.is_empty();
        for d in &from_client {
            if keep(Side::Client, d) {
                self.to_server(d);
            }
        }

        let from_server = self.drain_server();
        moved |= !from_server.is_empty();
        for d in &from_server {
            if keep(Side::Server, d) {
                self.to_client(d);
            }
        }

        moved
    }

    /// Exchange datagrams until both sides are quiet.
    pub fn run(&mut self) {
        for _ in 0..50 {
            if !self.pump_with(&mut |_, _| true) {
                return;
            }
        }
        panic!("endpoints never went quiet");
    }

    /// Move time forward and fire due timers on both sides.
    pub fn advance(&mut self, d: Duration) {
        self.now += d;
        self.client.handle_timeout(self.now);
        self.server.handle_timeout(self.now);
    }

    /// Connect and run the handshake to completion.
    pub fn handshake(&mut self) -> (SessionId, SessionId) {
        let client_id = self.connect();
        self.run();

        assert!(
            established(&self.client_events).contains(&client_id),
            "client not established: {:?}",
            self.client_events
        );

        let server_id = self
            .server
            .session_for(client_addr())
            .expect("server session");
        assert!(
            established(&self.server_events).contains(&server_id),
            "server not established: {:?}",
            self.server_events
        );

        (client_id, server_id)
    }
}

pub fn established(events: &[Event]) -> Vec<SessionId> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::HandshakeEstablished(id) => Some(*id),
            _ => None,
        })
        .collect()
}

pub fn failures(events: &[Event]) -> Vec<datagram_tls::Error> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::HandshakeFailed(_, err) => Some(err.clone()),
            _ => None,
        })
        .collect()
}

pub fn received(events: &[Event]) -> Vec<Vec<u8>> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::DataReceived(_, data) => Some(data.clone()),
            _ => None,
        })
        .collect()
}

/// A suite that negotiates like the AES-128 suite but leaves records in the
/// clear, so tests can tamper with encrypted-epoch payloads.
#[derive(Debug)]
pub struct CleartextSuite;

pub static CLEARTEXT_SUITE: CleartextSuite = CleartextSuite;

#[derive(Debug)]
struct CleartextCipher;

impl RecordCipher for CleartextCipher {
    fn encrypt(&mut self, _header: &RecordHeader, _payload: &mut Buf) -> Result<(), String> {
        Ok(())
    }

    fn decrypt(&mut self, _header: &RecordHeader, _payload: &mut Buf) -> Result<(), String> {
        Ok(())
    }
}

impl CipherSuite for CleartextSuite {
    fn id(&self) -> CipherSuiteId {
        CipherSuiteId(0xFF00)
    }

    fn priority(&self) -> u8 {
        1
    }

    fn record_overhead(&self) -> usize {
        0
    }

    fn hash(&self, data: &[u8], out: &mut Buf) {
        ECDHE_PSK_AES128_GCM_SHA256.hash(data, out)
    }

    fn prf(
        &self,
        secret: &[u8],
        label: &str,
        seed: &[u8],
        out: &mut Buf,
        len: usize,
    ) -> Result<(), String> {
        ECDHE_PSK_AES128_GCM_SHA256.prf(secret, label, seed, out, len)
    }

    fn derive_keys(
        &self,
        master_secret: &[u8],
        client_random: &[u8; 32],
        server_random: &[u8; 32],
        epoch: u16,
    ) -> Result<KeyMaterial, String> {
        ECDHE_PSK_AES128_GCM_SHA256.derive_keys(master_secret, client_random, server_random, epoch)
    }

    fn create_cipher(&self, _keys: &DirectionKeys) -> Result<Box<dyn RecordCipher>, String> {
        Ok(Box::new(CleartextCipher))
    }

    fn start_key_exchange(&self) -> Result<Box<dyn ActiveKeyExchange>, String> {
        ECDHE_PSK_AES128_GCM_SHA256.start_key_exchange()
    }
}
