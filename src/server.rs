// DTLS Server Handshake Flow:
//
// 1. Client sends ClientHello (maybe without cookie)
// 2. If cookie missing/invalid, the endpoint answers with a HelloVerifyRequest
//    without creating any state
//    - Client resends ClientHello with cookie
// 3. Server sends ServerHello, Certificate, ServerKeyExchange, ServerHelloDone
// 4. Client sends Certificate, ClientKeyExchange, ChangeCipherSpec, Finished
// 5. Server verifies Finished, then sends ChangeCipherSpec, Finished
// 6. Handshake complete, application data can flow

use std::net::SocketAddr;
use std::time::Instant;

use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::cookie::CookieSecrets;
use crate::credentials::Credentials;
use crate::crypto::{negotiate, ActiveKeyExchange};
use crate::engine::Engine;
use crate::message::{Body, Certificate, ClientHello, ContentType, DTLSRecord, Finished};
use crate::message::{Handshake, Header, HelloVerifyRequest, KeyExchange, MessageType};
use crate::message::{ProtocolVersion, Random, ServerHello};
use crate::reassembly::Message;
use crate::Error;

/// Outcome of a datagram from an address without a session.
#[derive(Debug)]
pub(crate) enum Unsolicited {
    /// Send this HelloVerifyRequest datagram back. Nothing is remembered.
    Challenge(Buf),

    /// The hello is acceptable. Create a session for it.
    Accept(AcceptedHello),
}

/// A ClientHello that passed the cookie check.
#[derive(Debug)]
pub(crate) struct AcceptedHello {
    pub hello: ClientHello,
    pub message: Message,
}

/// Judge an initial ClientHello without allocating session state.
///
/// The hello must be the first record of the datagram, in epoch 0, and
/// unfragmented. Anything else returns `None` and is dropped.
pub(crate) fn handle_unsolicited(
    datagram: &[u8],
    peer: SocketAddr,
    cookies: &CookieSecrets,
    cookie_exchange: bool,
) -> Option<Unsolicited> {
    let (_, record) = DTLSRecord::parse(datagram).ok()?;

    if record.content_type != ContentType::Handshake
        || record.sequence.epoch != 0
        || !record.version.is_known()
    {
        trace!("Drop unsolicited {:?} record from {}", record.content_type, peer);
        return None;
    }

    let (_, handshake) = Handshake::parse(record.fragment).ok()?;
    let header = handshake.header;

    if header.msg_type != MessageType::ClientHello || header.is_fragment() {
        debug!("Drop unsolicited {:?} from {}", header.msg_type, peer);
        return None;
    }

    let hello = match Body::parse(handshake.fragment, MessageType::ClientHello) {
        Ok((_, Body::ClientHello(hello))) => hello,
        _ => {
            debug!("Drop malformed ClientHello from {}", peer);
            return None;
        }
    };

    if hello.client_version != ProtocolVersion::DTLS1_2 {
        debug!(
            "Drop ClientHello with version {:?} from {}",
            hello.client_version, peer
        );
        return None;
    }

    if cookie_exchange && !cookies.verify(peer, &hello) {
        let cookie = match cookies.issue(peer, &hello) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to issue cookie: {}", e);
                return None;
            }
        };

        debug!("Invalid/missing cookie from {}; sending HelloVerifyRequest", peer);

        let mut body = Buf::new();
        HelloVerifyRequest::new(ProtocolVersion::DTLS1_0, cookie).serialize(&mut body);

        let mut fragment = Buf::new();
        Header {
            msg_type: MessageType::HelloVerifyRequest,
            length: body.len() as u32,
            message_seq: header.message_seq,
            fragment_offset: 0,
            fragment_length: body.len() as u32,
        }
        .serialize(&mut fragment);
        fragment.extend_from_slice(&body);

        // Echo the record sequence so the client can match the answer.
        let mut datagram = Buf::new();
        DTLSRecord::serialize_header(
            ContentType::Handshake,
            ProtocolVersion::DTLS1_0,
            record.sequence,
            fragment.len(),
            &mut datagram,
        );
        datagram.extend_from_slice(&fragment);

        return Some(Unsolicited::Challenge(datagram));
    }

    let message = Message {
        msg_type: MessageType::ClientHello,
        message_seq: header.message_seq,
        epoch: 0,
        body: Buf::from_slice(handshake.fragment),
    };

    Some(Unsolicited::Accept(AcceptedHello { hello, message }))
}

/// Server side of the handshake, from the accepted ClientHello on.
pub(crate) struct ServerHandshake {
    state: ServerState,

    /// Random unique data (with gmt timestamp).
    random: Random,

    /// Our ephemeral key exchange, until the client's share arrives.
    key_exchange: Option<Box<dyn ActiveKeyExchange>>,
}

/// Current state of the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerState {
    /// Nothing sent yet.
    Start,

    /// Await the client's identity.
    AwaitCertificate,

    AwaitClientKeyExchange,

    /// Await the client's Finished.
    AwaitFinished,

    /// Send and receive encrypted data.
    Running,
}

impl ServerHandshake {
    pub fn new(now: Instant) -> Self {
        ServerHandshake {
            state: ServerState::Start,
            random: Random::new(now),
            key_exchange: None,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Negotiate and send the ServerHello flight.
    pub fn start(
        &mut self,
        accepted: &AcceptedHello,
        engine: &mut Engine,
        credentials: &dyn Credentials,
        now: Instant,
    ) -> Result<(), Error> {
        let hello = &accepted.hello;

        let Some(suite) = negotiate(engine.config().cipher_suites(), &hello.cipher_suites) else {
            return Err(Error::NoCommonCipherSuite);
        };
        debug!("Selected cipher suite: {:?}", suite.id());

        engine.set_cipher_suite(suite);
        engine.set_randoms(hello.random.to_bytes(), self.random.to_bytes());

        // Our numbering continues from the hello we answer.
        engine.set_next_handshake_seq(accepted.message.message_seq);
        engine.transcript_append(&accepted.message);

        let key_exchange = suite.start_key_exchange().map_err(Error::CryptoError)?;

        debug!("Sending ServerHello flight");
        engine.flight_begin(4, true, now);

        let server_hello = ServerHello::new(self.random, suite.id());
        engine.create_handshake(MessageType::ServerHello, |body, _| {
            server_hello.serialize(body);
            Ok(())
        })?;

        let chain = credentials.certificate_chain();
        engine.create_handshake(MessageType::Certificate, |body, _| {
            Certificate::new(chain.iter().map(|c| c.as_slice())).serialize(body);
            Ok(())
        })?;

        let mut public = Buf::new();
        key_exchange.build_message(&mut public);
        engine.create_handshake(MessageType::ServerKeyExchange, |body, _| {
            KeyExchange::new(&public).serialize(body);
            Ok(())
        })?;

        engine.create_handshake(MessageType::ServerHelloDone, |_, _| Ok(()))?;

        self.key_exchange = Some(key_exchange);
        self.state = ServerState::AwaitCertificate;
        Ok(())
    }

    pub fn handle(
        &mut self,
        message: &Message,
        engine: &mut Engine,
        credentials: &dyn Credentials,
        now: Instant,
    ) -> Result<(), Error> {
        let body = message.parse_body()?;

        match (self.state, body) {
            (ServerState::AwaitCertificate, Body::Certificate(cert)) => {
                trace!("Client identity chain has {} entries", cert.chain.len());
                credentials
                    .verify_peer(&cert.chain)
                    .map_err(Error::CertificateError)?;

                engine.transcript_append(message);
                self.state = ServerState::AwaitClientKeyExchange;
                Ok(())
            }

            (ServerState::AwaitClientKeyExchange, Body::ClientKeyExchange(kx)) => {
                let key_exchange = self
                    .key_exchange
                    .take()
                    .ok_or_else(|| Error::UnexpectedMessage("No key exchange in progress".into()))?;

                let mut shared = Zeroizing::new(Buf::new());
                key_exchange
                    .consume_peer_message(kx.public_key, &mut shared)
                    .map_err(Error::CryptoError)?;

                engine.derive_master_secret(&shared, credentials.pre_shared_key())?;
                engine.install_read_keys(1)?;
                engine.install_write_keys(1)?;

                engine.transcript_append(message);
                self.state = ServerState::AwaitFinished;
                Ok(())
            }

            (ServerState::AwaitFinished, Body::Finished(finished)) => {
                if message.epoch == 0 {
                    return Err(Error::UnexpectedMessage(
                        "Finished received without encryption".into(),
                    ));
                }

                engine.verify_peer_finished(finished.verify_data)?;
                engine.transcript_append(message);

                debug!("Sending final flight");
                engine.flight_begin(6, false, now);
                engine.send_change_cipher_spec(true)?;
                engine.create_handshake(MessageType::Finished, |body, engine| {
                    let verify_data = engine.verify_data(false)?;
                    Finished::new(&verify_data).serialize(body);
                    Ok(())
                })?;

                engine.set_established()?;
                self.state = ServerState::Running;
                Ok(())
            }

            (state, body) => Err(Error::UnexpectedMessage(format!(
                "{:?} in state {:?}",
                body.msg_type(),
                state
            ))),
        }
    }
}

impl std::fmt::Debug for ServerHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandshake")
            .field("state", &self.state)
            .field("key_exchange", &self.key_exchange.is_some())
            .finish()
    }
}
