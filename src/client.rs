// DTLS Client Handshake Flow:
//
// 1. Client sends ClientHello without cookie
// 2. Server may answer with a stateless HelloVerifyRequest
//    - Client resends ClientHello with the cookie and the same random
// 3. Server sends ServerHello, Certificate, ServerKeyExchange, ServerHelloDone
// 4. Client sends Certificate, ClientKeyExchange, ChangeCipherSpec, Finished
// 5. Server sends ChangeCipherSpec, Finished
// 6. Handshake complete, application data can flow

use std::time::Instant;

use zeroize::Zeroizing;

use crate::buffer::Buf;
use crate::credentials::Credentials;
use crate::engine::Engine;
use crate::message::{Body, Certificate, ClientHello, Cookie, Finished, KeyExchange};
use crate::message::{MessageType, ProtocolVersion, Random};
use crate::reassembly::Message;
use crate::Error;

/// Client side of the handshake.
#[derive(Debug)]
pub(crate) struct ClientHandshake {
    state: ClientState,

    /// Random unique data (with gmt timestamp). Kept across the cookie exchange.
    random: Random,

    /// Cookie from the HelloVerifyRequest, empty until one arrives.
    cookie: Cookie,

    /// Server random. Set by ServerHello.
    server_random: Option<Random>,

    /// Server's key exchange message. Set by ServerKeyExchange.
    server_key_exchange: Option<Vec<u8>>,
}

/// Current state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientState {
    /// Nothing sent yet.
    Start,

    /// Await HelloVerifyRequest or ServerHello.
    AwaitServerHello,

    /// Await the server's identity.
    AwaitCertificate,

    AwaitServerKeyExchange,
    AwaitServerHelloDone,

    /// Our Finished is sent. Await the server's.
    AwaitFinished,

    /// Send and receive encrypted data.
    Running,
}

impl ClientHandshake {
    pub fn new(now: Instant) -> Self {
        ClientHandshake {
            state: ClientState::Start,
            random: Random::new(now),
            cookie: Cookie::empty(),
            server_random: None,
            server_key_exchange: None,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether a HelloVerifyRequest was answered.
    pub fn has_cookie(&self) -> bool {
        !self.cookie.is_empty()
    }

    /// Send the first flight.
    pub fn start(&mut self, engine: &mut Engine, now: Instant) -> Result<(), Error> {
        debug!("Sending ClientHello");
        engine.flight_begin(1, true, now);
        self.send_client_hello(engine)?;
        self.state = ClientState::AwaitServerHello;
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
            (ClientState::AwaitServerHello, Body::HelloVerifyRequest(hvr)) => {
                if hvr.cookie.is_empty() {
                    return Err(Error::UnexpectedMessage(
                        "HelloVerifyRequest without cookie".into(),
                    ));
                }
                debug!("Got HelloVerifyRequest, resending ClientHello with cookie");

                // The HelloVerifyRequest is not part of the transcript, and
                // neither is the ClientHello it answered.
                self.cookie = hvr.cookie;
                engine.reset_for_hello_verify_request();

                engine.flight_begin(3, true, now);
                self.send_client_hello(engine)?;
                Ok(())
            }

            (ClientState::AwaitServerHello, Body::ServerHello(sh)) => {
                if sh.server_version != ProtocolVersion::DTLS1_2 {
                    return Err(Error::UnexpectedMessage(format!(
                        "Unsupported server version: {:?}",
                        sh.server_version
                    )));
                }

                let Some(suite) = engine
                    .config()
                    .cipher_suites()
                    .iter()
                    .copied()
                    .find(|s| s.id() == sh.cipher_suite)
                else {
                    return Err(Error::UnexpectedMessage(format!(
                        "Server selected a cipher suite we did not offer: {:?}",
                        sh.cipher_suite
                    )));
                };

                debug!("Server selected cipher suite: {:?}", suite.id());
                engine.set_cipher_suite(suite);
                self.server_random = Some(sh.random);

                engine.transcript_append(message);
                self.state = ClientState::AwaitCertificate;
                Ok(())
            }

            (ClientState::AwaitCertificate, Body::Certificate(cert)) => {
                trace!("Server identity chain has {} entries", cert.chain.len());
                credentials
                    .verify_peer(&cert.chain)
                    .map_err(Error::CertificateError)?;

                engine.transcript_append(message);
                self.state = ClientState::AwaitServerKeyExchange;
                Ok(())
            }

            (ClientState::AwaitServerKeyExchange, Body::ServerKeyExchange(kx)) => {
                self.server_key_exchange = Some(kx.public_key.to_vec());

                engine.transcript_append(message);
                self.state = ClientState::AwaitServerHelloDone;
                Ok(())
            }

            (ClientState::AwaitServerHelloDone, Body::ServerHelloDone) => {
                engine.transcript_append(message);
                self.send_client_flight(engine, credentials, now)?;
                self.state = ClientState::AwaitFinished;
                Ok(())
            }

            (ClientState::AwaitFinished, Body::Finished(finished)) => {
                if message.epoch == 0 {
                    return Err(Error::UnexpectedMessage(
                        "Finished received without encryption".into(),
                    ));
                }

                // Verify against the transcript up to, not including, this message.
                engine.verify_peer_finished(finished.verify_data)?;
                engine.transcript_append(message);

                engine.flight_stop_timer();
                engine.set_established()?;
                self.state = ClientState::Running;
                Ok(())
            }

            (state, body) => Err(Error::UnexpectedMessage(format!(
                "{:?} in state {:?}",
                body.msg_type(),
                state
            ))),
        }
    }

    fn send_client_hello(&self, engine: &mut Engine) -> Result<(), Error> {
        let hello = ClientHello::new(
            ProtocolVersion::DTLS1_2,
            self.random,
            self.cookie,
            engine.config().cipher_suites().iter().map(|s| s.id()),
        );

        engine.create_handshake(MessageType::ClientHello, |body, _| {
            hello.serialize(body);
            Ok(())
        })
    }

    fn send_client_flight(
        &mut self,
        engine: &mut Engine,
        credentials: &dyn Credentials,
        now: Instant,
    ) -> Result<(), Error> {
        debug!("Sending client key exchange flight");

        let server_random = self
            .server_random
            .ok_or_else(|| Error::UnexpectedMessage("No server random".into()))?;
        let peer_public = self
            .server_key_exchange
            .take()
            .ok_or_else(|| Error::UnexpectedMessage("No server key exchange".into()))?;
        let suite = engine
            .cipher_suite()
            .ok_or_else(|| Error::UnexpectedMessage("No cipher suite selected".into()))?;

        let kx = suite.start_key_exchange().map_err(Error::CryptoError)?;
        let mut public = Buf::new();
        kx.build_message(&mut public);

        let mut shared = Zeroizing::new(Buf::new());
        kx.consume_peer_message(&peer_public, &mut shared)
            .map_err(Error::CryptoError)?;

        engine.set_randoms(self.random.to_bytes(), server_random.to_bytes());
        engine.derive_master_secret(&shared, credentials.pre_shared_key())?;
        engine.install_write_keys(1)?;
        engine.install_read_keys(1)?;

        engine.flight_begin(5, true, now);

        let chain = credentials.certificate_chain();
        engine.create_handshake(MessageType::Certificate, |body, _| {
            Certificate::new(chain.iter().map(|c| c.as_slice())).serialize(body);
            Ok(())
        })?;

        engine.create_handshake(MessageType::ClientKeyExchange, |body, _| {
            KeyExchange::new(&public).serialize(body);
            Ok(())
        })?;

        engine.send_change_cipher_spec(true)?;

        engine.create_handshake(MessageType::Finished, |body, engine| {
            let verify_data = engine.verify_data(true)?;
            Finished::new(&verify_data).serialize(body);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crypto::CipherSuiteId;
    use crate::message::{HelloVerifyRequest, ServerHello};
    use crate::{Config, PskCredentials};

    fn engine() -> Engine {
        Engine::new(Arc::new(Config::builder().rng_seed(1).build().unwrap()), true, 0)
    }

    fn credentials() -> PskCredentials {
        PskCredentials::new(b"client", b"key")
    }

    fn message(msg_type: MessageType, message_seq: u16, epoch: u16, body: Buf) -> Message {
        Message {
            msg_type,
            message_seq,
            epoch,
            body,
        }
    }

    fn started(now: Instant) -> (ClientHandshake, Engine) {
        let mut e = engine();
        let mut c = ClientHandshake::new(now);
        c.start(&mut e, now).unwrap();
        while e.pop_datagram().is_some() {}
        (c, e)
    }

    fn random() -> Random {
        Random {
            gmt_unix_time: 1,
            random_bytes: [4; 28],
        }
    }

    #[test]
    fn hello_verify_request_without_cookie_is_rejected() {
        let now = Instant::now();
        let (mut c, mut e) = started(now);

        let mut body = Buf::new();
        HelloVerifyRequest::new(ProtocolVersion::DTLS1_0, Cookie::empty()).serialize(&mut body);
        let m = message(MessageType::HelloVerifyRequest, 0, 0, body);

        let err = c.handle(&m, &mut e, &credentials(), now).unwrap_err();
        assert_eq!(err, Error::ParseError(nom::error::ErrorKind::LengthValue));
        assert!(!c.has_cookie());
        assert!(e.pop_datagram().is_none());
    }

    #[test]
    fn hello_verify_request_resends_hello_with_cookie() {
        let now = Instant::now();
        let (mut c, mut e) = started(now);

        let cookie = Cookie::try_new(&[9; 16]).unwrap();
        let mut body = Buf::new();
        HelloVerifyRequest::new(ProtocolVersion::DTLS1_0, cookie).serialize(&mut body);
        let m = message(MessageType::HelloVerifyRequest, 0, 0, body);

        c.handle(&m, &mut e, &credentials(), now).unwrap();
        assert!(c.has_cookie());
        assert_eq!(c.state(), ClientState::AwaitServerHello);
        assert!(e.pop_datagram().is_some());
        assert_eq!(e.next_handshake_seq(), 2);
    }

    #[test]
    fn suite_never_offered_is_rejected() {
        let now = Instant::now();
        let (mut c, mut e) = started(now);

        let mut body = Buf::new();
        ServerHello::new(random(), CipherSuiteId(0x1234)).serialize(&mut body);
        let m = message(MessageType::ServerHello, 1, 0, body);

        let err = c.handle(&m, &mut e, &credentials(), now).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
        assert!(e.cipher_suite().is_none());
    }

    #[test]
    fn plaintext_finished_is_rejected() {
        let now = Instant::now();
        let (mut c, mut e) = started(now);
        c.state = ClientState::AwaitFinished;

        let mut body = Buf::new();
        Finished::new(&[0; 12]).serialize(&mut body);
        let m = message(MessageType::Finished, 5, 0, body);

        let err = c.handle(&m, &mut e, &credentials(), now).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
        assert_eq!(c.state(), ClientState::AwaitFinished);
    }

    #[test]
    fn message_out_of_order_is_rejected() {
        let now = Instant::now();
        let (mut c, mut e) = started(now);

        let m = message(MessageType::ServerHelloDone, 1, 0, Buf::new());

        let err = c.handle(&m, &mut e, &credentials(), now).unwrap_err();
        assert!(matches!(err, Error::UnexpectedMessage(_)));
        assert_eq!(c.state(), ClientState::AwaitServerHello);
    }
}
