//! One DTLS session: a handshake role driving an [`Engine`].
//!
//! Every entry point runs to completion on the session alone. The endpoint
//! only reads back events and datagrams afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::client::{ClientHandshake, ClientState};
use crate::credentials::Credentials;
use crate::crypto::CipherSuiteId;
use crate::engine::{Engine, Inbound};
use crate::event::{CloseReason, Event};
use crate::message::{Alert, AlertDescription, AlertLevel, DTLSRecord};
use crate::record_layer::MAX_PLAINTEXT;
use crate::server::{AcceptedHello, ServerHandshake, ServerState};
use crate::{Buf, Config, Error};

/// Handle to a session in an [`Endpoint`](crate::Endpoint).
///
/// Handles are generation checked: a handle to a removed session stays
/// invalid even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    index: u32,
    generation: u32,
}

impl SessionId {
    pub(crate) fn new(index: usize, generation: u32) -> Self {
        SessionId {
            index: index as u32,
            generation,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}/{}", self.index, self.generation)
    }
}

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing sent or received yet.
    Idle,
    /// Waiting for the peer's hello.
    AwaitingHello,
    /// The client answered a HelloVerifyRequest and waits for the ServerHello.
    CookieExchange,
    /// Hellos exchanged; identity and key exchange messages in progress.
    AwaitingKeyExchange,
    /// Keys are derived; waiting for the peer's Finished.
    AwaitingFinished,
    /// Handshake complete.
    Established,
    /// Ended by a protocol violation, fatal alert or timeout.
    Failed,
    /// Ended by close_notify, local close or idle timeout.
    Closed,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeState::Failed | HandshakeState::Closed)
    }
}

enum Role {
    Client(ClientHandshake),
    Server(ServerHandshake),
}

pub(crate) struct Session {
    id: SessionId,
    peer: SocketAddr,
    engine: Engine,
    role: Role,
    credentials: Arc<dyn Credentials>,

    /// Events not yet collected by the endpoint.
    events: VecDeque<Event>,

    /// Set once the session ended.
    ended: Option<HandshakeState>,

    established: bool,
    handshake_deadline: Instant,
    idle_timeout: Option<Duration>,
    last_rx: Instant,
}

impl Session {
    /// Start a client session and send the first flight.
    pub fn connect(
        id: SessionId,
        peer: SocketAddr,
        config: Arc<Config>,
        credentials: Arc<dyn Credentials>,
        now: Instant,
    ) -> Result<Session, Error> {
        let mut client = ClientHandshake::new(now);
        let mut engine = Engine::new(config, true, 0);
        client.start(&mut engine, now)?;

        Ok(Session::new(id, peer, engine, Role::Client(client), credentials, now))
    }

    /// Create a server session for a hello that passed the cookie check and
    /// answer it.
    ///
    /// If the hello cannot be served the session is returned already failed,
    /// with the alert queued.
    pub fn accept(
        id: SessionId,
        peer: SocketAddr,
        config: Arc<Config>,
        credentials: Arc<dyn Credentials>,
        accepted: AcceptedHello,
        now: Instant,
    ) -> Session {
        let peer_seq = accepted.message.message_seq.wrapping_add(1);
        let engine = Engine::new(config, false, peer_seq);
        let server = ServerHandshake::new(now);

        let mut session = Session::new(id, peer, engine, Role::Server(server), credentials, now);

        let result = match &mut session.role {
            Role::Server(server) => server.start(
                &accepted,
                &mut session.engine,
                &*session.credentials,
                now,
            ),
            Role::Client(_) => Ok(()),
        };

        session.engine.push_buffer(accepted.message.body);

        if let Err(e) = result {
            session.fail(e);
        }

        session
    }

    fn new(
        id: SessionId,
        peer: SocketAddr,
        engine: Engine,
        role: Role,
        credentials: Arc<dyn Credentials>,
        now: Instant,
    ) -> Session {
        let handshake_deadline = now + engine.config().handshake_timeout();
        let idle_timeout = engine.config().idle_timeout();

        Session {
            id,
            peer,
            engine,
            role,
            credentials,
            events: VecDeque::new(),
            ended: None,
            established: false,
            handshake_deadline,
            idle_timeout,
            last_rx: now,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> HandshakeState {
        if let Some(ended) = self.ended {
            return ended;
        }

        match &self.role {
            Role::Client(c) => match c.state() {
                ClientState::Start => HandshakeState::Idle,
                ClientState::AwaitServerHello if c.has_cookie() => HandshakeState::CookieExchange,
                ClientState::AwaitServerHello => HandshakeState::AwaitingHello,
                ClientState::AwaitCertificate
                | ClientState::AwaitServerKeyExchange
                | ClientState::AwaitServerHelloDone => HandshakeState::AwaitingKeyExchange,
                ClientState::AwaitFinished => HandshakeState::AwaitingFinished,
                ClientState::Running => HandshakeState::Established,
            },
            Role::Server(s) => match s.state() {
                ServerState::Start => HandshakeState::Idle,
                ServerState::AwaitCertificate | ServerState::AwaitClientKeyExchange => {
                    HandshakeState::AwaitingKeyExchange
                }
                ServerState::AwaitFinished => HandshakeState::AwaitingFinished,
                ServerState::Running => HandshakeState::Established,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.ended.is_some()
    }

    pub fn is_established(&self) -> bool {
        self.established && self.ended.is_none()
    }

    pub fn negotiated_suite(&self) -> Option<CipherSuiteId> {
        self.engine.cipher_suite().map(|s| s.id())
    }

    /// Handle one datagram from the peer.
    ///
    /// Records are handled one at a time, and the handshake sees each
    /// completed message before the next record is unprotected. That way keys
    /// derived from a ClientKeyExchange are in place for the ChangeCipherSpec
    /// and Finished packed after it.
    pub fn handle_datagram(&mut self, datagram: &[u8], now: Instant) {
        if self.is_terminal() {
            return;
        }

        self.engine.begin_datagram();

        let mut rest = datagram;
        while !rest.is_empty() {
            let record = match DTLSRecord::parse(rest) {
                Ok((r, record)) => {
                    rest = r;
                    record
                }
                Err(_) => {
                    trace!("Drop malformed record from {}", self.peer);
                    break;
                }
            };

            match self.engine.handle_record(&record, now) {
                Ok(true) => self.last_rx = now,
                Ok(false) => {}
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }

            if let Err(e) = self.process_inbound(now) {
                self.fail(e);
                return;
            }

            if self.is_terminal() {
                return;
            }
        }
    }

    fn process_inbound(&mut self, now: Instant) -> Result<(), Error> {
        while let Some(inbound) = self.engine.next_inbound() {
            match inbound {
                Inbound::Handshake(message) => {
                    if self.established {
                        debug!("Ignore {:?} after handshake", message.msg_type);
                        self.engine.push_buffer(message.body);
                        continue;
                    }

                    let result = match &mut self.role {
                        Role::Client(c) => {
                            c.handle(&message, &mut self.engine, &*self.credentials, now)
                        }
                        Role::Server(s) => {
                            s.handle(&message, &mut self.engine, &*self.credentials, now)
                        }
                    };
                    self.engine.push_buffer(message.body);
                    result?;

                    if self.state() == HandshakeState::Established {
                        info!("Handshake established with {}", self.peer);
                        self.established = true;
                        self.events.push_back(Event::HandshakeEstablished(self.id));
                    }
                }

                Inbound::Alert(alert) => {
                    self.handle_alert(alert);
                    if self.is_terminal() {
                        return Ok(());
                    }
                }

                Inbound::ApplicationData(data) => {
                    if self.established {
                        trace!("Received {} bytes of application data", data.len());
                        self.events
                            .push_back(Event::DataReceived(self.id, data.into_vec()));
                    } else {
                        debug!("Drop application data before handshake completion");
                        self.engine.push_buffer(data);
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_alert(&mut self, alert: Alert) {
        match (alert.level, alert.description) {
            (_, AlertDescription::CloseNotify) => {
                if self.established {
                    info!("Peer {} closed the session", self.peer);
                    self.engine.send_alert(Alert::close_notify());
                    self.end(HandshakeState::Closed, CloseReason::PeerClosed);
                } else {
                    self.fail(Error::AlertReceived(AlertDescription::CloseNotify));
                }
            }
            (AlertLevel::Fatal, description) => {
                self.fail(Error::AlertReceived(description));
            }
            (_, description) => {
                debug!("Ignore warning alert: {:?}", description);
            }
        }
    }

    /// End the session because of `error`, telling the peer if the error has
    /// an alert.
    pub fn fail(&mut self, error: Error) {
        if self.is_terminal() {
            return;
        }

        if let Some(description) = error.alert() {
            self.engine.send_alert(Alert::fatal(description));
        }

        self.engine.flight_stop_timer();

        let event = if self.established {
            warn!("Session with {} failed: {}", self.peer, error);
            Event::SessionClosed(self.id, CloseReason::Fatal(error))
        } else {
            warn!("Handshake with {} failed: {}", self.peer, error);
            Event::HandshakeFailed(self.id, error)
        };

        self.ended = Some(HandshakeState::Failed);
        self.events.push_back(event);
    }

    fn end(&mut self, state: HandshakeState, reason: CloseReason) {
        self.engine.flight_stop_timer();
        self.ended = Some(state);
        self.events.push_back(Event::SessionClosed(self.id, reason));
    }

    /// Close locally, sending close_notify.
    pub fn close(&mut self) {
        if self.is_terminal() {
            return;
        }

        info!("Closing session with {}", self.peer);
        self.engine.send_alert(Alert::close_notify());
        self.end(HandshakeState::Closed, CloseReason::Local);
    }

    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if !self.is_established() {
            return Err(Error::NotEstablished);
        }

        if data.len() > MAX_PLAINTEXT {
            return Err(Error::PayloadTooLarge(data.len()));
        }

        match self.engine.send_application_data(data) {
            Ok(()) => Ok(()),
            Err(Error::TransmitQueueFull) => Err(Error::TransmitQueueFull),
            Err(e) => {
                self.fail(e.clone());
                Err(e)
            }
        }
    }

    pub fn rekey(&mut self) -> Result<(), Error> {
        if !self.is_established() {
            return Err(Error::NotEstablished);
        }
        self.engine.rekey()
    }

    pub fn close_previous_epoch(&mut self) -> bool {
        self.engine.close_previous_epoch()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }

        if !self.established && now >= self.handshake_deadline {
            self.fail(Error::Timeout("handshake"));
            return;
        }

        if let Err(e) = self.engine.flight_handle_timeout(now) {
            self.fail(e);
            return;
        }

        if self.idle_deadline().is_some_and(|d| now >= d) {
            info!("Session with {} idle, closing", self.peer);
            self.end(HandshakeState::Closed, CloseReason::IdleTimeout);
            return;
        }

        self.engine.expire_previous_epoch(now);
    }

    fn idle_deadline(&self) -> Option<Instant> {
        if !self.established {
            return None;
        }
        self.idle_timeout.map(|t| self.last_rx + t)
    }

    /// The next instant `handle_timeout` has something to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }

        let handshake = (!self.established).then_some(self.handshake_deadline);

        [
            self.engine.flight_poll_timeout(),
            handshake,
            self.idle_deadline(),
            self.engine.previous_epoch_expiry(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn poll_datagram(&mut self) -> Option<Buf> {
        self.engine.pop_datagram()
    }

    pub fn has_datagrams(&self) -> bool {
        self.engine.has_datagrams()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
