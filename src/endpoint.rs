//! The session registry.
//!
//! An [`Endpoint`] owns every session in a slab. Sessions are addressed by a
//! generation-checked [`SessionId`], so a stale handle (for instance a timer
//! entry of a removed session) never reaches a newer session in the same
//! slot. Inbound datagrams are routed by source address; datagrams from an
//! unknown address go through the stateless hello check first.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use slab::Slab;

use crate::cookie::CookieSecrets;
use crate::credentials::Credentials;
use crate::crypto::CipherSuiteId;
use crate::event::{Event, Output, Transmit};
use crate::server::{handle_unsolicited, Unsolicited};
use crate::session::{HandshakeState, Session, SessionId};
use crate::{Buf, Config, Error};

/// Sends datagrams on behalf of [`Endpoint::flush`].
pub trait Transport {
    fn send(&mut self, destination: SocketAddr, datagram: &[u8]) -> io::Result<()>;
}

struct Slot {
    session: Session,

    /// The instant this slot is currently registered for in the timer heap.
    scheduled: Option<Instant>,

    /// Whether the slot is in the ready queue.
    queued: bool,
}

/// A DTLS endpoint: many sessions behind one transport address.
pub struct Endpoint {
    config: Arc<Config>,
    credentials: Arc<dyn Credentials>,
    cookies: Arc<CookieSecrets>,

    sessions: Slab<Slot>,
    next_generation: u32,
    by_addr: HashMap<SocketAddr, SessionId>,

    /// Lazy timer heap. Entries that no longer match their slot's `scheduled`
    /// are skipped when popped.
    timers: BinaryHeap<Reverse<(Instant, SessionId)>>,

    /// Sessions with datagrams to send.
    ready: VecDeque<SessionId>,

    /// Datagrams not owned by a live session: HelloVerifyRequests and the
    /// last words of removed sessions.
    stray: VecDeque<(SocketAddr, Buf)>,

    events: VecDeque<Event>,
}

impl Endpoint {
    pub fn new(
        config: Arc<Config>,
        credentials: Arc<dyn Credentials>,
        cookies: Arc<CookieSecrets>,
    ) -> Self {
        Endpoint {
            config,
            credentials,
            cookies,
            sessions: Slab::new(),
            next_generation: 0,
            by_addr: HashMap::new(),
            timers: BinaryHeap::new(),
            ready: VecDeque::new(),
            stray: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a handshake with `peer` using the endpoint's config.
    pub fn connect(&mut self, peer: SocketAddr, now: Instant) -> Result<SessionId, Error> {
        let config = self.config.clone();
        self.connect_with(peer, config, now)
    }

    /// Start a handshake with `peer` using a session specific config.
    pub fn connect_with(
        &mut self,
        peer: SocketAddr,
        config: Arc<Config>,
        now: Instant,
    ) -> Result<SessionId, Error> {
        if self.by_addr.contains_key(&peer) {
            return Err(Error::SessionExists(peer));
        }

        if self.sessions.len() >= self.config.max_sessions() {
            return Err(Error::TooManySessions);
        }

        let credentials = self.credentials.clone();
        let generation = self.bump_generation();

        let entry = self.sessions.vacant_entry();
        let id = SessionId::new(entry.key(), generation);
        let session = Session::connect(id, peer, config, credentials, now)?;

        entry.insert(Slot {
            session,
            scheduled: None,
            queued: false,
        });
        self.by_addr.insert(peer, id);

        info!("Connecting to {} ({})", peer, id);
        self.after_op(id);

        Ok(id)
    }

    /// Feed one datagram received from `source`.
    ///
    /// Never fails. Datagrams that do not belong to a session and are not an
    /// acceptable ClientHello are dropped without a trace on the network.
    pub fn accept_incoming(&mut self, datagram: &[u8], source: SocketAddr, now: Instant) {
        if let Some(&id) = self.by_addr.get(&source) {
            if let Some(slot) = self.slot_mut(id) {
                slot.session.handle_datagram(datagram, now);
                self.after_op(id);
                return;
            }
        }

        if !self.config.accept_incoming() {
            trace!("Drop datagram from unknown peer {}", source);
            return;
        }

        let unsolicited = handle_unsolicited(
            datagram,
            source,
            &self.cookies,
            self.config.cookie_exchange(),
        );

        match unsolicited {
            None => {}

            Some(Unsolicited::Challenge(datagram)) => {
                self.stray.push_back((source, datagram));
            }

            Some(Unsolicited::Accept(accepted)) => {
                if self.sessions.len() >= self.config.max_sessions() {
                    warn!("Session limit reached, drop ClientHello from {}", source);
                    return;
                }

                let config = self.config.clone();
                let credentials = self.credentials.clone();
                let generation = self.bump_generation();

                let entry = self.sessions.vacant_entry();
                let id = SessionId::new(entry.key(), generation);
                let session = Session::accept(id, source, config, credentials, accepted, now);

                entry.insert(Slot {
                    session,
                    scheduled: None,
                    queued: false,
                });
                self.by_addr.insert(source, id);

                info!("Accepted ClientHello from {} ({})", source, id);
                self.after_op(id);
            }
        }
    }

    pub fn send_application_data(&mut self, id: SessionId, data: &[u8]) -> Result<(), Error> {
        let slot = self.slot_mut(id).ok_or(Error::UnknownSession)?;
        let result = slot.session.send_application_data(data);
        self.after_op(id);
        result
    }

    /// Send close_notify and remove the session.
    pub fn close(&mut self, id: SessionId) -> Result<(), Error> {
        let slot = self.slot_mut(id).ok_or(Error::UnknownSession)?;
        slot.session.close();
        self.after_op(id);
        Ok(())
    }

    /// Move our write direction to a fresh epoch.
    pub fn rekey(&mut self, id: SessionId) -> Result<(), Error> {
        let slot = self.slot_mut(id).ok_or(Error::UnknownSession)?;
        let result = slot.session.rekey();
        self.after_op(id);
        result
    }

    /// Drop the retained previous-epoch read keys now.
    pub fn close_previous_epoch(&mut self, id: SessionId) -> Result<(), Error> {
        let slot = self.slot_mut(id).ok_or(Error::UnknownSession)?;
        if slot.session.close_previous_epoch() {
            debug!("Closed previous epoch of {}", id);
        }
        self.after_op(id);
        Ok(())
    }

    /// Drive timers. Rotates the cookie secret when due.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.cookies.rotate_if_due(now) {
            debug!("Rotated cookie secret");
        }

        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.timers.peek().copied() {
            if at > now {
                break;
            }
            self.timers.pop();

            let Some(slot) = self.slot_mut(id) else {
                continue;
            };
            if slot.scheduled != Some(at) {
                continue;
            }
            slot.scheduled = None;
            due.push(id);
        }

        for id in due {
            if let Some(slot) = self.slot_mut(id) {
                slot.session.handle_timeout(now);
                self.after_op(id);
            }
        }
    }

    /// Next thing for the caller to act on.
    ///
    /// Datagrams come first, then events. When both are drained this returns
    /// the instant of the next timer.
    pub fn poll_output(&mut self) -> Output {
        if let Some(transmit) = self.poll_transmit() {
            return Output::Transmit(transmit);
        }

        if let Some(event) = self.events.pop_front() {
            return Output::Event(event);
        }

        Output::Timeout(self.poll_timeout())
    }

    /// Send every pending datagram through `transport`.
    pub fn flush(&mut self, transport: &mut impl Transport) -> io::Result<()> {
        while let Some(transmit) = self.poll_transmit() {
            transport.send(transmit.destination, &transmit.contents)?;
        }
        Ok(())
    }

    pub fn state(&self, id: SessionId) -> Option<HandshakeState> {
        self.slot(id).map(|s| s.session.state())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_for(&self, peer: SocketAddr) -> Option<SessionId> {
        self.by_addr.get(&peer).copied()
    }

    pub fn peer_address(&self, id: SessionId) -> Option<SocketAddr> {
        self.slot(id).map(|s| s.session.peer())
    }

    pub fn negotiated_suite(&self, id: SessionId) -> Option<CipherSuiteId> {
        self.slot(id).and_then(|s| s.session.negotiated_suite())
    }

    fn bump_generation(&mut self) -> u32 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }

    fn slot(&self, id: SessionId) -> Option<&Slot> {
        self.sessions
            .get(id.index())
            .filter(|s| s.session.id().generation() == id.generation())
    }

    fn slot_mut(&mut self, id: SessionId) -> Option<&mut Slot> {
        self.sessions
            .get_mut(id.index())
            .filter(|s| s.session.id().generation() == id.generation())
    }

    /// Collect what a session produced, then reap it or reschedule it.
    fn after_op(&mut self, id: SessionId) {
        let Some(slot) = self
            .sessions
            .get_mut(id.index())
            .filter(|s| s.session.id().generation() == id.generation())
        else {
            return;
        };

        while let Some(event) = slot.session.poll_event() {
            self.events.push_back(event);
        }

        if slot.session.is_terminal() {
            let mut slot = self.sessions.remove(id.index());
            let peer = slot.session.peer();

            while let Some(datagram) = slot.session.poll_datagram() {
                self.stray.push_back((peer, datagram));
            }

            if self.by_addr.get(&peer) == Some(&id) {
                self.by_addr.remove(&peer);
            }

            debug!("Removed {} ({:?})", id, slot.session.state());
            return;
        }

        if slot.session.has_datagrams() && !slot.queued {
            slot.queued = true;
            self.ready.push_back(id);
        }

        let next = slot.session.poll_timeout();
        if next != slot.scheduled {
            slot.scheduled = next;
            if let Some(at) = next {
                self.timers.push(Reverse((at, id)));
            }
        }
    }

    fn poll_transmit(&mut self) -> Option<Transmit> {
        if let Some((destination, datagram)) = self.stray.pop_front() {
            return Some(Transmit {
                destination,
                contents: datagram.into_vec(),
            });
        }

        while let Some(id) = self.ready.pop_front() {
            let Some(slot) = self.slot_mut(id) else {
                continue;
            };

            let Some(datagram) = slot.session.poll_datagram() else {
                slot.queued = false;
                continue;
            };

            let destination = slot.session.peer();
            let more = slot.session.has_datagrams();
            if !more {
                slot.queued = false;
            }
            if more {
                self.ready.push_front(id);
            }

            return Some(Transmit {
                destination,
                contents: datagram.into_vec(),
            });
        }

        None
    }

    fn poll_timeout(&mut self) -> Instant {
        let rotation = self.cookies.next_rotation();

        while let Some(Reverse((at, id))) = self.timers.peek().copied() {
            let live = self.slot(id).is_some_and(|s| s.scheduled == Some(at));
            if live {
                return at.min(rotation);
            }
            self.timers.pop();
        }

        rotation
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("sessions", &self.sessions.len())
            .field("pending_transmit", &self.stray.len())
            .field("pending_events", &self.events.len())
            .finish_non_exhaustive()
    }
}
