//! Events for the application.
//!
//! Sessions queue events as they happen; the endpoint hands them out through
//! [`Endpoint::poll_output`](crate::Endpoint::poll_output).

use std::net::SocketAddr;
use std::time::Instant;

use crate::{Error, SessionId};

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed. Application data can flow.
    HandshakeEstablished(SessionId),

    /// The handshake failed. The session is gone.
    HandshakeFailed(SessionId, Error),

    /// Application data from the peer.
    DataReceived(SessionId, Vec<u8>),

    /// The session ended after being created. The session is gone.
    SessionClosed(SessionId, CloseReason),
}

impl Event {
    /// The session this event is about.
    pub fn session(&self) -> SessionId {
        match self {
            Event::HandshakeEstablished(id)
            | Event::HandshakeFailed(id, _)
            | Event::DataReceived(id, _)
            | Event::SessionClosed(id, _) => *id,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// We closed it.
    Local,

    /// The peer sent close_notify.
    PeerClosed,

    /// No authenticated record from the peer within the idle timeout.
    IdleTimeout,

    /// A fatal error, sent or received.
    Fatal(Error),
}

/// What [`Endpoint::poll_output`](crate::Endpoint::poll_output) hands out.
#[derive(Debug)]
pub enum Output {
    /// A datagram to send.
    Transmit(Transmit),

    /// Something happened to a session.
    Event(Event),

    /// Nothing more to do until this instant. Call `handle_timeout` then.
    Timeout(Instant),
}

/// One datagram for the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub destination: SocketAddr,
    pub contents: Vec<u8>,
}
