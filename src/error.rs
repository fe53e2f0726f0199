use std::net::SocketAddr;

use thiserror::Error;

use crate::message::AlertDescription;

/// Errors surfaced by the DTLS engine.
///
/// Transport noise (malformed records, unknown epochs, replays and failed
/// authentication) never produces an `Error`. Those records are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Some parser needs more data.
    #[error("parse incomplete")]
    ParseIncomplete,

    /// A parser rejected its input.
    #[error("parse error: {0:?}")]
    ParseError(nom::error::ErrorKind),

    /// A handshake message arrived that is not allowed in the current state.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Verification of the peer failed (Finished mismatch and similar).
    #[error("security error: {0}")]
    SecurityError(String),

    /// A cryptographic operation failed.
    #[error("crypto error: {0}")]
    CryptoError(String),

    /// The credential collaborator rejected the peer identity.
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// Client and server share no cipher suite.
    #[error("no common cipher suite")]
    NoCommonCipherSuite,

    /// Overlapping handshake fragments disagree on their bytes.
    #[error("inconsistent fragments for message_seq {0}")]
    FragmentMismatch(u16),

    /// Retransmission budget or handshake deadline exhausted.
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// The peer sent a fatal alert.
    #[error("fatal alert received: {0:?}")]
    AlertReceived(AlertDescription),

    /// Too many datagrams waiting to be polled.
    #[error("transmit queue full")]
    TransmitQueueFull,

    /// The session has not completed its handshake or is no longer usable.
    #[error("session is not established")]
    NotEstablished,

    /// The session handle is stale or never existed.
    #[error("unknown session")]
    UnknownSession,

    /// The endpoint reached its configured session limit.
    #[error("session limit reached")]
    TooManySessions,

    /// There is already a session for the peer address.
    #[error("session already exists for {0}")]
    SessionExists(SocketAddr),

    /// Neither sequence number nor epoch can advance any further.
    #[error("sequence number space exhausted")]
    SequenceExhausted,

    /// Application data does not fit in one record.
    #[error("payload of {0} bytes exceeds record limit")]
    PayloadTooLarge(usize),

    /// The configuration is invalid.
    #[error("config error: {0}")]
    ConfigError(String),
}

impl Error {
    /// The alert to send to the peer when this error terminates a session.
    ///
    /// `None` means the error is not reported on the wire.
    pub(crate) fn alert(&self) -> Option<AlertDescription> {
        let d = match self {
            Error::ParseIncomplete | Error::ParseError(_) => AlertDescription::DecodeError,
            Error::UnexpectedMessage(_) => AlertDescription::UnexpectedMessage,
            Error::SecurityError(_) => AlertDescription::DecryptError,
            Error::CertificateError(_) => AlertDescription::BadCertificate,
            Error::NoCommonCipherSuite => AlertDescription::InsufficientSecurity,
            Error::FragmentMismatch(_) => AlertDescription::IllegalParameter,
            Error::CryptoError(_) | Error::SequenceExhausted => AlertDescription::InternalError,
            Error::Timeout(_)
            | Error::AlertReceived(_)
            | Error::TransmitQueueFull
            | Error::NotEstablished
            | Error::UnknownSession
            | Error::TooManySessions
            | Error::SessionExists(_)
            | Error::PayloadTooLarge(_)
            | Error::ConfigError(_) => return None,
        };
        Some(d)
    }

    /// Whether this is a timeout-kind failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    fn from(value: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        match value {
            nom::Err::Incomplete(_) => Error::ParseIncomplete,
            nom::Err::Error(e) | nom::Err::Failure(e) => Error::ParseError(e.code),
        }
    }
}
