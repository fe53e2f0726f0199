//! Flight bookkeeping.
//!
//! A flight is every record we sent in one handshake step. It is stored as
//! plaintext fragments tagged with the epoch they went out in, so a resend
//! reproduces the same handshake framing under the same protection. Only the
//! record sequence numbers differ.
//!
//! Flights are acknowledged implicitly: the first peer handshake fragment with
//! a message_seq at or beyond the one we expected when sending retires the
//! flight.

use std::time::Instant;

use crate::buffer::{Buf, BufferPool};
use crate::message::ContentType;
use crate::rng::SeededRng;
use crate::timer::ExponentialBackoff;
use crate::{Config, Error};

#[derive(Debug)]
pub(crate) struct Entry {
    pub content_type: ContentType,
    pub epoch: u16,
    pub fragment: Buf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timeout {
    Disabled,
    Armed(Instant),
}

#[derive(Debug)]
pub(crate) struct FlightManager {
    /// Number of the current flight, for logging.
    number: u8,

    /// The records of the current flight.
    entries: Vec<Entry>,

    /// Peer message_seq that proves delivery. `None` for a final flight.
    retire_at: Option<u16>,

    backoff: ExponentialBackoff,
    timeout: Timeout,

    /// Seedable random number generator for deterministic jitter.
    rng: SeededRng,
}

impl FlightManager {
    pub fn new(config: &Config) -> Self {
        let mut rng = SeededRng::new(config.rng_seed());
        let backoff = ExponentialBackoff::new(
            config.flight_start_rto(),
            config.flight_max_rto(),
            config.flight_retries(),
            &mut rng,
        );

        FlightManager {
            number: 0,
            entries: Vec::new(),
            retire_at: None,
            backoff,
            timeout: Timeout::Disabled,
            rng,
        }
    }

    /// Start a new flight, dropping the stored records of the previous one.
    ///
    /// With `retire_at` set the flight is retransmitted until a peer fragment
    /// with that message_seq (or later) arrives. Without, it is the final
    /// flight: never retransmitted on a timer, only on duplicates.
    pub fn begin(
        &mut self,
        number: u8,
        retire_at: Option<u16>,
        now: Instant,
        pool: &mut BufferPool,
    ) {
        debug!("Begin flight {}", number);
        self.number = number;
        self.clear(pool);
        self.retire_at = retire_at;
        self.backoff.reset(&mut self.rng);

        self.timeout = if retire_at.is_some() {
            let rto = self.backoff.rto();
            trace!("Flight {} timeout in {:.03}s", number, rto.as_secs_f32());
            Timeout::Armed(now + rto)
        } else {
            Timeout::Disabled
        };
    }

    /// Remember a record for resends.
    pub fn save(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        fragment: &[u8],
        pool: &mut BufferPool,
    ) {
        let mut copy = pool.pop();
        copy.extend_from_slice(fragment);
        self.entries.push(Entry {
            content_type,
            epoch,
            fragment: copy,
        });
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A peer handshake fragment with `message_seq` arrived.
    ///
    /// Returns whether this retired the flight.
    pub fn on_peer_progressed(&mut self, message_seq: u16, pool: &mut BufferPool) -> bool {
        let Some(retire_at) = self.retire_at else {
            return false;
        };

        if message_seq < retire_at {
            return false;
        }

        debug!(
            "Flight {} retired by peer message_seq {}",
            self.number, message_seq
        );
        self.retire_at = None;
        self.timeout = Timeout::Disabled;
        self.clear(pool);
        true
    }

    /// When the retransmission timer fires, if armed.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.timeout {
            Timeout::Armed(t) => Some(t),
            Timeout::Disabled => None,
        }
    }

    /// Drive the retransmission timer.
    ///
    /// Returns `Ok(true)` when the flight is due for a resend. Fails once the
    /// retry budget is spent.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<bool, Error> {
        let Timeout::Armed(at) = self.timeout else {
            return Ok(false);
        };

        if now < at {
            return Ok(false);
        }

        if !self.backoff.can_retry() {
            debug!(
                "Flight {} gave up after {} attempts",
                self.number,
                self.backoff.attempts()
            );
            self.timeout = Timeout::Disabled;
            return Err(Error::Timeout("flight"));
        }

        self.backoff.attempt(&mut self.rng);
        let rto = self.backoff.rto();
        debug!(
            "Re-arm flight {} timeout due to resend in {:.03}s",
            self.number,
            rto.as_secs_f32()
        );
        self.timeout = Timeout::Armed(now + rto);
        Ok(true)
    }

    /// Stop retransmitting. Stored records are kept for duplicate-triggered
    /// resends.
    pub fn stop_timer(&mut self) {
        self.timeout = Timeout::Disabled;
    }

    fn clear(&mut self, pool: &mut BufferPool) {
        for entry in self.entries.drain(..) {
            pool.push(entry.fragment);
        }
    }
}
