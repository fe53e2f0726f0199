use std::fmt;
use std::time::Duration;

use crate::crypto::{rust_crypto, CipherSuite};
use crate::window::MAX_WINDOW;
use crate::Error;

/// Smallest MTU we can fit a handshake fragment and AEAD overhead into.
const MIN_MTU: usize = 256;

/// DTLS endpoint configuration.
///
/// Built with [`Config::builder()`] and shared between endpoints and sessions
/// as an `Arc<Config>`.
#[derive(Clone)]
pub struct Config {
    mtu: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_max_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
    previous_epoch_lifetime: Option<Duration>,
    replay_window: u32,
    cookie_exchange: bool,
    accept_incoming: bool,
    max_sessions: usize,
    cipher_suites: Vec<&'static dyn CipherSuite>,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            mtu: 1150,
            max_queue_tx: 32,
            flight_start_rto: Duration::from_secs(1),
            flight_max_rto: Duration::from_secs(60),
            flight_retries: 4,
            handshake_timeout: Duration::from_secs(40),
            idle_timeout: Some(Duration::from_secs(300)),
            previous_epoch_lifetime: Some(Duration::from_secs(30)),
            replay_window: MAX_WINDOW,
            cookie_exchange: true,
            accept_incoming: true,
            max_sessions: 1024,
            cipher_suites: None,
            rng_seed: None,
        }
    }

    /// Max transmission unit.
    ///
    /// The largest size UDP packets we will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Max amount of outgoing datagrams to buffer per session.
    #[inline(always)]
    pub fn max_queue_tx(&self) -> usize {
        self.max_queue_tx
    }

    /// Time of first retry.
    ///
    /// Every flight restarts with this value.
    /// Doubled for every retry with a ±0.25s jitter.
    #[inline(always)]
    pub fn flight_start_rto(&self) -> Duration {
        self.flight_start_rto
    }

    /// Ceiling for the doubled retransmission timeout.
    #[inline(always)]
    pub fn flight_max_rto(&self) -> Duration {
        self.flight_max_rto
    }

    /// Max number of retries per flight.
    #[inline(always)]
    pub fn flight_retries(&self) -> usize {
        self.flight_retries
    }

    /// Timeout for the entire handshake, regardless of flights.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Established sessions without authenticated inbound traffic for this
    /// long are closed.
    #[inline(always)]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// How long read keys of the previous epoch are retained after the peer
    /// switched epoch. `None` keeps them until explicitly closed.
    #[inline(always)]
    pub fn previous_epoch_lifetime(&self) -> Option<Duration> {
        self.previous_epoch_lifetime
    }

    /// Size of the anti-replay window in records.
    #[inline(always)]
    pub fn replay_window(&self) -> u32 {
        self.replay_window
    }

    /// Whether the server demands a HelloVerifyRequest round trip.
    #[inline(always)]
    pub fn cookie_exchange(&self) -> bool {
        self.cookie_exchange
    }

    /// Whether unknown peers may start a handshake with this endpoint.
    #[inline(always)]
    pub fn accept_incoming(&self) -> bool {
        self.accept_incoming
    }

    /// Max number of sessions held by an endpoint.
    #[inline(always)]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Cipher suites in priority order, most preferred first.
    #[inline(always)]
    pub fn cipher_suites(&self) -> &[&'static dyn CipherSuite] {
        &self.cipher_suites
    }

    /// Seed for non-cryptographic randomness (retransmission jitter).
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suites: Vec<_> = self.cipher_suites.iter().map(|s| s.id()).collect();
        f.debug_struct("Config")
            .field("mtu", &self.mtu)
            .field("flight_start_rto", &self.flight_start_rto)
            .field("flight_max_rto", &self.flight_max_rto)
            .field("flight_retries", &self.flight_retries)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("cookie_exchange", &self.cookie_exchange)
            .field("cipher_suites", &suites)
            .finish_non_exhaustive()
    }
}

/// Builder for DTLS configuration.
pub struct ConfigBuilder {
    mtu: usize,
    max_queue_tx: usize,
    flight_start_rto: Duration,
    flight_max_rto: Duration,
    flight_retries: usize,
    handshake_timeout: Duration,
    idle_timeout: Option<Duration>,
    previous_epoch_lifetime: Option<Duration>,
    replay_window: u32,
    cookie_exchange: bool,
    accept_incoming: bool,
    max_sessions: usize,
    cipher_suites: Option<Vec<&'static dyn CipherSuite>>,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the max transmission unit (MTU).
    ///
    /// The largest size UDP packets we will produce.
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the max amount of outgoing datagrams to buffer per session.
    ///
    /// Defaults to 32.
    pub fn max_queue_tx(mut self, max_queue_tx: usize) -> Self {
        self.max_queue_tx = max_queue_tx;
        self
    }

    /// Set the time of first retry.
    ///
    /// Every flight restarts with this value.
    /// Defaults to 1 second.
    pub fn flight_start_rto(mut self, rto: Duration) -> Self {
        self.flight_start_rto = rto;
        self
    }

    /// Set the ceiling for the doubled retransmission timeout.
    ///
    /// Defaults to 60 seconds.
    pub fn flight_max_rto(mut self, rto: Duration) -> Self {
        self.flight_max_rto = rto;
        self
    }

    /// Set the max number of retries per flight.
    ///
    /// Defaults to 4.
    pub fn flight_retries(mut self, retries: usize) -> Self {
        self.flight_retries = retries;
        self
    }

    /// Set the timeout for the entire handshake, regardless of flights.
    ///
    /// Defaults to 40 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the idle timeout for established sessions.
    ///
    /// Defaults to 5 minutes.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set how long previous-epoch read keys are retained.
    ///
    /// Defaults to 30 seconds.
    pub fn previous_epoch_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.previous_epoch_lifetime = lifetime;
        self
    }

    /// Set the anti-replay window size (1 to 64 records).
    ///
    /// Defaults to 64.
    pub fn replay_window(mut self, size: u32) -> Self {
        self.replay_window = size;
        self
    }

    /// Set whether servers demand a cookie round trip.
    ///
    /// Defaults to true.
    pub fn cookie_exchange(mut self, enabled: bool) -> Self {
        self.cookie_exchange = enabled;
        self
    }

    /// Set whether unknown peers may start a handshake.
    ///
    /// Defaults to true.
    pub fn accept_incoming(mut self, accept: bool) -> Self {
        self.accept_incoming = accept;
        self
    }

    /// Set the max number of sessions per endpoint.
    ///
    /// Defaults to 1024.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the cipher suites to offer and accept.
    ///
    /// They are ordered by [`CipherSuite::priority`], highest first. Suites with
    /// equal priority keep the given order.
    /// Defaults to all built-in suites.
    pub fn cipher_suites(mut self, suites: &[&'static dyn CipherSuite]) -> Self {
        self.cipher_suites = Some(suites.to_vec());
        self
    }

    /// Seed the generator used for retransmission jitter.
    ///
    /// Defaults to unseeded.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::ConfigError` if a value is out of range.
    pub fn build(self) -> Result<Config, Error> {
        if self.mtu < MIN_MTU {
            return Err(Error::ConfigError(format!(
                "mtu {} is below minimum {}",
                self.mtu, MIN_MTU
            )));
        }

        if self.replay_window == 0 || self.replay_window > MAX_WINDOW {
            return Err(Error::ConfigError(format!(
                "replay window {} not in 1..={}",
                self.replay_window, MAX_WINDOW
            )));
        }

        if self.flight_max_rto < self.flight_start_rto {
            return Err(Error::ConfigError(
                "flight_max_rto is less than flight_start_rto".into(),
            ));
        }

        if self.max_queue_tx == 0 {
            return Err(Error::ConfigError("max_queue_tx must be > 0".into()));
        }

        let mut cipher_suites = self
            .cipher_suites
            .unwrap_or_else(|| rust_crypto::ALL_CIPHER_SUITES.to_vec());

        if cipher_suites.is_empty() {
            return Err(Error::ConfigError("no cipher suites".into()));
        }

        // Stable sort keeps caller order for equal priorities.
        cipher_suites.sort_by_key(|s| std::cmp::Reverse(s.priority()));

        Ok(Config {
            mtu: self.mtu,
            max_queue_tx: self.max_queue_tx,
            flight_start_rto: self.flight_start_rto,
            flight_max_rto: self.flight_max_rto,
            flight_retries: self.flight_retries,
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
            previous_epoch_lifetime: self.previous_epoch_lifetime,
            replay_window: self.replay_window,
            cookie_exchange: self.cookie_exchange,
            accept_incoming: self.accept_incoming,
            max_sessions: self.max_sessions,
            cipher_suites,
            rng_seed: self.rng_seed,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
