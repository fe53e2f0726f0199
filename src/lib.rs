//! Sans-IO DTLS 1.2 endpoint.
//!
//! An [`Endpoint`] multiplexes many sessions behind one datagram socket. It
//! never performs IO and never reads the clock: the caller feeds datagrams
//! with [`Endpoint::accept_incoming`], drives timers with
//! [`Endpoint::handle_timeout`] and pulls datagrams, events and the next
//! wakeup through [`Endpoint::poll_output`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::{Duration, Instant};
//! use datagram_tls::{Config, CookieSecrets, Endpoint, Output, PskCredentials};
//!
//! let now = Instant::now();
//! let config = Arc::new(Config::default());
//! let credentials = Arc::new(PskCredentials::new(b"client", b"shared key"));
//! let cookies = CookieSecrets::new(Duration::from_secs(60), now);
//!
//! let mut endpoint = Endpoint::new(config, credentials, cookies);
//! let id = endpoint.connect("127.0.0.1:4433".parse().unwrap(), now).unwrap();
//!
//! loop {
//!     match endpoint.poll_output() {
//!         Output::Transmit(t) => { /* socket.send_to(&t.contents, t.destination) */ }
//!         Output::Event(e) => println!("{:?}", e),
//!         Output::Timeout(_) => break,
//!     }
//! }
//! # let _ = id;
//! ```
//!
//! Cipher suites are pluggable through the traits in [`crypto`]. The built-in
//! suites combine an ephemeral ECDH exchange with a pre-shared key from the
//! [`Credentials`] collaborator and protect records with AES-GCM.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod buffer;
mod client;
mod config;
mod cookie;
mod credentials;
mod endpoint;
mod engine;
mod error;
mod event;
mod flight;
mod message;
mod reassembly;
mod record_layer;
mod rng;
mod server;
mod session;
mod time_tricks;
mod timer;
mod window;

pub mod crypto;

pub use buffer::Buf;
pub use config::{Config, ConfigBuilder};
pub use cookie::CookieSecrets;
pub use credentials::{Credentials, PskCredentials};
pub use endpoint::{Endpoint, Transport};
pub use error::Error;
pub use event::{CloseReason, Event, Output, Transmit};
pub use message::AlertDescription;
pub use session::{HandshakeState, SessionId};
