#![no_main]

//! Fuzz target for inbound datagram handling.
//!
//! Feeds arbitrary bytes to a server endpoint (stateless hello path, then an
//! existing session) and to a client that is waiting for the server's
//! answer. Looks for panics, not errors.

use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use datagram_tls::{Config, CookieSecrets, Endpoint, Output, PskCredentials};

fn endpoint(now: Instant, cookie_exchange: bool) -> Endpoint {
    let config = Config::builder()
        .rng_seed(0)
        .cookie_exchange(cookie_exchange)
        .build()
        .unwrap();
    let credentials = Arc::new(PskCredentials::new(b"fuzz", b"fuzz key"));
    let cookies = CookieSecrets::new(Duration::from_secs(60), now);
    Endpoint::new(Arc::new(config), credentials, cookies)
}

fn drain(endpoint: &mut Endpoint) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    // Bounded in case something never goes quiet.
    for _ in 0..100 {
        match endpoint.poll_output() {
            Output::Transmit(t) => out.push(t.contents),
            Output::Event(_) => continue,
            Output::Timeout(_) => break,
        }
    }
    out
}

fuzz_target!(|data: &[u8]| {
    let now = Instant::now();
    let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let server_addr: SocketAddr = "127.0.0.1:4433".parse().unwrap();

    // Server, unknown peer.
    {
        let mut server = endpoint(now, true);
        server.accept_incoming(data, peer, now);
        drain(&mut server);
    }

    // Server with a session for the peer: a real hello first, then the
    // fuzz input.
    {
        let mut client = endpoint(now, false);
        let mut server = endpoint(now, false);

        if client.connect(server_addr, now).is_ok() {
            for d in drain(&mut client) {
                server.accept_incoming(&d, peer, now);
            }
            drain(&mut server);
            server.accept_incoming(data, peer, now);
            drain(&mut server);
            server.handle_timeout(now + Duration::from_secs(2));
            drain(&mut server);
        }
    }

    // Client waiting for the server's answer.
    {
        let mut client = endpoint(now, true);
        if client.connect(server_addr, now).is_ok() {
            drain(&mut client);
            client.accept_incoming(data, server_addr, now);
            drain(&mut client);
        }
    }
});
