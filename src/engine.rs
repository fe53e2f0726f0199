use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use zeroize::Zeroizing;

use crate::buffer::{Buf, BufferPool};
use crate::crypto::{pre_master_secret, CipherSuite, VERIFY_DATA_LEN};
use crate::flight::FlightManager;
use crate::message::{Alert, AlertLevel, ContentType, DTLSRecord, Handshake, Header};
use crate::message::{MessageType, RECORD_HEADER_LEN};
use crate::reassembly::{Message, Reassembler};
use crate::record_layer::RecordLayer;
use crate::{Config, Error};

/// Handshake header length on the wire.
const HANDSHAKE_HEADER_LEN: usize = 12;

/// Something the handshake or the application needs to look at.
#[derive(Debug)]
pub(crate) enum Inbound {
    Handshake(Message),
    Alert(Alert),
    ApplicationData(Buf),
}

/// Per-session protocol machinery shared by client and server.
pub(crate) struct Engine {
    config: Arc<Config>,

    /// Whether this engine is for a client (true) or server (false)
    is_client: bool,

    /// Pool of buffers
    buffers_free: BufferPool,

    /// Epoch keys, sequence numbers and replay windows.
    records: RecordLayer,

    /// Peer handshake fragments not yet released.
    reassembler: Reassembler,

    /// The flight we are responsible for resending.
    flight: FlightManager,

    /// Complete inbound units, in arrival order.
    queue_rx: VecDeque<Inbound>,

    /// Outgoing datagrams.
    queue_tx: VecDeque<Buf>,

    /// Next handshake message sequence number for sending
    next_handshake_seq: u16,

    /// Handshake messages in transmission order, unfragmented.
    transcript: Buf,

    /// The cipher suite in use. Set by the hello exchange.
    suite: Option<&'static dyn CipherSuite>,

    master_secret: Zeroizing<Buf>,
    client_random: [u8; 32],
    server_random: [u8; 32],

    /// Whether the current datagram already caused a flight resend.
    resent_this_datagram: bool,

    /// Keys for the read epoch after the current one are kept ready.
    established: bool,
}

impl Engine {
    /// `peer_seq` is the first handshake message_seq we expect from the peer.
    pub fn new(config: Arc<Config>, is_client: bool, peer_seq: u16) -> Self {
        let records = RecordLayer::new(config.replay_window(), config.previous_epoch_lifetime());
        let flight = FlightManager::new(&config);

        Engine {
            config,
            is_client,
            buffers_free: BufferPool::default(),
            records,
            reassembler: Reassembler::new(peer_seq),
            flight,
            queue_rx: VecDeque::new(),
            queue_tx: VecDeque::new(),
            next_handshake_seq: 0,
            transcript: Buf::new(),
            suite: None,
            master_secret: Zeroizing::new(Buf::new()),
            client_random: [0; 32],
            server_random: [0; 32],
            resent_this_datagram: false,
            established: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Called before the records of a new datagram are handled.
    pub fn begin_datagram(&mut self) {
        self.resent_this_datagram = false;
    }

    /// Unprotect and dispatch one record.
    ///
    /// Returns whether the record authenticated under epoch keys. Plaintext
    /// epoch 0 records never count. Errors are protocol violations; transport
    /// noise is dropped here.
    pub fn handle_record(&mut self, record: &DTLSRecord, now: Instant) -> Result<bool, Error> {
        let read_epoch = self.records.read_epoch();
        let mut plain = self.buffers_free.pop();

        let Some(content_type) = self.records.unprotect(record, now, &mut plain) else {
            self.buffers_free.push(plain);
            return Ok(false);
        };

        let epoch = record.sequence.epoch;
        trace!("Received {:?} record {}", content_type, record.sequence);

        let result = match content_type {
            ContentType::Handshake => self.handle_handshake(epoch, &plain),

            ContentType::ChangeCipherSpec => {
                if *plain != [1] {
                    debug!("Drop malformed ChangeCipherSpec");
                } else if epoch == self.records.read_epoch() && self.records.has_next_read() {
                    self.records.advance_read_epoch(now);
                } else {
                    trace!("Ignore ChangeCipherSpec in epoch {}", epoch);
                }
                Ok(())
            }

            ContentType::Alert => {
                match Alert::parse(&plain) {
                    Ok((_, alert)) if epoch == 0 && self.records.read_epoch() > 0 => {
                        debug!("Ignore plaintext alert after key change: {:?}", alert);
                    }
                    Ok((_, alert)) => self.queue_rx.push_back(Inbound::Alert(alert)),
                    Err(_) => debug!("Drop malformed alert"),
                }
                Ok(())
            }

            ContentType::ApplicationData => {
                if epoch == 0 {
                    debug!("Drop unprotected application data");
                } else {
                    let mut data = self.buffers_free.pop();
                    data.extend_from_slice(&plain);
                    self.queue_rx.push_back(Inbound::ApplicationData(data));
                }
                Ok(())
            }

            ContentType::Unknown(v) => {
                debug!("Drop record with unknown content type: {}", v);
                Ok(())
            }
        };

        self.buffers_free.push(plain);

        if self.records.read_epoch() != read_epoch && self.established {
            self.prepare_next_read()?;
        }

        result.map(|_| epoch > 0)
    }

    fn handle_handshake(&mut self, epoch: u16, mut input: &[u8]) -> Result<(), Error> {
        let read_epoch = self.records.read_epoch();

        // Once keys for the peer's next epoch exist, everything the peer
        // still has to say in the handshake is protected. Plaintext from here
        // on is either a retransmission or a forgery.
        let plaintext_done = read_epoch > 0 || self.records.has_next_read();

        while !input.is_empty() {
            let (rest, handshake) = match Handshake::parse(input) {
                Ok(v) => v,
                Err(e) => {
                    debug!("Drop malformed handshake fragment: {:?}", e);
                    return Ok(());
                }
            };
            input = rest;

            let seq = handshake.header.message_seq;

            // A repeat of something already released means the peer did not
            // hear our answer. Resend it once per datagram.
            if self.reassembler.is_stale(seq) {
                if !self.resent_this_datagram && !self.flight.is_empty() {
                    self.resent_this_datagram = true;
                    self.flight_resend("dupe triggers resend")?;
                }
                continue;
            }

            if epoch == 0 && plaintext_done {
                debug!(
                    "Drop plaintext {:?} (message_seq {}) after key exchange",
                    handshake.header.msg_type, seq
                );
                continue;
            }

            if !self.reassembler.accepts(seq) {
                debug!("Drop handshake fragment out of window: {}", seq);
                continue;
            }

            let fed = self
                .reassembler
                .feed(&handshake.header, epoch, handshake.fragment);

            let message = match fed {
                Ok(v) => v,
                Err(e) if epoch == read_epoch => return Err(e),
                Err(e) => {
                    debug!("Drop handshake fragment from epoch {}: {}", epoch, e);
                    continue;
                }
            };

            // Only a fragment the reassembler kept counts as progress.
            self.flight.on_peer_progressed(seq, &mut self.buffers_free);

            if let Some(message) = message {
                self.queue_rx.push_back(Inbound::Handshake(message));
            }

            while let Some(message) = self.reassembler.pop_complete() {
                self.queue_rx.push_back(Inbound::Handshake(message));
            }
        }

        Ok(())
    }

    pub fn next_inbound(&mut self) -> Option<Inbound> {
        self.queue_rx.pop_front()
    }

    /// Give a buffer back to the pool.
    pub fn push_buffer(&mut self, buf: Buf) {
        self.buffers_free.push(buf);
    }

    pub fn pop_datagram(&mut self) -> Option<Buf> {
        self.queue_tx.pop_front()
    }

    pub fn has_datagrams(&self) -> bool {
        !self.queue_tx.is_empty()
    }

    /// Start a new outgoing flight.
    ///
    /// A flight that expects an answer is retired by the peer's next message
    /// and retransmitted until then. The final flight only goes out again when
    /// the peer repeats itself.
    pub fn flight_begin(&mut self, number: u8, expects_answer: bool, now: Instant) {
        let retire_at = expects_answer.then(|| self.reassembler.next_seq());
        self.flight
            .begin(number, retire_at, now, &mut self.buffers_free);
    }

    pub fn flight_poll_timeout(&self) -> Option<Instant> {
        self.flight.poll_timeout()
    }

    pub fn flight_stop_timer(&mut self) {
        self.flight.stop_timer();
    }

    pub fn flight_handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        if self.flight.handle_timeout(now)? {
            self.flight_resend("flight timeout")?;
        }
        Ok(())
    }

    fn flight_resend(&mut self, reason: &str) -> Result<(), Error> {
        debug!("Resending flight due to {}", reason);

        // Copy the entries out of self for the duration of the resend.
        let mut entries = Vec::with_capacity(self.flight.entries().len());
        for e in self.flight.entries() {
            entries.push((e.content_type, e.epoch, Buf::from_slice(&e.fragment)));
        }

        for (content_type, epoch, fragment) in entries {
            if !self.records.can_write(epoch) {
                debug!("No keys left for epoch {}, skip resend", epoch);
                continue;
            }
            let result = self.create_record(content_type, epoch, false, |f| {
                f.extend_from_slice(&fragment);
            });

            match result {
                Ok(()) => {}
                // The next timeout or duplicate tries again.
                Err(Error::TransmitQueueFull) => break,
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Create a record in `epoch` and queue it for sending.
    ///
    /// Records are packed into the last datagram while they fit the MTU.
    /// With `save` the plaintext is kept for flight resends.
    pub fn create_record<F>(
        &mut self,
        content_type: ContentType,
        epoch: u16,
        save: bool,
        f: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf),
    {
        let mut fragment = self.buffers_free.pop();
        f(&mut fragment);

        let record_wire_len = RECORD_HEADER_LEN + fragment.len() + self.records.overhead(epoch);
        let mtu = self.config.mtu();

        let can_append = self
            .queue_tx
            .back()
            .map(|b| b.len() + record_wire_len <= mtu)
            .unwrap_or(false);

        if !can_append && self.queue_tx.len() >= self.config.max_queue_tx() {
            warn!(
                "Transmit queue full (max {})",
                self.config.max_queue_tx()
            );
            self.buffers_free.push(fragment);
            return Err(Error::TransmitQueueFull);
        }

        if save {
            self.flight
                .save(content_type, epoch, &fragment, &mut self.buffers_free);
        }

        let mut datagram = if can_append {
            self.queue_tx.pop_back().unwrap_or_default()
        } else {
            self.buffers_free.pop()
        };

        let result = self
            .records
            .protect(epoch, content_type, &mut fragment, &mut datagram);

        if datagram.is_empty() {
            self.buffers_free.push(datagram);
        } else {
            self.queue_tx.push_back(datagram);
        }
        self.buffers_free.push(fragment);

        let sequence = result?;
        trace!("Queued {:?} record {}", content_type, sequence);
        Ok(())
    }

    /// Create a handshake message in the current write epoch, fragmented to
    /// the MTU, and append it to the transcript.
    pub fn create_handshake<F>(&mut self, msg_type: MessageType, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Buf, &mut Self) -> Result<(), Error>,
    {
        let mut body = self.buffers_free.pop();
        f(&mut body, self)?;

        let header = Header {
            msg_type,
            length: body.len() as u32,
            message_seq: self.next_handshake_seq,
            fragment_offset: 0,
            fragment_length: body.len() as u32,
        };

        header.serialize(&mut self.transcript);
        self.transcript.extend_from_slice(&body);

        self.next_handshake_seq = self.next_handshake_seq.wrapping_add(1);

        let epoch = self.records.write_epoch();
        let fixed_overhead =
            RECORD_HEADER_LEN + HANDSHAKE_HEADER_LEN + self.records.overhead(epoch);
        let mtu = self.config.mtu();
        let total_len = body.len();
        let mut offset = 0;

        // At least one record, even for an empty body.
        loop {
            let used = self.queue_tx.back().map(|b| b.len()).unwrap_or(0);
            let available_in_current = mtu.saturating_sub(used);

            let available_for_body = if available_in_current > fixed_overhead {
                available_in_current - fixed_overhead
            } else {
                mtu.saturating_sub(fixed_overhead)
            };

            let chunk_len = (total_len - offset).min(available_for_body);
            let chunk = &body[offset..offset + chunk_len];

            let fragment_header = Header {
                fragment_offset: offset as u32,
                fragment_length: chunk_len as u32,
                ..header
            };

            self.create_record(ContentType::Handshake, epoch, true, |fragment| {
                fragment_header.serialize(fragment);
                fragment.extend_from_slice(chunk);
            })?;

            offset += chunk_len;
            if offset >= total_len {
                break;
            }
        }

        self.buffers_free.push(body);
        Ok(())
    }

    /// Send ChangeCipherSpec and switch to the next write epoch.
    pub fn send_change_cipher_spec(&mut self, save: bool) -> Result<(), Error> {
        let epoch = self.records.write_epoch();
        self.create_record(ContentType::ChangeCipherSpec, epoch, save, |f| f.push(1))?;
        self.records.advance_write_epoch()
    }

    /// Best effort alert in the current write epoch.
    pub fn send_alert(&mut self, alert: Alert) {
        let epoch = self.records.write_epoch();
        let result = self.create_record(ContentType::Alert, epoch, false, |f| alert.serialize(f));
        if let Err(e) = result {
            debug!("Failed to send alert {:?}: {}", alert.description, e);
        } else if alert.level == AlertLevel::Fatal {
            debug!("Sent fatal alert: {:?}", alert.description);
        }
    }

    pub fn send_application_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.records.wants_rekey() {
            debug!("Write sequence numbers running out, rekey");
            self.rekey()?;
        }

        let epoch = self.records.write_epoch();
        self.create_record(ContentType::ApplicationData, epoch, false, |f| {
            f.extend_from_slice(data)
        })
    }

    /// Move our write direction to fresh keys.
    ///
    /// The peer follows either on our ChangeCipherSpec or on the first record
    /// it authenticates in the new epoch.
    pub fn rekey(&mut self) -> Result<(), Error> {
        let Some(next) = self.records.write_epoch().checked_add(1) else {
            return Err(Error::SequenceExhausted);
        };
        self.install_write_keys(next)?;
        self.send_change_cipher_spec(false)
    }

    pub fn next_handshake_seq(&self) -> u16 {
        self.next_handshake_seq
    }

    pub fn set_next_handshake_seq(&mut self, seq: u16) {
        self.next_handshake_seq = seq;
    }

    /// Append a received message to the transcript.
    pub fn transcript_append(&mut self, message: &Message) {
        message.serialize_unfragmented(&mut self.transcript);
    }

    /// The HelloVerifyRequest exchange starts the handshake over: the first
    /// ClientHello is not part of the transcript, and the server's session
    /// restarts record numbering.
    pub fn reset_for_hello_verify_request(&mut self) {
        self.transcript.clear();
        self.records.reset_read_replay();
    }

    pub fn set_cipher_suite(&mut self, suite: &'static dyn CipherSuite) {
        self.suite = Some(suite);
    }

    pub fn cipher_suite(&self) -> Option<&'static dyn CipherSuite> {
        self.suite
    }

    fn suite(&self) -> Result<&'static dyn CipherSuite, Error> {
        self.suite
            .ok_or_else(|| Error::UnexpectedMessage("No cipher suite selected".into()))
    }

    pub fn set_randoms(&mut self, client_random: [u8; 32], server_random: [u8; 32]) {
        self.client_random = client_random;
        self.server_random = server_random;
    }

    /// Mix the key exchange output and the pre-shared key into the master
    /// secret.
    pub fn derive_master_secret(&mut self, shared: &[u8], psk: Option<&[u8]>) -> Result<(), Error> {
        let suite = self.suite()?;

        let mut pre_master = Zeroizing::new(Buf::new());
        pre_master_secret(shared, psk, &mut pre_master);

        suite
            .derive_master_secret(
                &pre_master,
                &self.client_random,
                &self.server_random,
                &mut self.master_secret,
            )
            .map_err(Error::CryptoError)
    }

    /// Derive keys for `epoch` and stage them for our next ChangeCipherSpec.
    pub fn install_write_keys(&mut self, epoch: u16) -> Result<(), Error> {
        let suite = self.suite()?;
        let keys = suite
            .derive_keys(
                &self.master_secret,
                &self.client_random,
                &self.server_random,
                epoch,
            )
            .map_err(Error::CryptoError)?;

        let own = if self.is_client {
            &keys.client_write
        } else {
            &keys.server_write
        };

        let cipher = suite.create_cipher(own).map_err(Error::CryptoError)?;
        self.records.install_next_write(cipher, suite.record_overhead());
        Ok(())
    }

    /// Derive keys for `epoch` and accept peer records in it.
    pub fn install_read_keys(&mut self, epoch: u16) -> Result<(), Error> {
        let suite = self.suite()?;
        let keys = suite
            .derive_keys(
                &self.master_secret,
                &self.client_random,
                &self.server_random,
                epoch,
            )
            .map_err(Error::CryptoError)?;

        let peer = if self.is_client {
            &keys.server_write
        } else {
            &keys.client_write
        };

        let cipher = suite.create_cipher(peer).map_err(Error::CryptoError)?;
        self.records.install_next_read(cipher);
        Ok(())
    }

    fn prepare_next_read(&mut self) -> Result<(), Error> {
        if self.records.has_next_read() {
            return Ok(());
        }
        match self.records.read_epoch().checked_add(1) {
            Some(next) => self.install_read_keys(next),
            None => Ok(()),
        }
    }

    /// Finished verify data over the transcript so far.
    pub fn verify_data(&self, client: bool) -> Result<Buf, Error> {
        let suite = self.suite()?;

        let mut hash = Buf::new();
        suite.hash(&self.transcript, &mut hash);

        let label = if client {
            "client finished"
        } else {
            "server finished"
        };

        let mut out = Buf::new();
        suite
            .prf(&self.master_secret, label, &hash, &mut out, VERIFY_DATA_LEN)
            .map_err(Error::CryptoError)?;
        Ok(out)
    }

    /// Check the peer's Finished against the transcript so far.
    pub fn verify_peer_finished(&self, received: &[u8]) -> Result<(), Error> {
        let expected = self.verify_data(!self.is_client)?;

        let diff = expected.len() ^ received.len();
        let acc = expected
            .iter()
            .zip(received)
            .fold(diff, |acc, (a, b)| acc | (a ^ b) as usize);

        if acc != 0 {
            return Err(Error::SecurityError("Finished verify data mismatch".into()));
        }
        Ok(())
    }

    /// The handshake is done. From now on the keys for the peer's next epoch
    /// are always ready.
    pub fn set_established(&mut self) -> Result<(), Error> {
        self.established = true;
        self.prepare_next_read()
    }

    pub fn read_epoch(&self) -> u16 {
        self.records.read_epoch()
    }

    pub fn write_epoch(&self) -> u16 {
        self.records.write_epoch()
    }

    pub fn close_previous_epoch(&mut self) -> bool {
        self.records.close_previous_epoch()
    }

    pub fn previous_epoch_expiry(&self) -> Option<Instant> {
        self.records.previous_expiry()
    }

    pub fn expire_previous_epoch(&mut self, now: Instant) {
        self.records.expire_previous(now);
    }

    #[cfg(test)]
    pub(crate) fn set_write_sequence(&mut self, seq: u64) {
        self.records.set_write_sequence(seq);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("is_client", &self.is_client)
            .field("records", &self.records)
            .field("reassembler", &self.reassembler)
            .field("flight", &self.flight)
            .field("queue_rx", &self.queue_rx.len())
            .field("queue_tx", &self.queue_tx.len())
            .field("next_handshake_seq", &self.next_handshake_seq)
            .field("suite", &self.suite.map(|s| s.id()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rust_crypto::ECDHE_PSK_AES128_GCM_SHA256;

    fn config(mtu: usize) -> Arc<Config> {
        Arc::new(Config::builder().mtu(mtu).rng_seed(1).build().unwrap())
    }

    fn records_in(datagram: &[u8]) -> Vec<(ContentType, u16, Vec<u8>)> {
        let mut out = Vec::new();
        let mut rest = datagram;
        while !rest.is_empty() {
            let (r, record) = DTLSRecord::parse(rest).unwrap();
            out.push((
                record.content_type,
                record.sequence.epoch,
                record.fragment.to_vec(),
            ));
            rest = r;
        }
        out
    }

    /// Client and server engines sharing a master secret with keys ready for
    /// epoch 1 in both directions.
    fn keyed_pair() -> (Engine, Engine) {
        let mut c = Engine::new(config(1150), true, 0);
        let mut s = Engine::new(config(1150), false, 0);
        for e in [&mut c, &mut s] {
            e.set_cipher_suite(&ECDHE_PSK_AES128_GCM_SHA256);
            e.set_randoms([1; 32], [2; 32]);
            e.derive_master_secret(&[3; 32], Some(b"psk")).unwrap();
            e.install_write_keys(1).unwrap();
            e.install_read_keys(1).unwrap();
        }
        (c, s)
    }

    fn deliver(from: &mut Engine, to: &mut Engine, now: Instant) {
        while let Some(d) = from.pop_datagram() {
            to.begin_datagram();
            let mut rest = &d[..];
            while let Ok((r, record)) = DTLSRecord::parse(rest) {
                to.handle_record(&record, now).unwrap();
                rest = r;
            }
        }
    }

    #[test]
    fn large_message_is_fragmented_to_mtu() {
        let now = Instant::now();
        let mut e = Engine::new(config(300), true, 0);
        e.flight_begin(1, true, now);

        let body: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        e.create_handshake(MessageType::Certificate, |b, _| {
            b.extend_from_slice(&body);
            Ok(())
        })
        .unwrap();

        let mut reassembled = Reassembler::new(0);
        let mut complete = None;
        while let Some(d) = e.pop_datagram() {
            assert!(d.len() <= 300);
            for (ct, _, fragment) in records_in(&d) {
                assert_eq!(ct, ContentType::Handshake);
                let (_, hs) = Handshake::parse(&fragment).unwrap();
                if let Some(m) = reassembled.feed(&hs.header, 0, hs.fragment).unwrap() {
                    complete = Some(m);
                }
            }
        }
        assert_eq!(&*complete.unwrap().body, &body[..]);
    }

    #[test]
    fn empty_message_sends_one_record() {
        let now = Instant::now();
        let mut e = Engine::new(config(1150), false, 0);
        e.flight_begin(4, true, now);
        e.create_handshake(MessageType::ServerHelloDone, |_, _| Ok(()))
            .unwrap();
        let d = e.pop_datagram().unwrap();
        let records = records_in(&d);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].2.len(), HANDSHAKE_HEADER_LEN);
        assert_eq!(e.next_handshake_seq(), 1);
    }

    #[test]
    fn records_pack_into_one_datagram() {
        let now = Instant::now();
        let mut e = Engine::new(config(1150), false, 0);
        e.flight_begin(4, true, now);
        for t in [MessageType::ServerHello, MessageType::ServerHelloDone] {
            e.create_handshake(t, |b, _| {
                b.extend_from_slice(&[0; 40]);
                Ok(())
            })
            .unwrap();
        }
        assert!(e.pop_datagram().is_some());
        assert!(e.pop_datagram().is_none());
    }

    #[test]
    fn resend_is_identical_apart_from_record_sequence() {
        let now = Instant::now();
        let mut e = Engine::new(config(200), true, 0);
        e.flight_begin(1, true, now);
        e.create_handshake(MessageType::ClientHello, |b, _| {
            b.extend_from_slice(&[7; 400]);
            Ok(())
        })
        .unwrap();

        let mut first = Vec::new();
        while let Some(d) = e.pop_datagram() {
            first.extend(records_in(&d));
        }

        let at = e.flight_poll_timeout().unwrap();
        e.flight_handle_timeout(at).unwrap();

        let mut second = Vec::new();
        while let Some(d) = e.pop_datagram() {
            second.extend(records_in(&d));
        }

        assert!(first.len() > 1);
        assert_eq!(first, second);
    }

    #[test]
    fn queue_bound_is_enforced() {
        let c = Arc::new(
            Config::builder()
                .mtu(256)
                .max_queue_tx(2)
                .build()
                .unwrap(),
        );
        let mut e = Engine::new(c, true, 0);
        let big = [0u8; 200];
        e.create_record(ContentType::Handshake, 0, false, |f| f.extend_from_slice(&big))
            .unwrap();
        e.create_record(ContentType::Handshake, 0, false, |f| f.extend_from_slice(&big))
            .unwrap();
        let err = e
            .create_record(ContentType::Handshake, 0, false, |f| f.extend_from_slice(&big))
            .unwrap_err();
        assert_eq!(err, Error::TransmitQueueFull);
    }

    #[test]
    fn change_cipher_spec_switches_both_sides() {
        let now = Instant::now();
        let (mut c, mut s) = keyed_pair();

        c.send_change_cipher_spec(false).unwrap();
        assert_eq!(c.write_epoch(), 1);
        deliver(&mut c, &mut s, now);
        assert_eq!(s.read_epoch(), 1);

        c.send_application_data(b"secret").unwrap();
        deliver(&mut c, &mut s, now);
        match s.next_inbound() {
            Some(Inbound::ApplicationData(d)) => assert_eq!(&*d, b"secret"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn retransmitted_old_ccs_is_ignored() {
        let now = Instant::now();
        let (mut c, mut s) = keyed_pair();

        c.send_change_cipher_spec(false).unwrap();
        let ccs = c.pop_datagram().unwrap();

        for _ in 0..2 {
            s.begin_datagram();
            let (_, record) = DTLSRecord::parse(&ccs).unwrap();
            s.handle_record(&record, now).unwrap();
        }
        s.set_established().unwrap();

        // A later plaintext CCS, as in a retransmitted flight.
        c.records = RecordLayer::new(64, None);
        c.records.set_write_sequence(7);
        c.create_record(ContentType::ChangeCipherSpec, 0, false, |f| f.push(1))
            .unwrap();
        deliver(&mut c, &mut s, now);
        assert_eq!(s.read_epoch(), 1);
    }

    #[test]
    fn rekey_is_followed_without_ccs() {
        let now = Instant::now();
        let (mut c, mut s) = keyed_pair();
        c.send_change_cipher_spec(false).unwrap();
        deliver(&mut c, &mut s, now);
        c.set_established().unwrap();
        s.set_established().unwrap();

        c.rekey().unwrap();
        assert_eq!(c.write_epoch(), 2);
        // Lose the ChangeCipherSpec.
        c.pop_datagram().unwrap();

        c.send_application_data(b"after rekey").unwrap();
        deliver(&mut c, &mut s, now);
        assert_eq!(s.read_epoch(), 2);
        assert!(matches!(s.next_inbound(), Some(Inbound::ApplicationData(_))));
    }

    #[test]
    fn automatic_rekey_near_sequence_limit() {
        let now = Instant::now();
        let (mut c, mut s) = keyed_pair();
        c.send_change_cipher_spec(false).unwrap();
        deliver(&mut c, &mut s, now);
        c.set_established().unwrap();
        s.set_established().unwrap();

        c.set_write_sequence(crate::message::MAX_SEQUENCE - 10);
        c.send_application_data(b"x").unwrap();
        assert_eq!(c.write_epoch(), 2);
        deliver(&mut c, &mut s, now);
        assert_eq!(s.read_epoch(), 2);
    }

    #[test]
    fn finished_verify_data_matches_between_peers() {
        let (mut c, mut s) = keyed_pair();
        for e in [&mut c, &mut s] {
            e.transcript.extend_from_slice(b"same transcript");
        }
        let client_fin = c.verify_data(true).unwrap();
        assert_eq!(client_fin.len(), VERIFY_DATA_LEN);
        assert!(s.verify_peer_finished(&client_fin).is_ok());

        let mut bad = client_fin.clone();
        bad[0] ^= 1;
        assert!(matches!(
            s.verify_peer_finished(&bad),
            Err(Error::SecurityError(_))
        ));
        assert!(s.verify_peer_finished(&client_fin[..11]).is_err());
    }

    #[test]
    fn stale_fragment_triggers_single_resend() {
        let now = Instant::now();
        let mut e = Engine::new(config(1150), false, 1);
        e.flight_begin(4, true, now);
        e.create_handshake(MessageType::ServerHelloDone, |_, _| Ok(()))
            .unwrap();
        e.pop_datagram().unwrap();

        // Two stale fragments in one record.
        let mut frag = Buf::new();
        for _ in 0..2 {
            Header {
                msg_type: MessageType::ClientHello,
                length: 0,
                message_seq: 0,
                fragment_offset: 0,
                fragment_length: 0,
            }
            .serialize(&mut frag);
        }
        let mut d = Buf::new();
        DTLSRecord::serialize_header(
            ContentType::Handshake,
            crate::message::ProtocolVersion::DTLS1_2,
            crate::message::Sequence::new(0, 5),
            frag.len(),
            &mut d,
        );
        d.extend_from_slice(&frag);

        e.begin_datagram();
        let (_, record) = DTLSRecord::parse(&d).unwrap();
        e.handle_record(&record, now).unwrap();

        assert!(e.pop_datagram().is_some());
        assert!(e.pop_datagram().is_none());
    }

    fn plaintext_handshake(record_seq: u64, header: Header, data: &[u8]) -> Buf {
        let mut fragment = Buf::new();
        header.serialize(&mut fragment);
        fragment.extend_from_slice(data);

        let mut d = Buf::new();
        DTLSRecord::serialize_header(
            ContentType::Handshake,
            crate::message::ProtocolVersion::DTLS1_2,
            crate::message::Sequence::new(0, record_seq),
            fragment.len(),
            &mut d,
        );
        d.extend_from_slice(&fragment);
        d
    }

    fn header(msg_type: MessageType, length: u32, seq: u16, offset: u32, len: u32) -> Header {
        Header {
            msg_type,
            length,
            message_seq: seq,
            fragment_offset: offset,
            fragment_length: len,
        }
    }

    fn receive(e: &mut Engine, d: &[u8], now: Instant) -> Result<bool, Error> {
        e.begin_datagram();
        let (_, record) = DTLSRecord::parse(d).unwrap();
        e.handle_record(&record, now)
    }

    #[test]
    fn plaintext_handshake_after_key_exchange_is_dropped() {
        let now = Instant::now();
        let (_, mut s) = keyed_pair();

        // Claims to be far larger than anything we reassemble.
        let huge = plaintext_handshake(
            5000,
            header(MessageType::Finished, 0x10_0000, 0, 0, 0),
            &[],
        );
        assert_eq!(receive(&mut s, &huge, now), Ok(false));

        // Two fragments of one message that disagree.
        let a = plaintext_handshake(5001, header(MessageType::Finished, 8, 0, 0, 4), b"aaaa");
        let b = plaintext_handshake(5002, header(MessageType::Finished, 8, 0, 2, 4), b"bbbb");
        assert_eq!(receive(&mut s, &a, now), Ok(false));
        assert_eq!(receive(&mut s, &b, now), Ok(false));

        // A complete plaintext Finished is not released either.
        let fin = plaintext_handshake(
            5003,
            header(MessageType::Finished, 12, 0, 0, 12),
            &[0; 12],
        );
        assert_eq!(receive(&mut s, &fin, now), Ok(false));

        assert!(s.next_inbound().is_none());
        assert_eq!(s.reassembler.next_seq(), 0);
    }

    #[test]
    fn inconsistent_fragments_before_keys_are_fatal() {
        let now = Instant::now();
        let mut e = Engine::new(config(1150), true, 0);

        let huge = plaintext_handshake(
            1,
            header(MessageType::ServerHello, 0x10_0000, 0, 0, 0),
            &[],
        );
        assert_eq!(
            receive(&mut e, &huge, now),
            Err(Error::ParseError(nom::error::ErrorKind::TooLarge))
        );

        let a = plaintext_handshake(2, header(MessageType::ServerHello, 8, 0, 0, 4), b"aaaa");
        let b = plaintext_handshake(3, header(MessageType::ServerHello, 8, 0, 2, 4), b"bbbb");
        assert_eq!(receive(&mut e, &a, now), Ok(false));
        assert_eq!(receive(&mut e, &b, now), Err(Error::FragmentMismatch(0)));
    }

    #[test]
    fn only_kept_fragments_retire_the_flight() {
        let now = Instant::now();
        let mut e = Engine::new(config(1150), true, 0);
        e.flight_begin(1, true, now);
        e.create_handshake(MessageType::ClientHello, |b, _| {
            b.extend_from_slice(&[1; 40]);
            Ok(())
        })
        .unwrap();
        e.pop_datagram().unwrap();
        assert!(e.flight_poll_timeout().is_some());

        // Far beyond what the reassembler holds on to.
        let ahead = plaintext_handshake(
            1,
            header(MessageType::ServerHelloDone, 0, 200, 0, 0),
            &[],
        );
        assert_eq!(receive(&mut e, &ahead, now), Ok(false));
        assert!(e.flight_poll_timeout().is_some());

        // The first fragment of the answer does.
        let answer = plaintext_handshake(
            2,
            header(MessageType::ServerHello, 8, 0, 0, 4),
            b"abcd",
        );
        assert_eq!(receive(&mut e, &answer, now), Ok(false));
        assert!(e.flight_poll_timeout().is_none());
    }
}
