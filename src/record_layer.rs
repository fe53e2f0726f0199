//! Record protection.
//!
//! Each direction has its own epoch. Outbound, the current and the previous
//! write epoch are kept so a flight spanning a ChangeCipherSpec can be resent
//! under the protection it was first sent with. Inbound, the current read
//! epoch, the previous one (for a grace period) and the next one (once its
//! keys are known) are accepted. Anything else is dropped without a trace on
//! the wire.

use std::time::{Duration, Instant};

use crate::buffer::Buf;
use crate::crypto::{RecordCipher, RecordHeader};
use crate::message::{ContentType, DTLSRecord, ProtocolVersion, Sequence, MAX_SEQUENCE};
use crate::window::ReplayWindow;
use crate::Error;

/// Largest plaintext in one record.
pub(crate) const MAX_PLAINTEXT: usize = 1 << 14;

/// Write sequence number at which we ask for a rekey.
const REKEY_AT: u64 = MAX_SEQUENCE - (1 << 16);

struct Writer {
    epoch: u16,
    next_seq: u64,
    cipher: Option<Box<dyn RecordCipher>>,
    overhead: usize,
}

struct Reader {
    epoch: u16,
    cipher: Option<Box<dyn RecordCipher>>,
    replay: ReplayWindow,
    expires: Option<Instant>,
}

impl Writer {
    fn plaintext() -> Self {
        Writer {
            epoch: 0,
            next_seq: 0,
            cipher: None,
            overhead: 0,
        }
    }
}

impl Reader {
    fn new(epoch: u16, cipher: Option<Box<dyn RecordCipher>>, window: u32) -> Self {
        Reader {
            epoch,
            cipher,
            replay: ReplayWindow::new(window),
            expires: None,
        }
    }
}

/// Where an inbound record's keys live.
#[derive(Clone, Copy, PartialEq, Eq)]
enum ReadSlot {
    Current,
    Previous,
    Next,
}

pub(crate) struct RecordLayer {
    replay_window: u32,
    previous_lifetime: Option<Duration>,

    write: Writer,
    write_previous: Option<Writer>,
    write_next: Option<(Box<dyn RecordCipher>, usize)>,

    read: Reader,
    read_previous: Option<Reader>,
    read_next: Option<Box<dyn RecordCipher>>,
}

impl RecordLayer {
    pub fn new(replay_window: u32, previous_lifetime: Option<Duration>) -> Self {
        RecordLayer {
            replay_window,
            previous_lifetime,
            write: Writer::plaintext(),
            write_previous: None,
            write_next: None,
            read: Reader::new(0, None, replay_window),
            read_previous: None,
            read_next: None,
        }
    }

    pub fn write_epoch(&self) -> u16 {
        self.write.epoch
    }

    pub fn read_epoch(&self) -> u16 {
        self.read.epoch
    }

    /// Whether we still hold write keys for `epoch`.
    pub fn can_write(&self, epoch: u16) -> bool {
        self.writer(epoch).is_some()
    }

    /// Bytes the protection adds to a record in `epoch`.
    pub fn overhead(&self, epoch: u16) -> usize {
        self.writer(epoch).map(|w| w.overhead).unwrap_or(0)
    }

    fn writer(&self, epoch: u16) -> Option<&Writer> {
        if self.write.epoch == epoch {
            Some(&self.write)
        } else {
            self.write_previous.as_ref().filter(|w| w.epoch == epoch)
        }
    }

    fn writer_mut(&mut self, epoch: u16) -> Option<&mut Writer> {
        if self.write.epoch == epoch {
            Some(&mut self.write)
        } else {
            self.write_previous.as_mut().filter(|w| w.epoch == epoch)
        }
    }

    /// Protect `payload` in `epoch` and append the record to `out`.
    ///
    /// `payload` holds the plaintext on entry and the protected fragment on
    /// return. Refuses to send once the sequence number space of the epoch is
    /// used up.
    pub fn protect(
        &mut self,
        epoch: u16,
        content_type: ContentType,
        payload: &mut Buf,
        out: &mut Buf,
    ) -> Result<Sequence, Error> {
        let Some(w) = self.writer_mut(epoch) else {
            return Err(Error::CryptoError(format!("No write keys for epoch {}", epoch)));
        };

        if w.next_seq > MAX_SEQUENCE {
            return Err(Error::SequenceExhausted);
        }

        let sequence = Sequence::new(epoch, w.next_seq);
        let header = RecordHeader {
            content_type,
            version: ProtocolVersion::DTLS1_2,
            sequence,
            length: payload.len() as u16,
        };

        if let Some(cipher) = &mut w.cipher {
            cipher.encrypt(&header, payload).map_err(Error::CryptoError)?;
        }

        DTLSRecord::serialize_header(
            content_type,
            ProtocolVersion::DTLS1_2,
            sequence,
            payload.len(),
            out,
        );
        out.extend_from_slice(payload);

        w.next_seq += 1;

        Ok(sequence)
    }

    /// Whether the current write epoch is close to running out of sequence
    /// numbers.
    pub fn wants_rekey(&self) -> bool {
        self.write.next_seq >= REKEY_AT
    }

    /// Keys to use once we send our next ChangeCipherSpec.
    pub fn install_next_write(&mut self, cipher: Box<dyn RecordCipher>, overhead: usize) {
        self.write_next = Some((cipher, overhead));
    }

    /// Switch to the next write epoch. The current one is kept for resends.
    pub fn advance_write_epoch(&mut self) -> Result<(), Error> {
        let Some(epoch) = self.write.epoch.checked_add(1) else {
            return Err(Error::SequenceExhausted);
        };

        let Some((cipher, overhead)) = self.write_next.take() else {
            return Err(Error::CryptoError("No keys for next write epoch".into()));
        };

        let next = Writer {
            epoch,
            next_seq: 0,
            cipher: Some(cipher),
            overhead,
        };

        self.write_previous = Some(std::mem::replace(&mut self.write, next));
        debug!("Write epoch advanced to {}", epoch);
        Ok(())
    }

    /// Keys for records the peer sends after its next ChangeCipherSpec.
    pub fn install_next_read(&mut self, cipher: Box<dyn RecordCipher>) {
        self.read_next = Some(cipher);
    }

    pub fn has_next_read(&self) -> bool {
        self.read_next.is_some()
    }

    /// Switch to the next read epoch. The current one stays readable for the
    /// configured grace period.
    pub fn advance_read_epoch(&mut self, now: Instant) -> bool {
        let Some(epoch) = self.read.epoch.checked_add(1) else {
            return false;
        };
        let Some(cipher) = self.read_next.take() else {
            return false;
        };

        let next = Reader::new(epoch, Some(cipher), self.replay_window);
        let mut previous = std::mem::replace(&mut self.read, next);
        previous.expires = self.previous_lifetime.map(|l| now + l);
        self.read_previous = Some(previous);

        debug!("Read epoch advanced to {}", epoch);
        true
    }

    /// Forget the previous read epoch. Returns whether there was one.
    pub fn close_previous_epoch(&mut self) -> bool {
        let closed = self.read_previous.take();
        if let Some(r) = &closed {
            debug!("Closed read epoch {}", r.epoch);
        }
        closed.is_some()
    }

    /// When the previous read epoch expires.
    pub fn previous_expiry(&self) -> Option<Instant> {
        self.read_previous.as_ref().and_then(|r| r.expires)
    }

    pub fn expire_previous(&mut self, now: Instant) {
        if self.previous_expiry().is_some_and(|e| now >= e) {
            self.close_previous_epoch();
        }
    }

    /// Forget what we have seen in the current read epoch.
    ///
    /// The stateless HelloVerifyRequest reuses the record sequence number of
    /// the ClientHello, so the server's session may legitimately restart from
    /// there.
    pub fn reset_read_replay(&mut self) {
        self.read.replay = ReplayWindow::new(self.replay_window);
    }

    /// Unprotect a record into `out`.
    ///
    /// Returns `None` for anything that is not an authentic, fresh record in an
    /// epoch we hold keys for. The window is only updated after a record
    /// authenticates. An authentic record in the next epoch switches the read
    /// epoch, as if its ChangeCipherSpec had arrived.
    pub fn unprotect(
        &mut self,
        record: &DTLSRecord,
        now: Instant,
        out: &mut Buf,
    ) -> Option<ContentType> {
        self.expire_previous(now);

        if !record.version.is_known() {
            trace!("Drop record with version {:?}", record.version);
            return None;
        }

        let epoch = record.sequence.epoch;
        let seq = record.sequence.sequence_number;

        let slot = if epoch == self.read.epoch {
            ReadSlot::Current
        } else if self.read_previous.as_ref().is_some_and(|r| r.epoch == epoch) {
            ReadSlot::Previous
        } else if self.read_next.is_some() && Some(epoch) == self.read.epoch.checked_add(1) {
            ReadSlot::Next
        } else {
            trace!("Drop record from unknown epoch: {}", record.sequence);
            return None;
        };

        let fresh = match slot {
            ReadSlot::Current => self.read.replay.is_fresh(seq),
            ReadSlot::Previous => self
                .read_previous
                .as_ref()
                .is_some_and(|r| r.replay.is_fresh(seq)),
            ReadSlot::Next => true,
        };

        if !fresh {
            trace!("Drop replayed record: {}", record.sequence);
            return None;
        }

        let header = RecordHeader {
            content_type: record.content_type,
            version: record.version,
            sequence: record.sequence,
            length: record.fragment.len() as u16,
        };

        out.clear();
        out.extend_from_slice(record.fragment);

        let cipher = match slot {
            ReadSlot::Current => self.read.cipher.as_mut(),
            ReadSlot::Previous => self.read_previous.as_mut().and_then(|r| r.cipher.as_mut()),
            ReadSlot::Next => self.read_next.as_mut(),
        };

        if let Some(cipher) = cipher {
            if cipher.decrypt(&header, out).is_err() {
                trace!("Drop record failing authentication: {}", record.sequence);
                return None;
            }
        }

        if out.len() > MAX_PLAINTEXT {
            trace!("Drop oversized record: {}", record.sequence);
            return None;
        }

        match slot {
            ReadSlot::Current => self.read.replay.mark_seen(seq),
            ReadSlot::Previous => {
                if let Some(r) = &mut self.read_previous {
                    r.replay.mark_seen(seq);
                }
            }
            ReadSlot::Next => {
                self.advance_read_epoch(now);
                self.read.replay.mark_seen(seq);
            }
        }

        Some(record.content_type)
    }

    #[cfg(test)]
    pub(crate) fn set_write_sequence(&mut self, seq: u64) {
        self.write.next_seq = seq;
    }
}

impl std::fmt::Debug for RecordLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLayer")
            .field("write_epoch", &self.write.epoch)
            .field("write_seq", &self.write.next_seq)
            .field("read_epoch", &self.read.epoch)
            .field(
                "read_previous",
                &self.read_previous.as_ref().map(|r| r.epoch),
            )
            .field("read_next", &self.read_next.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::rust_crypto::ECDHE_PSK_AES128_GCM_SHA256;
    use crate::crypto::CipherSuite;

    fn cipher(epoch: u16) -> Box<dyn RecordCipher> {
        let suite = &ECDHE_PSK_AES128_GCM_SHA256;
        let km = suite
            .derive_keys(&[9; 48], &[1; 32], &[2; 32], epoch)
            .unwrap();
        suite.create_cipher(&km.client_write).unwrap()
    }

    /// A writer and a reader that share keys for epochs 1 and 2.
    fn pair() -> (RecordLayer, RecordLayer) {
        let mut tx = RecordLayer::new(64, None);
        let mut rx = RecordLayer::new(64, None);
        tx.install_next_write(cipher(1), 24);
        tx.advance_write_epoch().unwrap();
        rx.install_next_read(cipher(1));
        rx.advance_read_epoch(Instant::now());
        (tx, rx)
    }

    fn seal(tx: &mut RecordLayer, epoch: u16, data: &[u8]) -> Buf {
        let mut payload = Buf::from_slice(data);
        let mut out = Buf::new();
        tx.protect(epoch, ContentType::ApplicationData, &mut payload, &mut out)
            .unwrap();
        out
    }

    fn open(rx: &mut RecordLayer, wire: &[u8], now: Instant) -> Option<Vec<u8>> {
        let (_, record) = DTLSRecord::parse(wire).unwrap();
        let mut out = Buf::new();
        rx.unprotect(&record, now, &mut out)?;
        Some(out.into_vec())
    }

    #[test]
    fn plaintext_epoch_zero() {
        let mut tx = RecordLayer::new(64, None);
        let mut rx = RecordLayer::new(64, None);
        let wire = seal(&mut tx, 0, b"hello");
        assert_eq!(wire.len(), 13 + 5);
        assert_eq!(open(&mut rx, &wire, Instant::now()).unwrap(), b"hello");
    }

    #[test]
    fn sequence_numbers_increase_per_epoch() {
        let (mut tx, _) = pair();
        let a = seal(&mut tx, 1, b"a");
        let b = seal(&mut tx, 1, b"b");
        let (_, ra) = DTLSRecord::parse(&a).unwrap();
        let (_, rb) = DTLSRecord::parse(&b).unwrap();
        assert_eq!(ra.sequence, Sequence::new(1, 0));
        assert_eq!(rb.sequence, Sequence::new(1, 1));

        // The previous epoch keeps its own counter.
        let c = seal(&mut tx, 0, b"c");
        let (_, rc) = DTLSRecord::parse(&c).unwrap();
        assert_eq!(rc.sequence, Sequence::new(0, 0));
    }

    #[test]
    fn replay_is_dropped() {
        let now = Instant::now();
        let (mut tx, mut rx) = pair();
        let wire = seal(&mut tx, 1, b"once");
        assert!(open(&mut rx, &wire, now).is_some());
        assert!(open(&mut rx, &wire, now).is_none());
    }

    #[test]
    fn forged_record_does_not_poison_window() {
        let now = Instant::now();
        let (mut tx, mut rx) = pair();
        let wire = seal(&mut tx, 1, b"genuine");

        let mut forged = wire.clone();
        let last = forged.len() - 1;
        forged[last] ^= 0xFF;
        assert!(open(&mut rx, &forged, now).is_none());

        // Same sequence number, but authentic: still accepted.
        assert_eq!(open(&mut rx, &wire, now).unwrap(), b"genuine");
    }

    #[test]
    fn unknown_epoch_is_dropped() {
        let now = Instant::now();
        let (mut tx, mut rx) = pair();
        let mut wire = seal(&mut tx, 1, b"x");
        // Rewrite epoch to 7
        wire[3..5].copy_from_slice(&7u16.to_be_bytes());
        assert!(open(&mut rx, &wire, now).is_none());
    }

    #[test]
    fn old_window_rejects_far_behind() {
        let now = Instant::now();
        let (mut tx, mut rx) = pair();
        let first = seal(&mut tx, 1, b"first");
        for _ in 0..70 {
            let w = seal(&mut tx, 1, b"filler");
            assert!(open(&mut rx, &w, now).is_some());
        }
        assert!(open(&mut rx, &first, now).is_none());
    }

    #[test]
    fn previous_epoch_grace_then_close() {
        let now = Instant::now();
        let (mut tx, mut rx) = pair();
        let old_a = seal(&mut tx, 1, b"old a");
        let old_b = seal(&mut tx, 1, b"old b");

        tx.install_next_write(cipher(2), 24);
        tx.advance_write_epoch().unwrap();
        rx.install_next_read(cipher(2));
        assert!(rx.advance_read_epoch(now));

        let new = seal(&mut tx, 2, b"new");
        assert_eq!(open(&mut rx, &new, now).unwrap(), b"new");
        assert_eq!(open(&mut rx, &old_a, now).unwrap(), b"old a");

        assert!(rx.close_previous_epoch());
        assert!(open(&mut rx, &old_b, now).is_none());
    }

    #[test]
    fn previous_epoch_expires() {
        let now = Instant::now();
        let mut tx = RecordLayer::new(64, None);
        let mut rx = RecordLayer::new(64, Some(Duration::from_secs(5)));
        let old = seal(&mut tx, 0, b"old");

        rx.install_next_read(cipher(1));
        rx.advance_read_epoch(now);
        assert_eq!(rx.previous_expiry(), Some(now + Duration::from_secs(5)));

        assert!(open(&mut rx, &old, now + Duration::from_secs(6)).is_none());
        assert_eq!(rx.previous_expiry(), None);
    }

    #[test]
    fn authentic_next_epoch_record_switches_epoch() {
        let now = Instant::now();
        let (mut tx, mut rx) = pair();
        tx.install_next_write(cipher(2), 24);
        tx.advance_write_epoch().unwrap();
        rx.install_next_read(cipher(2));

        let wire = seal(&mut tx, 2, b"ahead");
        assert_eq!(open(&mut rx, &wire, now).unwrap(), b"ahead");
        assert_eq!(rx.read_epoch(), 2);
        assert!(open(&mut rx, &wire, now).is_none());
    }

    #[test]
    fn refuses_exhausted_sequence() {
        let (mut tx, _) = pair();
        tx.set_write_sequence(MAX_SEQUENCE);
        assert!(tx.wants_rekey());
        seal(&mut tx, 1, b"last one");

        let mut payload = Buf::from_slice(b"too many");
        let mut out = Buf::new();
        let err = tx
            .protect(1, ContentType::ApplicationData, &mut payload, &mut out)
            .unwrap_err();
        assert_eq!(err, Error::SequenceExhausted);
        assert!(out.is_empty());
    }

    #[test]
    fn epoch_wrap_is_refused() {
        let mut tx = RecordLayer::new(64, None);
        tx.write.epoch = u16::MAX;
        tx.install_next_write(cipher(1), 24);
        assert_eq!(tx.advance_write_epoch(), Err(Error::SequenceExhausted));
    }
}
