//! Handshake message reassembly.
//!
//! Fragments are accepted in any order and any number of times. A message is
//! released exactly once, when its byte ranges cover the whole message and all
//! messages before it have been released.

use std::collections::BTreeMap;
use std::ops::Range;

use nom::error::ErrorKind;

use crate::buffer::Buf;
use crate::message::{Body, Header, MessageType};
use crate::Error;

/// How far beyond the next expected message_seq we keep fragments.
const MAX_LOOKAHEAD: u16 = 8;

/// Largest handshake message we are willing to reassemble.
const MAX_MESSAGE_LEN: u32 = 1 << 16;

/// A complete handshake message.
#[derive(Debug)]
pub(crate) struct Message {
    pub msg_type: MessageType,
    pub message_seq: u16,
    /// Lowest record epoch any of the fragments arrived in.
    pub epoch: u16,
    pub body: Buf,
}

impl Message {
    pub fn parse_body(&self) -> Result<Body<'_>, Error> {
        let (_, body) = Body::parse(&self.body, self.msg_type)?;
        Ok(body)
    }

    /// The message as if sent unfragmented. This is what goes in the transcript.
    pub fn serialize_unfragmented(&self, out: &mut Buf) {
        let len = self.body.len() as u32;
        Header {
            msg_type: self.msg_type,
            length: len,
            message_seq: self.message_seq,
            fragment_offset: 0,
            fragment_length: len,
        }
        .serialize(out);
        out.extend_from_slice(&self.body);
    }
}

#[derive(Debug)]
struct Pending {
    msg_type: MessageType,
    epoch: u16,
    length: u32,
    body: Buf,
    // Sorted, non-overlapping, non-adjacent.
    ranges: Vec<Range<u32>>,
}

impl Pending {
    fn new(header: &Header, epoch: u16) -> Self {
        let mut body = Buf::new();
        body.resize(header.length as usize, 0);
        Pending {
            msg_type: header.msg_type,
            epoch,
            length: header.length,
            body,
            ranges: Vec::new(),
        }
    }

    /// Add a fragment. Returns false if it contradicts bytes we already hold.
    fn insert(&mut self, offset: u32, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        let new = offset..offset + data.len() as u32;

        for r in &self.ranges {
            let start = r.start.max(new.start);
            let end = r.end.min(new.end);
            if start >= end {
                continue;
            }
            let held = &self.body[start as usize..end as usize];
            let incoming = &data[(start - offset) as usize..(end - offset) as usize];
            if held != incoming {
                return false;
            }
        }

        self.body[new.start as usize..new.end as usize].copy_from_slice(data);
        self.merge(new);
        true
    }

    fn merge(&mut self, new: Range<u32>) {
        self.ranges.push(new);
        self.ranges.sort_by_key(|r| r.start);

        let mut merged: Vec<Range<u32>> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    fn is_complete(&self) -> bool {
        if self.length == 0 {
            return true;
        }
        matches!(self.ranges.as_slice(), [r] if r.start == 0 && r.end == self.length)
    }
}

/// Collects handshake fragments per message_seq and releases complete
/// messages in order.
#[derive(Debug)]
pub(crate) struct Reassembler {
    next_seq: u16,
    pending: BTreeMap<u16, Pending>,
}

impl Reassembler {
    /// Start expecting `next_seq`.
    pub fn new(next_seq: u16) -> Self {
        Reassembler {
            next_seq,
            pending: BTreeMap::new(),
        }
    }

    /// The message_seq of the next message to be released.
    pub fn next_seq(&self) -> u16 {
        self.next_seq
    }

    /// Whether `message_seq` belongs to a message already released.
    pub fn is_stale(&self, message_seq: u16) -> bool {
        message_seq < self.next_seq
    }

    /// Whether a fragment for `message_seq` would be kept, neither stale nor
    /// too far ahead.
    pub fn accepts(&self, message_seq: u16) -> bool {
        !self.is_stale(message_seq) && message_seq - self.next_seq <= MAX_LOOKAHEAD
    }

    /// Feed one fragment.
    ///
    /// Returns the next message in sequence if it is now complete. Further
    /// messages that became releasable are returned by [`pop_complete`].
    ///
    /// Stale and too-far-ahead fragments are ignored. A fragment that
    /// contradicts data already held for the same message is a protocol
    /// violation; the partial message is discarded.
    ///
    /// [`pop_complete`]: Reassembler::pop_complete
    pub fn feed(
        &mut self,
        header: &Header,
        epoch: u16,
        data: &[u8],
    ) -> Result<Option<Message>, Error> {
        let seq = header.message_seq;

        if self.is_stale(seq) {
            trace!("Stale handshake fragment: {}", seq);
            return Ok(None);
        }

        if seq - self.next_seq > MAX_LOOKAHEAD {
            debug!(
                "Handshake fragment too far ahead: {} (expecting {})",
                seq, self.next_seq
            );
            return Ok(None);
        }

        if header.length > MAX_MESSAGE_LEN {
            return Err(Error::ParseError(ErrorKind::TooLarge));
        }

        if data.len() as u32 != header.fragment_length
            || header.fragment_offset as u64 + data.len() as u64 > header.length as u64
        {
            return Err(Error::ParseError(ErrorKind::LengthValue));
        }

        let pending = self
            .pending
            .entry(seq)
            .or_insert_with(|| Pending::new(header, epoch));

        let consistent = pending.msg_type == header.msg_type
            && pending.length == header.length
            && pending.insert(header.fragment_offset, data);

        if !consistent {
            warn!("Inconsistent handshake fragments for message_seq {}", seq);
            self.pending.remove(&seq);
            return Err(Error::FragmentMismatch(seq));
        }

        pending.epoch = pending.epoch.min(epoch);

        Ok(self.pop_complete())
    }

    /// Release the next message if it is complete.
    pub fn pop_complete(&mut self) -> Option<Message> {
        let entry = self.pending.first_entry()?;
        if *entry.key() != self.next_seq || !entry.get().is_complete() {
            return None;
        }

        let p = entry.remove();
        let message_seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        Some(Message {
            msg_type: p.msg_type,
            message_seq,
            epoch: p.epoch,
            body: p.body,
        })
    }
}
