/// Largest window the bitmap can represent.
pub(crate) const MAX_WINDOW: u32 = 64;

/// Sliding replay window for DTLS record sequence numbers.
///
/// Maintains the latest accepted sequence number and a bitmap of the last `W`
/// seen sequence numbers to reject duplicates and old records.
///
/// Each epoch has its own `ReplayWindow`. Checking and marking are separate
/// steps: a record is only marked once it has been authenticated.
#[derive(Debug)]
pub(crate) struct ReplayWindow {
    size: u32,
    max_seq: u64,
    window: u64,
}

impl ReplayWindow {
    pub fn new(size: u32) -> Self {
        ReplayWindow {
            size: size.clamp(1, MAX_WINDOW),
            max_seq: 0,
            window: 0,
        }
    }

    /// Whether `seqno` would be accepted. Does not change the window.
    pub fn is_fresh(&self, seqno: u64) -> bool {
        if seqno > self.max_seq {
            return true;
        }
        let offset = self.max_seq - seqno;
        if offset >= self.size as u64 {
            return false; // too old
        }
        (self.window & (1u64 << offset)) == 0
    }

    /// Mark `seqno` as seen, advancing the anchor if needed.
    pub fn mark_seen(&mut self, seqno: u64) {
        if seqno > self.max_seq {
            let delta = seqno - self.max_seq;
            self.window = if delta >= 64 { 0 } else { self.window << delta };
            self.window |= 1; // mark newest as seen
            self.max_seq = seqno;
        } else {
            let offset = self.max_seq - seqno;
            if offset < self.size as u64 {
                self.window |= 1u64 << offset;
            }
        }
    }

    /// Check if the given sequence number is acceptable and update the window state.
    /// Returns true if fresh/acceptable, false if duplicate/too old.
    #[cfg(test)]
    pub fn check_and_update(&mut self, seqno: u64) -> bool {
        if !self.is_fresh(seqno) {
            return false;
        }
        self.mark_seen(seqno);
        true
    }
}
