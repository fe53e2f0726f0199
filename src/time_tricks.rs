use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::Lazy;

// A pair of (Instant, SystemTime) captured together. All time in the engine is
// driven through `Instant`, but the hello random wants wall-clock seconds, so we
// translate relative to this anchor.
static ANCHOR: Lazy<(Instant, SystemTime)> = Lazy::new(|| {
    let now = Instant::now();
    let now_sys = SystemTime::now();

    // Move the anchor back up to an hour so that instants slightly older than
    // the first call still translate.
    let mut back = Duration::from_secs(3600);
    let anchor = loop {
        if let Some(v) = now.checked_sub(back) {
            break v;
        }
        back /= 2;
        if back.is_zero() {
            break now;
        }
    };

    (anchor, now_sys - (now - anchor))
});

pub(crate) trait InstantExt {
    /// Seconds since the unix epoch for this instant.
    fn to_unix_secs(&self) -> u64;
}

impl InstantExt for Instant {
    fn to_unix_secs(&self) -> u64 {
        let (anchor, anchor_sys) = *ANCHOR;

        if *self < anchor {
            warn!("Instant predates time anchor");
        }

        let system_time = anchor_sys + self.saturating_duration_since(anchor);

        system_time
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
