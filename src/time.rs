use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Seconds in the store's relative time domain.
///
/// All staleness and expiry comparisons happen in this domain; the core
/// never consults an OS clock directly.
pub type RelTime = u32;

/// Injected time source.
///
/// The store takes its notion of "now" from here, so tests can drive the
/// flusher's age checks and lock leases deterministically with a
/// [`ManualClock`].
pub trait Clock: Send + Sync {
    /// Current time as an offset in the relative domain.
    fn now(&self) -> RelTime;

    /// Translates a relative offset into wall-clock seconds since the Unix
    /// epoch.
    fn abs(&self, rel: RelTime) -> u64;
}

/// Default clock: relative time is seconds elapsed since construction.
pub struct WallClock {
    anchor: Instant,
    anchor_unix: u64,
}

impl Default for WallClock {
    fn default() -> Self {
        let anchor_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        Self {
            anchor: Instant::now(),
            anchor_unix,
        }
    }
}

impl Clock for WallClock {
    fn now(&self) -> RelTime {
        // NOTE: Truncation is fine, a store does not live 136 years
        #[allow(clippy::cast_possible_truncation)]
        let secs = self.anchor.elapsed().as_secs() as RelTime;
        secs
    }

    fn abs(&self, rel: RelTime) -> u64 {
        self.anchor_unix + u64::from(rel)
    }
}

/// Hand-cranked clock for tests.
///
/// Starts at zero and only moves when told to.
#[derive(Default)]
pub struct ManualClock(AtomicU32);

impl ManualClock {
    /// Creates a clock positioned at `now`.
    #[must_use]
    pub fn at(now: RelTime) -> Self {
        Self(AtomicU32::new(now))
    }

    /// Moves the clock forward by `secs`.
    pub fn advance(&self, secs: RelTime) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> RelTime {
        self.0.load(Ordering::SeqCst)
    }

    fn abs(&self, rel: RelTime) -> u64 {
        u64::from(rel)
    }
}
