//! Cache clock
//!
//! Item times are u32 seconds on a clock that starts when the pool was
//! created, not at process start, so access and expiry times stored in a
//! pool stay meaningful across restarts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Expiry values above this many seconds are absolute UNIX timestamps.
pub const REALTIME_MAXDELTA: u64 = 60 * 60 * 24 * 30;

/// First value a [`PoolClock`] reports. Keeps `now - 1` clear of 0, which
/// means "unset" for expiry and the flush watermark.
const CLOCK_BASE: u32 = 2;

/// Source of "now" for the engine.
pub trait Clock: Send + Sync {
    /// Seconds on the cache clock
    fn current_time(&self) -> u32;

    /// Cache-clock time of a UNIX timestamp, clamped to 1 for the past
    fn from_unix(&self, secs: u64) -> u32;
}

/// Wall clock measured from the pool epoch.
#[derive(Debug, Clone)]
pub struct PoolClock {
    epoch: u64,
}

impl PoolClock {
    pub fn new(epoch: u64) -> Self {
        Self { epoch }
    }
}

impl Clock for PoolClock {
    fn current_time(&self) -> u32 {
        self.from_unix(unix_now())
    }

    fn from_unix(&self, secs: u64) -> u32 {
        let delta = secs.saturating_sub(self.epoch);
        u32::try_from(delta).unwrap_or(u32::MAX - CLOCK_BASE).saturating_add(CLOCK_BASE).max(1)
    }
}

/// Hand-driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU32,
    unix_base: u64,
}

impl ManualClock {
    /// Clock reading `start`, with cache time 0 at UNIX time `unix_base`
    pub fn new(start: u32, unix_base: u64) -> Self {
        Self { now: AtomicU32::new(start), unix_base }
    }

    pub fn set(&self, now: u32) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u32) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn current_time(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }

    fn from_unix(&self, secs: u64) -> u32 {
        u32::try_from(secs.saturating_sub(self.unix_base)).unwrap_or(u32::MAX).max(1)
    }
}

/// Convert a client expiry to cache-clock time.
///
/// 0 never expires; up to 30 days is relative to now; anything larger is an
/// absolute UNIX timestamp.
pub fn realtime(clock: &dyn Clock, exptime: u64) -> u32 {
    if exptime == 0 {
        return 0;
    }
    if exptime > REALTIME_MAXDELTA {
        return clock.from_unix(exptime);
    }
    clock.current_time().saturating_add(exptime as u32)
}

/// Current UNIX time in seconds
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
