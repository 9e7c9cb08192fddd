//! Miscellaneous utilities for Palisade.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

//----------- Clock ------------------------------------------------------------

/// The time source for everything that compares clocks: TSIG fudge windows,
/// RRSIG inception and expiration, cache expiry, transfer backoff.
///
/// There is exactly one of these per process so that tests can substitute a
/// fixed or stepped clock and exercise expiry behavior without sleeping.
#[derive(Clone)]
pub struct Clock {
    now: Arc<dyn Fn() -> u64 + Send + Sync>,
}

impl Clock {
    /// The system clock.
    pub fn system() -> Self {
        Self {
            now: Arc::new(|| {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0)
            }),
        }
    }

    /// A clock frozen at `secs` since the unix epoch.
    pub fn fixed(secs: u64) -> Self {
        Self {
            now: Arc::new(move || secs),
        }
    }

    /// A clock backed by an arbitrary function.
    pub fn from_fn(f: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self { now: Arc::new(f) }
    }

    /// The current time in seconds since the unix epoch.
    pub fn now_unix(&self) -> u64 {
        (self.now)()
    }
}

impl fmt::Debug for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Clock").finish_non_exhaustive()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

//----------- Helpers ----------------------------------------------------------

/// Clamp a TTL into the configured window.
pub fn clamp_ttl(ttl: u32, min: u32, max: u32) -> u32 {
    ttl.clamp(min, max.max(min))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock() {
        let clock = Clock::fixed(1_700_000_000);
        assert_eq!(clock.now_unix(), 1_700_000_000);
    }

    #[test]
    fn ttl_clamping() {
        assert_eq!(clamp_ttl(5, 60, 86400), 60);
        assert_eq!(clamp_ttl(100_000, 60, 86400), 86400);
        assert_eq!(clamp_ttl(300, 60, 86400), 300);
        // A misconfigured window (max < min) degrades to the minimum.
        assert_eq!(clamp_ttl(300, 600, 60), 600);
    }
}
