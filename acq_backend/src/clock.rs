//! Monotonic wall-clock used for timestamps and deadlines.
//!
//! The wall-clock time is sampled once per process and then advanced with a monotonic
//! [`Instant`], so timestamps handed out by [`now`] never go backwards even if the system
//! clock is adjusted while an experiment runs. Log entries rely on this for ordering.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct Anchor {
    epoch: f64,
    instant: Instant,
}

fn anchor() -> &'static Anchor {
    static ANCHOR: OnceLock<Anchor> = OnceLock::new();
    ANCHOR.get_or_init(|| Anchor {
        epoch: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
        instant: Instant::now(),
    })
}

/// Seconds since the UNIX epoch, monotonically non-decreasing within the process.
pub fn now() -> f64 {
    let a = anchor();
    a.epoch + a.instant.elapsed().as_secs_f64()
}

/// Converts a monotonic instant into the epoch-seconds scale used by [`now`].
pub fn to_epoch(instant: Instant) -> f64 {
    let a = anchor();
    if instant >= a.instant {
        a.epoch + (instant - a.instant).as_secs_f64()
    } else {
        a.epoch - (a.instant - instant).as_secs_f64()
    }
}

/// Longest span, in seconds, accepted for durations, lead times and timeouts.
pub const MAX_SECS: f64 = 1e7;

/// Converts a duration in float seconds, clamping negatives and NaN to zero and anything
/// longer (including infinity) to [`MAX_SECS`].
pub fn secs(value: f64) -> Duration {
    if value > 0. {
        Duration::from_secs_f64(value.min(MAX_SECS))
    } else {
        Duration::ZERO
    }
}

/// Utility for time-tracking of configuration and streaming steps.
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = (now - self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_print(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::debug!(elapsed_ms = diff, "{}", msg);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn now_is_monotonic() {
        let mut last = now();
        for _ in 0..1000 {
            let t = now();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn epoch_conversion() {
        let i = Instant::now();
        let t = now();
        assert!((to_epoch(i) - t).abs() < 0.01);
        assert_eq!(secs(-1.), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.5), Duration::from_millis(500));
    }

    #[test]
    fn huge_spans_are_capped() {
        assert_eq!(secs(1e20), Duration::from_secs_f64(MAX_SECS));
        assert_eq!(secs(f64::INFINITY), Duration::from_secs_f64(MAX_SECS));
        assert!(Instant::now().checked_add(secs(1e20)).is_some());
    }

    #[test]
    fn tick_timer() {
        let mut timer = TickTimer::new();
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.tick() >= 5.);
        assert!(timer.tick() < 5.);
    }
}
