//! Progress throttling and speed accounting.

use std::time::{Duration, Instant};

/// Minimum interval between progress emissions.
const EMIT_INTERVAL: Duration = Duration::from_millis(500);

/// Byte delta that forces an emission regardless of elapsed time.
const EMIT_BYTES: u64 = 1024 * 1024;

/// Decides when a progress update is worth emitting: every 500 ms or
/// every 1 MiB, whichever comes first.
pub struct ProgressThrottle {
    last_emit: Instant,
    bytes_at_last_emit: u64,
}

impl ProgressThrottle {
    pub fn new() -> Self {
        Self {
            last_emit: Instant::now(),
            bytes_at_last_emit: 0,
        }
    }

    /// Returns true (and arms the next window) when an update should be
    /// emitted for the given cumulative byte count.
    pub fn should_emit(&mut self, bytes_downloaded: u64) -> bool {
        let elapsed = self.last_emit.elapsed();
        let delta = bytes_downloaded.saturating_sub(self.bytes_at_last_emit);
        if elapsed >= EMIT_INTERVAL || delta >= EMIT_BYTES {
            self.last_emit = Instant::now();
            self.bytes_at_last_emit = bytes_downloaded;
            return true;
        }
        false
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new()
    }
}

/// Instantaneous speed from byte/time deltas between samples.
pub struct SpeedTracker {
    last_sample: Instant,
    last_bytes: u64,
    speed_bps: f64,
}

impl SpeedTracker {
    pub fn new(initial_bytes: u64) -> Self {
        Self {
            last_sample: Instant::now(),
            last_bytes: initial_bytes,
            speed_bps: 0.0,
        }
    }

    /// Record a sample and return the updated speed in bytes per second.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, bytes_downloaded: u64) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample).as_secs_f64();
        if elapsed > 0.0 {
            let delta = bytes_downloaded.saturating_sub(self.last_bytes);
            self.speed_bps = delta as f64 / elapsed;
            self.last_sample = now;
            self.last_bytes = bytes_downloaded;
        }
        self.speed_bps
    }

    pub const fn speed_bps(&self) -> f64 {
        self.speed_bps
    }
}

/// Estimated seconds remaining, when the speed is usable.
#[allow(clippy::cast_precision_loss)]
pub fn eta_seconds(speed_bps: f64, downloaded: u64, total: u64) -> Option<f64> {
    if speed_bps > 0.0 && total > downloaded {
        Some((total - downloaded) as f64 / speed_bps)
    } else {
        None
    }
}

/// Parse the total size out of a `Content-Range` header value
/// (`bytes 100-999/4096` → `4096`). Returns `None` for `*` totals.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_emits_on_byte_threshold() {
        let mut throttle = ProgressThrottle::new();
        // Immediately after construction the interval has not elapsed
        assert!(!throttle.should_emit(1024));
        // A full MiB forces emission
        assert!(throttle.should_emit(EMIT_BYTES + 1024));
        // And re-arms the window
        assert!(!throttle.should_emit(EMIT_BYTES + 2048));
    }

    #[test]
    fn eta_requires_speed_and_remaining_bytes() {
        assert_eq!(eta_seconds(0.0, 0, 100), None);
        assert_eq!(eta_seconds(50.0, 100, 100), None);
        let eta = eta_seconds(50.0, 0, 100).unwrap();
        assert!((eta - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn content_range_total_parses_suffix() {
        assert_eq!(parse_content_range_total("bytes 0-499/1234"), Some(1234));
        assert_eq!(parse_content_range_total("bytes 500-999/1000"), Some(1000));
        assert_eq!(parse_content_range_total("bytes 0-499/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn speed_tracker_reports_nonnegative_speed() {
        let mut tracker = SpeedTracker::new(0);
        std::thread::sleep(Duration::from_millis(10));
        let speed = tracker.sample(10_000);
        assert!(speed > 0.0);
        assert!((tracker.speed_bps() - speed).abs() < f64::EPSILON);
    }
}
