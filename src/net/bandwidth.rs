//! Bandwidth estimation and the outbound limiter
//!
//! - [`BandwidthMeter`]: per-peer receive rate averaged over the last minute
//! - [`OutboundLimiter`]: cycle-based cap on total bytes sent, refusing
//!   historical block serving first

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

// =============================================================================
// Constants
// =============================================================================

/// Interval between bandwidth samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Samples kept: one minute of history
pub const SAMPLE_WINDOW: usize = 12;

/// Seconds of remaining cycle time that reserve one block worth of upload
const BLOCK_SERVING_BUFFER_SECS: u64 = 600;

// =============================================================================
// Per-peer bandwidth
// =============================================================================

/// Rolling receive-rate estimate for one peer
#[derive(Debug, Clone)]
pub struct BandwidthMeter {
    bytes_since_sample: u64,
    last_sample: Instant,
    samples: VecDeque<f64>,
}

impl BandwidthMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            bytes_since_sample: 0,
            last_sample: now,
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.bytes_since_sample += bytes;
    }

    /// Push a spot rate if a sample interval has elapsed. Returns whether a
    /// sample was taken.
    pub fn sample(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed < SAMPLE_INTERVAL {
            return false;
        }
        let rate = self.bytes_since_sample as f64 / elapsed.as_secs_f64();
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rate);
        self.bytes_since_sample = 0;
        self.last_sample = now;
        true
    }

    /// Average bytes per second over the sample window
    pub fn average(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

// =============================================================================
// Outbound limiter
// =============================================================================

/// Snapshot of the outbound limiter
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UploadTargetStatus {
    pub timeframe_secs: u64,
    pub target: u64,
    pub target_reached: bool,
    pub serve_historical_blocks: bool,
    pub bytes_left_in_cycle: u64,
    pub time_left_in_cycle_secs: u64,
}

#[derive(Debug)]
struct LimiterState {
    target: u64,
    timeframe: Duration,
    cycle_start: Option<Instant>,
    sent_in_cycle: u64,
}

/// Global cap on bytes sent per cycle
#[derive(Debug)]
pub struct OutboundLimiter {
    state: Mutex<LimiterState>,
    max_block_size: u64,
}

impl OutboundLimiter {
    /// `target == 0` disables the limiter
    pub fn new(target: u64, timeframe: Duration, max_block_size: u64) -> Self {
        Self {
            state: Mutex::new(LimiterState {
                target,
                timeframe,
                cycle_start: None,
                sent_in_cycle: 0,
            }),
            max_block_size,
        }
    }

    pub fn set_target(&self, target: u64) {
        self.state.lock().target = target;
    }

    /// Account bytes written to any socket
    pub fn record_sent(&self, bytes: u64, now: Instant) {
        let mut state = self.state.lock();
        let start = *state.cycle_start.get_or_insert(now);
        if now.saturating_duration_since(start) > state.timeframe {
            state.cycle_start = Some(now);
            state.sent_in_cycle = 0;
        }
        state.sent_in_cycle += bytes;
    }

    pub fn sent_in_cycle(&self) -> u64 {
        self.state.lock().sent_in_cycle
    }

    fn time_left(state: &LimiterState, now: Instant) -> Duration {
        if state.target == 0 {
            return Duration::ZERO;
        }
        match state.cycle_start {
            Some(start) => (start + state.timeframe).saturating_duration_since(now),
            None => state.timeframe,
        }
    }

    /// Whether the outbound target is reached.
    ///
    /// With `historical_block_serving`, enough headroom is kept back to relay
    /// one block per ten minutes of remaining cycle time.
    pub fn target_reached(&self, historical_block_serving: bool, now: Instant) -> bool {
        let state = self.state.lock();
        self.reached(&state, historical_block_serving, now)
    }

    fn reached(&self, state: &LimiterState, historical: bool, now: Instant) -> bool {
        if state.target == 0 {
            return false;
        }
        if historical {
            let left = Self::time_left(state, now).as_secs();
            let buffer = (left / BLOCK_SERVING_BUFFER_SECS).saturating_mul(self.max_block_size);
            buffer >= state.target || state.sent_in_cycle >= state.target - buffer
        } else {
            state.sent_in_cycle >= state.target
        }
    }

    pub fn status(&self, now: Instant) -> UploadTargetStatus {
        let state = self.state.lock();
        UploadTargetStatus {
            timeframe_secs: state.timeframe.as_secs(),
            target: state.target,
            target_reached: self.reached(&state, false, now),
            serve_historical_blocks: !self.reached(&state, true, now),
            bytes_left_in_cycle: if state.target == 0 {
                0
            } else {
                state.target.saturating_sub(state.sent_in_cycle)
            },
            time_left_in_cycle_secs: Self::time_left(&state, now).as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_bandwidth_average() {
        let start = Instant::now();
        let mut meter = BandwidthMeter::new(start);

        meter.record(5000);
        assert!(!meter.sample(start + Duration::from_secs(1)));
        assert!(meter.sample(start + Duration::from_secs(5)));
        assert_eq!(meter.average(), 1000.0);

        meter.record(15000);
        assert!(meter.sample(start + Duration::from_secs(10)));
        assert_eq!(meter.average(), 2000.0);
    }

    #[test]
    fn test_bandwidth_window_bounded() {
        let start = Instant::now();
        let mut meter = BandwidthMeter::new(start);
        for i in 1..=20u64 {
            meter.record(if i <= 8 { 0 } else { 500 });
            meter.sample(start + SAMPLE_INTERVAL * i as u32);
        }
        // Only the last 12 samples (all at 100 B/s) remain
        assert_eq!(meter.average(), 100.0);
    }

    #[test]
    fn test_limiter_disabled() {
        let limiter = OutboundLimiter::new(0, DAY, 1000);
        limiter.record_sent(u64::MAX / 2, Instant::now());
        assert!(!limiter.target_reached(false, Instant::now()));
        assert!(!limiter.target_reached(true, Instant::now()));
    }

    #[test]
    fn test_limiter_reserves_block_buffer() {
        let now = Instant::now();
        // One hour cycle: 6 blocks of 1000 bytes held back for new blocks
        let limiter = OutboundLimiter::new(10_000, Duration::from_secs(3600), 1000);
        limiter.record_sent(3_000, now);
        assert!(!limiter.target_reached(false, now));
        assert!(!limiter.target_reached(true, now));

        limiter.record_sent(1_500, now);
        assert!(!limiter.target_reached(false, now));
        assert!(limiter.target_reached(true, now));

        let status = limiter.status(now);
        assert!(!status.serve_historical_blocks);
        assert_eq!(status.bytes_left_in_cycle, 5_500);
    }

    #[test]
    fn test_limiter_cycle_resets() {
        let now = Instant::now();
        let limiter = OutboundLimiter::new(1000, Duration::from_secs(60), 10);
        limiter.record_sent(1000, now);
        assert!(limiter.target_reached(false, now));

        limiter.record_sent(10, now + Duration::from_secs(61));
        assert_eq!(limiter.sent_in_cycle(), 10);
        assert!(!limiter.target_reached(false, now + Duration::from_secs(61)));
    }
}
