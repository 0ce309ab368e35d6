//! Data flow rate monitoring and limiting
//!
//! A [`Monitor`] counts the bytes moved in one direction, keeps an
//! exponentially weighted estimate of the current rate and doubles as a
//! token bucket: [`Monitor::limit`] waits until enough tokens for the next
//! transfer have accumulated at the configured byte rate.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// How often the rate estimate is resampled
const SAMPLE_PERIOD: Duration = Duration::from_millis(100);

/// Weight of the newest sample in the rate estimate
const RATE_EMA_WEIGHT: f64 = 0.3;

/// Snapshot of a monitor
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct FlowStatus {
    /// Total bytes transferred
    pub bytes: u64,
    /// Current transfer rate estimate in bytes/s
    pub cur_rate: u64,
    /// Average rate since the monitor started in bytes/s
    pub avg_rate: u64,
    /// Highest current-rate estimate seen
    pub peak_rate: u64,
    /// Time since the monitor started
    pub duration: Duration,
}

#[derive(Debug)]
struct MonitorState {
    start: Instant,
    bytes: u64,
    sample_start: Instant,
    sample_bytes: u64,
    rate_ema: f64,
    peak_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl MonitorState {
    fn resample(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.sample_start);
        if elapsed < SAMPLE_PERIOD {
            return;
        }
        let sample_rate = self.sample_bytes as f64 / elapsed.as_secs_f64();
        self.rate_ema = if self.rate_ema == 0.0 {
            sample_rate
        } else {
            RATE_EMA_WEIGHT * sample_rate + (1.0 - RATE_EMA_WEIGHT) * self.rate_ema
        };
        self.peak_rate = self.peak_rate.max(self.rate_ema);
        self.sample_start = now;
        self.sample_bytes = 0;
    }

    fn refill(&mut self, now: Instant, rate: u64, want: usize) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let capacity = (rate as f64).max(want as f64);
        self.tokens = (self.tokens + elapsed * rate as f64).min(capacity);
        self.last_refill = now;
    }
}

/// Byte counter, rate estimator and token bucket for one direction
#[derive(Debug, Clone)]
pub struct Monitor {
    state: Arc<Mutex<MonitorState>>,
}

impl Monitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                start: now,
                bytes: 0,
                sample_start: now,
                sample_bytes: 0,
                rate_ema: 0.0,
                peak_rate: 0.0,
                tokens: 0.0,
                last_refill: now,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `n` transferred bytes
    pub fn update(&self, n: usize) {
        let now = Instant::now();
        let mut state = self.lock();
        state.bytes += n as u64;
        state.sample_bytes += n as u64;
        state.tokens -= n as f64;
        state.resample(now);
    }

    /// How long to wait before `want` bytes may move at `rate` bytes/s
    pub fn delay(&self, want: usize, rate: u64) -> Duration {
        if rate == 0 {
            return Duration::ZERO;
        }
        let now = Instant::now();
        let mut state = self.lock();
        state.refill(now, rate, want);
        let missing = want as f64 - state.tokens;
        if missing <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(missing / rate as f64)
        }
    }

    /// Wait until `want` bytes may move at `rate` bytes/s; 0 disables limiting
    pub async fn limit(&self, want: usize, rate: u64) {
        loop {
            let wait = self.delay(want, rate);
            if wait.is_zero() {
                return;
            }
            tokio::time::sleep(wait).await;
        }
    }

    pub fn status(&self) -> FlowStatus {
        let now = Instant::now();
        let mut state = self.lock();
        state.resample(now);
        let duration = now.duration_since(state.start);
        let secs = duration.as_secs_f64();
        FlowStatus {
            bytes: state.bytes,
            cur_rate: state.rate_ema.round() as u64,
            avg_rate: if secs > 0.0 {
                (state.bytes as f64 / secs).round() as u64
            } else {
                0
            },
            peak_rate: state.peak_rate.round() as u64,
            duration,
        }
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}
