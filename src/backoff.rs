//! Simple retry mechanism shared by all transports.

use std::cmp;
use std::thread;
use std::time::Duration;

use log::info;
use rand::Rng;

const FACTOR: f32 = 1.3;
const JITTER_BOUND: u64 = 800;

/// Default minimum reconnect delay.
pub const DEFAULT_MIN: Duration = Duration::from_millis(500);
/// Default maximum reconnect delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(60);

/// How the next reconnect delay is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Multiply the delay by a fixed factor each attempt, capped at the maximum.
    #[default]
    Exponential,
    /// `min(max, 2^attempt + random(0..800ms) + min)`, clamped on overflow.
    Jitter,
}

/// Reconnect backoff calculator.
///
/// One instance is owned by each transport. It is advanced on every failed
/// connection attempt and [`reset`](Backoff::reset) on success. When the
/// configured maximum retry count is exceeded the state resets to its initial
/// values, so attempts continue indefinitely at renewed low delay rather than
/// giving up.
#[derive(Debug, Clone)]
pub struct Backoff {
    retry_cnt: u32,
    delay: Duration,
    min: Duration,
    max: Duration,
    max_retry_cnt: u32,
    strategy: Strategy,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

impl Backoff {
    /// Creates a calculator with the default 500ms..60s window.
    pub fn new() -> Self {
        Self {
            retry_cnt: 0,
            delay: DEFAULT_MIN,
            min: DEFAULT_MIN,
            max: DEFAULT_MAX,
            max_retry_cnt: 0,
            strategy: Strategy::Exponential,
        }
    }

    /// Sets the minimum delay.
    pub fn min(mut self, min: Duration) -> Self {
        self.min = min;
        self.delay = min;
        self
    }

    /// Sets the maximum delay.
    pub fn max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Sets the retry count after which the state resets (0 = unlimited).
    pub fn max_retry_cnt(mut self, max_retry_cnt: u32) -> Self {
        self.max_retry_cnt = max_retry_cnt;
        self
    }

    /// Sets the delay strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// The number of attempts since the last reset.
    pub fn retry_cnt(&self) -> u32 {
        self.retry_cnt
    }

    /// Resets the counter and delay to their initial values.
    pub fn reset(&mut self) {
        self.retry_cnt = 0;
        self.delay = self.min;
    }

    /// Advances the state and returns the delay before the next attempt.
    ///
    /// Non-decreasing until it pins at the maximum. When the configured
    /// `max_retry_cnt` is exceeded the state resets and the minimum delay is
    /// returned.
    pub fn next_delay(&mut self) -> Duration {
        self.retry_cnt += 1;
        if self.delay < self.max {
            match self.strategy {
                Strategy::Exponential => {
                    self.delay = cmp::min(self.max, self.delay.mul_f32(FACTOR));
                }
                Strategy::Jitter => {
                    let jitter = rand::thread_rng().gen_range(0..JITTER_BOUND);
                    self.delay = match 2u64
                        .checked_pow(self.retry_cnt)
                        .and_then(|pow| pow.checked_add(jitter))
                        .and_then(|pow| pow.checked_add(self.min.as_millis() as u64))
                    {
                        Some(ms) => cmp::min(self.max, Duration::from_millis(ms)),
                        None => self.max,
                    };
                }
            }
        } else {
            self.delay = self.max;
        }

        if self.max_retry_cnt > 0 && self.retry_cnt > self.max_retry_cnt {
            self.reset();
        }

        self.delay
    }

    /// Advances the state, sleeps for the computed delay and reports whether
    /// a retry should proceed.
    ///
    /// Returns `false` exactly when a reset just occurred, signalling "try
    /// again fresh rather than waiting".
    pub fn should_retry(&mut self) -> bool {
        let delay = self.next_delay();
        if self.retry_cnt == 0 {
            return false;
        }
        info!("retrying with delay {}ms ...", delay.as_millis());
        thread::sleep(delay);
        true
    }
}
