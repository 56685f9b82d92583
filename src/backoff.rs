//! Exponential backoff with proportional jitter.
//!
//! One policy type covers the request retry loop, the circuit cooldown and
//! the outbox replay schedule:
//!
//! | Use            | Base    | Max     | Jitter   |
//! |----------------|---------|---------|----------|
//! | Request retry  | 250ms   | 1250ms  | 20–60%   |
//! | Circuit open   | 15s     | 15s     | none     |
//! | Outbox replay  | 1500ms  | 60s     | 15–40%   |

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
  pub base: Duration,
  pub max: Duration,
  /// Jitter added on top of the exponential delay, as a fraction of it.
  pub jitter_min: f64,
  pub jitter_max: f64,
}

impl BackoffPolicy {
  pub fn new(base: Duration, max: Duration) -> Self {
    Self {
      base,
      max: max.max(base),
      jitter_min: 0.0,
      jitter_max: 0.0,
    }
  }

  /// Constant delay, no growth and no jitter.
  pub fn fixed(delay: Duration) -> Self {
    Self::new(delay, delay)
  }

  pub fn with_jitter(mut self, min: f64, max: f64) -> Self {
    let min = min.max(0.0);
    self.jitter_min = min;
    self.jitter_max = max.max(min);
    self
  }

  /// Delay before the n-th attempt (1-based), without jitter.
  pub fn base_delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let factor = 1u64 << exponent;
    let base_ms = self.base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms).min(self.max)
  }

  /// Delay before the n-th attempt with jitter applied.
  ///
  /// The result never exceeds `max` plus the jitter drawn for it.
  pub fn delay(&self, attempt: u32) -> Duration {
    let ratio = if self.jitter_max > self.jitter_min {
      rand::rng().random_range(self.jitter_min..self.jitter_max)
    } else {
      self.jitter_min
    };
    self.delay_with_ratio(attempt, ratio)
  }

  fn delay_with_ratio(&self, attempt: u32, ratio: f64) -> Duration {
    let delay = self.base_delay(attempt);
    let jitter = delay.mul_f64(ratio);
    (delay + jitter).min(self.max + jitter)
  }
}
