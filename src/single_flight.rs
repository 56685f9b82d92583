//! "At most one at a time" flag with guaranteed release.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct SingleFlight {
  busy: AtomicBool,
}

impl SingleFlight {
  pub fn new() -> Self {
    Self::default()
  }

  /// Claim the flag. `None` when another holder is active.
  pub fn try_begin(&self) -> Option<FlightPermit<'_>> {
    self
      .busy
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .ok()
      .map(|_| FlightPermit { flag: &self.busy })
  }

  pub fn is_busy(&self) -> bool {
    self.busy.load(Ordering::Acquire)
  }
}

/// Releases the flag when dropped.
#[derive(Debug)]
pub struct FlightPermit<'a> {
  flag: &'a AtomicBool,
}

impl Drop for FlightPermit<'_> {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn one_permit_at_a_time() {
    let flight = SingleFlight::new();
    let permit = flight.try_begin().unwrap();
    assert!(flight.try_begin().is_none());
    assert!(flight.is_busy());
    drop(permit);
    assert!(flight.try_begin().is_some());
  }
}
