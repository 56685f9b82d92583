//! Host environment signals: link state and foreground visibility.
//!
//! The embedding application updates these from whatever the platform
//! reports; the executor and the connectivity monitor only read them.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct HostSignals {
  link_online: AtomicBool,
  visible: AtomicBool,
}

impl HostSignals {
  pub fn new() -> Self {
    Self {
      link_online: AtomicBool::new(true),
      visible: AtomicBool::new(true),
    }
  }

  pub fn is_link_online(&self) -> bool {
    self.link_online.load(Ordering::Acquire)
  }

  pub fn set_link_online(&self, online: bool) {
    self.link_online.store(online, Ordering::Release);
  }

  pub fn is_visible(&self) -> bool {
    self.visible.load(Ordering::Acquire)
  }

  pub fn set_visible(&self, visible: bool) {
    self.visible.store(visible, Ordering::Release);
  }
}

impl Default for HostSignals {
  fn default() -> Self {
    Self::new()
  }
}
