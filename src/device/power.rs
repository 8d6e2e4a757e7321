//! Power-domain bookkeeping for the aperture.
//!
//! Fault service holds a wakeref while it touches aperture state, and arms
//! a debounced auto-suspend timer once a userfault mapping is live, so the
//! domain stays up across a burst of faults and idles afterwards.

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct PowerDomain {
    wakerefs: Mutex<u32>,
    autosuspend_deadline: Mutex<Option<Instant>>,
    debounce: Duration,
}

impl PowerDomain {
    pub(crate) fn new(debounce: Duration) -> Self {
        Self {
            wakerefs: Mutex::new(0),
            autosuspend_deadline: Mutex::new(None),
            debounce,
        }
    }

    /// Keep the domain awake until the returned guard drops.
    pub fn wakeref(&self) -> WakeRef<'_> {
        *self.wakerefs.lock().unwrap() += 1;
        WakeRef { domain: self }
    }

    #[must_use]
    pub fn wakeref_count(&self) -> u32 {
        *self.wakerefs.lock().unwrap()
    }

    /// Push the auto-suspend deadline out by the debounce interval.
    pub(crate) fn arm_userfault_autosuspend(&self) {
        *self.autosuspend_deadline.lock().unwrap() = Some(Instant::now() + self.debounce);
    }

    #[must_use]
    pub fn autosuspend_armed(&self) -> bool {
        self.autosuspend_deadline.lock().unwrap().is_some()
    }

    /// Whether the domain may suspend at `now`.
    #[must_use]
    pub fn may_suspend(&self, now: Instant) -> bool {
        if self.wakeref_count() > 0 {
            return false;
        }
        self.autosuspend_deadline
            .lock()
            .unwrap()
            .is_none_or(|deadline| now >= deadline)
    }
}

pub struct WakeRef<'a> {
    domain: &'a PowerDomain,
}

impl Drop for WakeRef<'_> {
    fn drop(&mut self) {
        let mut refs = self.domain.wakerefs.lock().unwrap();
        debug_assert!(*refs > 0);
        *refs -= 1;
    }
}
