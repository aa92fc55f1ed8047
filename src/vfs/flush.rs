//! Decides when the directory is written back.
//!
//! Every mutation bumps two counters. Crossing either threshold asks for an
//! immediate flush; otherwise a one-shot deadline is armed and the owner
//! polls it from its own thread of control with [`FlushController::poll`].

use crate::config::VfsConfig;
use std::time::{Duration, Instant};

/// What the caller should do after recording a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// A threshold was crossed; flush now.
    Immediate,
    /// The deferred flush is armed.
    Deferred,
}

#[derive(Debug, Clone)]
pub struct FlushController {
    max_bytes: u64,
    max_calls: u64,
    idle: Duration,
    dirty_bytes: u64,
    dirty_calls: u64,
    deadline: Option<Instant>,
}

impl FlushController {
    pub fn new(config: &VfsConfig) -> Self {
        Self {
            max_bytes: config.max_dirty_bytes,
            max_calls: config.max_dirty_calls,
            idle: config.dirty_timeout(),
            dirty_bytes: 0,
            dirty_calls: 0,
            deadline: None,
        }
    }

    /// Account for one mutating call that changed `bytes` bytes of data.
    pub fn record(&mut self, bytes: u64, now: Instant) -> FlushDecision {
        self.dirty_bytes = self.dirty_bytes.saturating_add(bytes);
        self.dirty_calls += 1;

        if self.dirty_bytes > self.max_bytes || self.dirty_calls > self.max_calls {
            return FlushDecision::Immediate;
        }
        if self.deadline.is_none() {
            self.deadline = Some(now + self.idle);
        }
        FlushDecision::Deferred
    }

    /// Check the deferred deadline. Returns `true` exactly once per armed
    /// deadline that has passed; the deadline is disarmed before returning.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_calls > 0
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes
    }

    pub fn dirty_calls(&self) -> u64 {
        self.dirty_calls
    }

    /// Reset the counters for a flush that is about to run. Returns whether
    /// there was anything to flush.
    pub fn begin_flush(&mut self) -> bool {
        let dirty = self.is_dirty();
        self.dirty_bytes = 0;
        self.dirty_calls = 0;
        self.deadline = None;
        dirty
    }

    /// A flush failed; keep the state dirty so the next one retries.
    pub fn flush_failed(&mut self) {
        self.dirty_calls = self.dirty_calls.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(max_bytes: u64, max_calls: u64) -> FlushController {
        FlushController::new(&VfsConfig {
            max_dirty_bytes: max_bytes,
            max_dirty_calls: max_calls,
            dirty_timeout_secs: 5,
            ..Default::default()
        })
    }

    #[test]
    fn test_byte_threshold() {
        let mut c = controller(100, 1000);
        let now = Instant::now();

        assert_eq!(c.record(60, now), FlushDecision::Deferred);
        assert_eq!(c.record(60, now), FlushDecision::Immediate);
    }

    #[test]
    fn test_call_threshold() {
        let mut c = controller(u64::MAX, 2);
        let now = Instant::now();

        assert_eq!(c.record(0, now), FlushDecision::Deferred);
        assert_eq!(c.record(0, now), FlushDecision::Deferred);
        assert_eq!(c.record(0, now), FlushDecision::Immediate);
    }

    #[test]
    fn test_deadline_fires_once() {
        let mut c = controller(1000, 1000);
        let start = Instant::now();
        c.record(1, start);
        c.record(1, start + Duration::from_secs(3));

        assert!(!c.poll(start + Duration::from_secs(4)));
        assert!(c.poll(start + Duration::from_secs(5)));
        assert!(!c.is_armed());
        assert!(!c.poll(start + Duration::from_secs(6)));
    }

    #[test]
    fn test_begin_flush_resets() {
        let mut c = controller(1000, 1000);
        assert!(!c.begin_flush());

        c.record(10, Instant::now());
        assert!(c.begin_flush());
        assert!(!c.is_dirty());
        assert!(!c.is_armed());
        assert_eq!(c.dirty_bytes(), 0);

        c.flush_failed();
        assert!(c.is_dirty());
    }
}
