use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use thiserror::Error;

pub trait Clock: Send + Sync {
    fn now_epoch(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeSyncError {
    #[error("time source unavailable: {0}")]
    Unavailable(String),
    #[error("time sync did not complete within {0:?}")]
    Timeout(Duration),
}

pub trait TimeSync: Send {
    fn sync(&mut self) -> Result<(), TimeSyncError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsTimeSync;

impl TimeSync for OsTimeSync {
    fn sync(&mut self) -> Result<(), TimeSyncError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TimeSyncTracker {
    interval_secs: i64,
    last_attempt: Option<i64>,
}

impl TimeSyncTracker {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs: i64::try_from(interval_secs).unwrap_or(i64::MAX),
            last_attempt: None,
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        match self.last_attempt {
            None => true,
            // A clock that stepped backwards also counts as due.
            Some(last) => now < last || now.saturating_sub(last) >= self.interval_secs,
        }
    }

    pub fn record_attempt(&mut self, now: i64) {
        self.last_attempt = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_on_demand() {
        let clock = ManualClock::new(100);
        clock.advance(50);
        assert_eq!(clock.now_epoch(), 150);
        clock.set(7);
        assert_eq!(clock.now_epoch(), 7);
    }

    #[test]
    fn sync_is_due_once_per_interval() {
        let mut tracker = TimeSyncTracker::new(86_400);
        assert!(tracker.is_due(0));

        tracker.record_attempt(0);
        assert!(!tracker.is_due(86_399));
        assert!(tracker.is_due(86_400));
    }

    #[test]
    fn clock_stepping_backwards_triggers_sync() {
        let mut tracker = TimeSyncTracker::new(86_400);
        tracker.record_attempt(1_700_000_000);
        assert!(tracker.is_due(10));
    }
}
