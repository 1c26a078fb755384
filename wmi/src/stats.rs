//! Runtime statistics

use core::sync::atomic::{AtomicU64, Ordering};

/// WMI runtime statistics
pub struct WmiStats {
    /// Data sources added
    pub registrations: AtomicU64,
    /// Update passes over an existing data source
    pub updates: AtomicU64,
    /// Data sources removed
    pub deregistrations: AtomicU64,
    /// Events handed to the delivery pipeline
    pub events_fired: AtomicU64,
    /// Events copied to a consumer (queued, callback or pending request)
    pub events_delivered: AtomicU64,
    /// Events dropped because a consumer queue was full
    pub events_lost: AtomicU64,
    /// Enable requests sent to providers
    pub enable_requests: AtomicU64,
    /// Disable requests sent to providers
    pub disable_requests: AtomicU64,
    /// Registration records rejected as malformed
    pub invalid_records: AtomicU64,
    /// Mailbox notices that never reached their reply object
    pub replies_lost: AtomicU64,
}

impl WmiStats {
    pub const fn new() -> Self {
        Self {
            registrations: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            deregistrations: AtomicU64::new(0),
            events_fired: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_lost: AtomicU64::new(0),
            enable_requests: AtomicU64::new(0),
            disable_requests: AtomicU64::new(0),
            invalid_records: AtomicU64::new(0),
            replies_lost: AtomicU64::new(0),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WmiStatistics {
        WmiStatistics {
            registrations: self.registrations.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deregistrations: self.deregistrations.load(Ordering::Relaxed),
            events_fired: self.events_fired.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_lost: self.events_lost.load(Ordering::Relaxed),
            enable_requests: self.enable_requests.load(Ordering::Relaxed),
            disable_requests: self.disable_requests.load(Ordering::Relaxed),
            invalid_records: self.invalid_records.load(Ordering::Relaxed),
            replies_lost: self.replies_lost.load(Ordering::Relaxed),
        }
    }
}

impl Default for WmiStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`WmiStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WmiStatistics {
    pub registrations: u64,
    pub updates: u64,
    pub deregistrations: u64,
    pub events_fired: u64,
    pub events_delivered: u64,
    pub events_lost: u64,
    pub enable_requests: u64,
    pub disable_requests: u64,
    pub invalid_records: u64,
    pub replies_lost: u64,
}
