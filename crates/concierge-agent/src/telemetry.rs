//! Process-wide counters shared by every conversation thread.

use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Default)]
struct Counters {
    turns: AtomicU64,
    suspensions: AtomicU64,
    resumes: AtomicU64,
    expired: AtomicU64,
    mismatches: AtomicU64,
    duplicate_skips: AtomicU64,
    llm_calls: AtomicU64,
    handler_errors: AtomicU64,
}

/// A cloneable handle over atomic counters.
///
/// All fields are `Arc`-wrapped, so cloning is cheap and increments from
/// concurrent turns never race.
#[derive(Clone, Default)]
pub struct Telemetry {
    counters: Arc<Counters>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub turns: u64,
    pub suspensions: u64,
    pub resumes: u64,
    pub expired: u64,
    pub mismatches: u64,
    pub duplicate_skips: u64,
    pub llm_calls: u64,
    pub handler_errors: u64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_turn(&self) {
        self.counters.turns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspension(&self) {
        self.counters.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resume(&self) {
        self.counters.resumes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.counters.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_mismatch(&self) {
        self.counters.mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_skip(&self) {
        self.counters.duplicate_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_llm_calls(&self, n: u32) {
        self.counters
            .llm_calls
            .fetch_add(u64::from(n), Ordering::Relaxed);
    }

    pub fn record_handler_error(&self) {
        self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let c = &self.counters;
        TelemetrySnapshot {
            turns: c.turns.load(Ordering::Relaxed),
            suspensions: c.suspensions.load(Ordering::Relaxed),
            resumes: c.resumes.load(Ordering::Relaxed),
            expired: c.expired.load(Ordering::Relaxed),
            mismatches: c.mismatches.load(Ordering::Relaxed),
            duplicate_skips: c.duplicate_skips.load(Ordering::Relaxed),
            llm_calls: c.llm_calls.load(Ordering::Relaxed),
            handler_errors: c.handler_errors.load(Ordering::Relaxed),
        }
    }
}
