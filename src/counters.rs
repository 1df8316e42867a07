//! Structured counters (spec §7: "counted, never logged per-event") for the
//! Resource/Policy-denied/Crypto error kinds that would otherwise flood the
//! log at line rate. Exposed read-only through the local admin IPC's
//! `GET /status`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    pub dropped_no_path: AtomicU64,
    pub dropped_by_filter: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub relay_dropped_records: AtomicU64,
    pub relay_dropped_congested: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            dropped_no_path: self.dropped_no_path.load(Ordering::Relaxed),
            dropped_by_filter: self.dropped_by_filter.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            relay_dropped_records: self.relay_dropped_records.load(Ordering::Relaxed),
            relay_dropped_congested: self.relay_dropped_congested.load(Ordering::Relaxed),
        }
    }

    pub fn inc_dropped_no_path(&self) {
        self.dropped_no_path.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped_by_filter(&self) {
        self.dropped_by_filter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_decrypt_failures(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_relay_dropped_records(&self) {
        self.relay_dropped_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_relay_dropped_congested(&self) {
        self.relay_dropped_congested.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Clone, Copy, Debug, Default, serde::Serialize)]
pub struct CountersSnapshot {
    pub dropped_no_path: u64,
    pub dropped_by_filter: u64,
    pub decrypt_failures: u64,
    pub relay_dropped_records: u64,
    pub relay_dropped_congested: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment_independently() {
        let counters = Counters::default();
        counters.inc_dropped_no_path();
        counters.inc_dropped_no_path();
        counters.inc_decrypt_failures();
        let snap = counters.snapshot();
        assert_eq!(snap.dropped_no_path, 2);
        assert_eq!(snap.decrypt_failures, 1);
        assert_eq!(snap.dropped_by_filter, 0);
    }
}
