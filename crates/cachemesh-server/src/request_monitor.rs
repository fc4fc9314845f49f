//! Per-worker load accounting.
//!
//! Every handled request leaves a `(start, end)` record; the capacity
//! factor is the summed processing time over the elapsed trailing
//! window. Records older than the TTL are dropped before each reading.

use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct RequestRecord {
    start_ms: u64,
    end_ms: u64,
}

impl RequestRecord {
    fn processing_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Tracks recent request processing times for one worker.
#[derive(Debug)]
pub struct RequestMonitor {
    /// Records ordered by start time (requests are recorded as they
    /// complete, and starts are monotonic enough for TTL trimming).
    records: Mutex<VecDeque<RequestRecord>>,
    record_ttl_ms: u64,
}

impl RequestMonitor {
    pub fn new(record_ttl_ms: u64) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            record_ttl_ms,
        }
    }

    /// Record one handled request by its processing interval
    /// (milliseconds since the epoch).
    pub fn record(&self, start_ms: u64, end_ms: u64) {
        let mut records = self.records.lock().expect("request records lock");
        records.push_back(RequestRecord { start_ms, end_ms });
    }

    /// Drop records whose start is older than the TTL at `now_ms`.
    pub fn clear_expired(&self, now_ms: u64) {
        let mut records = self.records.lock().expect("request records lock");
        while let Some(front) = records.front() {
            if front.start_ms + self.record_ttl_ms < now_ms {
                records.pop_front();
            } else {
                break;
            }
        }
    }

    /// The worker's load: summed processing time of live records over
    /// the time elapsed since the earliest live record. 0.0 when idle;
    /// may exceed 1.0 under queueing.
    pub fn capacity_factor(&self, now_ms: u64) -> f64 {
        self.clear_expired(now_ms);
        let records = self.records.lock().expect("request records lock");
        let first_start = match records.front() {
            Some(record) => record.start_ms,
            None => return 0.0,
        };
        let window_ms = now_ms.saturating_sub(first_start);
        if window_ms == 0 {
            return 0.0;
        }
        let busy_ms: u64 = records.iter().map(RequestRecord::processing_ms).sum();
        busy_ms as f64 / window_ms as f64
    }
}
