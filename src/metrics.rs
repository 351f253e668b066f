use opentelemetry::{
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

use crate::session::Side;

/// Plain per-worker counters. Only the owning worker writes them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub accepted: u64,
    /// Accepted connections closed straight away (pool full, fd too large).
    pub rejected: u64,
    pub live: u64,
    pub bytes_c2s: u64,
    pub bytes_s2c: u64,
    /// Graceful end-of-stream per side, indexed by [`Side::index`].
    pub closes: [u64; 2],
    /// I/O failures per side, indexed by [`Side::index`].
    pub errors: [u64; 2],
    pub read_suspends: u64,
    pub read_resumes: u64,
    pub deferred_deletes: u64,
    pub deleted: u64,
}

impl WorkerStats {
    pub fn record_close(&mut self, side: Side) {
        self.closes[side.index()] += 1;
    }

    pub fn record_error(&mut self, side: Side) {
        self.errors[side.index()] += 1;
    }

    /// Bytes received on `from`, relayed towards the other side.
    pub fn record_bytes(&mut self, from: Side, n: usize) {
        match from {
            Side::Client => self.bytes_c2s += n as u64,
            Side::Backend => self.bytes_s2c += n as u64,
        }
    }

    pub fn closes(&self, side: Side) -> u64 {
        self.closes[side.index()]
    }

    pub fn errors(&self, side: Side) -> u64 {
        self.errors[side.index()]
    }
}

/// OpenTelemetry view of [`WorkerStats`], fed by deltas.
pub struct ProxyMetrics {
    accepted: Counter<u64>,
    rejected: Counter<u64>,
    live: Gauge<u64>,
    bytes: Counter<u64>,
    closes: Counter<u64>,
    errors: Counter<u64>,
    read_suspends: Counter<u64>,
    deferred_deletes: Counter<u64>,
    worker: KeyValue,
    last: WorkerStats,
}

impl ProxyMetrics {
    pub fn new(meter: &Meter, worker: usize) -> Self {
        Self {
            accepted: meter.u64_counter("sluice_session_accept_total").build(),
            rejected: meter.u64_counter("sluice_session_reject_total").build(),
            live: meter.u64_gauge("sluice_sessions_active").build(),
            bytes: meter.u64_counter("sluice_relay_bytes_total").build(),
            closes: meter.u64_counter("sluice_close_total").build(),
            errors: meter.u64_counter("sluice_error_total").build(),
            read_suspends: meter.u64_counter("sluice_read_suspend_total").build(),
            deferred_deletes: meter.u64_counter("sluice_deferred_delete_total").build(),
            worker: KeyValue::new("worker", worker as i64),
            last: WorkerStats::default(),
        }
    }

    /// Records everything that changed since the previous publish.
    pub fn publish(&mut self, stats: &WorkerStats) {
        let last = self.last;
        let worker = self.worker.clone();
        let plain = std::slice::from_ref(&worker);

        add(&self.accepted, stats.accepted - last.accepted, plain);
        add(&self.rejected, stats.rejected - last.rejected, plain);
        add(&self.read_suspends, stats.read_suspends - last.read_suspends, plain);
        add(
            &self.deferred_deletes,
            stats.deferred_deletes - last.deferred_deletes,
            plain,
        );
        self.live.record(stats.live, plain);

        for (direction, now, then) in [
            ("c2s", stats.bytes_c2s, last.bytes_c2s),
            ("s2c", stats.bytes_s2c, last.bytes_s2c),
        ] {
            add(
                &self.bytes,
                now - then,
                &[worker.clone(), KeyValue::new("direction", direction)],
            );
        }
        for side in [Side::Client, Side::Backend] {
            let attrs = [worker.clone(), KeyValue::new("side", side.as_str())];
            add(&self.closes, stats.closes(side) - last.closes(side), &attrs);
            add(&self.errors, stats.errors(side) - last.errors(side), &attrs);
        }

        self.last = *stats;
    }
}

fn add(counter: &Counter<u64>, delta: u64, attrs: &[KeyValue]) {
    if delta > 0 {
        counter.add(delta, attrs);
    }
}
