//! Four counters: `mta.session`, `mta.task`, `mta.task.running`,
//! `mta.envelope`.
//!
//! Metrics backends are an external collaborator, so this module only
//! keeps the numbers and hands back a snapshot — wiring them to
//! Prometheus/statsd/whatever is someone else's job.

use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    session: AtomicI64,
    task: AtomicI64,
    task_running: AtomicI64,
    envelope: AtomicI64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub session: i64,
    pub task: i64,
    pub task_running: i64,
    pub envelope: i64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_started(&self) {
        self.session.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.session.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.task.fetch_add(1, Ordering::Relaxed);
        self.task_running.fetch_add(1, Ordering::Relaxed);
    }

    /// A task leaves the running set (handed to DATA) but is only fully
    /// retired, decrementing `task`, once every envelope has a verdict.
    pub fn task_retired(&self, envelope_count: i64) {
        self.task.fetch_sub(1, Ordering::Relaxed);
        self.task_running.fetch_sub(1, Ordering::Relaxed);
        self.envelope.fetch_sub(envelope_count, Ordering::Relaxed);
    }

    pub fn envelope_added(&self, count: i64) {
        self.envelope.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            session: self.session.load(Ordering::Relaxed),
            task: self.task.load(Ordering::Relaxed),
            task_running: self.task_running.load(Ordering::Relaxed),
            envelope: self.envelope.load(Ordering::Relaxed),
        }
    }
}
