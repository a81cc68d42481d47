//! Agent counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free agent counters. Monotonic, never reset.
#[derive(Debug, Default)]
pub struct AgentMetricsStorage {
    pub(crate) messages_handled: AtomicU64,
    pub(crate) messages_skipped: AtomicU64,
    pub(crate) processes_started: AtomicU64,
    pub(crate) spawn_failures: AtomicU64,
    pub(crate) processes_finished: AtomicU64,
    pub(crate) reports_sent: AtomicU64,
    pub(crate) report_failures: AtomicU64,
    pub(crate) stdin_bytes: AtomicU64,
    pub(crate) output_bytes: AtomicU64,
}

impl AgentMetricsStorage {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        AgentMetrics {
            messages_handled: load(&self.messages_handled),
            messages_skipped: load(&self.messages_skipped),
            processes_started: load(&self.processes_started),
            spawn_failures: load(&self.spawn_failures),
            processes_finished: load(&self.processes_finished),
            reports_sent: load(&self.reports_sent),
            report_failures: load(&self.report_failures),
            stdin_bytes: load(&self.stdin_bytes),
            output_bytes: load(&self.output_bytes),
        }
    }
}

/// Snapshot of [`AgentMetricsStorage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct AgentMetrics {
    pub messages_handled: u64,
    pub messages_skipped: u64,
    pub processes_started: u64,
    pub spawn_failures: u64,
    pub processes_finished: u64,
    pub reports_sent: u64,
    pub report_failures: u64,
    /// Bytes written to process stdin.
    pub stdin_bytes: u64,
    /// Bytes handed to the host in `SendOutput`.
    pub output_bytes: u64,
}

impl AgentMetrics {
    /// Processes started and not yet reported terminal.
    pub fn num_running_processes(&self) -> u64 {
        self.processes_started
            .saturating_sub(self.processes_finished)
    }
}
