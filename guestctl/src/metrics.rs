//! Service counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters updated by the service.
///
/// Counters are monotonic and never reset.
#[derive(Debug, Default)]
pub struct ServiceMetricsStorage {
    pub(crate) clients_connected: AtomicU64,
    pub(crate) clients_disconnected: AtomicU64,
    pub(crate) messages_queued: AtomicU64,
    pub(crate) messages_skipped: AtomicU64,
    pub(crate) reports_received: AtomicU64,
    pub(crate) reports_rejected: AtomicU64,
    pub(crate) requests_cancelled: AtomicU64,
    pub(crate) requests_timed_out: AtomicU64,
    pub(crate) bytes_sent: AtomicU64,
    pub(crate) bytes_received: AtomicU64,
}

impl ServiceMetricsStorage {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServiceMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ServiceMetrics {
            clients_connected: load(&self.clients_connected),
            clients_disconnected: load(&self.clients_disconnected),
            messages_queued: load(&self.messages_queued),
            messages_skipped: load(&self.messages_skipped),
            reports_received: load(&self.reports_received),
            reports_rejected: load(&self.reports_rejected),
            requests_cancelled: load(&self.requests_cancelled),
            requests_timed_out: load(&self.requests_timed_out),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
        }
    }
}

/// Point-in-time copy of [`ServiceMetricsStorage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ServiceMetrics {
    clients_connected: u64,
    clients_disconnected: u64,
    messages_queued: u64,
    messages_skipped: u64,
    reports_received: u64,
    reports_rejected: u64,
    requests_cancelled: u64,
    requests_timed_out: u64,
    bytes_sent: u64,
    bytes_received: u64,
}

impl ServiceMetrics {
    /// Clients that connected since the service started.
    pub fn clients_connected_total(&self) -> u64 {
        self.clients_connected
    }

    pub fn clients_disconnected_total(&self) -> u64 {
        self.clients_disconnected
    }

    /// Clients currently connected.
    pub fn num_connected_clients(&self) -> u64 {
        self.clients_connected
            .saturating_sub(self.clients_disconnected)
    }

    pub fn messages_queued_total(&self) -> u64 {
        self.messages_queued
    }

    /// Messages the guest dropped with `SkipHostMsg`.
    pub fn messages_skipped_total(&self) -> u64 {
        self.messages_skipped
    }

    pub fn reports_received_total(&self) -> u64 {
        self.reports_received
    }

    /// Reports that failed validation or arrived after a terminal status.
    pub fn reports_rejected_total(&self) -> u64 {
        self.reports_rejected
    }

    pub fn requests_cancelled_total(&self) -> u64 {
        self.requests_cancelled
    }

    pub fn requests_timed_out_total(&self) -> u64 {
        self.requests_timed_out
    }

    /// Stdin bytes queued for the guest.
    pub fn bytes_sent_total(&self) -> u64 {
        self.bytes_sent
    }

    /// Output bytes received from the guest.
    pub fn bytes_received_total(&self) -> u64 {
        self.bytes_received
    }
}
