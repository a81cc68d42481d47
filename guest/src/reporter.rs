//! Single FIFO path for everything the guest reports to the host.
//!
//! Status, output and input-status reports from all tasks are funnelled
//! through one queue, so per-process ordering is the order of enqueueing.

use std::sync::Arc;

use guestctl_shared::protocol::{
    GuestReport, InputStatus, InputStatusReport, OutputReport, ProcessStatus, StatusReport,
    StreamHandle,
};
use guestctl_shared::ContextId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::channel::GuestChannel;
use crate::metrics::AgentMetricsStorage;

enum ReportCommand {
    Send(GuestReport),
    Close(oneshot::Sender<()>),
}

/// Cloneable handle to the report queue.
#[derive(Clone, Debug)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<ReportCommand>,
}

impl Reporter {
    /// Start the task that ships queued reports over `channel`.
    pub fn spawn(
        channel: GuestChannel,
        metrics: Arc<AgentMetricsStorage>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    ReportCommand::Send(report) => {
                        match channel.send_report(&report).await {
                            Ok(()) => AgentMetricsStorage::incr(&metrics.reports_sent),
                            Err(e) => {
                                AgentMetricsStorage::incr(&metrics.report_failures);
                                tracing::warn!(
                                    context = report.context(),
                                    pid = report.pid(),
                                    function = report.function().name(),
                                    error = %e,
                                    "Failed to deliver report"
                                );
                            }
                        }
                    }
                    ReportCommand::Close(done) => {
                        rx.close();
                        let _ = done.send(());
                        break;
                    }
                }
            }
            tracing::debug!("Reporter stopped");
        });
        (Self { tx }, task)
    }

    /// A reporter whose reports go to `tx`, for tests.
    #[cfg(test)]
    pub(crate) fn capture() -> (Self, mpsc::UnboundedReceiver<GuestReport>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    ReportCommand::Send(report) => {
                        let _ = out_tx.send(report);
                    }
                    ReportCommand::Close(done) => {
                        let _ = done.send(());
                        break;
                    }
                }
            }
        });
        (Self { tx }, out_rx)
    }

    pub fn send(&self, report: GuestReport) {
        if self.tx.send(ReportCommand::Send(report)).is_err() {
            tracing::debug!("Report queue closed, dropping report");
        }
    }

    pub fn status(&self, context: ContextId, pid: u32, status: ProcessStatus, flags: u32) {
        self.send(GuestReport::Status(StatusReport {
            context,
            pid,
            status,
            flags,
            data: Vec::new(),
        }));
    }

    pub fn output(
        &self,
        context: ContextId,
        pid: u32,
        handle: StreamHandle,
        flags: u32,
        data: Vec<u8>,
    ) {
        self.send(GuestReport::Output(OutputReport {
            context,
            pid,
            handle,
            flags,
            data,
        }));
    }

    pub fn input_status(
        &self,
        context: ContextId,
        pid: u32,
        status: InputStatus,
        flags: u32,
        bytes_written: u32,
    ) {
        self.send(GuestReport::InputStatus(InputStatusReport {
            context,
            pid,
            status,
            flags,
            bytes_written,
        }));
    }

    /// Flush everything queued so far, then stop. Later reports are dropped.
    pub async fn close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(ReportCommand::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}
