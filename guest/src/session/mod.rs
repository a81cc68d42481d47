//! Guest process sessions.
//!
//! Each spawned child gets one reaper task, one pump per output stream and
//! one stdin worker. All of them report through the shared [`Reporter`], so
//! `Started` is always followed by exactly one terminal status. A session is
//! released once it has ended and both output streams were drained to EOF
//! or discarded by the host.

mod exit;
mod output;
mod spawn;
mod tools;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use guestctl_shared::constants::error_code;
use guestctl_shared::protocol::{
    ExecCommand, ExecInput, InputStatus, OutputRequest, ProcessStatus, StreamHandle, flags,
};
use guestctl_shared::{ContextId, GuestCtlError};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use self::output::OutputBuffer;
use self::spawn::Launched;
use crate::metrics::AgentMetricsStorage;
use crate::options::SessionOptions;
use crate::reporter::Reporter;

struct InputChunk {
    context: ContextId,
    data: Vec<u8>,
    eof: bool,
}

/// Agent-side state of one child process.
struct ProcessSession {
    pid: u32,
    /// Context of the `ExecuteCommand`; status reports carry it.
    context: ContextId,
    command: String,
    started_at: DateTime<Utc>,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    /// `None` once stdin no longer accepts data.
    input: Mutex<Option<mpsc::Sender<InputChunk>>>,
    finished: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSession {
    fn buffer(&self, handle: StreamHandle) -> &Arc<OutputBuffer> {
        match handle {
            StreamHandle::Stdout => &self.stdout,
            StreamHandle::Stderr => &self.stderr,
        }
    }

    fn close_input(&self) {
        self.input.lock().take();
    }

    fn is_done(&self) -> bool {
        self.finished.load(Ordering::Acquire)
            && self.stdout.eof_delivered()
            && self.stderr.eof_delivered()
    }
}

/// Public view of a running session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ProcessSessionInfo {
    pub pid: u32,
    pub context: ContextId,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub finished: bool,
    pub accepts_input: bool,
}

struct Inner {
    sessions: Mutex<HashMap<u32, Arc<ProcessSession>>>,
    reapers: Mutex<Vec<JoinHandle<()>>>,
    reporter: Reporter,
    options: SessionOptions,
    shutdown: watch::Sender<bool>,
    metrics: Arc<AgentMetricsStorage>,
}

/// Owns every child process the agent started.
#[derive(Clone)]
pub struct ProcessSessionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSessionManager")
            .field("sessions", &self.inner.sessions.lock().len())
            .finish()
    }
}

impl ProcessSessionManager {
    pub fn new(
        reporter: Reporter,
        options: SessionOptions,
        metrics: Arc<AgentMetricsStorage>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                reapers: Mutex::new(Vec::new()),
                reporter,
                options,
                shutdown,
                metrics,
            }),
        }
    }

    /// Start `cmd` and report `Started`, or report `Error` with the failure code.
    pub fn spawn(&self, cmd: &ExecCommand) {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            inner.reporter.status(
                cmd.context,
                0,
                ProcessStatus::Error,
                error_code::INVALID_STATE,
            );
            return;
        }

        let mut process = match spawn::launch(cmd) {
            Ok(process) => process,
            Err(e) => {
                AgentMetricsStorage::incr(&inner.metrics.spawn_failures);
                tracing::warn!(context = cmd.context, command = %cmd.command, error = %e, "Failed to spawn process");
                inner
                    .reporter
                    .status(cmd.context, 0, ProcessStatus::Error, e.status_code());
                return;
            }
        };

        let Some(pid) = process.id() else {
            // Already reaped; nothing to report against.
            inner.reporter.status(
                cmd.context,
                0,
                ProcessStatus::Error,
                error_code::INTERNAL,
            );
            return;
        };

        let options = &inner.options;
        let (input_tx, input_rx) = mpsc::channel(options.input_queue_depth.max(1));
        let session = Arc::new(ProcessSession {
            pid,
            context: cmd.context,
            command: cmd.command.clone(),
            started_at: Utc::now(),
            stdout: Arc::new(OutputBuffer::new(options.output_buffer_size)),
            stderr: Arc::new(OutputBuffer::new(options.output_buffer_size)),
            input: Mutex::new(Some(input_tx)),
            finished: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        inner.sessions.lock().insert(pid, session.clone());

        AgentMetricsStorage::incr(&inner.metrics.processes_started);
        tracing::info!(pid, context = cmd.context, command = %cmd.command, "Process started");
        inner
            .reporter
            .status(cmd.context, pid, ProcessStatus::Started, 0);

        {
            let io = process.take_io();
            let mut workers = session.workers.lock();
            for (handle, reader) in [
                (StreamHandle::Stdout, io.stdout),
                (StreamHandle::Stderr, io.stderr),
            ] {
                match reader {
                    Some(reader) => workers.push(self.spawn_pump(reader, &session, handle)),
                    None => session.buffer(handle).close(),
                }
            }
            if let Some(stdin) = io.stdin {
                workers.push(tokio::spawn(stdin_worker(
                    stdin,
                    input_rx,
                    session.clone(),
                    inner.reporter.clone(),
                    inner.metrics.clone(),
                )));
            } else {
                session.close_input();
            }
        }

        let limit = (!cmd.wait_for_start_only() && cmd.timeout_ms > 0)
            .then(|| Duration::from_millis(u64::from(cmd.timeout_ms)));
        let reaper = tokio::spawn(reap(self.clone(), session, process, limit));
        let mut reapers = inner.reapers.lock();
        reapers.retain(|h| !h.is_finished());
        reapers.push(reaper);
    }

    /// Queue stdin data for `input.pid`; the outcome is reported asynchronously.
    pub fn write_input(&self, input: ExecInput) {
        let inner = &self.inner;
        let (context, pid, eof) = (input.context, input.pid, input.is_eof());

        let Some(session) = self.get(pid) else {
            inner
                .reporter
                .input_status(context, pid, InputStatus::Error, error_code::NOT_FOUND, 0);
            return;
        };

        if input.data.len() > inner.options.max_input_chunk {
            session.close_input();
            tracing::warn!(pid, len = input.data.len(), "Input chunk too large, closing stdin");
            inner
                .reporter
                .input_status(context, pid, InputStatus::Overflow, 0, 0);
            return;
        }

        let mut slot = session.input.lock();
        let Some(tx) = slot.as_ref() else {
            drop(slot);
            inner
                .reporter
                .input_status(context, pid, InputStatus::Terminated, 0, 0);
            return;
        };

        let chunk = InputChunk {
            context,
            data: input.data,
            eof,
        };
        match tx.try_send(chunk) {
            Ok(()) => {
                if eof {
                    slot.take();
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                slot.take();
                drop(slot);
                tracing::warn!(pid, "Input queue full, closing stdin");
                inner
                    .reporter
                    .input_status(context, pid, InputStatus::Overflow, 0, 0);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                slot.take();
                drop(slot);
                inner
                    .reporter
                    .input_status(context, pid, InputStatus::Terminated, 0, 0);
            }
        }
    }

    /// Answer an output request with whatever is buffered right now.
    pub fn drain_output(&self, request: &OutputRequest) {
        let inner = &self.inner;
        let Some(session) = self.get(request.pid) else {
            inner.reporter.status(
                request.context,
                request.pid,
                ProcessStatus::Error,
                error_code::NOT_FOUND,
            );
            return;
        };

        if request.is_discard() {
            let dropped = session.stdout.discard() + session.stderr.discard();
            session.close_input();
            tracing::debug!(pid = session.pid, dropped, "Output discarded by host");
            inner.reporter.output(
                request.context,
                request.pid,
                request.handle,
                flags::output::EOF,
                Vec::new(),
            );
            self.release_if_done(&session);
            return;
        }

        let (data, eof) = session
            .buffer(request.handle)
            .take(inner.options.max_output_chunk);
        AgentMetricsStorage::add(&inner.metrics.output_bytes, data.len());
        let out_flags = if eof {
            flags::output::EOF
        } else {
            flags::output::NONE
        };
        inner
            .reporter
            .output(request.context, request.pid, request.handle, out_flags, data);

        self.release_if_done(&session);
    }

    pub fn get_info(&self, pid: u32) -> Option<ProcessSessionInfo> {
        self.get(pid).map(|s| info(&s))
    }

    pub fn list(&self) -> Vec<ProcessSessionInfo> {
        let mut list: Vec<_> = self.inner.sessions.lock().values().map(|s| info(s)).collect();
        list.sort_by_key(|i| i.pid);
        list
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every child still running and wait up to `grace` for the reapers.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.send_replace(true);

        let reapers: Vec<_> = std::mem::take(&mut *self.inner.reapers.lock());
        let pending = reapers.len();
        if tokio::time::timeout(grace, join_all(reapers))
            .await
            .is_err()
        {
            tracing::warn!(pending, ?grace, "Reapers did not finish within grace period");
        }

        let sessions: Vec<_> = self.inner.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in sessions {
            for worker in session.workers.lock().drain(..) {
                worker.abort();
            }
        }
        tracing::info!("Process sessions shut down");
    }

    /// Pump `reader` into the session buffer; the session may be released
    /// once the stream closes.
    fn spawn_pump<R>(
        &self,
        reader: R,
        session: &Arc<ProcessSession>,
        handle: StreamHandle,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let manager = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let stream = match handle {
                StreamHandle::Stdout => "stdout",
                StreamHandle::Stderr => "stderr",
            };
            output::pump(reader, session.buffer(handle).clone(), session.pid, stream).await;
            manager.release_if_done(&session);
        })
    }

    fn get(&self, pid: u32) -> Option<Arc<ProcessSession>> {
        self.inner.sessions.lock().get(&pid).cloned()
    }

    /// Report the terminal status once.
    fn finish(&self, session: &Arc<ProcessSession>, status: ProcessStatus, status_flags: u32) {
        if session.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        session.close_input();
        AgentMetricsStorage::incr(&self.inner.metrics.processes_finished);
        tracing::info!(pid = session.pid, ?status, flags = status_flags, "Process finished");
        self.inner
            .reporter
            .status(session.context, session.pid, status, status_flags);
        self.release_if_done(session);
    }

    fn release_if_done(&self, session: &Arc<ProcessSession>) {
        if !session.is_done() {
            return;
        }
        if self.inner.sessions.lock().remove(&session.pid).is_some() {
            tracing::debug!(pid = session.pid, "Process session released");
        }
    }
}

fn info(session: &ProcessSession) -> ProcessSessionInfo {
    ProcessSessionInfo {
        pid: session.pid,
        context: session.context,
        command: session.command.clone(),
        started_at: session.started_at,
        finished: session.finished.load(Ordering::Acquire),
        accepts_input: session.input.lock().is_some(),
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

enum Reaped {
    Exited(std::io::Result<(ProcessStatus, u32)>),
    TimedOut,
    Shutdown,
}

async fn reap(
    manager: ProcessSessionManager,
    session: Arc<ProcessSession>,
    mut process: Launched,
    limit: Option<Duration>,
) {
    let mut shutdown = manager.inner.shutdown.subscribe();
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let reaped = tokio::select! {
        status = process.wait() => Reaped::Exited(status),
        _ = deadline => Reaped::TimedOut,
        _ = stop_requested(&mut shutdown) => Reaped::Shutdown,
    };

    let grace = manager.inner.options.kill_grace();
    let (status, status_flags) = match reaped {
        Reaped::Exited(Ok(outcome)) => outcome,
        Reaped::Exited(Err(e)) => {
            tracing::warn!(pid = session.pid, error = %e, "Waiting for process failed");
            (ProcessStatus::Error, GuestCtlError::Io(e).status_code())
        }
        Reaped::TimedOut => {
            tracing::info!(pid = session.pid, ?limit, "Process timed out, killing");
            if process.kill(grace).await {
                (ProcessStatus::TimedOutKilled, 0)
            } else {
                (ProcessStatus::TimedOutNotKilled, 0)
            }
        }
        Reaped::Shutdown => {
            if !process.kill(grace).await {
                tracing::warn!(pid = session.pid, "Process did not die at shutdown");
            }
            (ProcessStatus::KilledAtShutdown, 0)
        }
    };

    manager.finish(&session, status, status_flags);
}

async fn stdin_worker<W>(
    mut stdin: W,
    mut rx: mpsc::Receiver<InputChunk>,
    session: Arc<ProcessSession>,
    reporter: Reporter,
    metrics: Arc<AgentMetricsStorage>,
) where
    W: AsyncWrite + Unpin,
{
    let pid = session.pid;
    while let Some(chunk) = rx.recv().await {
        let result = match stdin.write_all(&chunk.data).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                AgentMetricsStorage::add(&metrics.stdin_bytes, chunk.data.len());
                reporter.input_status(
                    chunk.context,
                    pid,
                    InputStatus::Written,
                    0,
                    chunk.data.len() as u32,
                );
                if chunk.eof {
                    tracing::debug!(pid, "Stdin closed");
                    break;
                }
            }
            Err(e) => {
                session.close_input();
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    tracing::debug!(pid, "Process closed its stdin");
                    reporter.input_status(chunk.context, pid, InputStatus::Terminated, 0, 0);
                } else {
                    tracing::warn!(pid, error = %e, "Writing to stdin failed");
                    let code = GuestCtlError::Io(e).status_code();
                    reporter.input_status(chunk.context, pid, InputStatus::Error, code, 0);
                }
                rx.close();
                while let Some(rest) = rx.recv().await {
                    reporter.input_status(rest.context, pid, InputStatus::Terminated, 0, 0);
                }
                break;
            }
        }
    }
    drop(stdin);
}
