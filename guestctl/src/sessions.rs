//! Host-visible process sessions.
//!
//! A session is keyed by (client, pid). It is created when the guest reports
//! `Started`, collects the output the guest sends, and records the terminal
//! status. It is destroyed when the caller consumes the exit, or when the
//! client disconnects.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use guestctl_shared::protocol::{ProcessStatus, StreamHandle};
use guestctl_shared::{ClientId, ContextId, GuestCtlError, GuestCtlResult};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;

/// Status published to waiters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub status: ProcessStatus,
    pub flags: u32,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Default)]
struct StreamBuffer {
    data: Vec<u8>,
    eof: bool,
}

struct ExecSession {
    context: ContextId,
    status: ProcessStatus,
    flags: u32,
    accepts_input: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    state_tx: watch::Sender<SessionState>,
}

impl ExecSession {
    fn stream(&mut self, handle: StreamHandle) -> &mut StreamBuffer {
        match handle {
            StreamHandle::Stdout => &mut self.stdout,
            StreamHandle::Stderr => &mut self.stderr,
        }
    }

    fn info(&self, client: ClientId, pid: u32) -> ExecSessionInfo {
        ExecSessionInfo {
            client,
            pid,
            context: self.context,
            status: self.status,
            flags: self.flags,
            accepts_input: self.accepts_input,
            started_at: self.started_at,
            finished_at: self.finished_at,
            stdout_eof: self.stdout.eof,
            stderr_eof: self.stderr.eof,
            buffered_bytes: self.stdout.data.len() + self.stderr.data.len(),
        }
    }
}

/// Snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecSessionInfo {
    pub client: ClientId,
    pub pid: u32,
    /// Context of the `ExecuteCommand` that spawned the process.
    pub context: ContextId,
    pub status: ProcessStatus,
    pub flags: u32,
    pub accepts_input: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stdout_eof: bool,
    pub stderr_eof: bool,
    pub buffered_bytes: usize,
}

/// What a status report did to the session table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOutcome {
    Created,
    Updated,
    /// No session is spawned by this context.
    Ignored,
    Rejected(String),
}

/// Thread-safe table of live process sessions.
#[derive(Clone, Default)]
pub struct ExecSessionManager {
    inner: Arc<RwLock<HashMap<(ClientId, u32), ExecSession>>>,
}

impl std::fmt::Debug for ExecSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSessionManager")
            .field("sessions", &self.inner.read().len())
            .finish()
    }
}

impl ExecSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a `ReportStatus` to the session it belongs to.
    ///
    /// Only reports against the spawning context change a session. Anything
    /// after a terminal status is rejected.
    pub fn on_status(
        &self,
        client: ClientId,
        context: ContextId,
        pid: u32,
        status: ProcessStatus,
        flags: u32,
    ) -> StatusOutcome {
        let mut sessions = self.inner.write();
        let key = (client, pid);

        if !sessions.contains_key(&key) {
            if status != ProcessStatus::Started {
                return StatusOutcome::Ignored;
            }
            let state = SessionState { status, flags };
            let (state_tx, _) = watch::channel(state);
            sessions.insert(
                key,
                ExecSession {
                    context,
                    status,
                    flags,
                    accepts_input: true,
                    started_at: Utc::now(),
                    finished_at: None,
                    stdout: StreamBuffer::default(),
                    stderr: StreamBuffer::default(),
                    state_tx,
                },
            );
            tracing::debug!(client, pid, context, "Process session created");
            return StatusOutcome::Created;
        }
        let Some(session) = sessions.get_mut(&key) else {
            return StatusOutcome::Ignored;
        };

        if session.context != context {
            if status == ProcessStatus::Started {
                return StatusOutcome::Rejected(format!(
                    "pid {pid} already belongs to context {}",
                    session.context
                ));
            }
            return StatusOutcome::Ignored;
        }
        if session.status.is_terminal() {
            return StatusOutcome::Rejected(format!(
                "process {pid} already reported {:?}",
                session.status
            ));
        }
        if status == ProcessStatus::Started {
            return StatusOutcome::Rejected(format!("process {pid} reported Started twice"));
        }

        tracing::debug!(
            client,
            pid,
            old_status = ?session.status,
            new_status = ?status,
            flags,
            "Updating process status"
        );
        session.status = status;
        session.flags = flags;
        if status.is_terminal() {
            session.finished_at = Some(Utc::now());
            session.accepts_input = false;
        }
        session.state_tx.send_replace(SessionState { status, flags });
        StatusOutcome::Updated
    }

    /// Append output received from the guest. Returns false without a session.
    pub fn append_output(
        &self,
        client: ClientId,
        pid: u32,
        handle: StreamHandle,
        data: &[u8],
        eof: bool,
    ) -> bool {
        let mut sessions = self.inner.write();
        let Some(session) = sessions.get_mut(&(client, pid)) else {
            return false;
        };
        let stream = session.stream(handle);
        stream.data.extend_from_slice(data);
        stream.eof |= eof;
        true
    }

    /// Take everything buffered for `handle`; the flag tells whether the
    /// stream is closed and fully drained.
    pub fn take_output(
        &self,
        client: ClientId,
        pid: u32,
        handle: StreamHandle,
    ) -> GuestCtlResult<(Vec<u8>, bool)> {
        let mut sessions = self.inner.write();
        let session = sessions
            .get_mut(&(client, pid))
            .ok_or_else(|| not_found(client, pid))?;
        let stream = session.stream(handle);
        Ok((std::mem::take(&mut stream.data), stream.eof))
    }

    pub fn accepts_input(&self, client: ClientId, pid: u32) -> GuestCtlResult<bool> {
        self.inner
            .read()
            .get(&(client, pid))
            .map(|s| s.accepts_input)
            .ok_or_else(|| not_found(client, pid))
    }

    pub fn close_input(&self, client: ClientId, pid: u32) {
        if let Some(session) = self.inner.write().get_mut(&(client, pid)) {
            session.accepts_input = false;
        }
    }

    /// Watch status changes of a session.
    pub fn subscribe(
        &self,
        client: ClientId,
        pid: u32,
    ) -> GuestCtlResult<watch::Receiver<SessionState>> {
        self.inner
            .read()
            .get(&(client, pid))
            .map(|s| s.state_tx.subscribe())
            .ok_or_else(|| not_found(client, pid))
    }

    pub fn get(&self, client: ClientId, pid: u32) -> Option<ExecSessionInfo> {
        self.inner.read().get(&(client, pid)).map(|s| s.info(client, pid))
    }

    /// Sessions of one client, or of all clients.
    pub fn list(&self, client: Option<ClientId>) -> Vec<ExecSessionInfo> {
        let mut list: Vec<_> = self
            .inner
            .read()
            .iter()
            .filter(|((c, _), _)| client.is_none_or(|wanted| wanted == *c))
            .map(|((c, pid), s)| s.info(*c, *pid))
            .collect();
        list.sort_by_key(|s| (s.client, s.pid));
        list
    }

    pub fn remove(&self, client: ClientId, pid: u32) -> Option<ExecSessionInfo> {
        let removed = self.inner.write().remove(&(client, pid));
        removed.map(|s| {
            tracing::debug!(client, pid, status = ?s.status, "Process session removed");
            s.info(client, pid)
        })
    }

    /// Destroy all sessions of a client. Waiters observe a closed channel.
    pub fn remove_client(&self, client: ClientId) -> usize {
        let mut sessions = self.inner.write();
        let before = sessions.len();
        sessions.retain(|(c, _), _| *c != client);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

fn not_found(client: ClientId, pid: u32) -> GuestCtlError {
    GuestCtlError::NotFound(format!("no session for pid {pid} on client {client}"))
}
