//! Handle to a process running in the guest.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use guestctl_shared::protocol::{
    CallbackData, ExecInput, HostMessage, InputStatus, OutputRequest, ProcessStatus,
    StreamHandle, flags,
};
use guestctl_shared::{ClientId, ContextId, GuestCtlError, GuestCtlResult};
use serde::Serialize;
use tokio::time::Instant;

use super::{GuestControl, describe_code};
use crate::sessions::ExecSessionInfo;

/// Bytes read from one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub handle: StreamHandle,
    pub data: Vec<u8>,
    /// The stream is closed; no more data follows.
    pub eof: bool,
}

/// How a guest process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub pid: u32,
    pub status: ProcessStatus,
    /// Raw `flags` of the terminal status report.
    pub flags: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessExit {
    fn from_info(info: ExecSessionInfo) -> Self {
        Self {
            pid: info.pid,
            status: info.status,
            flags: info.flags,
            started_at: info.started_at,
            finished_at: info.finished_at,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        (self.status == ProcessStatus::ExitedNormally).then_some(self.flags as i32)
    }

    pub fn signal(&self) -> Option<i32> {
        (self.status == ProcessStatus::ExitedViaSignal).then_some(self.flags as i32)
    }

    pub fn error_code(&self) -> Option<u32> {
        (self.status == ProcessStatus::Error).then_some(self.flags)
    }

    pub fn success(&self) -> bool {
        self.exit_code() == Some(0)
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// Everything a process wrote plus its exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectedOutput {
    pub exit: ProcessExit,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A process started through [`GuestControl::execute`].
#[derive(Clone, Debug)]
pub struct GuestProcess {
    control: GuestControl,
    client: ClientId,
    pid: u32,
    context: ContextId,
}

impl GuestProcess {
    pub(crate) fn new(control: GuestControl, client: ClientId, pid: u32, context: ContextId) -> Self {
        Self {
            control,
            client,
            pid,
            context,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Context of the `ExecuteCommand` that started the process.
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn info(&self) -> Option<ExecSessionInfo> {
        self.control.service().sessions().get(self.client, self.pid)
    }

    /// Send stdin data; `eof` closes stdin after it.
    ///
    /// Returns the number of bytes the process consumed. Writing after EOF
    /// or after the process ended fails with [`GuestCtlError::InputClosed`].
    pub async fn write_stdin(&self, data: &[u8], eof: bool) -> GuestCtlResult<u32> {
        let sessions = self.control.service().sessions();
        if !sessions.accepts_input(self.client, self.pid)? {
            return Err(GuestCtlError::InputClosed(self.pid));
        }
        if eof {
            sessions.close_input(self.client, self.pid);
        }

        let message = HostMessage::Input(ExecInput {
            context: 0,
            pid: self.pid,
            flags: if eof {
                flags::input::EOF
            } else {
                flags::input::NONE
            },
            data: data.to_vec(),
        });
        let callback = self
            .control
            .request(self.client, message, self.control.reply_timeout())
            .await?;

        match callback.data {
            CallbackData::ExecInputStatus {
                status: InputStatus::Written,
                bytes_written,
                ..
            } => Ok(bytes_written),
            CallbackData::ExecInputStatus {
                status: InputStatus::Terminated,
                ..
            } => Err(GuestCtlError::InputClosed(self.pid)),
            CallbackData::ExecInputStatus {
                status: InputStatus::Overflow,
                ..
            } => Err(GuestCtlError::Overflow(format!(
                "stdin of process {} overflowed and was closed",
                self.pid
            ))),
            CallbackData::ExecInputStatus { flags, .. }
            | CallbackData::ExecStatus {
                status: ProcessStatus::Error,
                flags,
                ..
            } => Err(GuestCtlError::from_status_code(flags)),
            other => Err(GuestCtlError::InvalidState(format!(
                "unexpected reply to SendInput: {other:?}"
            ))),
        }
    }

    /// Close stdin without sending data.
    pub async fn close_stdin(&self) -> GuestCtlResult<u32> {
        self.write_stdin(&[], true).await
    }

    /// Read the next chunk of `handle`.
    ///
    /// Polls the guest until it has data or the stream is closed. Fails with
    /// `Timeout` if neither happens within `timeout`.
    pub async fn read_output(
        &self,
        handle: StreamHandle,
        timeout: Option<Duration>,
    ) -> GuestCtlResult<OutputChunk> {
        let service = self.control.service();
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let (data, eof) = service.sessions().take_output(self.client, self.pid, handle)?;
            if !data.is_empty() || eof {
                return Ok(OutputChunk { handle, data, eof });
            }

            let remaining = match deadline {
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(GuestCtlError::Timeout(format!(
                            "no {handle} output from process {}",
                            self.pid
                        )));
                    }
                    Some(left)
                }
                None => None,
            };
            let per_request = match (remaining, self.control.reply_timeout()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };

            let message = HostMessage::OutputRequest(OutputRequest {
                context: 0,
                pid: self.pid,
                handle,
                flags: 0,
            });
            let callback = self.control.request(self.client, message, per_request).await?;

            match callback.data {
                CallbackData::ExecOutput {
                    data,
                    flags: out_flags,
                    ..
                } if data.is_empty() && out_flags & flags::output::EOF == 0 =>
                {
                    let pause = service.options().output_poll_interval();
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d.min(Instant::now() + pause)).await,
                        None => tokio::time::sleep(pause).await,
                    }
                }
                CallbackData::ExecOutput { .. } => {}
                CallbackData::ExecStatus {
                    status: ProcessStatus::Error,
                    flags,
                    ..
                } => {
                    return Err(GuestCtlError::from_status_code(flags));
                }
                other => {
                    return Err(GuestCtlError::InvalidState(format!(
                        "unexpected reply to SendOutputRequest: {other:?}"
                    )));
                }
            }
        }
    }

    /// Output of `handle` as a stream of non-empty chunks, ending at EOF.
    pub fn output_stream(
        &self,
        handle: StreamHandle,
    ) -> impl Stream<Item = GuestCtlResult<Vec<u8>>> + Send + 'static {
        let process = self.clone();
        async_stream::try_stream! {
            loop {
                let chunk = process.read_output(handle, None).await?;
                if !chunk.data.is_empty() {
                    yield chunk.data;
                }
                if chunk.eof {
                    break;
                }
            }
        }
    }

    /// Wait for the terminal status and release the session.
    ///
    /// Output not read by then is discarded on both sides.
    pub async fn wait(&self, timeout: Option<Duration>) -> GuestCtlResult<ProcessExit> {
        let sessions = self.control.service().sessions();
        let mut rx = sessions.subscribe(self.client, self.pid)?;

        let terminal = async {
            loop {
                if rx.borrow_and_update().is_terminal() {
                    return Ok::<(), GuestCtlError>(());
                }
                rx.changed().await.map_err(|_| {
                    GuestCtlError::TransportUnavailable(format!(
                        "client {} went away while waiting for process {}",
                        self.client, self.pid
                    ))
                })?;
            }
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, terminal).await.map_err(|_| {
                GuestCtlError::Timeout(format!("process {} still running after {t:?}", self.pid))
            })??,
            None => terminal.await?,
        }

        let info = sessions
            .remove(self.client, self.pid)
            .ok_or_else(|| GuestCtlError::NotFound(format!("process {}", self.pid)))?;
        if !(info.stdout_eof && info.stderr_eof) {
            self.discard_output().await;
        }
        let exit = ProcessExit::from_info(info);
        if let Some(code) = exit.error_code() {
            tracing::warn!(pid = self.pid, code = %describe_code(code), "Guest process failed");
        } else {
            tracing::debug!(pid = self.pid, status = ?exit.status, flags = exit.flags, "Guest process finished");
        }
        Ok(exit)
    }

    /// Read stdout and stderr to EOF, then wait for the exit.
    pub async fn collect_output(&self, timeout: Option<Duration>) -> GuestCtlResult<CollectedOutput> {
        let work = async {
            let (stdout, stderr) = tokio::try_join!(
                self.drain(StreamHandle::Stdout),
                self.drain(StreamHandle::Stderr)
            )?;
            let exit = self.wait(None).await?;
            Ok::<_, GuestCtlError>(CollectedOutput {
                exit,
                stdout,
                stderr,
            })
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, work).await.map_err(|_| {
                GuestCtlError::Timeout(format!("process {} output not complete after {t:?}", self.pid))
            })?,
            None => work.await,
        }
    }

    /// Tell the guest nobody will read the rest of the output, so it can
    /// release the process.
    async fn discard_output(&self) {
        let message = HostMessage::OutputRequest(OutputRequest {
            context: 0,
            pid: self.pid,
            handle: StreamHandle::Stdout,
            flags: flags::output_request::DISCARD,
        });
        if let Err(e) = self
            .control
            .request(self.client, message, self.control.reply_timeout())
            .await
        {
            tracing::debug!(pid = self.pid, error = %e, "Discarding guest output failed");
        }
    }

    async fn drain(&self, handle: StreamHandle) -> GuestCtlResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_output(handle, None).await?;
            out.extend_from_slice(&chunk.data);
            if chunk.eof {
                return Ok(out);
            }
        }
    }
}
