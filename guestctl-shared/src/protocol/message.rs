//! Typed protocol messages.

use std::fmt;

use super::flags;
use super::function::{GuestFn, HostFn};
use super::status::{InputStatus, ProcessStatus, StreamHandle};
use crate::transport::ContextId;

/// `ExecuteCommand`: start a process in the guest.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ExecCommand {
    pub context: ContextId,
    /// Program path, or a full command line when `args` is empty.
    pub command: String,
    /// See [`flags::exec`].
    pub flags: u32,
    pub args: Vec<String>,
    /// `KEY=VALUE` entries applied on top of the agent's environment.
    pub env: Vec<String>,
    /// Run-as user; empty means the agent's own user.
    pub user: String,
    pub password: String,
    /// 0 means no limit.
    pub timeout_ms: u32,
}

impl ExecCommand {
    pub fn wait_for_start_only(&self) -> bool {
        self.flags & flags::exec::WAIT_FOR_START_ONLY != 0
    }
}

impl fmt::Debug for ExecCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecCommand")
            .field("context", &self.context)
            .field("command", &self.command)
            .field("flags", &self.flags)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

/// `SendInput`: a chunk of stdin for a running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecInput {
    pub context: ContextId,
    pub pid: u32,
    /// See [`flags::input`].
    pub flags: u32,
    pub data: Vec<u8>,
}

impl ExecInput {
    pub fn is_eof(&self) -> bool {
        self.flags & flags::input::EOF != 0
    }
}

/// `SendOutputRequest`: ask for buffered output of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRequest {
    pub context: ContextId,
    pub pid: u32,
    pub handle: StreamHandle,
    /// See [`flags::output_request`].
    pub flags: u32,
}

impl OutputRequest {
    pub fn is_discard(&self) -> bool {
        self.flags & flags::output_request::DISCARD != 0
    }
}

/// Message queued by the host for the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    CancelPendingWaits,
    Execute(ExecCommand),
    Input(ExecInput),
    OutputRequest(OutputRequest),
}

impl HostMessage {
    pub fn function(&self) -> HostFn {
        match self {
            Self::CancelPendingWaits => HostFn::CancelPendingWaits,
            Self::Execute(_) => HostFn::ExecCmd,
            Self::Input(_) => HostFn::ExecSetInput,
            Self::OutputRequest(_) => HostFn::ExecGetOutput,
        }
    }

    /// Context the message is correlated with, if it carries one.
    pub fn context(&self) -> Option<ContextId> {
        match self {
            Self::CancelPendingWaits => None,
            Self::Execute(m) => Some(m.context),
            Self::Input(m) => Some(m.context),
            Self::OutputRequest(m) => Some(m.context),
        }
    }

    pub fn set_context(&mut self, context: ContextId) {
        match self {
            Self::CancelPendingWaits => {}
            Self::Execute(m) => m.context = context,
            Self::Input(m) => m.context = context,
            Self::OutputRequest(m) => m.context = context,
        }
    }
}

/// `ReportStatus`: process status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub context: ContextId,
    pub pid: u32,
    pub status: ProcessStatus,
    /// Exit code, signal number or error code depending on `status`.
    pub flags: u32,
    pub data: Vec<u8>,
}

/// `SendOutput`: bytes drained from one output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputReport {
    pub context: ContextId,
    pub pid: u32,
    pub handle: StreamHandle,
    /// See [`flags::output`].
    pub flags: u32,
    pub data: Vec<u8>,
}

impl OutputReport {
    pub fn is_eof(&self) -> bool {
        self.flags & flags::output::EOF != 0
    }
}

/// `ReportInputStatus`: outcome of one `SendInput`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputStatusReport {
    pub context: ContextId,
    pub pid: u32,
    pub status: InputStatus,
    /// Error code when `status` is `Error`.
    pub flags: u32,
    pub bytes_written: u32,
}

/// Report sent by the guest to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestReport {
    Status(StatusReport),
    Output(OutputReport),
    InputStatus(InputStatusReport),
}

impl GuestReport {
    pub fn function(&self) -> GuestFn {
        match self {
            Self::Status(_) => GuestFn::ExecSendStatus,
            Self::Output(_) => GuestFn::ExecSendOutput,
            Self::InputStatus(_) => GuestFn::ExecSendInputStatus,
        }
    }

    pub fn context(&self) -> ContextId {
        match self {
            Self::Status(r) => r.context,
            Self::Output(r) => r.context,
            Self::InputStatus(r) => r.context,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            Self::Status(r) => r.pid,
            Self::Output(r) => r.pid,
            Self::InputStatus(r) => r.pid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_redacted() {
        let cmd = ExecCommand {
            command: "/bin/true".into(),
            password: "hunter2".into(),
            ..Default::default()
        };
        let dbg = format!("{cmd:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn test_set_context() {
        let mut msg = HostMessage::Input(ExecInput {
            context: 0,
            pid: 7,
            flags: flags::input::EOF,
            data: Vec::new(),
        });
        msg.set_context(42);
        assert_eq!(msg.context(), Some(42));
        assert_eq!(msg.function(), HostFn::ExecSetInput);

        let mut cancel = HostMessage::CancelPendingWaits;
        cancel.set_context(1);
        assert_eq!(cancel.context(), None);
    }
}
