//! Host-side callback records built from guest reports.

use serde::Serialize;

use super::codec::DecodeError;
use super::function::GuestFn;
use super::message::GuestReport;
use super::status::{InputStatus, ProcessStatus, StreamHandle};
use crate::transport::ContextId;

/// Magic numbers identifying each callback payload.
pub mod magic {
    pub const CLIENT_DISCONNECTED: u32 = 0x0804_1984;
    pub const EXEC_STATUS: u32 = 0x2601_1982;
    pub const EXEC_OUT: u32 = 0x1106_1949;
    pub const EXEC_IN_STATUS: u32 = 0x1909_1951;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallbackKind {
    ClientDisconnected,
    ExecStatus,
    ExecOutput,
    ExecInputStatus,
}

impl CallbackKind {
    pub const fn magic(self) -> u32 {
        match self {
            Self::ClientDisconnected => magic::CLIENT_DISCONNECTED,
            Self::ExecStatus => magic::EXEC_STATUS,
            Self::ExecOutput => magic::EXEC_OUT,
            Self::ExecInputStatus => magic::EXEC_IN_STATUS,
        }
    }

    /// Kind of callback a guest report function produces.
    pub const fn for_function(function: GuestFn) -> Option<Self> {
        match function {
            GuestFn::ExecSendStatus => Some(Self::ExecStatus),
            GuestFn::ExecSendOutput => Some(Self::ExecOutput),
            GuestFn::ExecSendInputStatus => Some(Self::ExecInputStatus),
            GuestFn::Disconnected => Some(Self::ClientDisconnected),
            _ => None,
        }
    }

    pub const fn from_magic(value: u32) -> Option<Self> {
        match value {
            magic::CLIENT_DISCONNECTED => Some(Self::ClientDisconnected),
            magic::EXEC_STATUS => Some(Self::ExecStatus),
            magic::EXEC_OUT => Some(Self::ExecOutput),
            magic::EXEC_IN_STATUS => Some(Self::ExecInputStatus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallbackHeader {
    pub magic: u32,
    pub context_id: ContextId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallbackData {
    ClientDisconnected,
    ExecStatus {
        pid: u32,
        status: ProcessStatus,
        flags: u32,
        data: Vec<u8>,
    },
    ExecOutput {
        pid: u32,
        handle: StreamHandle,
        flags: u32,
        data: Vec<u8>,
    },
    ExecInputStatus {
        pid: u32,
        status: InputStatus,
        flags: u32,
        bytes_written: u32,
    },
}

impl CallbackData {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::ClientDisconnected => CallbackKind::ClientDisconnected,
            Self::ExecStatus { .. } => CallbackKind::ExecStatus,
            Self::ExecOutput { .. } => CallbackKind::ExecOutput,
            Self::ExecInputStatus { .. } => CallbackKind::ExecInputStatus,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::ClientDisconnected => None,
            Self::ExecStatus { pid, .. }
            | Self::ExecOutput { pid, .. }
            | Self::ExecInputStatus { pid, .. } => Some(*pid),
        }
    }
}

/// A validated event delivered to host-side waiters and subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Callback {
    pub header: CallbackHeader,
    pub data: CallbackData,
}

impl Callback {
    fn new(context_id: ContextId, data: CallbackData) -> Self {
        Self {
            header: CallbackHeader {
                magic: data.kind().magic(),
                context_id,
            },
            data,
        }
    }

    /// Assemble a callback from a header and a payload decoded separately.
    ///
    /// Fails unless the header magic names the payload's kind.
    pub fn from_parts(header: CallbackHeader, data: CallbackData) -> Result<Self, DecodeError> {
        check_magic(header.magic, data.kind())?;
        let callback = Self { header, data };
        callback.verify()?;
        Ok(callback)
    }

    pub fn from_report(report: GuestReport) -> Self {
        let (context, data) = split_report(report);
        Self::new(context, data)
    }

    pub fn client_disconnected() -> Self {
        Self::new(0, CallbackData::ClientDisconnected)
    }

    pub fn kind(&self) -> CallbackKind {
        self.data.kind()
    }

    pub fn context_id(&self) -> ContextId {
        self.header.context_id
    }

    /// Check the record before it is handed to anyone.
    ///
    /// The header magic must match the payload, and an `Error` status must
    /// carry a non-zero error code.
    pub fn verify(&self) -> Result<(), DecodeError> {
        check_magic(self.header.magic, self.data.kind())?;
        if let CallbackData::ExecStatus {
            status: ProcessStatus::Error,
            flags: 0,
            ..
        } = self.data
        {
            return Err(DecodeError::InvalidValue {
                field: "flags",
                value: 0,
            });
        }
        Ok(())
    }
}

fn check_magic(magic: u32, kind: CallbackKind) -> Result<(), DecodeError> {
    if CallbackKind::from_magic(magic) == Some(kind) {
        Ok(())
    } else {
        Err(DecodeError::InvalidValue {
            field: "magic",
            value: magic,
        })
    }
}

/// Context and payload of a guest report.
pub(crate) fn split_report(report: GuestReport) -> (ContextId, CallbackData) {
    match report {
        GuestReport::Status(s) => (
            s.context,
            CallbackData::ExecStatus {
                pid: s.pid,
                status: s.status,
                flags: s.flags,
                data: s.data,
            },
        ),
        GuestReport::Output(o) => (
            o.context,
            CallbackData::ExecOutput {
                pid: o.pid,
                handle: o.handle,
                flags: o.flags,
                data: o.data,
            },
        ),
        GuestReport::InputStatus(i) => (
            i.context,
            CallbackData::ExecInputStatus {
                pid: i.pid,
                status: i.status,
                flags: i.flags,
                bytes_written: i.bytes_written,
            },
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::StatusReport;

    fn status(status: ProcessStatus, flags: u32) -> Callback {
        Callback::from_report(GuestReport::Status(StatusReport {
            context: 3,
            pid: 10,
            status,
            flags,
            data: Vec::new(),
        }))
    }

    #[test]
    fn test_magic_matches_kind() {
        let cb = status(ProcessStatus::Started, 0);
        assert_eq!(cb.header.magic, magic::EXEC_STATUS);
        assert_eq!(cb.context_id(), 3);
        assert!(cb.verify().is_ok());
        assert_eq!(
            CallbackKind::from_magic(magic::EXEC_IN_STATUS),
            Some(CallbackKind::ExecInputStatus)
        );
        assert_eq!(CallbackKind::from_magic(0), None);
    }

    #[test]
    fn test_tampered_magic_is_rejected() {
        let mut cb = status(ProcessStatus::Started, 0);
        cb.header.magic = magic::EXEC_OUT;
        assert!(cb.verify().is_err());
    }

    #[test]
    fn test_from_parts_checks_magic_before_building() {
        let data = CallbackData::ExecOutput {
            pid: 1,
            handle: StreamHandle::Stdout,
            flags: 0,
            data: Vec::new(),
        };
        let header = |magic| CallbackHeader {
            magic,
            context_id: 9,
        };

        let err = Callback::from_parts(header(magic::EXEC_STATUS), data.clone()).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::InvalidValue {
                field: "magic",
                value: magic::EXEC_STATUS
            }
        ));
        assert!(Callback::from_parts(header(0xdead_beef), data.clone()).is_err());

        let cb = Callback::from_parts(header(magic::EXEC_OUT), data).unwrap();
        assert_eq!(cb.context_id(), 9);
    }

    #[test]
    fn test_kind_for_function() {
        assert_eq!(
            CallbackKind::for_function(GuestFn::ExecSendOutput),
            Some(CallbackKind::ExecOutput)
        );
        assert_eq!(CallbackKind::for_function(GuestFn::GetHostMsg), None);
    }

    #[test]
    fn test_error_status_needs_code() {
        assert!(status(ProcessStatus::Error, 0).verify().is_err());
        assert!(status(ProcessStatus::Error, 2).verify().is_ok());
    }

    #[test]
    fn test_client_disconnected() {
        let cb = Callback::client_disconnected();
        assert_eq!(cb.header.magic, magic::CLIENT_DISCONNECTED);
        assert_eq!(cb.data.pid(), None);
    }
}
