//! Service function numbers.
//!
//! The numbers are part of the wire contract and never change.

use super::codec::DecodeError;

/// Functions the host calls to hand work to the guest.
///
/// Each value doubles as the message type the guest sees when it fetches
/// the next queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum HostFn {
    /// Ask the guest to cancel its pending waits and shut down.
    CancelPendingWaits = 0,
    /// Execute a command line inside the guest.
    ExecCmd = 100,
    /// Deliver stdin data to a process started by `ExecCmd`.
    ExecSetInput = 101,
    /// Request buffered stdout/stderr data of a running process.
    ExecGetOutput = 102,
}

impl HostFn {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::CancelPendingWaits),
            100 => Some(Self::ExecCmd),
            101 => Some(Self::ExecSetInput),
            102 => Some(Self::ExecGetOutput),
            _ => None,
        }
    }

    /// Number of positional parameters the message carries.
    pub const fn param_count(self) -> usize {
        match self {
            Self::CancelPendingWaits => 0,
            Self::ExecCmd => 11,
            Self::ExecSetInput => 5,
            Self::ExecGetOutput => 4,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::CancelPendingWaits => "CancelPendingWaits",
            Self::ExecCmd => "ExecuteCommand",
            Self::ExecSetInput => "SendInput",
            Self::ExecGetOutput => "SendOutputRequest",
        }
    }
}

impl TryFrom<u32> for HostFn {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_u32(value).ok_or(DecodeError::UnknownMessage(value))
    }
}

/// Functions the guest calls on the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GuestFn {
    /// Block until the host queued a message; returns its type and parameter
    /// count. Called again with a full parameter list to fetch the payload.
    GetHostMsg = 1,
    /// Wake the guest's own blocked `GetHostMsg` call.
    CancelPendingWaits = 2,
    /// The guest disconnected, either normally or because it crashed.
    Disconnected = 3,
    /// Drop the head message the guest cannot handle, with an error code.
    ///
    /// Protocol extension, not part of the classic guest function set.
    SkipHostMsg = 10,
    /// Output from an executed process.
    ExecSendOutput = 100,
    /// Status update of an executed process.
    ExecSendStatus = 101,
    /// Input status notification.
    ExecSendInputStatus = 102,
}

impl GuestFn {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::GetHostMsg),
            2 => Some(Self::CancelPendingWaits),
            3 => Some(Self::Disconnected),
            10 => Some(Self::SkipHostMsg),
            100 => Some(Self::ExecSendOutput),
            101 => Some(Self::ExecSendStatus),
            102 => Some(Self::ExecSendInputStatus),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::GetHostMsg => "GetHostMessage",
            Self::CancelPendingWaits => "CancelPendingWaits",
            Self::Disconnected => "Disconnected",
            Self::SkipHostMsg => "SkipHostMessage",
            Self::ExecSendOutput => "SendOutput",
            Self::ExecSendStatus => "ReportStatus",
            Self::ExecSendInputStatus => "ReportInputStatus",
        }
    }
}

impl TryFrom<u32> for GuestFn {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_u32(value).ok_or(DecodeError::UnknownMessage(value))
    }
}
