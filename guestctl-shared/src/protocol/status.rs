//! Process and input status values.

use serde::{Deserialize, Serialize};

/// Status of a process executed in the guest.
///
/// ```text
/// Started -> ExitedNormally | ExitedViaSignal | ExitedAbnormally
///          | TimedOutKilled | TimedOutNotKilled | KilledAtShutdown | Error
/// ```
///
/// Meaning of the accompanying `flags` word:
/// - `ExitedNormally`: exit code
/// - `ExitedViaSignal`: signal number
/// - `Error`: error code (mandatory)
/// - everything else: reserved, zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ProcessStatus {
    Undefined = 0,
    Started = 1,
    ExitedNormally = 2,
    ExitedViaSignal = 3,
    ExitedAbnormally = 4,
    TimedOutKilled = 5,
    TimedOutNotKilled = 6,
    KilledAtShutdown = 7,
    Error = 8,
}

impl ProcessStatus {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Started),
            2 => Some(Self::ExitedNormally),
            3 => Some(Self::ExitedViaSignal),
            4 => Some(Self::ExitedAbnormally),
            5 => Some(Self::TimedOutKilled),
            6 => Some(Self::TimedOutNotKilled),
            7 => Some(Self::KilledAtShutdown),
            8 => Some(Self::Error),
            _ => None,
        }
    }

    /// No further status is reported for a process after a terminal one.
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Undefined | Self::Started)
    }
}

/// Outcome of delivering one input chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum InputStatus {
    Undefined = 0,
    /// Written; see `bytes_written`.
    Written = 1,
    /// Write failed; error code in flags.
    Error = 20,
    /// The process abandoned or no longer accepts input.
    Terminated = 21,
    /// Too much input data; the input channel is closed.
    Overflow = 30,
}

impl InputStatus {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Undefined),
            1 => Some(Self::Written),
            20 => Some(Self::Error),
            21 => Some(Self::Terminated),
            30 => Some(Self::Overflow),
            _ => None,
        }
    }

    /// Whether the input channel stays closed after this status.
    pub const fn closes_input(self) -> bool {
        matches!(self, Self::Terminated | Self::Overflow)
    }
}

/// Output stream of a guest process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamHandle {
    Stdout,
    Stderr,
}

impl StreamHandle {
    pub const ALL: [StreamHandle; 2] = [StreamHandle::Stdout, StreamHandle::Stderr];

    /// Wire handle id (matches the conventional file descriptor number).
    pub const fn id(self) -> u32 {
        match self {
            Self::Stdout => 1,
            Self::Stderr => 2,
        }
    }

    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_status_values() {
        for v in 0..=8 {
            let status = ProcessStatus::from_u32(v).unwrap();
            assert_eq!(status.as_u32(), v);
        }
        assert_eq!(ProcessStatus::from_u32(9), None);
    }

    #[test]
    fn test_seven_terminal_statuses() {
        let terminal = (0..=8)
            .filter_map(ProcessStatus::from_u32)
            .filter(|s| s.is_terminal())
            .count();
        assert_eq!(terminal, 7);
        assert!(!ProcessStatus::Started.is_terminal());
    }

    #[test]
    fn test_input_status_values() {
        assert_eq!(InputStatus::from_u32(20), Some(InputStatus::Error));
        assert_eq!(InputStatus::from_u32(21), Some(InputStatus::Terminated));
        assert_eq!(InputStatus::from_u32(30), Some(InputStatus::Overflow));
        assert_eq!(InputStatus::from_u32(2), None);
        assert!(InputStatus::Overflow.closes_input());
        assert!(!InputStatus::Written.closes_input());
    }

    #[test]
    fn test_status_serializes_by_name() {
        let json = serde_json::to_string(&ProcessStatus::TimedOutKilled).unwrap();
        assert_eq!(json, "\"TimedOutKilled\"");
    }
}
