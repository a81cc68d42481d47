//! HGCM-style call parameters.

use std::fmt;

/// Type tag of a parameter slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    U32,
    U64,
    Buffer,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U32 => f.write_str("u32"),
            Self::U64 => f.write_str("u64"),
            Self::Buffer => f.write_str("buffer"),
        }
    }
}

/// One positional parameter of a call.
///
/// When used as a receive slot, the length of a `Buffer` is its capacity.
/// The callee replaces the slot with the actual bytes, so after a successful
/// call the length is the number of bytes received.
#[derive(Clone, PartialEq, Eq)]
pub enum HgcmParam {
    U32(u32),
    U64(u64),
    Buffer(Vec<u8>),
}

impl HgcmParam {
    /// Receive slot able to hold `capacity` bytes.
    pub fn buffer_slot(capacity: usize) -> Self {
        Self::Buffer(vec![0; capacity])
    }

    pub fn kind(&self) -> ParamKind {
        match self {
            Self::U32(_) => ParamKind::U32,
            Self::U64(_) => ParamKind::U64,
            Self::Buffer(_) => ParamKind::Buffer,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&[u8]> {
        match self {
            Self::Buffer(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_buffer(self) -> Option<Vec<u8>> {
        match self {
            Self::Buffer(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Debug for HgcmParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U32(v) => write!(f, "U32({v})"),
            Self::U64(v) => write!(f, "U64({v})"),
            // Payloads may carry passwords or process data.
            Self::Buffer(b) => write!(f, "Buffer({} bytes)", b.len()),
        }
    }
}

impl From<u32> for HgcmParam {
    fn from(v: u32) -> Self {
        Self::U32(v)
    }
}

impl From<Vec<u8>> for HgcmParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Buffer(v)
    }
}
