//! Strings and string blocks.
//!
//! A string travels as a NUL-terminated buffer. Argument and environment
//! blocks are concatenations of NUL-terminated strings, with the number of
//! entries sent alongside in a separate parameter.

use super::codec::DecodeError;

/// Which block is being decoded, for error reporting and entry rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Args,
    Env,
}

impl BlockKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Args => "args",
            Self::Env => "env",
        }
    }
}

/// Encode a string as a NUL-terminated buffer.
pub fn encode_string(s: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(s.len() + 1);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    buf
}

/// Decode a NUL-terminated buffer. An empty buffer is the empty string.
pub fn decode_string(buf: &[u8], field: &'static str) -> Result<String, DecodeError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end])
        .map(str::to_owned)
        .map_err(|_| DecodeError::InvalidString { field })
}

/// Concatenate `entries` as NUL-terminated strings.
pub fn pack_strings<S: AsRef<str>>(entries: &[S]) -> Vec<u8> {
    let len = entries.iter().map(|e| e.as_ref().len() + 1).sum();
    let mut buf = Vec::with_capacity(len);
    for entry in entries {
        buf.extend_from_slice(entry.as_ref().as_bytes());
        buf.push(0);
    }
    buf
}

/// Split a block into exactly `count` strings.
///
/// Environment entries must have the form `KEY=VALUE` with a non-empty key.
pub fn unpack_strings(
    buf: &[u8],
    count: u32,
    kind: BlockKind,
) -> Result<Vec<String>, DecodeError> {
    let malformed = |reason: String| DecodeError::MalformedBlock {
        block: kind.name(),
        reason,
    };

    if count == 0 {
        return match buf {
            [] | [0] => Ok(Vec::new()),
            _ => Err(malformed(format!("expected no entries, got {} bytes", buf.len()))),
        };
    }

    let Some((&last, body)) = buf.split_last() else {
        return Err(malformed(format!("expected {count} entries, block is empty")));
    };
    if last != 0 {
        return Err(malformed("block is not NUL-terminated".into()));
    }

    let entries: Vec<&[u8]> = body.split(|&b| b == 0).collect();
    if entries.len() != count as usize {
        return Err(malformed(format!(
            "expected {count} entries, found {}",
            entries.len()
        )));
    }

    entries
        .into_iter()
        .map(|raw| {
            let entry = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::InvalidString { field: kind.name() })?;
            if kind == BlockKind::Env {
                match entry.split_once('=') {
                    Some((key, _)) if !key.is_empty() => {}
                    _ => return Err(malformed(format!("invalid environment entry '{entry}'"))),
                }
            }
            Ok(entry.to_owned())
        })
        .collect()
}
