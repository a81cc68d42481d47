//! Encoding and decoding of protocol messages.
//!
//! Parameter layouts (index: field):
//!
//! ```text
//! ExecuteCommand (11)   0 context  1 cmd  2 flags  3 argc  4 args
//!                       5 envCount  6 envBytes  7 env  8 user
//!                       9 password  10 timeoutMs
//! SendInput (5)         0 context  1 pid  2 flags  3 data  4 size
//! SendOutputRequest (4) 0 context  1 pid  2 handle  3 flags
//! SendOutput (5)        0 context  1 pid  2 handle  3 flags  4 data
//! ReportStatus (5)      0 context  1 pid  2 status  3 flags  4 data
//! ReportInputStatus (5) 0 context  1 pid  2 status  3 flags  4 bytesWritten
//! ```

use thiserror::Error;

use super::block::{BlockKind, decode_string, encode_string, pack_strings, unpack_strings};
use super::callback::{Callback, CallbackHeader, CallbackKind, split_report};
use super::function::{GuestFn, HostFn};
use super::message::{
    ExecCommand, ExecInput, GuestReport, HostMessage, InputStatusReport, OutputReport,
    OutputRequest, StatusReport,
};
use super::param::{HgcmParam, ParamKind};
use super::status::{InputStatus, ProcessStatus, StreamHandle};
use crate::transport::ContextId;

/// Failure to turn a parameter list into a message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown message type {0}")]
    UnknownMessage(u32),

    #[error("{message}: expected {expected} parameters, got {actual}")]
    ParamCount {
        message: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("parameter {index} ({field}): expected {expected}, got {actual}")]
    ParamType {
        index: usize,
        field: &'static str,
        expected: ParamKind,
        actual: ParamKind,
    },

    #[error("parameter {index} ({field}): needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall {
        index: usize,
        field: &'static str,
        needed: usize,
        capacity: usize,
    },

    #[error("malformed {block} block: {reason}")]
    MalformedBlock { block: &'static str, reason: String },

    #[error("{field} is not valid UTF-8")]
    InvalidString { field: &'static str },

    #[error("invalid value {value} for {field}")]
    InvalidValue { field: &'static str, value: u32 },
}

/// Positional reader over a received parameter list.
struct Reader<'a> {
    params: &'a [HgcmParam],
}

impl<'a> Reader<'a> {
    fn new(
        message: &'static str,
        params: &'a [HgcmParam],
        expected: usize,
    ) -> Result<Self, DecodeError> {
        if params.len() != expected {
            return Err(DecodeError::ParamCount {
                message,
                expected,
                actual: params.len(),
            });
        }
        Ok(Self { params })
    }

    fn u32(&self, index: usize, field: &'static str) -> Result<u32, DecodeError> {
        match &self.params[index] {
            HgcmParam::U32(v) => Ok(*v),
            other => Err(type_error(index, field, ParamKind::U32, other)),
        }
    }

    fn buffer(&self, index: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        match &self.params[index] {
            HgcmParam::Buffer(b) => Ok(b),
            other => Err(type_error(index, field, ParamKind::Buffer, other)),
        }
    }

    fn string(&self, index: usize, field: &'static str) -> Result<String, DecodeError> {
        decode_string(self.buffer(index, field)?, field)
    }

    fn handle(&self, index: usize) -> Result<StreamHandle, DecodeError> {
        let value = self.u32(index, "handle")?;
        StreamHandle::from_id(value).ok_or(DecodeError::InvalidValue {
            field: "handle",
            value,
        })
    }
}

fn type_error(
    index: usize,
    field: &'static str,
    expected: ParamKind,
    actual: &HgcmParam,
) -> DecodeError {
    DecodeError::ParamType {
        index,
        field,
        expected,
        actual: actual.kind(),
    }
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Encode a host message into its parameter list.
pub fn encode_host(message: &HostMessage) -> Vec<HgcmParam> {
    match message {
        HostMessage::CancelPendingWaits => Vec::new(),
        HostMessage::Execute(cmd) => {
            let args = pack_strings(&cmd.args);
            let env = pack_strings(&cmd.env);
            vec![
                HgcmParam::U32(cmd.context),
                HgcmParam::Buffer(encode_string(&cmd.command)),
                HgcmParam::U32(cmd.flags),
                HgcmParam::U32(len_u32(cmd.args.len())),
                HgcmParam::Buffer(args),
                HgcmParam::U32(len_u32(cmd.env.len())),
                HgcmParam::U32(len_u32(env.len())),
                HgcmParam::Buffer(env),
                HgcmParam::Buffer(encode_string(&cmd.user)),
                HgcmParam::Buffer(encode_string(&cmd.password)),
                HgcmParam::U32(cmd.timeout_ms),
            ]
        }
        HostMessage::Input(input) => vec![
            HgcmParam::U32(input.context),
            HgcmParam::U32(input.pid),
            HgcmParam::U32(input.flags),
            HgcmParam::Buffer(input.data.clone()),
            HgcmParam::U32(len_u32(input.data.len())),
        ],
        HostMessage::OutputRequest(req) => vec![
            HgcmParam::U32(req.context),
            HgcmParam::U32(req.pid),
            HgcmParam::U32(req.handle.id()),
            HgcmParam::U32(req.flags),
        ],
    }
}

/// Decode a host message of type `msg_type`.
pub fn decode_host(msg_type: u32, params: &[HgcmParam]) -> Result<HostMessage, DecodeError> {
    let function = HostFn::try_from(msg_type)?;
    let r = Reader::new(function.name(), params, function.param_count())?;

    match function {
        HostFn::CancelPendingWaits => Ok(HostMessage::CancelPendingWaits),
        HostFn::ExecCmd => {
            let argc = r.u32(3, "argc")?;
            let args = unpack_strings(r.buffer(4, "args")?, argc, BlockKind::Args)?;

            let env_count = r.u32(5, "envCount")?;
            let env_bytes = r.u32(6, "envBytes")?;
            let env_buf = r.buffer(7, "env")?;
            if env_bytes as usize != env_buf.len() {
                return Err(DecodeError::MalformedBlock {
                    block: BlockKind::Env.name(),
                    reason: format!(
                        "envBytes is {env_bytes} but the block holds {} bytes",
                        env_buf.len()
                    ),
                });
            }
            let env = unpack_strings(env_buf, env_count, BlockKind::Env)?;

            Ok(HostMessage::Execute(ExecCommand {
                context: r.u32(0, "context")?,
                command: r.string(1, "cmd")?,
                flags: r.u32(2, "flags")?,
                args,
                env,
                user: r.string(8, "user")?,
                password: r.string(9, "password")?,
                timeout_ms: r.u32(10, "timeoutMs")?,
            }))
        }
        HostFn::ExecSetInput => {
            let data = r.buffer(3, "data")?;
            let size = r.u32(4, "size")? as usize;
            if size > data.len() {
                return Err(DecodeError::BufferTooSmall {
                    index: 3,
                    field: "data",
                    needed: size,
                    capacity: data.len(),
                });
            }
            Ok(HostMessage::Input(ExecInput {
                context: r.u32(0, "context")?,
                pid: r.u32(1, "pid")?,
                flags: r.u32(2, "flags")?,
                data: data[..size].to_vec(),
            }))
        }
        HostFn::ExecGetOutput => Ok(HostMessage::OutputRequest(OutputRequest {
            context: r.u32(0, "context")?,
            pid: r.u32(1, "pid")?,
            handle: r.handle(2)?,
            flags: r.u32(3, "flags")?,
        })),
    }
}

/// Receive slots for fetching a message of type `function`.
///
/// Every buffer slot gets `capacity` bytes.
pub fn host_layout(function: HostFn, capacity: usize) -> Vec<HgcmParam> {
    let u = || HgcmParam::U32(0);
    let b = || HgcmParam::buffer_slot(capacity);
    match function {
        HostFn::CancelPendingWaits => Vec::new(),
        HostFn::ExecCmd => vec![u(), b(), u(), u(), b(), u(), u(), b(), b(), b(), u()],
        HostFn::ExecSetInput => vec![u(), u(), u(), b(), u()],
        HostFn::ExecGetOutput => vec![u(), u(), u(), u()],
    }
}

/// Encode a guest report into its parameter list.
pub fn encode_report(report: &GuestReport) -> Vec<HgcmParam> {
    match report {
        GuestReport::Status(s) => vec![
            HgcmParam::U32(s.context),
            HgcmParam::U32(s.pid),
            HgcmParam::U32(s.status.as_u32()),
            HgcmParam::U32(s.flags),
            HgcmParam::Buffer(s.data.clone()),
        ],
        GuestReport::Output(o) => vec![
            HgcmParam::U32(o.context),
            HgcmParam::U32(o.pid),
            HgcmParam::U32(o.handle.id()),
            HgcmParam::U32(o.flags),
            HgcmParam::Buffer(o.data.clone()),
        ],
        GuestReport::InputStatus(i) => vec![
            HgcmParam::U32(i.context),
            HgcmParam::U32(i.pid),
            HgcmParam::U32(i.status.as_u32()),
            HgcmParam::U32(i.flags),
            HgcmParam::U32(i.bytes_written),
        ],
    }
}

/// Decode a report the guest sent through `function`.
pub fn decode_report(function: GuestFn, params: &[HgcmParam]) -> Result<GuestReport, DecodeError> {
    match function {
        GuestFn::ExecSendStatus => {
            let r = Reader::new(function.name(), params, 5)?;
            let value = r.u32(2, "status")?;
            let status = ProcessStatus::from_u32(value).ok_or(DecodeError::InvalidValue {
                field: "status",
                value,
            })?;
            Ok(GuestReport::Status(StatusReport {
                context: r.u32(0, "context")?,
                pid: r.u32(1, "pid")?,
                status,
                flags: r.u32(3, "flags")?,
                data: r.buffer(4, "data")?.to_vec(),
            }))
        }
        GuestFn::ExecSendOutput => {
            let r = Reader::new(function.name(), params, 5)?;
            Ok(GuestReport::Output(OutputReport {
                context: r.u32(0, "context")?,
                pid: r.u32(1, "pid")?,
                handle: r.handle(2)?,
                flags: r.u32(3, "flags")?,
                data: r.buffer(4, "data")?.to_vec(),
            }))
        }
        GuestFn::ExecSendInputStatus => {
            let r = Reader::new(function.name(), params, 5)?;
            let value = r.u32(2, "status")?;
            let status = InputStatus::from_u32(value).ok_or(DecodeError::InvalidValue {
                field: "status",
                value,
            })?;
            Ok(GuestReport::InputStatus(InputStatusReport {
                context: r.u32(0, "context")?,
                pid: r.u32(1, "pid")?,
                status,
                flags: r.u32(3, "flags")?,
                bytes_written: r.u32(4, "bytesWritten")?,
            }))
        }
        other => Err(DecodeError::UnknownMessage(other.as_u32())),
    }
}

/// Decode a guest report and validate it as a host-side callback.
pub fn decode_callback(function: GuestFn, params: &[HgcmParam]) -> Result<Callback, DecodeError> {
    let magic = CallbackKind::for_function(function)
        .map(CallbackKind::magic)
        .ok_or(DecodeError::UnknownMessage(function.as_u32()))?;
    let (context_id, data) = split_report(decode_report(function, params)?);
    Callback::from_parts(CallbackHeader { magic, context_id }, data)
}

/// Context ID of a parameter list, read from parameter 0.
pub fn context_of(params: &[HgcmParam]) -> Option<ContextId> {
    params.first().and_then(HgcmParam::as_u32)
}
