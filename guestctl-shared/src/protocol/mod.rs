//! Guest control wire protocol.
//!
//! ## Layout
//!
//! ```text
//! function number + [HgcmParam; N]   (positional, fixed per message type)
//!
//! host  -> guest: ExecCmd / ExecSetInput / ExecGetOutput / CancelPendingWaits
//! guest -> host : ExecSendStatus / ExecSendOutput / ExecSendInputStatus
//! ```
//!
//! Every command the host issues carries a context ID in parameter 0. The
//! guest echoes it in each report so the host can match reports to the
//! command that caused them.

mod block;
mod callback;
pub mod codec;
pub mod flags;
mod function;
mod message;
mod param;
mod status;

pub use block::{BlockKind, decode_string, encode_string, pack_strings, unpack_strings};
pub use callback::{Callback, CallbackData, CallbackHeader, CallbackKind, magic};
pub use function::{GuestFn, HostFn};
pub use message::{
    ExecCommand, ExecInput, GuestReport, HostMessage, InputStatusReport, OutputReport,
    OutputRequest, StatusReport,
};
pub use param::{HgcmParam, ParamKind};
pub use status::{InputStatus, ProcessStatus, StreamHandle};
