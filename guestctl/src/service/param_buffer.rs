//! Queued parameter lists and their copy into guest receive slots.

use guestctl_shared::protocol::codec::DecodeError;
use guestctl_shared::protocol::{HgcmParam, HostFn};
use guestctl_shared::{ContextId, GuestCtlError, GuestCtlResult};

/// One host message waiting in a client's queue.
#[derive(Debug, Clone)]
pub(crate) struct ParamBuffer {
    function: HostFn,
    context: Option<ContextId>,
    params: Vec<HgcmParam>,
}

impl ParamBuffer {
    pub(crate) fn new(function: HostFn, context: Option<ContextId>, params: Vec<HgcmParam>) -> Self {
        Self {
            function,
            context,
            params,
        }
    }

    pub(crate) fn cancel_pending_waits() -> Self {
        Self::new(HostFn::CancelPendingWaits, None, Vec::new())
    }

    pub(crate) fn function(&self) -> HostFn {
        self.function
    }

    pub(crate) fn context(&self) -> Option<ContextId> {
        self.context
    }

    pub(crate) fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Copy the parameters into `slots`.
    ///
    /// Nothing is written unless every slot has the right type and enough
    /// room, so a failed copy can be retried with bigger buffers.
    pub(crate) fn copy_to(&self, slots: &mut [HgcmParam]) -> GuestCtlResult<()> {
        if slots.len() != self.params.len() {
            return Err(DecodeError::ParamCount {
                message: self.function.name(),
                expected: self.params.len(),
                actual: slots.len(),
            }
            .into());
        }

        for (index, (src, slot)) in self.params.iter().zip(slots.iter()).enumerate() {
            match (src, slot) {
                (HgcmParam::U32(_), HgcmParam::U32(_)) | (HgcmParam::U64(_), HgcmParam::U64(_)) => {}
                (HgcmParam::Buffer(data), HgcmParam::Buffer(room)) => {
                    if data.len() > room.len() {
                        return Err(GuestCtlError::BufferTooSmall {
                            index,
                            needed: data.len(),
                        });
                    }
                }
                (src, slot) => {
                    return Err(DecodeError::ParamType {
                        index,
                        field: "slot",
                        expected: src.kind(),
                        actual: slot.kind(),
                    }
                    .into());
                }
            }
        }

        for (src, slot) in self.params.iter().zip(slots.iter_mut()) {
            *slot = src.clone();
        }
        Ok(())
    }
}
