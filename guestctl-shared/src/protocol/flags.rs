//! Flag words carried by the protocol messages.
//!
//! Bits that are not listed here are reserved: senders leave them zero and
//! receivers ignore them.

/// `ExecuteCommand.flags`.
pub mod exec {
    pub const NONE: u32 = 0;
    /// The timeout only bounds process start-up, not its lifetime.
    pub const WAIT_FOR_START_ONLY: u32 = 1 << 0;
    /// Every bit this agent understands.
    pub const KNOWN: u32 = WAIT_FOR_START_ONLY;
}

/// `SendInput.flags`.
pub mod input {
    pub const NONE: u32 = 0;
    /// No more input follows; stdin of the process is closed after this chunk.
    pub const EOF: u32 = 1 << 0;
}

/// `SendOutput.flags`.
pub mod output {
    pub const NONE: u32 = 0;
    /// The stream is closed and this reply carried its last bytes.
    pub const EOF: u32 = 1 << 0;
}

/// `SendOutputRequest.flags`.
pub mod output_request {
    pub const NONE: u32 = 0;
    /// Drop everything still buffered for the process instead of returning
    /// it. The reply carries no data and the EOF flag; the guest releases
    /// the process once it has ended.
    pub const DISCARD: u32 = 1 << 0;
}
