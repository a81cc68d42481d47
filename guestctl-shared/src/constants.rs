//! Protocol-wide constants.

/// Error codes carried in the `flags` word of `ReportStatus{Error}` and
/// `ReportInputStatus{Error}`.
///
/// OS errno values are reported verbatim and stay below `0x8000_0000`.
/// Codes produced by the protocol layer itself live in the reserved range
/// starting at `0x8000_0000` so the two can never collide.
pub mod error_code {
    /// Start of the reserved protocol range.
    pub const PROTOCOL_BASE: u32 = 0x8000_0000;
    /// Malformed or inconsistent parameters.
    pub const INVALID_PARAMETER: u32 = PROTOCOL_BASE + 1;
    /// Message type or feature not supported by this agent.
    pub const NOT_SUPPORTED: u32 = PROTOCOL_BASE + 2;
    /// Process or session does not exist.
    pub const NOT_FOUND: u32 = PROTOCOL_BASE + 3;
    /// A variable-length field exceeded the configured maximum.
    pub const BUFFER_OVERFLOW: u32 = PROTOCOL_BASE + 4;
    /// Operation timed out.
    pub const TIMEOUT: u32 = PROTOCOL_BASE + 5;
    /// Operation was cancelled.
    pub const CANCELLED: u32 = PROTOCOL_BASE + 6;
    /// Operation is not valid in the current state.
    pub const INVALID_STATE: u32 = PROTOCOL_BASE + 7;
    /// Unexpected failure inside the agent or service.
    pub const INTERNAL: u32 = PROTOCOL_BASE + 8;

    /// Whether `code` belongs to the reserved protocol range.
    pub const fn is_protocol(code: u32) -> bool {
        code >= PROTOCOL_BASE
    }
}

/// Environment variable read by `init_logging` when no explicit filter is set.
pub const LOG_ENV_VAR: &str = "GUESTCTL_LOG";
