//! Agent configuration.

use std::time::Duration;

use guestctl_shared::{GuestCtlError, GuestCtlResult};
use serde::{Deserialize, Serialize};

/// Options of the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOptions {
    /// Starting size of each receive buffer slot.
    pub initial_buffer_size: usize,
    /// Fields larger than this are skipped with `BUFFER_OVERFLOW`.
    pub max_buffer_size: usize,
    pub session: SessionOptions,
    /// How long teardown waits for processes killed at shutdown.
    pub shutdown_grace_ms: u64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            initial_buffer_size: 4 * 1024,
            max_buffer_size: 1024 * 1024,
            session: SessionOptions::default(),
            shutdown_grace_ms: 10_000,
        }
    }
}

/// Per-process limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Bytes buffered per output stream before the pump stops reading.
    pub output_buffer_size: usize,
    /// Most bytes returned by one `SendOutput`.
    pub max_output_chunk: usize,
    /// Largest accepted `SendInput` payload.
    pub max_input_chunk: usize,
    /// Input chunks queued per process before `Overflow`.
    pub input_queue_depth: usize,
    /// Wait for a killed process to go away.
    pub kill_grace_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            output_buffer_size: 64 * 1024,
            max_output_chunk: 32 * 1024,
            max_input_chunk: 1024 * 1024,
            input_queue_depth: 16,
            kill_grace_ms: 5_000,
        }
    }
}

impl SessionOptions {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl AgentOptions {
    pub fn from_json(json: &str) -> GuestCtlResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| GuestCtlError::Config(format!("invalid agent options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> GuestCtlResult<()> {
        if self.initial_buffer_size == 0 || self.initial_buffer_size > self.max_buffer_size {
            return Err(GuestCtlError::Config(format!(
                "initial_buffer_size must be in 1..={}",
                self.max_buffer_size
            )));
        }
        let s = &self.session;
        if s.output_buffer_size == 0 || s.max_output_chunk == 0 || s.input_queue_depth == 0 {
            return Err(GuestCtlError::Config(
                "session buffer sizes and queue depth must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(AgentOptions::default().validate().is_ok());
    }

    #[test]
    fn test_nested_partial_json() {
        let options =
            AgentOptions::from_json(r#"{ "session": { "input_queue_depth": 2 } }"#).unwrap();
        assert_eq!(options.session.input_queue_depth, 2);
        assert_eq!(options.session.max_output_chunk, 32 * 1024);
        assert_eq!(options.initial_buffer_size, 4 * 1024);
    }

    #[test]
    fn test_invalid_buffer_sizes() {
        let err = AgentOptions::from_json(r#"{ "initial_buffer_size": 10, "max_buffer_size": 5 }"#);
        assert!(matches!(err, Err(GuestCtlError::Config(_))));
    }
}
