//! Service configuration.

use std::time::Duration;

use guestctl_shared::{GuestCtlError, GuestCtlResult};
use serde::{Deserialize, Serialize};

/// Options of the host-side service.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```json
/// { "request_timeout_ms": 5000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Default wait for a single guest reply. 0 waits forever.
    pub request_timeout_ms: u64,
    /// Pause between output requests that returned no data.
    pub output_poll_interval_ms: u64,
    /// Maximum number of messages queued per client before submits fail.
    pub max_queued_messages: usize,
    /// Capacity of the callback broadcast channel.
    pub event_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            output_poll_interval_ms: 20,
            max_queued_messages: 1024,
            event_capacity: 256,
        }
    }
}

impl ServiceOptions {
    /// Parse and validate options from JSON.
    pub fn from_json(json: &str) -> GuestCtlResult<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| GuestCtlError::Config(format!("invalid service options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> GuestCtlResult<()> {
        if self.max_queued_messages == 0 {
            return Err(GuestCtlError::Config(
                "max_queued_messages must be at least 1".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(GuestCtlError::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn output_poll_interval(&self) -> Duration {
        Duration::from_millis(self.output_poll_interval_ms)
    }
}
