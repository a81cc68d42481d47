//! Guest agent for guest control.
//!
//! The agent connects to the guest control service over an
//! [`HgcmTransport`](guestctl_shared::HgcmTransport), waits for host
//! messages and runs the processes they describe. Status changes, output
//! and stdin progress travel back as reports.

mod agent;
mod channel;
mod dispatcher;
mod metrics;
mod options;
mod reporter;
mod session;

pub use agent::GuestAgent;
pub use channel::GuestChannel;
pub use dispatcher::DispatcherState;
pub use guestctl_shared::logging::{LoggingGuard, LoggingOptions, init_logging};
pub use metrics::{AgentMetrics, AgentMetricsStorage};
pub use options::{AgentOptions, SessionOptions};
pub use reporter::Reporter;
pub use session::{ProcessSessionInfo, ProcessSessionManager};
