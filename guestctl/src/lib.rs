//! Host side of guest control.
//!
//! The [`GuestControlService`] owns one connection per guest consumer. Host
//! code queues commands on a connection and waits for the guest's reports,
//! which are matched to commands by context ID in the [`CorrelationTable`].
//! [`GuestControl`] wraps this in process handles:
//!
//! ```rust,no_run
//! # use guestctl::{GuestCommand, GuestControl, GuestControlService, ServiceOptions};
//! # async fn example(client: u32) -> Result<(), Box<dyn std::error::Error>> {
//! let service = GuestControlService::new(ServiceOptions::default());
//! let control = GuestControl::new(service.clone());
//!
//! let process = control.execute(client, GuestCommand::new("/bin/echo").arg("hi")).await?;
//! let output = process.collect_output(None).await?;
//! assert_eq!(output.stdout, b"hi\n");
//! # Ok(())
//! # }
//! ```

pub mod control;
pub mod correlation;
pub mod metrics;
pub mod options;
pub mod service;
pub mod sessions;

pub use control::{CollectedOutput, GuestCommand, GuestControl, GuestProcess, OutputChunk, ProcessExit};
pub use correlation::{Completion, CorrelationTable};
pub use guestctl_shared::{ClientId, ContextId, GuestCtlError, GuestCtlResult, HgcmTransport};
pub use metrics::{ServiceMetrics, ServiceMetricsStorage};
pub use guestctl_shared::logging::{LoggingGuard, LoggingOptions, init_logging};
pub use options::ServiceOptions;
pub use service::{CallbackEvent, ClientInfo, GuestControlService};
pub use sessions::{ExecSessionInfo, ExecSessionManager};
