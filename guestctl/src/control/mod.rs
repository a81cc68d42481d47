//! Process-handle API on top of the service.

mod command;
mod process;

use std::time::Duration;

use guestctl_shared::constants::error_code;
use guestctl_shared::protocol::{Callback, CallbackData, HostFn, HostMessage, ProcessStatus};
use guestctl_shared::{ClientId, GuestCtlError, GuestCtlResult};
use tokio::sync::broadcast;

use crate::metrics::ServiceMetricsStorage;
use crate::service::{CallbackEvent, ClientInfo, GuestControlService};
use crate::sessions::ExecSessionInfo;

pub use command::GuestCommand;
pub use process::{CollectedOutput, GuestProcess, OutputChunk, ProcessExit};

/// Entry point for running processes in connected guests.
#[derive(Clone, Debug)]
pub struct GuestControl {
    service: GuestControlService,
}

impl GuestControl {
    pub fn new(service: GuestControlService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &GuestControlService {
        &self.service
    }

    /// Start `command` in the guest behind `client`.
    ///
    /// Returns once the guest reported `Started`. A start failure comes back
    /// as [`GuestCtlError::Spawn`] carrying the guest's error code.
    pub async fn execute(
        &self,
        client: ClientId,
        command: GuestCommand,
    ) -> GuestCtlResult<GuestProcess> {
        let message = command.build()?;
        tracing::debug!(client, command = %command.command(), "Executing guest command");

        let callback = self
            .request(client, HostMessage::Execute(message), self.reply_timeout())
            .await?;
        let context = callback.context_id();

        match callback.data {
            CallbackData::ExecStatus {
                status: ProcessStatus::Started,
                pid,
                ..
            } => {
                tracing::info!(client, pid, context, command = %command.command(), "Guest process started");
                Ok(GuestProcess::new(self.clone(), client, pid, context))
            }
            CallbackData::ExecStatus {
                status: ProcessStatus::Error,
                flags,
                ..
            } => Err(GuestCtlError::Spawn {
                code: flags,
                message: format!("'{}': {}", command.command(), describe_code(flags)),
            }),
            other => Err(GuestCtlError::InvalidState(format!(
                "unexpected reply to ExecuteCommand: {other:?}"
            ))),
        }
    }

    /// Cancel all outstanding requests of `client` and stop its guest waits.
    pub fn cancel_pending_waits(&self, client: ClientId) -> GuestCtlResult<usize> {
        self.service.cancel_pending_waits(client)
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        self.service.clients()
    }

    pub fn sessions(&self, client: Option<ClientId>) -> Vec<ExecSessionInfo> {
        self.service.sessions().list(client)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallbackEvent> {
        self.service.subscribe()
    }

    pub(crate) fn reply_timeout(&self) -> Option<Duration> {
        self.service.options().request_timeout()
    }

    /// Submit one message and wait for the matching callback.
    pub(crate) async fn request(
        &self,
        client: ClientId,
        message: HostMessage,
        timeout: Option<Duration>,
    ) -> GuestCtlResult<Callback> {
        let function = message.function();
        let (context, completion) = self.service.submit(client, message)?;
        let result = completion.wait(timeout).await;
        match &result {
            Err(GuestCtlError::Timeout(_)) => {
                ServiceMetricsStorage::incr(&self.service.metrics_storage().requests_timed_out);
                if function == HostFn::ExecCmd {
                    tracing::warn!(
                        client,
                        context,
                        "No start report in time; the guest process may still be running"
                    );
                } else {
                    tracing::warn!(client, context, ?function, "Request timed out, context released");
                }
            }
            Err(GuestCtlError::Cancelled) => {
                tracing::debug!(client, "Request cancelled");
            }
            _ => {}
        }
        result
    }
}

/// Human-readable form of a guest error code.
pub(crate) fn describe_code(code: u32) -> String {
    if error_code::is_protocol(code) {
        GuestCtlError::from_status_code(code).to_string()
    } else {
        std::io::Error::from_raw_os_error(code as i32).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HgcmTransport;

    #[tokio::test]
    async fn test_execute_times_out_without_guest() {
        let service = GuestControlService::new(crate::ServiceOptions {
            request_timeout_ms: 50,
            ..Default::default()
        });
        let client = service.connect().await.unwrap();
        let control = GuestControl::new(service.clone());

        let err = control
            .execute(client, GuestCommand::new("true"))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestCtlError::Timeout(_)), "{err:?}");
        assert_eq!(service.metrics().requests_timed_out_total(), 1);
        assert!(control.sessions(Some(client)).is_empty());
    }

    #[test]
    fn test_describe_code() {
        assert!(describe_code(2).contains("No such file"));
        assert!(describe_code(error_code::NOT_FOUND).contains("not found"));
    }
}
