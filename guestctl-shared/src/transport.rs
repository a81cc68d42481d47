//! Collaborator interface of the HGCM call primitive.

use async_trait::async_trait;

use crate::errors::GuestCtlResult;
use crate::protocol::HgcmParam;

/// Identifies one guest consumer connected to the service.
pub type ClientId = u32;

/// Correlates a host command with the guest reports it causes.
pub type ContextId = u32;

/// Connection-oriented call interface between the guest and the service.
///
/// `call` may block: `GetHostMsg` waits until the host queued a message or
/// the wait is cancelled. Implementations write results back into `params`.
#[async_trait]
pub trait HgcmTransport: Send + Sync {
    async fn connect(&self) -> GuestCtlResult<ClientId>;

    async fn disconnect(&self, client: ClientId) -> GuestCtlResult<()>;

    async fn call(
        &self,
        client: ClientId,
        function: u32,
        params: &mut [HgcmParam],
    ) -> GuestCtlResult<()>;
}
