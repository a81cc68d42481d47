//! Guest end of the message transport.

use std::sync::Arc;

use guestctl_shared::protocol::codec;
use guestctl_shared::protocol::{GuestFn, GuestReport, HgcmParam};
use guestctl_shared::{ClientId, GuestCtlError, GuestCtlResult, HgcmTransport};

/// A connected guest client.
///
/// Cloning shares the connection. Only one clone may block in
/// [`GuestChannel::fetch_next_host_message`] at a time.
#[derive(Clone)]
pub struct GuestChannel {
    transport: Arc<dyn HgcmTransport>,
    client: ClientId,
}

impl std::fmt::Debug for GuestChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestChannel")
            .field("client", &self.client)
            .finish()
    }
}

impl GuestChannel {
    pub async fn connect(transport: Arc<dyn HgcmTransport>) -> GuestCtlResult<Self> {
        let client = transport.connect().await?;
        tracing::info!(client, "Connected to guest control service");
        Ok(Self { transport, client })
    }

    pub fn client_id(&self) -> ClientId {
        self.client
    }

    /// Block until the host queued a message; returns its type and parameter count.
    ///
    /// Fails with `Cancelled` when the wait is cancelled.
    pub async fn fetch_next_host_message(&self) -> GuestCtlResult<(u32, u32)> {
        let mut params = [HgcmParam::U32(0), HgcmParam::U32(0)];
        self.transport
            .call(self.client, GuestFn::GetHostMsg.as_u32(), &mut params)
            .await?;
        match (params[0].as_u32(), params[1].as_u32()) {
            (Some(msg_type), Some(count)) => Ok((msg_type, count)),
            _ => Err(GuestCtlError::Internal(
                "GetHostMsg returned non-integer parameters".into(),
            )),
        }
    }

    /// Fetch the head message into `slots`.
    ///
    /// On `BufferTooSmall` the message stays queued and can be fetched again.
    pub async fn get_message_details(&self, slots: &mut [HgcmParam]) -> GuestCtlResult<()> {
        self.transport
            .call(self.client, GuestFn::GetHostMsg.as_u32(), slots)
            .await
    }

    /// Drop the head message, telling the host why.
    pub async fn skip_message(&self, rc: u32) -> GuestCtlResult<()> {
        let mut params = [HgcmParam::U32(rc)];
        self.transport
            .call(self.client, GuestFn::SkipHostMsg.as_u32(), &mut params)
            .await
    }

    /// Wake this client's blocked fetch.
    pub async fn cancel_pending_waits(&self) -> GuestCtlResult<()> {
        self.transport
            .call(self.client, GuestFn::CancelPendingWaits.as_u32(), &mut [])
            .await
    }

    pub async fn send_report(&self, report: &GuestReport) -> GuestCtlResult<()> {
        let mut params = codec::encode_report(report);
        self.transport
            .call(self.client, report.function().as_u32(), &mut params)
            .await
    }

    pub async fn disconnect(&self) -> GuestCtlResult<()> {
        self.transport.disconnect(self.client).await?;
        tracing::info!(client = self.client, "Disconnected from guest control service");
        Ok(())
    }
}
