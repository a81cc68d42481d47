//! In-process guest control service.
//!
//! Implements the service end of [`HgcmTransport`]: guests connect, block in
//! `GetHostMsg` until the host queued something, fetch it, and send reports
//! back. Reports are validated once, turned into [`Callback`]s, applied to
//! the host session table and matched to the waiting caller by context ID.
//!
//! Lock order: client map, then correlation table, then sessions.

mod client;
mod param_buffer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use guestctl_shared::constants::error_code;
use guestctl_shared::protocol::codec::{self, DecodeError};
use guestctl_shared::protocol::flags::output as output_flags;
use guestctl_shared::protocol::{
    Callback, CallbackData, GuestFn, GuestReport, HgcmParam, HostFn, HostMessage, ProcessStatus,
    StatusReport,
};
use guestctl_shared::{ClientId, ContextId, GuestCtlError, GuestCtlResult, HgcmTransport};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::correlation::{Completion, CorrelationTable};
use crate::metrics::{ServiceMetrics, ServiceMetricsStorage};
use crate::options::ServiceOptions;
use crate::sessions::{ExecSessionManager, StatusOutcome};
use client::ClientConnection;
use param_buffer::ParamBuffer;

/// A validated callback together with the client that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackEvent {
    pub client: ClientId,
    pub callback: Callback,
}

/// Connected client summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub id: ClientId,
    pub connected_at: DateTime<Utc>,
    pub queued_messages: usize,
    pub outstanding_requests: usize,
}

struct ServiceInner {
    options: ServiceOptions,
    clients: Mutex<HashMap<ClientId, ClientConnection>>,
    next_client: AtomicU32,
    table: CorrelationTable,
    sessions: ExecSessionManager,
    events: broadcast::Sender<CallbackEvent>,
    metrics: ServiceMetricsStorage,
}

/// Host-side service. Cloning shares the same state.
#[derive(Clone)]
pub struct GuestControlService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for GuestControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestControlService")
            .field("clients", &self.inner.clients.lock().len())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}

impl GuestControlService {
    pub fn new(options: ServiceOptions) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            inner: Arc::new(ServiceInner {
                options,
                clients: Mutex::new(HashMap::new()),
                next_client: AtomicU32::new(1),
                table: CorrelationTable::new(),
                sessions: ExecSessionManager::new(),
                events,
                metrics: ServiceMetricsStorage::default(),
            }),
        }
    }

    pub fn options(&self) -> &ServiceOptions {
        &self.inner.options
    }

    pub fn sessions(&self) -> &ExecSessionManager {
        &self.inner.sessions
    }

    pub fn correlation(&self) -> &CorrelationTable {
        &self.inner.table
    }

    pub fn metrics(&self) -> ServiceMetrics {
        self.inner.metrics.snapshot()
    }

    pub(crate) fn metrics_storage(&self) -> &ServiceMetricsStorage {
        &self.inner.metrics
    }

    pub fn clients(&self) -> Vec<ClientInfo> {
        let clients = self.inner.clients.lock();
        let mut list: Vec<_> = clients
            .values()
            .map(|c| ClientInfo {
                id: c.id(),
                connected_at: c.connected_at(),
                queued_messages: c.queued(),
                outstanding_requests: self.inner.table.outstanding(c.id()).len(),
            })
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    pub fn is_connected(&self, client: ClientId) -> bool {
        self.inner.clients.lock().contains_key(&client)
    }

    /// Every validated callback, including client disconnects.
    pub fn subscribe(&self) -> broadcast::Receiver<CallbackEvent> {
        self.inner.events.subscribe()
    }

    /// [`Self::subscribe`] as a stream. Lagged events are skipped.
    pub fn event_stream(&self) -> impl Stream<Item = CallbackEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe()).filter_map(Result::ok)
    }

    /// Queue a host message for `client`.
    ///
    /// The message's context is replaced by a freshly issued one.
    pub fn submit(
        &self,
        client: ClientId,
        message: HostMessage,
    ) -> GuestCtlResult<(ContextId, Completion)> {
        if matches!(message, HostMessage::CancelPendingWaits) {
            return Err(GuestCtlError::InvalidState(
                "CancelPendingWaits is sent through cancel_pending_waits".into(),
            ));
        }
        if let HostMessage::Input(input) = &message {
            ServiceMetricsStorage::add(&self.inner.metrics.bytes_sent, input.data.len() as u64);
        }
        let function = message.function();
        self.enqueue(client, function, move |context| {
            let mut message = message;
            message.set_context(context);
            codec::encode_host(&message)
        })
    }

    /// Queue a pre-encoded parameter list. Parameter 0 gets the issued context.
    pub fn submit_raw(
        &self,
        client: ClientId,
        function: HostFn,
        params: Vec<HgcmParam>,
    ) -> GuestCtlResult<(ContextId, Completion)> {
        if function == HostFn::CancelPendingWaits {
            return Err(GuestCtlError::InvalidState(
                "CancelPendingWaits is sent through cancel_pending_waits".into(),
            ));
        }
        self.enqueue(client, function, move |context| {
            let mut params = params;
            if let Some(first) = params.first_mut() {
                *first = HgcmParam::U32(context);
            }
            params
        })
    }

    fn enqueue<F>(
        &self,
        client: ClientId,
        function: HostFn,
        encode: F,
    ) -> GuestCtlResult<(ContextId, Completion)>
    where
        F: FnOnce(ContextId) -> Vec<HgcmParam>,
    {
        let mut clients = self.inner.clients.lock();
        let conn = clients.get_mut(&client).ok_or_else(|| not_connected(client))?;
        conn.ensure_room()?;

        let (context, params, completion) = self.inner.table.issue(client, function, encode)?;
        conn.push_back(ParamBuffer::new(function, Some(context), params));
        ServiceMetricsStorage::incr(&self.inner.metrics.messages_queued);

        tracing::debug!(client, context, function = function.name(), "Queued host message");
        Ok((context, completion))
    }

    /// Cancel everything outstanding for `client` and ask the guest to stop
    /// waiting for messages.
    pub fn cancel_pending_waits(&self, client: ClientId) -> GuestCtlResult<usize> {
        {
            let mut clients = self.inner.clients.lock();
            let conn = clients.get_mut(&client).ok_or_else(|| not_connected(client))?;
            conn.push_front(ParamBuffer::cancel_pending_waits());
        }
        let cancelled = self.inner.table.cancel_all(client);
        ServiceMetricsStorage::add(&self.inner.metrics.requests_cancelled, cancelled as u64);
        tracing::info!(client, cancelled, "Host cancelled pending waits");
        Ok(cancelled)
    }

    // ========================================================================
    // Guest calls
    // ========================================================================

    /// `GetHostMsg`. Two parameters peek (blocking), any other count fetches.
    async fn get_host_msg(&self, client: ClientId, params: &mut [HgcmParam]) -> GuestCtlResult<()> {
        if params.len() != 2 {
            return self.fetch_host_msg(client, params);
        }

        loop {
            let rx = {
                let mut clients = self.inner.clients.lock();
                let conn = clients.get_mut(&client).ok_or_else(|| not_connected(client))?;
                if let Some(head) = conn.head() {
                    params[0] = HgcmParam::U32(head.function().as_u32());
                    params[1] = HgcmParam::U32(head.param_count() as u32);
                    return Ok(());
                }
                conn.register_waiter()?
            };

            tracing::trace!(client, "Guest waiting for host message");
            match rx.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(not_connected(client)),
            }
        }
    }

    fn fetch_host_msg(&self, client: ClientId, params: &mut [HgcmParam]) -> GuestCtlResult<()> {
        let mut clients = self.inner.clients.lock();
        let conn = clients.get_mut(&client).ok_or_else(|| not_connected(client))?;
        let head = conn
            .head()
            .ok_or_else(|| GuestCtlError::InvalidState("no host message queued".into()))?;
        head.copy_to(params)?;
        if let Some(message) = conn.pop() {
            tracing::trace!(
                client,
                context = ?message.context(),
                function = message.function().name(),
                "Guest fetched host message"
            );
        }
        Ok(())
    }

    /// The guest cannot handle the head message. Its caller gets an error status.
    fn skip_host_msg(&self, client: ClientId, params: &[HgcmParam]) -> GuestCtlResult<()> {
        let rc = match params.first().and_then(HgcmParam::as_u32) {
            Some(0) | None => error_code::INTERNAL,
            Some(rc) => rc,
        };
        let skipped = {
            let mut clients = self.inner.clients.lock();
            let conn = clients.get_mut(&client).ok_or_else(|| not_connected(client))?;
            conn.pop()
                .ok_or_else(|| GuestCtlError::InvalidState("no host message queued".into()))?
        };
        ServiceMetricsStorage::incr(&self.inner.metrics.messages_skipped);
        tracing::warn!(
            client,
            context = ?skipped.context(),
            function = skipped.function().name(),
            rc = format_args!("{rc:#x}"),
            "Guest skipped host message"
        );

        if let Some(context) = skipped.context() {
            let callback = Callback::from_report(GuestReport::Status(StatusReport {
                context,
                pid: 0,
                status: ProcessStatus::Error,
                flags: rc,
                data: Vec::new(),
            }));
            self.route(client, callback)?;
        }
        Ok(())
    }

    /// `CancelPendingWaits` from the guest. A no-op when nothing waits.
    fn guest_cancel_pending_waits(&self, client: ClientId) -> GuestCtlResult<()> {
        let (woken, dropped) = {
            let mut clients = self.inner.clients.lock();
            let conn = clients.get_mut(&client).ok_or_else(|| not_connected(client))?;
            (conn.cancel_waiter(), conn.drain().len())
        };
        let cancelled = self.inner.table.cancel_all(client);
        ServiceMetricsStorage::add(&self.inner.metrics.requests_cancelled, cancelled as u64);
        if woken || dropped > 0 || cancelled > 0 {
            tracing::info!(client, woken, dropped, cancelled, "Guest cancelled pending waits");
        }
        Ok(())
    }

    fn receive_report(
        &self,
        client: ClientId,
        function: GuestFn,
        params: &[HgcmParam],
    ) -> GuestCtlResult<()> {
        if !self.is_connected(client) {
            return Err(not_connected(client));
        }
        ServiceMetricsStorage::incr(&self.inner.metrics.reports_received);

        let callback = codec::decode_callback(function, params).map_err(|e| {
            ServiceMetricsStorage::incr(&self.inner.metrics.reports_rejected);
            tracing::warn!(client, function = function.name(), error = %e, "Rejected guest report");
            GuestCtlError::from(e)
        })?;
        self.route(client, callback)
    }

    /// Apply a validated callback and wake whoever waits for it.
    fn route(&self, client: ClientId, callback: Callback) -> GuestCtlResult<()> {
        let context = callback.context_id();
        let table = &self.inner.table;
        let sessions = &self.inner.sessions;

        let delivered = match &callback.data {
            CallbackData::ExecStatus {
                pid, status, flags, ..
            } => {
                let outcome = sessions.on_status(client, context, *pid, *status, *flags);
                if let StatusOutcome::Rejected(reason) = &outcome {
                    ServiceMetricsStorage::incr(&self.inner.metrics.reports_rejected);
                    tracing::warn!(client, context, pid, ?status, %reason, "Dropping status report");
                    return Err(GuestCtlError::InvalidState(reason.clone()));
                }
                let completed = if *status == ProcessStatus::Started {
                    table.complete_retained(client, context, Ok(callback.clone()))
                } else {
                    table.complete(client, context, Ok(callback.clone()))
                };
                completed || outcome != StatusOutcome::Ignored
            }
            CallbackData::ExecOutput {
                pid,
                handle,
                flags,
                data,
            } => {
                ServiceMetricsStorage::add(&self.inner.metrics.bytes_received, data.len() as u64);
                let eof = flags & output_flags::EOF != 0;
                let appended = sessions.append_output(client, *pid, *handle, data, eof);
                let completed = table.complete(client, context, Ok(callback.clone()));
                appended || completed
            }
            CallbackData::ExecInputStatus { pid, status, .. } => {
                if status.closes_input() {
                    sessions.close_input(client, *pid);
                }
                table.complete(client, context, Ok(callback.clone()))
            }
            CallbackData::ClientDisconnected => true,
        };

        if !delivered {
            tracing::warn!(
                client,
                context,
                pid = ?callback.data.pid(),
                kind = ?callback.kind(),
                "Report for unknown context and process, dropped"
            );
            return Ok(());
        }

        let _ = self.inner.events.send(CallbackEvent { client, callback });
        Ok(())
    }

    fn drop_client(&self, client: ClientId) -> GuestCtlResult<()> {
        let conn = self.inner.clients.lock().remove(&client);
        let Some(conn) = conn else {
            return Err(not_connected(client));
        };
        // Dropping the connection fails a blocked fetch with TransportUnavailable.
        drop(conn);

        let cancelled = self.inner.table.remove_client(client);
        let sessions = self.inner.sessions.remove_client(client);
        ServiceMetricsStorage::incr(&self.inner.metrics.clients_disconnected);
        ServiceMetricsStorage::add(&self.inner.metrics.requests_cancelled, cancelled as u64);
        tracing::info!(client, cancelled, sessions, "Guest client disconnected");

        let _ = self.inner.events.send(CallbackEvent {
            client,
            callback: Callback::client_disconnected(),
        });
        Ok(())
    }
}

fn not_connected(client: ClientId) -> GuestCtlError {
    GuestCtlError::TransportUnavailable(format!("client {client} is not connected"))
}

#[async_trait]
impl HgcmTransport for GuestControlService {
    async fn connect(&self) -> GuestCtlResult<ClientId> {
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        self.inner.clients.lock().insert(
            id,
            ClientConnection::new(id, self.inner.options.max_queued_messages),
        );
        self.inner.table.add_client(id);
        ServiceMetricsStorage::incr(&self.inner.metrics.clients_connected);
        tracing::info!(client = id, "Guest client connected");
        Ok(id)
    }

    async fn disconnect(&self, client: ClientId) -> GuestCtlResult<()> {
        self.drop_client(client)
    }

    async fn call(
        &self,
        client: ClientId,
        function: u32,
        params: &mut [HgcmParam],
    ) -> GuestCtlResult<()> {
        let function = GuestFn::try_from(function).map_err(|e: DecodeError| {
            GuestCtlError::Unsupported(format!("guest function: {e}"))
        })?;

        match function {
            GuestFn::GetHostMsg => self.get_host_msg(client, params).await,
            GuestFn::CancelPendingWaits => self.guest_cancel_pending_waits(client),
            GuestFn::Disconnected => self.drop_client(client),
            GuestFn::SkipHostMsg => self.skip_host_msg(client, params),
            GuestFn::ExecSendOutput | GuestFn::ExecSendStatus | GuestFn::ExecSendInputStatus => {
                self.receive_report(client, function, params)
            }
        }
    }
}
