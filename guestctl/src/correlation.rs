//! Host request queue: context ID allocation and completion tracking.
//!
//! Each client has its own context space. A context stays live from
//! [`CorrelationTable::issue`] until it is completed, cancelled or timed out,
//! and a live context is never handed out twice.
//!
//! `ExecuteCommand` contexts are special: the `Started` report completes the
//! caller's wait but the entry is *retained* until the terminal status, since
//! the guest keeps reporting against that context for the process lifetime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use guestctl_shared::protocol::{Callback, HgcmParam, HostFn};
use guestctl_shared::{ClientId, ContextId, GuestCtlError, GuestCtlResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;

type Slot = oneshot::Sender<GuestCtlResult<Callback>>;

struct PendingRequest {
    function: HostFn,
    params: Vec<HgcmParam>,
    submitted_at: DateTime<Utc>,
    /// Taken when the caller has been answered.
    slot: Option<Slot>,
}

struct ClientContexts {
    next: ContextId,
    pending: HashMap<ContextId, PendingRequest>,
}

impl ClientContexts {
    fn new() -> Self {
        Self {
            next: 1,
            pending: HashMap::new(),
        }
    }

    /// Next free context ID. 0 is never used.
    fn allocate(&mut self) -> Option<ContextId> {
        for _ in 0..u32::MAX {
            let candidate = self.next;
            self.next = match self.next.wrapping_add(1) {
                0 => 1,
                n => n,
            };
            if !self.pending.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

/// Summary of one live context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutstandingRequest {
    pub context: ContextId,
    pub function: HostFn,
    pub param_count: usize,
    pub submitted_at: DateTime<Utc>,
    /// Caller already answered, entry kept until the process terminates.
    pub retained: bool,
}

/// Per-client map of context ID to pending request.
///
/// Cloneable, all clones share the same table behind one lock.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    inner: Arc<Mutex<HashMap<ClientId, ClientContexts>>>,
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("clients", &self.inner.lock().len())
            .finish()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&self, client: ClientId) {
        self.inner.lock().entry(client).or_insert_with(ClientContexts::new);
    }

    /// Drop a client, cancelling everything it still has outstanding.
    pub fn remove_client(&self, client: ClientId) -> usize {
        let removed = self.inner.lock().remove(&client);
        match removed {
            Some(contexts) => Self::cancel_entries(contexts.pending.into_values()),
            None => 0,
        }
    }

    /// Allocate a context for `function` and park the request.
    ///
    /// `encode` receives the allocated context and returns the parameters
    /// that will be queued for the guest.
    pub fn issue<F>(
        &self,
        client: ClientId,
        function: HostFn,
        encode: F,
    ) -> GuestCtlResult<(ContextId, Vec<HgcmParam>, Completion)>
    where
        F: FnOnce(ContextId) -> Vec<HgcmParam>,
    {
        let mut inner = self.inner.lock();
        let contexts = inner.get_mut(&client).ok_or_else(|| {
            GuestCtlError::TransportUnavailable(format!("client {client} is not connected"))
        })?;
        let context = contexts.allocate().ok_or_else(|| {
            GuestCtlError::Overflow(format!("client {client} has no free context IDs"))
        })?;
        let params = encode(context);
        let completion = Self::register(self, contexts, client, context, function, params.clone())?;
        Ok((context, params, completion))
    }

    fn register(
        &self,
        contexts: &mut ClientContexts,
        client: ClientId,
        context: ContextId,
        function: HostFn,
        params: Vec<HgcmParam>,
    ) -> GuestCtlResult<Completion> {
        if context == 0 {
            return Err(GuestCtlError::InvalidState("context 0 is reserved".into()));
        }
        if contexts.pending.contains_key(&context) {
            return Err(GuestCtlError::InvalidState(format!(
                "context {context} of client {client} is still outstanding"
            )));
        }
        let (tx, rx) = oneshot::channel();
        contexts.pending.insert(
            context,
            PendingRequest {
                function,
                params,
                submitted_at: Utc::now(),
                slot: Some(tx),
            },
        );
        tracing::trace!(client, context, function = function.name(), "Issued context");
        Ok(Completion {
            client,
            context,
            rx,
            table: self.clone(),
        })
    }

    /// Park a request under a caller-chosen context.
    ///
    /// Fails when the context is still outstanding.
    pub fn insert(
        &self,
        client: ClientId,
        context: ContextId,
        function: HostFn,
        params: Vec<HgcmParam>,
    ) -> GuestCtlResult<Completion> {
        let mut inner = self.inner.lock();
        let contexts = inner.get_mut(&client).ok_or_else(|| {
            GuestCtlError::TransportUnavailable(format!("client {client} is not connected"))
        })?;
        self.register(contexts, client, context, function, params)
    }

    /// Resolve and remove a context. Returns false if it was not live.
    pub fn complete(
        &self,
        client: ClientId,
        context: ContextId,
        result: GuestCtlResult<Callback>,
    ) -> bool {
        let entry = self
            .inner
            .lock()
            .get_mut(&client)
            .and_then(|c| c.pending.remove(&context));
        match entry {
            Some(mut request) => {
                if let Some(slot) = request.slot.take() {
                    let _ = slot.send(result);
                }
                true
            }
            None => false,
        }
    }

    /// Answer the caller but keep the context live.
    pub fn complete_retained(
        &self,
        client: ClientId,
        context: ContextId,
        result: GuestCtlResult<Callback>,
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(request) = inner
            .get_mut(&client)
            .and_then(|c| c.pending.get_mut(&context))
        else {
            return false;
        };
        if let Some(slot) = request.slot.take() {
            let _ = slot.send(result);
        }
        true
    }

    /// Remove a context, failing its waiter with `Cancelled`.
    pub fn cancel(&self, client: ClientId, context: ContextId) -> bool {
        self.complete(client, context, Err(GuestCtlError::Cancelled))
    }

    /// Fail every outstanding context of `client` with `Cancelled`.
    pub fn cancel_all(&self, client: ClientId) -> usize {
        let drained: Vec<PendingRequest> = match self.inner.lock().get_mut(&client) {
            Some(contexts) => contexts.pending.drain().map(|(_, r)| r).collect(),
            None => return 0,
        };
        let count = Self::cancel_entries(drained.into_iter());
        if count > 0 {
            tracing::debug!(client, count, "Cancelled outstanding requests");
        }
        count
    }

    fn cancel_entries(entries: impl Iterator<Item = PendingRequest>) -> usize {
        let mut count = 0;
        for mut request in entries {
            if let Some(slot) = request.slot.take() {
                let _ = slot.send(Err(GuestCtlError::Cancelled));
            }
            count += 1;
        }
        count
    }

    pub fn contains(&self, client: ClientId, context: ContextId) -> bool {
        self.inner
            .lock()
            .get(&client)
            .is_some_and(|c| c.pending.contains_key(&context))
    }

    /// Whether the caller of `context` was answered and only the entry remains.
    pub fn is_retained(&self, client: ClientId, context: ContextId) -> bool {
        self.inner
            .lock()
            .get(&client)
            .and_then(|c| c.pending.get(&context))
            .is_some_and(|r| r.slot.is_none())
    }

    pub fn outstanding(&self, client: ClientId) -> Vec<OutstandingRequest> {
        let inner = self.inner.lock();
        let Some(contexts) = inner.get(&client) else {
            return Vec::new();
        };
        let mut list: Vec<_> = contexts
            .pending
            .iter()
            .map(|(context, r)| OutstandingRequest {
                context: *context,
                function: r.function,
                param_count: r.params.len(),
                submitted_at: r.submitted_at,
                retained: r.slot.is_none(),
            })
            .collect();
        list.sort_by_key(|r| r.context);
        list
    }

    #[cfg(test)]
    fn set_next(&self, client: ClientId, next: ContextId) {
        if let Some(c) = self.inner.lock().get_mut(&client) {
            c.next = next;
        }
    }
}

/// Caller side of an issued context.
#[must_use = "a completion does nothing unless waited on"]
pub struct Completion {
    client: ClientId,
    context: ContextId,
    rx: oneshot::Receiver<GuestCtlResult<Callback>>,
    table: CorrelationTable,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("client", &self.client)
            .field("context", &self.context)
            .finish()
    }
}

impl Completion {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Wait for the guest's reply.
    ///
    /// On timeout the context is cancelled so it can be reused.
    pub async fn wait(self, timeout: Option<Duration>) -> GuestCtlResult<Callback> {
        let Completion {
            client,
            context,
            rx,
            table,
        } = self;

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(r) => r,
                Err(_) => {
                    table.complete(client, context, Err(GuestCtlError::Cancelled));
                    tracing::debug!(client, context, ?limit, "Request timed out");
                    return Err(GuestCtlError::Timeout(format!(
                        "no reply for context {context} within {limit:?}"
                    )));
                }
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| {
            Err(GuestCtlError::TransportUnavailable(format!(
                "client {client} went away"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestctl_shared::protocol::{GuestReport, ProcessStatus, StatusReport};

    fn started(context: ContextId) -> Callback {
        Callback::from_report(GuestReport::Status(StatusReport {
            context,
            pid: 42,
            status: ProcessStatus::Started,
            flags: 0,
            data: Vec::new(),
        }))
    }

    fn issue(table: &CorrelationTable, client: ClientId) -> (ContextId, Completion) {
        let (context, _, completion) = table
            .issue(client, HostFn::ExecCmd, |ctx| vec![HgcmParam::U32(ctx)])
            .unwrap();
        (context, completion)
    }

    #[tokio::test]
    async fn test_issue_and_complete() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (context, completion) = issue(&table, 1);
        assert_eq!(context, 1);
        assert!(table.contains(1, context));

        assert!(table.complete(1, context, Ok(started(context))));
        let cb = completion.wait(None).await.unwrap();
        assert_eq!(cb.context_id(), context);
        assert!(!table.contains(1, context));
        assert!(!table.complete(1, context, Ok(started(context))));
    }

    #[tokio::test]
    async fn test_params_carry_context() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (context, params, _c) = table
            .issue(1, HostFn::ExecGetOutput, |ctx| vec![HgcmParam::U32(ctx)])
            .unwrap();
        assert_eq!(params, vec![HgcmParam::U32(context)]);
        assert_eq!(table.outstanding(1)[0].param_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_client() {
        let table = CorrelationTable::new();
        let err = table.issue(9, HostFn::ExecCmd, |_| Vec::new()).unwrap_err();
        assert!(matches!(err, GuestCtlError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn test_contexts_are_distinct_while_outstanding() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (a, _ca) = issue(&table, 1);
        let (b, _cb) = issue(&table, 1);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_wrap_skips_zero_and_live_ids() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (first, _keep) = issue(&table, 1);
        assert_eq!(first, 1);

        table.set_next(1, u32::MAX);
        let (last, _c1) = issue(&table, 1);
        assert_eq!(last, u32::MAX);
        let (wrapped, _c2) = issue(&table, 1);
        assert_eq!(wrapped, 2);
    }

    #[tokio::test]
    async fn test_insert_refuses_live_context() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (context, _c) = issue(&table, 1);
        let err = table
            .insert(1, context, HostFn::ExecSetInput, Vec::new())
            .unwrap_err();
        assert!(matches!(err, GuestCtlError::InvalidState(_)));
        assert!(table.insert(1, 0, HostFn::ExecSetInput, Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_retained_context_is_not_reused() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (context, completion) = issue(&table, 1);
        assert!(table.complete_retained(1, context, Ok(started(context))));
        assert!(completion.wait(None).await.is_ok());
        assert!(table.is_retained(1, context));

        table.set_next(1, context);
        let (next, _c) = issue(&table, 1);
        assert_ne!(next, context);

        assert!(table.complete(1, context, Ok(started(context))));
        assert!(!table.contains(1, context));
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let table = CorrelationTable::new();
        table.add_client(1);
        table.add_client(2);
        let (_, a) = issue(&table, 1);
        let (_, b) = issue(&table, 1);
        let (_, other) = issue(&table, 2);

        assert_eq!(table.cancel_all(1), 2);
        assert!(matches!(a.wait(None).await, Err(GuestCtlError::Cancelled)));
        assert!(matches!(b.wait(None).await, Err(GuestCtlError::Cancelled)));
        assert_eq!(table.outstanding(2).len(), 1);
        assert_eq!(table.cancel_all(1), 0);
        drop(other);
    }

    #[tokio::test]
    async fn test_timeout_releases_context() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (context, completion) = issue(&table, 1);
        let err = completion
            .wait(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, GuestCtlError::Timeout(_)));
        assert!(!table.contains(1, context));
    }

    #[tokio::test]
    async fn test_remove_client_cancels() {
        let table = CorrelationTable::new();
        table.add_client(1);
        let (_, completion) = issue(&table, 1);
        assert_eq!(table.remove_client(1), 1);
        assert!(matches!(
            completion.wait(None).await,
            Err(GuestCtlError::Cancelled)
        ));
        assert!(table.outstanding(1).is_empty());
    }
}
