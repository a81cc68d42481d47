//! Per-guest connection state.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use guestctl_shared::{ClientId, GuestCtlError, GuestCtlResult};
use tokio::sync::oneshot;

use super::param_buffer::ParamBuffer;

type Waiter = oneshot::Sender<GuestCtlResult<()>>;

/// One guest consumer: its queue of host messages and its blocked fetch.
pub(crate) struct ClientConnection {
    id: ClientId,
    queue: VecDeque<ParamBuffer>,
    /// Wakes the guest's pending `GetHostMsg`, at most one per client.
    waiter: Option<Waiter>,
    max_queued: usize,
    connected_at: DateTime<Utc>,
}

impl ClientConnection {
    pub(crate) fn new(id: ClientId, max_queued: usize) -> Self {
        Self {
            id,
            queue: VecDeque::new(),
            waiter: None,
            max_queued,
            connected_at: Utc::now(),
        }
    }

    pub(crate) fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn ensure_room(&self) -> GuestCtlResult<()> {
        if self.queue.len() >= self.max_queued {
            return Err(GuestCtlError::Overflow(format!(
                "client {} has {} messages queued",
                self.id,
                self.queue.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn push_back(&mut self, message: ParamBuffer) {
        self.queue.push_back(message);
        self.wake(Ok(()));
    }

    pub(crate) fn push_front(&mut self, message: ParamBuffer) {
        self.queue.push_front(message);
        self.wake(Ok(()));
    }

    pub(crate) fn head(&self) -> Option<&ParamBuffer> {
        self.queue.front()
    }

    pub(crate) fn pop(&mut self) -> Option<ParamBuffer> {
        self.queue.pop_front()
    }

    pub(crate) fn drain(&mut self) -> Vec<ParamBuffer> {
        self.queue.drain(..).collect()
    }

    /// Park the guest's fetch until a message arrives or the wait is cancelled.
    pub(crate) fn register_waiter(&mut self) -> GuestCtlResult<oneshot::Receiver<GuestCtlResult<()>>> {
        if self.waiter.as_ref().is_some_and(|w| !w.is_closed()) {
            return Err(GuestCtlError::InvalidState(format!(
                "client {} already has a pending GetHostMsg",
                self.id
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.waiter = Some(tx);
        Ok(rx)
    }

    /// Fail the pending fetch with `Cancelled`. Returns false when nothing waited.
    pub(crate) fn cancel_waiter(&mut self) -> bool {
        match self.waiter.take() {
            Some(w) if !w.is_closed() => w.send(Err(GuestCtlError::Cancelled)).is_ok(),
            _ => false,
        }
    }

    fn wake(&mut self, result: GuestCtlResult<()>) {
        if let Some(w) = self.waiter.take() {
            let _ = w.send(result);
        }
    }
}
