//! Fetches host messages and routes them to the session manager.

use std::sync::Arc;

use guestctl_shared::constants::error_code;
use guestctl_shared::protocol::{HgcmParam, HostFn, HostMessage, ProcessStatus, codec};
use guestctl_shared::{GuestCtlError, GuestCtlResult};
use serde::Serialize;
use tokio::sync::watch;

use crate::channel::GuestChannel;
use crate::metrics::AgentMetricsStorage;
use crate::options::AgentOptions;
use crate::reporter::Reporter;
use crate::session::ProcessSessionManager;

/// Where the dispatcher loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatcherState {
    Idle,
    /// Blocked in `GetHostMsg`.
    AwaitingMessage,
    Processing,
    ShuttingDown,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Dispatcher {
    channel: GuestChannel,
    sessions: ProcessSessionManager,
    reporter: Reporter,
    state: Arc<watch::Sender<DispatcherState>>,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<AgentMetricsStorage>,
    initial_buffer_size: usize,
    max_buffer_size: usize,
}

impl Dispatcher {
    pub(crate) fn new(
        channel: GuestChannel,
        sessions: ProcessSessionManager,
        reporter: Reporter,
        options: &AgentOptions,
        state: Arc<watch::Sender<DispatcherState>>,
        shutdown: watch::Receiver<bool>,
        metrics: Arc<AgentMetricsStorage>,
    ) -> Self {
        Self {
            channel,
            sessions,
            reporter,
            state,
            shutdown,
            metrics,
            initial_buffer_size: options.initial_buffer_size,
            max_buffer_size: options.max_buffer_size,
        }
    }

    /// Process messages until the host cancels, the transport goes away or
    /// a local shutdown is requested.
    pub(crate) async fn run(mut self) -> GuestCtlResult<()> {
        let result = loop {
            if *self.shutdown.borrow() {
                break Ok(());
            }

            self.state.send_replace(DispatcherState::AwaitingMessage);
            let (msg_type, count) = match self.fetch().await {
                Ok(next) => next,
                Err(GuestCtlError::Cancelled) => {
                    tracing::info!("Pending wait cancelled, stopping dispatcher");
                    break Ok(());
                }
                Err(GuestCtlError::TransportUnavailable(reason)) => {
                    tracing::warn!(%reason, "Transport lost, stopping dispatcher");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };
            if *self.shutdown.borrow() {
                break Ok(());
            }

            self.state.send_replace(DispatcherState::Processing);
            match self.handle(msg_type, count).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(GuestCtlError::Cancelled) | Err(GuestCtlError::TransportUnavailable(_)) => {
                    break Ok(());
                }
                Err(e) => {
                    tracing::warn!(msg_type, error = %e, "Failed to handle host message");
                }
            }
            self.state.send_replace(DispatcherState::Idle);
        };

        self.state.send_replace(DispatcherState::ShuttingDown);
        result
    }

    /// Wait for the next message; a shutdown request cancels the wait.
    async fn fetch(&self) -> GuestCtlResult<(u32, u32)> {
        let mut shutdown = self.shutdown.clone();
        let fetch = self.channel.fetch_next_host_message();
        tokio::pin!(fetch);

        tokio::select! {
            biased;
            result = &mut fetch => result,
            _ = stop_requested(&mut shutdown) => {
                self.state.send_replace(DispatcherState::ShuttingDown);
                if let Err(e) = self.channel.cancel_pending_waits().await {
                    tracing::warn!(error = %e, "Failed to cancel pending wait");
                }
                fetch.await
            }
        }
    }

    async fn handle(&mut self, msg_type: u32, count: u32) -> GuestCtlResult<Flow> {
        let Some(function) = HostFn::from_u32(msg_type) else {
            tracing::warn!(msg_type, "Unsupported host message");
            self.skip(error_code::NOT_SUPPORTED).await?;
            return Ok(Flow::Continue);
        };
        if count as usize != function.param_count() {
            tracing::warn!(
                function = function.name(),
                count,
                expected = function.param_count(),
                "Host message has wrong parameter count"
            );
            self.skip(error_code::INVALID_PARAMETER).await?;
            return Ok(Flow::Continue);
        }

        let Some(params) = self.receive(function).await? else {
            return Ok(Flow::Continue);
        };
        AgentMetricsStorage::incr(&self.metrics.messages_handled);

        let message = match codec::decode_host(msg_type, &params) {
            Ok(message) => message,
            Err(e) => {
                let context = codec::context_of(&params);
                tracing::warn!(function = function.name(), ?context, error = %e, "Malformed host message");
                if let Some(context) = context {
                    self.reporter.status(
                        context,
                        0,
                        ProcessStatus::Error,
                        error_code::INVALID_PARAMETER,
                    );
                }
                return Ok(Flow::Continue);
            }
        };

        tracing::debug!(function = function.name(), context = ?message.context(), "Host message");
        match message {
            HostMessage::CancelPendingWaits => {
                tracing::info!("Host asked the agent to stop");
                return Ok(Flow::Stop);
            }
            HostMessage::Execute(cmd) => self.sessions.spawn(&cmd),
            HostMessage::Input(input) => self.sessions.write_input(input),
            HostMessage::OutputRequest(request) => self.sessions.drain_output(&request),
        }
        Ok(Flow::Continue)
    }

    /// Copy the head message out, growing the receive buffers as needed.
    ///
    /// Returns `None` when the message was skipped.
    async fn receive(&mut self, function: HostFn) -> GuestCtlResult<Option<Vec<HgcmParam>>> {
        // Every message starts from the initial size again.
        let mut size = self.initial_buffer_size;
        loop {
            let mut slots = codec::host_layout(function, size);
            match self.channel.get_message_details(&mut slots).await {
                Ok(()) => return Ok(Some(slots)),
                Err(GuestCtlError::BufferTooSmall { index, needed }) => {
                    if needed > self.max_buffer_size {
                        tracing::warn!(
                            function = function.name(),
                            index,
                            needed,
                            max = self.max_buffer_size,
                            "Host message field exceeds buffer limit"
                        );
                        self.skip(error_code::BUFFER_OVERFLOW).await?;
                        return Ok(None);
                    }
                    size = needed
                        .next_power_of_two()
                        .min(self.max_buffer_size)
                        .max(needed);
                    tracing::debug!(index, size, "Growing receive buffers");
                }
                Err(e @ (GuestCtlError::Cancelled | GuestCtlError::TransportUnavailable(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(function = function.name(), error = %e, "Failed to fetch host message");
                    self.skip(e.status_code()).await?;
                    return Ok(None);
                }
            }
        }
    }

    async fn skip(&self, rc: u32) -> GuestCtlResult<()> {
        AgentMetricsStorage::incr(&self.metrics.messages_skipped);
        self.channel.skip_message(rc).await
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        // Nobody can ask for shutdown any more.
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::SessionOptions;
    use async_trait::async_trait;
    use guestctl_shared::protocol::{
        ExecCommand, ExecInput, GuestFn, GuestReport, InputStatus,
    };
    use guestctl_shared::{ClientId, HgcmTransport};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Scripted service: a message queue plus a log of everything else.
    #[derive(Default)]
    struct MockTransport {
        queue: Mutex<VecDeque<(u32, Vec<HgcmParam>)>>,
        skipped: Mutex<Vec<u32>>,
        reports: Mutex<Vec<GuestReport>>,
        /// Largest buffer slot offered by each fetch attempt that has one.
        fetch_sizes: Mutex<Vec<usize>>,
        cancel: AtomicBool,
    }

    impl MockTransport {
        fn push(&self, message: HostMessage) {
            let function = message.function().as_u32();
            self.queue
                .lock()
                .push_back((function, codec::encode_host(&message)));
        }

        fn push_raw(&self, msg_type: u32, params: Vec<HgcmParam>) {
            self.queue.lock().push_back((msg_type, params));
        }
    }

    #[async_trait]
    impl HgcmTransport for MockTransport {
        async fn connect(&self) -> GuestCtlResult<ClientId> {
            Ok(1)
        }

        async fn disconnect(&self, _client: ClientId) -> GuestCtlResult<()> {
            Ok(())
        }

        async fn call(
            &self,
            _client: ClientId,
            function: u32,
            params: &mut [HgcmParam],
        ) -> GuestCtlResult<()> {
            match GuestFn::from_u32(function) {
                Some(GuestFn::GetHostMsg) if params.len() == 2 => loop {
                    let head = self.queue.lock().front().map(|(t, p)| (*t, p.len()));
                    if let Some((msg_type, count)) = head {
                        params[0] = HgcmParam::U32(msg_type);
                        params[1] = HgcmParam::U32(count as u32);
                        return Ok(());
                    }
                    if self.cancel.swap(false, Ordering::SeqCst) {
                        return Err(GuestCtlError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
                Some(GuestFn::GetHostMsg) => {
                    let offered = params
                        .iter()
                        .filter_map(|p| match p {
                            HgcmParam::Buffer(b) => Some(b.len()),
                            _ => None,
                        })
                        .max();
                    if let Some(offered) = offered {
                        self.fetch_sizes.lock().push(offered);
                    }
                    let mut queue = self.queue.lock();
                    let (_, head) = queue
                        .front()
                        .ok_or_else(|| GuestCtlError::InvalidState("empty".into()))?;
                    for (index, (src, slot)) in head.iter().zip(params.iter()).enumerate() {
                        if let (HgcmParam::Buffer(data), HgcmParam::Buffer(room)) = (src, slot) {
                            if data.len() > room.len() {
                                return Err(GuestCtlError::BufferTooSmall {
                                    index,
                                    needed: data.len(),
                                });
                            }
                        }
                    }
                    params.clone_from_slice(head);
                    queue.pop_front();
                    Ok(())
                }
                Some(GuestFn::SkipHostMsg) => {
                    self.queue.lock().pop_front();
                    self.skipped
                        .lock()
                        .push(params[0].as_u32().unwrap_or_default());
                    Ok(())
                }
                Some(GuestFn::CancelPendingWaits) => {
                    self.cancel.store(true, Ordering::SeqCst);
                    Ok(())
                }
                Some(report_fn) => {
                    let report = codec::decode_report(report_fn, params)?;
                    self.reports.lock().push(report);
                    Ok(())
                }
                None => Err(GuestCtlError::Unsupported(format!("function {function}"))),
            }
        }
    }

    struct Harness {
        transport: Arc<MockTransport>,
        reporter: Reporter,
        state: watch::Receiver<DispatcherState>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<GuestCtlResult<()>>,
    }

    async fn start(options: AgentOptions) -> Harness {
        let transport = Arc::new(MockTransport::default());
        let channel = GuestChannel::connect(transport.clone()).await.unwrap();
        let metrics = Arc::new(AgentMetricsStorage::default());
        let (reporter, _reporter_task) = Reporter::spawn(channel.clone(), metrics.clone());
        let sessions =
            ProcessSessionManager::new(reporter.clone(), SessionOptions::default(), metrics.clone());
        let (state_tx, state) = watch::channel(DispatcherState::Idle);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = Dispatcher::new(
            channel,
            sessions,
            reporter.clone(),
            &options,
            Arc::new(state_tx),
            shutdown_rx,
            metrics,
        );
        let task = tokio::spawn(dispatcher.run());
        Harness {
            transport,
            reporter,
            state,
            shutdown,
            task,
        }
    }

    impl Harness {
        /// Stop the dispatcher through a host cancel and flush reports.
        async fn stop(self) -> (Arc<MockTransport>, DispatcherState) {
            self.transport.push(HostMessage::CancelPendingWaits);
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            self.reporter.close().await;
            let state = *self.state.borrow();
            (self.transport, state)
        }
    }

    fn input(pid: u32, data: Vec<u8>) -> HostMessage {
        HostMessage::Input(ExecInput {
            context: 11,
            pid,
            flags: 0,
            data,
        })
    }

    #[tokio::test]
    async fn test_unknown_message_is_skipped() {
        let harness = start(AgentOptions::default()).await;
        harness.transport.push_raw(999, Vec::new());

        let (transport, state) = harness.stop().await;
        assert_eq!(*transport.skipped.lock(), vec![error_code::NOT_SUPPORTED]);
        assert_eq!(state, DispatcherState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_wrong_param_count_is_skipped() {
        let harness = start(AgentOptions::default()).await;
        harness
            .transport
            .push_raw(HostFn::ExecGetOutput.as_u32(), vec![HgcmParam::U32(1)]);

        let (transport, _) = harness.stop().await;
        assert_eq!(*transport.skipped.lock(), vec![error_code::INVALID_PARAMETER]);
    }

    #[tokio::test]
    async fn test_buffers_grow_up_to_limit() {
        let options = AgentOptions {
            initial_buffer_size: 16,
            max_buffer_size: 64,
            ..Default::default()
        };
        let harness = start(options).await;
        harness.transport.push(input(4242, vec![b'x'; 40]));
        harness.transport.push(input(4242, vec![b'y'; 100]));

        let (transport, _) = harness.stop().await;
        assert_eq!(*transport.skipped.lock(), vec![error_code::BUFFER_OVERFLOW]);

        let reports = transport.reports.lock();
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            GuestReport::InputStatus(r) => {
                assert_eq!(r.context, 11);
                assert_eq!(r.status, InputStatus::Error);
                assert_eq!(r.flags, error_code::NOT_FOUND);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buffers_shrink_after_large_message() {
        let options = AgentOptions {
            initial_buffer_size: 16,
            max_buffer_size: 64,
            ..Default::default()
        };
        let harness = start(options).await;
        harness.transport.push(input(4242, vec![b'x'; 40]));
        harness.transport.push(input(4242, vec![b'y'; 4]));

        let (transport, _) = harness.stop().await;
        assert_eq!(*transport.fetch_sizes.lock(), vec![16, 64, 16]);
        assert_eq!(transport.reports.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_message_reports_error_status() {
        let harness = start(AgentOptions::default()).await;
        let mut params = codec::encode_host(&HostMessage::Execute(ExecCommand {
            context: 21,
            command: "/bin/true".into(),
            env: vec!["A=1".into(), "B=2".into()],
            ..Default::default()
        }));
        params[5] = HgcmParam::U32(3);
        harness.transport.push_raw(HostFn::ExecCmd.as_u32(), params);

        let (transport, _) = harness.stop().await;
        assert!(transport.skipped.lock().is_empty());
        let reports = transport.reports.lock();
        match reports.as_slice() {
            [GuestReport::Status(r)] => {
                assert_eq!(r.context, 21);
                assert_eq!(r.pid, 0);
                assert_eq!(r.status, ProcessStatus::Error);
                assert_eq!(r.flags, error_code::INVALID_PARAMETER);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_cancels_blocked_fetch() {
        let harness = start(AgentOptions::default()).await;
        let mut state = harness.state.clone();
        state
            .wait_for(|s| *s == DispatcherState::AwaitingMessage)
            .await
            .unwrap();

        harness.shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), harness.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*harness.state.borrow(), DispatcherState::ShuttingDown);
    }
}
