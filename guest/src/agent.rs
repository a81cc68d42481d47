//! The guest agent: connection, dispatcher, sessions and teardown.

use std::sync::Arc;

use guestctl_shared::{GuestCtlResult, HgcmTransport};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::GuestChannel;
use crate::dispatcher::{Dispatcher, DispatcherState};
use crate::metrics::{AgentMetrics, AgentMetricsStorage};
use crate::options::AgentOptions;
use crate::reporter::Reporter;
use crate::session::{ProcessSessionInfo, ProcessSessionManager};

struct AgentInner {
    options: AgentOptions,
    transport: Arc<dyn HgcmTransport>,
    shutdown: watch::Sender<bool>,
    state: Arc<watch::Sender<DispatcherState>>,
    metrics: Arc<AgentMetricsStorage>,
    sessions: Mutex<Option<ProcessSessionManager>>,
}

/// Guest side of guest control.
///
/// Connects to the service, executes host commands and reports back until
/// the host cancels, the transport drops or [`GuestAgent::shutdown`] is called.
/// Running processes are killed during teardown.
///
/// ```no_run
/// # async fn demo(transport: std::sync::Arc<dyn guestctl_shared::HgcmTransport>) {
/// use guestctl_guest::{AgentOptions, GuestAgent};
///
/// let agent = GuestAgent::new(AgentOptions::default(), transport);
/// let task = agent.spawn();
/// // ...
/// agent.shutdown();
/// task.await.ok();
/// # }
/// ```
#[derive(Clone)]
pub struct GuestAgent {
    inner: Arc<AgentInner>,
}

impl std::fmt::Debug for GuestAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestAgent")
            .field("state", &*self.inner.state.borrow())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl GuestAgent {
    pub fn new(options: AgentOptions, transport: Arc<dyn HgcmTransport>) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (state, _) = watch::channel(DispatcherState::Idle);
        Self {
            inner: Arc::new(AgentInner {
                options,
                transport,
                shutdown,
                state: Arc::new(state),
                metrics: Arc::new(AgentMetricsStorage::default()),
                sessions: Mutex::new(None),
            }),
        }
    }

    /// Run the agent to completion.
    pub async fn run(&self) -> GuestCtlResult<()> {
        let inner = &self.inner;
        inner.options.validate()?;

        let channel = GuestChannel::connect(inner.transport.clone()).await?;
        let (reporter, reporter_task) = Reporter::spawn(channel.clone(), inner.metrics.clone());
        let sessions = ProcessSessionManager::new(
            reporter.clone(),
            inner.options.session.clone(),
            inner.metrics.clone(),
        );
        *inner.sessions.lock() = Some(sessions.clone());

        tracing::info!(client = channel.client_id(), "Guest agent running");
        let dispatcher = Dispatcher::new(
            channel.clone(),
            sessions.clone(),
            reporter.clone(),
            &inner.options,
            inner.state.clone(),
            inner.shutdown.subscribe(),
            inner.metrics.clone(),
        );
        let result = dispatcher.run().await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "Dispatcher failed");
        }

        sessions.shutdown(inner.options.shutdown_grace()).await;
        reporter.close().await;
        if let Err(e) = reporter_task.await {
            tracing::warn!(error = %e, "Reporter task panicked");
        }
        if let Err(e) = channel.disconnect().await {
            tracing::debug!(error = %e, "Disconnect after shutdown failed");
        }

        let metrics = inner.metrics.snapshot();
        tracing::info!(
            handled = metrics.messages_handled,
            skipped = metrics.messages_skipped,
            started = metrics.processes_started,
            finished = metrics.processes_finished,
            "Guest agent stopped"
        );
        result
    }

    /// Run the agent on a new task.
    pub fn spawn(&self) -> JoinHandle<GuestCtlResult<()>> {
        let agent = self.clone();
        tokio::spawn(async move { agent.run().await })
    }

    /// Ask the agent to stop. A blocked fetch is cancelled.
    pub fn shutdown(&self) {
        tracing::info!("Guest agent shutdown requested");
        self.inner.shutdown.send_replace(true);
    }

    pub fn state(&self) -> watch::Receiver<DispatcherState> {
        self.inner.state.subscribe()
    }

    pub fn metrics(&self) -> AgentMetrics {
        self.inner.metrics.snapshot()
    }

    /// Processes the agent is tracking.
    pub fn processes(&self) -> Vec<ProcessSessionInfo> {
        self.inner
            .sessions
            .lock()
            .as_ref()
            .map(ProcessSessionManager::list)
            .unwrap_or_default()
    }
}
