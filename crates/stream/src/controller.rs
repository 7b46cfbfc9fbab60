//! Single-slot session controller.
//!
//! [`SessionController`] owns at most one active analysis session. Each
//! [`start`](SessionController::start) mints a fresh [`SessionToken`],
//! retires whatever ran before and opens a new transport whose callbacks
//! carry that token. Events arriving under any other token are dropped,
//! which is what keeps a superseded stream from touching the new session.
//!
//! Every state change happens synchronously inside the transport callback
//! that caused it, under one short-lived lock. Consumers read immutable
//! [`SessionSnapshot`]s and subscribe to [`SessionUpdate`]s.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use analyst_core::registry::StageRegistry;
use analyst_core::resolver::{resolve, PipelineStatus, ResolveInput};
use analyst_core::session::{
    FailureKind, JobOutcome, JobSession, SessionFailure, SessionSnapshot,
    UNSUCCESSFUL_RESULT_MESSAGE,
};
use analyst_core::types::SessionToken;
use tokio::sync::{broadcast, oneshot};

use crate::binding::{self, CloseAction};
use crate::client::Connector;
use crate::config::StreamConfig;
use crate::events::SessionUpdate;
use crate::messages::StreamMessage;
use crate::transport::{CloseReason, StreamMode, TransportHandle};

/// Broadcast channel capacity for session updates.
pub(crate) const UPDATE_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors and futures
// ---------------------------------------------------------------------------

/// Why a session did not produce a result.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    /// The stream could not be opened or was lost.
    #[error("{0}")]
    Transport(String),

    /// The server reported a failure.
    #[error("{0}")]
    Application(String),

    /// A newer start request replaced this session.
    #[error("Session was superseded by a newer request")]
    Superseded,

    /// The session was cancelled before it finished.
    #[error("Session was cancelled")]
    Cancelled,

    /// A batch needs at least one input.
    #[error("Batch has no inputs")]
    EmptyBatch,
}

impl From<SessionFailure> for SessionError {
    fn from(failure: SessionFailure) -> Self {
        match failure.kind {
            FailureKind::Transport => Self::Transport(failure.message),
            FailureKind::Application => Self::Application(failure.message),
        }
    }
}

/// Resolves once the session it was returned for settles.
///
/// Dropping it does not cancel the session.
#[derive(Debug)]
pub struct SessionFuture<T> {
    token: SessionToken,
    rx: oneshot::Receiver<Result<T, SessionError>>,
}

impl<T> SessionFuture<T> {
    pub(crate) fn new(token: SessionToken, rx: oneshot::Receiver<Result<T, SessionError>>) -> Self {
        Self { token, rx }
    }

    /// Token of the session this future belongs to.
    pub fn token(&self) -> SessionToken {
        self.token
    }
}

impl<T> Future for SessionFuture<T> {
    type Output = Result<T, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped sender means the controller itself went away.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SessionError::Cancelled)))
    }
}

/// Future returned by [`SessionController::start`].
pub type JobFuture = SessionFuture<JobOutcome>;

// ---------------------------------------------------------------------------
// SessionController
// ---------------------------------------------------------------------------

/// Owns the active session and the transport feeding it.
///
/// Cheap to clone; clones share the same slot.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

/// Read-only view of a [`SessionController`] for presentation code.
#[derive(Clone)]
pub struct SessionReader {
    inner: Arc<Inner>,
}

struct Inner {
    config: StreamConfig,
    registry: StageRegistry,
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<ActiveSession>>,
    updates: broadcast::Sender<SessionUpdate>,
}

struct ActiveSession {
    session: JobSession,
    transport: Option<TransportHandle>,
    waiter: Option<oneshot::Sender<Result<JobOutcome, SessionError>>>,
    /// Connect retries spent so far.
    retries: u32,
}

impl ActiveSession {
    /// Settle the caller's future. Only the first call has any effect.
    fn settle(&mut self, result: Result<JobOutcome, SessionError>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }
}

impl SessionController {
    pub fn new(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let registry = config.pipeline.registry();
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                connector,
                slot: Mutex::new(None),
                updates,
            }),
        }
    }

    /// Start a new session for `input`, superseding any current one.
    ///
    /// Starting the same input twice is a restart, never a no-op. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, input: impl Into<String>) -> JobFuture {
        let input = input.into();
        let token = SessionToken::new();
        let (tx, rx) = oneshot::channel();

        let mut slot = self.inner.lock();
        if let Some(previous) = slot.take() {
            self.inner.supersede(previous);
        }

        tracing::info!(%token, input = %input, "Starting analysis session");
        let transport = Inner::open_transport(&self.inner, token, &input);
        *slot = Some(ActiveSession {
            session: JobSession::new(token, input.clone()),
            transport: Some(transport),
            waiter: Some(tx),
            retries: 0,
        });
        self.inner.publish(SessionUpdate::Started { token, input });

        SessionFuture::new(token, rx)
    }

    /// Stop the active session without replacing it.
    ///
    /// Returns `false` when there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        let Some(mut active) = self.inner.lock().take() else {
            return false;
        };
        if let Some(transport) = active.transport.take() {
            transport.close();
        }
        let token = active.session.token();
        let input = active.session.input().to_string();
        let was_running = active.session.cancel();
        active.settle(Err(SessionError::Cancelled));
        if was_running {
            tracing::info!(%token, input = %input, "Analysis session cancelled");
            self.inner.publish(SessionUpdate::Cancelled { token, input });
        }
        true
    }

    /// Narrow read-only accessor to hand to consumers.
    pub fn reader(&self) -> SessionReader {
        SessionReader {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Snapshot of the session for `input`, if it is the active one.
    pub fn session(&self, input: &str) -> Option<SessionSnapshot> {
        self.inner.session(input)
    }

    /// Snapshot of the active session, whatever its input.
    pub fn current(&self) -> Option<SessionSnapshot> {
        self.inner.current()
    }

    /// Sub-task statuses for `input`; all idle if no session runs for it.
    pub fn pipeline(&self, input: &str) -> PipelineStatus {
        self.inner.pipeline(input)
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }
}

impl SessionReader {
    pub fn session(&self, input: &str) -> Option<SessionSnapshot> {
        self.inner.session(input)
    }

    pub fn current(&self) -> Option<SessionSnapshot> {
        self.inner.current()
    }

    pub fn pipeline(&self, input: &str) -> PipelineStatus {
        self.inner.pipeline(input)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }
}

// ---- internals ----

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, update: SessionUpdate) {
        // Only fails when nobody is subscribed.
        let _ = self.updates.send(update);
    }

    fn session(&self, input: &str) -> Option<SessionSnapshot> {
        self.lock()
            .as_ref()
            .filter(|active| active.session.input() == input)
            .map(|active| active.session.snapshot(&self.registry))
    }

    fn current(&self) -> Option<SessionSnapshot> {
        self.lock()
            .as_ref()
            .map(|active| active.session.snapshot(&self.registry))
    }

    fn pipeline(&self, input: &str) -> PipelineStatus {
        if let Some(active) = self.lock().as_ref() {
            if active.session.input() == input {
                return active.session.status(&self.registry);
            }
        }
        idle_status(&self.registry)
    }

    /// Retire a session replaced by a new start request.
    fn supersede(&self, mut previous: ActiveSession) {
        if let Some(transport) = previous.transport.take() {
            transport.close();
        }
        previous.settle(Err(SessionError::Superseded));
        if !previous.session.is_terminal() {
            let token = previous.session.token();
            let input = previous.session.input().to_string();
            tracing::info!(%token, input = %input, "Analysis session superseded");
            self.publish(SessionUpdate::Superseded { token, input });
        }
    }

    /// Open a transport whose callbacks are bound to `token`.
    fn open_transport(inner: &Arc<Self>, token: SessionToken, input: &str) -> TransportHandle {
        binding::open_bound(
            inner,
            Arc::clone(&inner.connector),
            inner.config.single_url(input),
            StreamMode::Single,
            token,
            Self::handle_message,
            Self::handle_closed,
        )
    }

    /// Apply one message delivered under `token`.
    fn handle_message(&self, token: SessionToken, message: StreamMessage) {
        let mut slot = self.lock();
        let Some(active) = slot.as_mut().filter(|a| a.session.token() == token) else {
            tracing::trace!(%token, "Dropping event from superseded session");
            return;
        };
        if active.session.is_terminal() {
            tracing::debug!(%token, "Dropping event after terminal state");
            return;
        }
        if let Some(input) = message.input() {
            if input != active.session.input() {
                tracing::debug!(%token, input = %input, "Dropping event for another input");
                return;
            }
        }

        let input = active.session.input().to_string();
        match apply_message(&self.registry, &mut active.session, message) {
            Applied::Progress {
                stage,
                progress,
                task,
            } => {
                tracing::debug!(%token, input = %input, stage = %stage, progress, "Session progress");
                if let Some((task, success)) = task {
                    self.publish(SessionUpdate::TaskFinished {
                        token,
                        input: input.clone(),
                        task,
                        success,
                    });
                }
                self.publish(SessionUpdate::Progress {
                    token,
                    input,
                    stage,
                    progress,
                });
            }
            Applied::Succeeded(outcome) => {
                active.settle(Ok(outcome));
                tracing::info!(%token, input = %input, "Analysis session completed");
                self.publish(SessionUpdate::Completed { token, input });
            }
            Applied::Failed(failure) => self.reject(active, failure),
            Applied::Ignored => {
                tracing::debug!(%token, "Ignoring batch ranking on a single-input stream");
            }
        }
    }

    /// React to the transport bound to `token` going away.
    fn handle_closed(inner: &Arc<Self>, token: SessionToken, reason: CloseReason) {
        let mut slot = inner.lock();
        let Some(active) = slot.as_mut().filter(|a| a.session.token() == token) else {
            return;
        };
        active.transport = None;
        if active.session.is_terminal() {
            return;
        }

        let action = binding::after_close(
            inner,
            token,
            reason,
            &mut active.retries,
            &inner.config.retry,
            Self::reopen,
        );
        if action == CloseAction::Fail {
            inner.fail(active, SessionFailure::connectivity());
        }
    }

    /// Open a new transport for a session still waiting on a retry.
    fn reopen(inner: &Arc<Self>, token: SessionToken) {
        let mut slot = inner.lock();
        let Some(active) = slot.as_mut().filter(|a| a.session.token() == token) else {
            return;
        };
        if active.session.is_terminal() || active.transport.is_some() {
            return;
        }
        let input = active.session.input().to_string();
        tracing::info!(%token, input = %input, attempt = active.retries, "Reopening event stream");
        active.transport = Some(Self::open_transport(inner, token, &input));
    }

    fn fail(&self, active: &mut ActiveSession, failure: SessionFailure) {
        if active.session.fail(failure.clone()) {
            self.reject(active, failure);
        }
    }

    /// Settle and announce a session that has just failed.
    fn reject(&self, active: &mut ActiveSession, failure: SessionFailure) {
        let token = active.session.token();
        let input = active.session.input().to_string();
        tracing::error!(%token, input = %input, error = %failure.message, "Analysis session failed");
        active.settle(Err(failure.clone().into()));
        self.publish(SessionUpdate::Failed {
            token,
            input,
            error: failure.message,
        });
    }
}

// ---------------------------------------------------------------------------
// Shared event application
// ---------------------------------------------------------------------------

/// What applying one message did to a session.
#[derive(Debug)]
pub(crate) enum Applied {
    Progress {
        stage: String,
        progress: f64,
        /// Sub-task result carried by the progress event, if any.
        task: Option<(String, bool)>,
    },
    Succeeded(JobOutcome),
    Failed(SessionFailure),
    /// The message has no meaning for a single session.
    Ignored,
}

/// Apply a message already routed to `session`.
///
/// The caller checks the token, the input and that the session is still
/// live; this only translates the message into session mutations.
pub(crate) fn apply_message(
    registry: &StageRegistry,
    session: &mut JobSession,
    message: StreamMessage,
) -> Applied {
    match message {
        StreamMessage::Progress(data) => {
            // A progress event without a percentage keeps the last one.
            let progress = data.progress.unwrap_or(session.progress());
            let stage = data.stage.to_string();
            session.apply_progress(registry, data.stage, progress);
            let task = data.task_result.map(|task_result| {
                let (task, result) = task_result.into_result();
                let success = result.success;
                session.record_result(task.clone(), result);
                (task, success)
            });
            Applied::Progress {
                stage,
                progress: session.progress(),
                task,
            }
        }
        StreamMessage::Result(data) => {
            for (task, result) in data.results {
                session.record_result(task, result);
            }
            if data.success {
                let outcome = JobOutcome {
                    input: session.input().to_string(),
                    fields: data.fields,
                };
                session.succeed(outcome.clone());
                Applied::Succeeded(outcome)
            } else {
                let message = data
                    .error
                    .unwrap_or_else(|| UNSUCCESSFUL_RESULT_MESSAGE.to_string());
                let failure = SessionFailure::application(message);
                session.fail(failure.clone());
                Applied::Failed(failure)
            }
        }
        StreamMessage::Error(data) => {
            let failure = SessionFailure::application(data.error);
            session.fail(failure.clone());
            Applied::Failed(failure)
        }
        StreamMessage::BatchComplete(_) => Applied::Ignored,
    }
}

/// Resolution for an input with no session at all.
pub(crate) fn idle_status(registry: &StageRegistry) -> PipelineStatus {
    let results = Default::default();
    resolve(
        registry,
        &ResolveInput {
            current_stage: None,
            results: &results,
            job_started: false,
            terminal_success: false,
            furthest_position: None,
        },
    )
}
