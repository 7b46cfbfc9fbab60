//! Batch session controller.
//!
//! Runs one fan-out stream for several inputs. Events carrying an input
//! are routed to that input's session; a failure for one input does not
//! stop the others. The batch settles when the final ranking arrives, the
//! stream is lost, or it is cancelled.

use std::sync::{Arc, Mutex, MutexGuard};

use analyst_core::batch::{BatchSession, BatchSnapshot, NO_RESULT_MESSAGE};
use analyst_core::registry::StageRegistry;
use analyst_core::resolver::PipelineStatus;
use analyst_core::session::{SessionFailure, SessionSnapshot};
use analyst_core::types::SessionToken;
use tokio::sync::{broadcast, oneshot};

use crate::binding::{self, CloseAction};
use crate::client::Connector;
use crate::config::StreamConfig;
use crate::controller::{
    apply_message, idle_status, Applied, SessionError, SessionFuture, UPDATE_CHANNEL_CAPACITY,
};
use crate::events::SessionUpdate;
use crate::messages::StreamMessage;
use crate::transport::{CloseReason, StreamMode, TransportHandle};

/// Future returned by [`BatchController::start_batch`].
pub type BatchFuture = SessionFuture<BatchSnapshot>;

/// Owns the active batch and its shared stream.
#[derive(Clone)]
pub struct BatchController {
    inner: Arc<Inner>,
}

struct Inner {
    config: StreamConfig,
    registry: StageRegistry,
    connector: Arc<dyn Connector>,
    slot: Mutex<Option<ActiveBatch>>,
    updates: broadcast::Sender<SessionUpdate>,
}

struct ActiveBatch {
    batch: BatchSession,
    transport: Option<TransportHandle>,
    waiter: Option<oneshot::Sender<Result<BatchSnapshot, SessionError>>>,
    retries: u32,
}

impl ActiveBatch {
    fn settle(&mut self, result: Result<BatchSnapshot, SessionError>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(result);
        }
    }

    fn label(&self) -> String {
        self.batch.inputs().join(",")
    }
}

impl BatchController {
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

    /// Start a batch over `inputs`, superseding any current batch.
    ///
    /// Blank and duplicate inputs are dropped. Fails with
    /// [`SessionError::EmptyBatch`] when nothing is left. Must be called
    /// from within a tokio runtime.
    pub fn start_batch<I, S>(&self, inputs: I) -> Result<BatchFuture, SessionError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let token = SessionToken::new();
        let inputs = inputs
            .into_iter()
            .map(|input| input.into().trim().to_string())
            .filter(|input| !input.is_empty());
        let batch = BatchSession::new(token, inputs);
        if batch.total() == 0 {
            return Err(SessionError::EmptyBatch);
        }

        let (tx, rx) = oneshot::channel();
        let mut slot = self.inner.lock();
        if let Some(previous) = slot.take() {
            self.inner.supersede(previous);
        }

        let url = self.inner.config.batch_url(batch.inputs());
        tracing::info!(%token, total = batch.total(), "Starting batch session");
        let mut active = ActiveBatch {
            batch,
            transport: None,
            waiter: Some(tx),
            retries: 0,
        };
        active.transport = Some(Inner::open_transport(&self.inner, token, url));
        let label = active.label();
        *slot = Some(active);
        self.inner.publish(SessionUpdate::Started {
            token,
            input: label,
        });

        Ok(SessionFuture::new(token, rx))
    }

    /// Stop the running batch. Inputs still in flight become cancelled.
    ///
    /// The cancelled batch stays readable. Returns `false` if no batch was
    /// running.
    pub fn cancel_batch(&self) -> bool {
        let mut slot = self.inner.lock();
        let Some(active) = slot.as_mut() else {
            return false;
        };
        if !active.batch.cancel() {
            return false;
        }
        if let Some(transport) = active.transport.take() {
            transport.close();
        }
        active.settle(Err(SessionError::Cancelled));

        let token = active.batch.token();
        tracing::info!(%token, "Batch session cancelled");
        let label = active.label();
        self.inner.publish(SessionUpdate::Cancelled {
            token,
            input: label,
        });
        true
    }

    /// Snapshot of the current batch.
    pub fn batch(&self) -> Option<BatchSnapshot> {
        self.inner
            .lock()
            .as_ref()
            .map(|active| active.batch.snapshot(&self.inner.registry))
    }

    /// Snapshot of one input of the current batch.
    pub fn session(&self, input: &str) -> Option<SessionSnapshot> {
        self.inner
            .lock()
            .as_ref()
            .and_then(|active| active.batch.session(input))
            .map(|session| session.snapshot(&self.inner.registry))
    }

    /// Sub-task statuses for one input; all idle if it is not in the batch.
    pub fn pipeline(&self, input: &str) -> PipelineStatus {
        self.inner
            .lock()
            .as_ref()
            .and_then(|active| active.batch.session(input))
            .map(|session| session.status(&self.inner.registry))
            .unwrap_or_else(|| idle_status(&self.inner.registry))
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.inner.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.inner.updates.subscribe()
    }
}

// ---- internals ----

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<ActiveBatch>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn supersede(&self, mut previous: ActiveBatch) {
        if let Some(transport) = previous.transport.take() {
            transport.close();
        }
        previous.settle(Err(SessionError::Superseded));
        if !previous.batch.is_terminal() {
            let token = previous.batch.token();
            tracing::info!(%token, "Batch session superseded");
            let label = previous.label();
            self.publish(SessionUpdate::Superseded {
                token,
                input: label,
            });
        }
    }

    fn open_transport(inner: &Arc<Self>, token: SessionToken, url: String) -> TransportHandle {
        binding::open_bound(
            inner,
            Arc::clone(&inner.connector),
            url,
            StreamMode::Batch,
            token,
            Self::handle_message,
            Self::handle_closed,
        )
    }

    fn handle_message(&self, token: SessionToken, message: StreamMessage) {
        let mut slot = self.lock();
        let Some(active) = slot.as_mut().filter(|a| a.batch.token() == token) else {
            tracing::trace!(%token, "Dropping event from superseded batch");
            return;
        };
        if active.batch.is_terminal() {
            return;
        }

        let message = match message {
            StreamMessage::BatchComplete(data) => {
                let unfinished: Vec<String> = active
                    .batch
                    .inputs()
                    .iter()
                    .filter(|input| {
                        active
                            .batch
                            .session(input)
                            .is_some_and(|session| !session.is_terminal())
                    })
                    .cloned()
                    .collect();
                active.batch.complete(data.into_ranked());
                for input in unfinished {
                    tracing::warn!(%token, input = %input, "Batch finished without a result for input");
                    self.publish(SessionUpdate::Failed {
                        token,
                        input,
                        error: NO_RESULT_MESSAGE.to_string(),
                    });
                }
                active.transport = None;
                let snapshot = active.batch.snapshot(&self.registry);
                tracing::info!(
                    %token,
                    completed = snapshot.completed,
                    total = snapshot.total,
                    "Batch session completed",
                );
                active.settle(Ok(snapshot));
                self.publish(SessionUpdate::BatchCompleted {
                    token,
                    total: active.batch.total(),
                });
                return;
            }
            other => other,
        };

        let Some(input) = message.input().map(str::to_string) else {
            match message {
                StreamMessage::Error(data) => {
                    self.fail(active, SessionFailure::application(data.error));
                }
                _ => tracing::debug!(%token, "Dropping batch event without an input"),
            }
            return;
        };
        let Some(session) = active.batch.session_mut(&input) else {
            tracing::debug!(%token, input = %input, "Dropping event for input outside the batch");
            return;
        };
        if session.is_terminal() {
            return;
        }

        match apply_message(&self.registry, session, message) {
            Applied::Progress {
                stage,
                progress,
                task,
            } => {
                tracing::debug!(%token, input = %input, stage = %stage, progress, "Batch input progress");
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
            Applied::Succeeded(_) => {
                tracing::info!(
                    %token,
                    input = %input,
                    completed = active.batch.completed(),
                    total = active.batch.total(),
                    "Batch input completed",
                );
                self.publish(SessionUpdate::Completed { token, input });
            }
            Applied::Failed(failure) => {
                tracing::warn!(%token, input = %input, error = %failure.message, "Batch input failed");
                self.publish(SessionUpdate::Failed {
                    token,
                    input,
                    error: failure.message,
                });
            }
            Applied::Ignored => {}
        }
    }

    fn handle_closed(inner: &Arc<Self>, token: SessionToken, reason: CloseReason) {
        let mut slot = inner.lock();
        let Some(active) = slot.as_mut().filter(|a| a.batch.token() == token) else {
            return;
        };
        active.transport = None;
        if active.batch.is_terminal() {
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

    fn reopen(inner: &Arc<Self>, token: SessionToken) {
        let mut slot = inner.lock();
        let Some(active) = slot.as_mut().filter(|a| a.batch.token() == token) else {
            return;
        };
        if active.batch.is_terminal() || active.transport.is_some() {
            return;
        }
        let url = inner.config.batch_url(active.batch.inputs());
        tracing::info!(%token, attempt = active.retries, "Reopening batch stream");
        active.transport = Some(Self::open_transport(inner, token, url));
    }

    /// Fail the whole batch along with every input still in flight.
    fn fail(&self, active: &mut ActiveBatch, failure: SessionFailure) {
        if !active.batch.fail(failure.clone()) {
            return;
        }
        active.transport = None;
        let token = active.batch.token();
        tracing::error!(%token, error = %failure.message, "Batch session failed");
        active.settle(Err(failure.clone().into()));
        let label = active.label();
        self.publish(SessionUpdate::Failed {
            token,
            input: label,
            error: failure.message,
        });
    }
}
