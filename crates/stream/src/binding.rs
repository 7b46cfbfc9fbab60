//! Token-bound transports shared by the session and batch controllers.
//!
//! A controller opens every transport through [`open_bound`], so each
//! callback carries the token of the session it was opened for and only
//! holds a weak reference to the controller. [`after_close`] decides what
//! happens to a still-live session once its transport is gone.

use std::sync::{Arc, Weak};

use analyst_core::types::SessionToken;

use crate::client::Connector;
use crate::messages::StreamMessage;
use crate::reconnect::RetryPolicy;
use crate::transport::{self, CloseReason, StreamMode, TransportHandle};

/// Open a transport whose callbacks are bound to `token`.
///
/// Callbacks are dropped silently once the owner itself is gone.
pub(crate) fn open_bound<T>(
    owner: &Arc<T>,
    connector: Arc<dyn Connector>,
    url: String,
    mode: StreamMode,
    token: SessionToken,
    on_message: fn(&T, SessionToken, StreamMessage),
    on_closed: fn(&Arc<T>, SessionToken, CloseReason),
) -> TransportHandle
where
    T: Send + Sync + 'static,
{
    let on_event = {
        let weak: Weak<T> = Arc::downgrade(owner);
        move |message: StreamMessage| {
            if let Some(owner) = weak.upgrade() {
                on_message(&owner, token, message);
            }
        }
    };
    let on_close = {
        let weak: Weak<T> = Arc::downgrade(owner);
        move |reason: CloseReason| {
            if let Some(owner) = weak.upgrade() {
                on_closed(&owner, token, reason);
            }
        }
    };

    transport::open(connector, url, mode, on_event, on_close)
}

/// What a controller does with a live session after its transport closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseAction {
    /// A reopen has been scheduled.
    Retry,
    /// The session must fail with the connectivity message.
    Fail,
}

/// Handle the closure of the transport feeding a session that has not
/// settled yet.
///
/// Only a stream that never opened is retried, within `policy`. `retries`
/// is the session's retry counter and is bumped when a retry is scheduled.
/// Any other closure, including a terminal event the controller did not
/// accept, leaves the session without a stream and fails it.
pub(crate) fn after_close<T>(
    owner: &Arc<T>,
    token: SessionToken,
    reason: CloseReason,
    retries: &mut u32,
    policy: &RetryPolicy,
    reopen: fn(&Arc<T>, SessionToken),
) -> CloseAction
where
    T: Send + Sync + 'static,
{
    match reason {
        CloseReason::ConnectFailed(error) => {
            let retry = *retries + 1;
            let Some(delay) = policy.delay_for(retry) else {
                tracing::error!(%token, error = %error, "Event stream failed to open");
                return CloseAction::Fail;
            };
            *retries = retry;
            tracing::warn!(
                %token,
                attempt = retry,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Event stream failed to open, retrying",
            );
            let weak = Arc::downgrade(owner);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(owner) = weak.upgrade() {
                    reopen(&owner, token);
                }
            });
            CloseAction::Retry
        }
        CloseReason::Dropped(detail) => {
            tracing::error!(%token, error = %detail, "Event stream lost before a terminal event");
            CloseAction::Fail
        }
        CloseReason::Terminal | CloseReason::Closed => {
            tracing::error!(%token, ?reason, "Event stream closed before the session settled");
            CloseAction::Fail
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::client::TransportError;

    #[derive(Default)]
    struct Owner {
        reopened: AtomicUsize,
    }

    fn reopen(owner: &Arc<Owner>, _token: SessionToken) {
        owner.reopened.fetch_add(1, Ordering::SeqCst);
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn connect_failure_schedules_reopen_within_budget() {
        let owner = Arc::new(Owner::default());
        let mut retries = 0;
        let reason = CloseReason::ConnectFailed(TransportError::Connection("refused".into()));

        let action = after_close(&owner, SessionToken::new(), reason, &mut retries, &fast_policy(1), reopen);
        assert_eq!(action, CloseAction::Retry);
        assert_eq!(retries, 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while owner.reopened.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let reason = CloseReason::ConnectFailed(TransportError::Connection("refused".into()));
        let action = after_close(&owner, SessionToken::new(), reason, &mut retries, &fast_policy(1), reopen);
        assert_eq!(action, CloseAction::Fail);
        assert_eq!(retries, 1);
    }

    #[tokio::test]
    async fn every_other_closure_fails_a_live_session() {
        let owner = Arc::new(Owner::default());
        for reason in [
            CloseReason::Terminal,
            CloseReason::Closed,
            CloseReason::Dropped("reset".into()),
        ] {
            let mut retries = 0;
            let action = after_close(&owner, SessionToken::new(), reason, &mut retries, &fast_policy(3), reopen);
            assert_eq!(action, CloseAction::Fail);
            assert_eq!(retries, 0);
        }
        assert_eq!(owner.reopened.load(Ordering::SeqCst), 0);
    }
}
