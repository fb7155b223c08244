//! Connection lifecycle state machine
//!
//! A client moves `Unready -> Ready` exactly once and to `Closed` exactly once. Every
//! transition happens under a single transition lock; the current state is published on a
//! `watch` channel so any number of concurrent callers can wait for readiness without
//! polling.

use crate::error::{HubError, HubResult};
use std::future::Future;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Lifecycle state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not yet authenticated and connected
    Unready,
    /// Authenticated and usable
    Ready,
    /// Torn down; terminal
    Closed,
}

/// Owner of a client's [`ConnectionState`]
#[derive(Debug)]
pub struct Lifecycle {
    transition: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::with_state(ConnectionState::Unready)
    }

    /// Lifecycle that starts in the given state, e.g. `Ready` for clients whose session is
    /// established during construction
    pub fn with_state(state: ConnectionState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            transition: Mutex::new(()),
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Acquire the transition lock. State changes happen only while it is held.
    pub async fn lock(&self) -> Transition<'_> {
        Transition {
            _guard: self.transition.lock().await,
            state_tx: &self.state_tx,
        }
    }

    /// Three-way wait: `Ok` once ready, `Closed` once closed, `Cancelled` if `cancel` fires
    /// first. Returns immediately when the state is already decided.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> HubResult<()> {
        let mut state_rx = self.state_tx.subscribe();
        let decided = async move {
            state_rx
                .wait_for(|state| *state != ConnectionState::Unready)
                .await
                .map(|state| *state)
        };

        tokio::select! {
            biased;

            decided = decided => match decided {
                Ok(ConnectionState::Ready) => Ok(()),
                Ok(_) | Err(_) => Err(HubError::Closed),
            },
            _ = cancel.cancelled() => Err(HubError::Cancelled),
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Held transition lock
pub struct Transition<'a> {
    _guard: MutexGuard<'a, ()>,
    state_tx: &'a watch::Sender<ConnectionState>,
}

impl Transition<'_> {
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn set(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "connection state changed");
        }
    }
}

/// Run `operation` until it completes or `cancel` fires, whichever happens first.
///
/// The operation future is dropped on cancellation, so callers must release any link they
/// opened after this returns, on both paths.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, operation: F) -> HubResult<T>
where
    F: Future<Output = HubResult<T>>,
{
    tokio::select! {
        result = operation => result,
        _ = cancel.cancelled() => Err(HubError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_ready_returns_once_ready() {
        let lifecycle = Arc::new(Lifecycle::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let lifecycle = lifecycle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lifecycle.wait_ready(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.lock().await.set(ConnectionState::Ready);

        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_ready_fails_when_closed() {
        let lifecycle = Arc::new(Lifecycle::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let lifecycle = lifecycle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lifecycle.wait_ready(&cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        lifecycle.lock().await.set(ConnectionState::Closed);

        assert_eq!(waiter.await.unwrap(), Err(HubError::Closed));
    }

    #[test]
    fn test_wait_ready_is_woken_by_transition() {
        let lifecycle = Lifecycle::new();
        let cancel = CancellationToken::new();
        let mut waiter = tokio_test::task::spawn(lifecycle.wait_ready(&cancel));

        tokio_test::assert_pending!(waiter.poll());
        tokio_test::block_on(async { lifecycle.lock().await.set(ConnectionState::Ready) });

        assert!(waiter.is_woken());
        tokio_test::assert_ready_eq!(waiter.poll(), Ok(()));
    }

    #[tokio::test]
    async fn test_wait_ready_observes_cancellation() {
        let lifecycle = Lifecycle::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(lifecycle.wait_ready(&cancel).await, Err(HubError::Cancelled));
    }

    #[tokio::test]
    async fn test_decided_state_returns_immediately() {
        let lifecycle = Lifecycle::with_state(ConnectionState::Ready);
        let cancel = CancellationToken::new();
        assert_eq!(lifecycle.wait_ready(&cancel).await, Ok(()));

        lifecycle.lock().await.set(ConnectionState::Closed);
        assert_eq!(lifecycle.wait_ready(&cancel).await, Err(HubError::Closed));
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_decided_state_wins_over_cancelled_token() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ready = Lifecycle::with_state(ConnectionState::Ready);
        let closed = Lifecycle::with_state(ConnectionState::Closed);
        for _ in 0..32 {
            assert_eq!(ready.wait_ready(&cancel).await, Ok(()));
            assert_eq!(closed.wait_ready(&cancel).await, Err(HubError::Closed));
        }
    }

    #[tokio::test]
    async fn test_run_cancellable() {
        let cancel = CancellationToken::new();
        let value = run_cancellable(&cancel, async { Ok::<_, HubError>(7) }).await;
        assert_eq!(value, Ok(7));

        cancel.cancel();
        let pending = run_cancellable(&cancel, std::future::pending::<HubResult<()>>()).await;
        assert_eq!(pending, Err(HubError::Cancelled));
    }
}
