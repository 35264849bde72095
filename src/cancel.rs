//! Cooperative Cancellation
//!
//! A [`CancellationToken`] is a one-shot broadcast: callers register cleanup
//! actions, and cancelling runs each of them exactly once.
//!
//! - Actions registered before `cancel()` run during `cancel()`, in
//!   registration order.
//! - Actions registered after `cancel()` run synchronously inside
//!   `register()`.
//! - A second `cancel()` does nothing.
//! - An action can be withdrawn with [`CancellationToken::unregister`] until
//!   the token fires.
//!
//! Cancellation only stops local listening. The session uses it to tear down
//! a pending record; it never asks the broker to abort work.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type Action = Box<dyn FnOnce() + Send>;

/// Identifies one registered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionKey(u64);

#[derive(Default)]
struct State {
    cancelled: bool,
    next_key: u64,
    actions: Vec<(ActionKey, Action)>,
}

#[derive(Clone, Default)]
pub struct CancellationToken {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CancellationToken")
            .field("cancelled", &state.cancelled)
            .field("actions", &state.actions.len())
            .finish()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup action.
    ///
    /// On a cancelled token the action runs before this returns, and the key
    /// refers to nothing.
    pub fn register(&self, action: impl FnOnce() + Send + 'static) -> ActionKey {
        let key = {
            let mut state = self.lock();
            let key = ActionKey(state.next_key);
            state.next_key += 1;
            if !state.cancelled {
                state.actions.push((key, Box::new(action)));
                return key;
            }
            key
        };
        action();
        key
    }

    /// Withdraw an action that has not run. Returns false if it already ran
    /// or was withdrawn.
    pub fn unregister(&self, key: ActionKey) -> bool {
        let mut state = self.lock();
        match state.actions.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                state.actions.remove(index);
                true
            }
            None => false,
        }
    }

    /// Actions waiting for the token to fire.
    pub fn pending_actions(&self) -> usize {
        self.lock().actions.len()
    }

    /// Fire the token. Idempotent.
    pub fn cancel(&self) {
        let actions = {
            let mut state = self.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.actions)
        };
        // Run outside the lock: actions may register on this same token.
        for (_, action) in actions {
            action();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Resolves once the token has been cancelled.
    pub async fn cancelled(&self) {
        let (tx, rx) = oneshot::channel();
        self.register(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    /// Cancel the token once `after` has elapsed.
    ///
    /// This is how callers put a timeout on a request.
    pub fn cancel_after(&self, after: Duration) -> JoinHandle<()> {
        let token = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
