//! Observable "current user" shared by queries, mutations and the cache
//! lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tracing::info;

/// Handle returned by `on_transition`, used to remove the hook.
pub type HookId = u64;

type TransitionHook = Arc<dyn Fn(Option<&str>, Option<&str>) + Send + Sync>;

struct ProviderInner {
    user: watch::Sender<Option<String>>,
    hooks: Mutex<Vec<(HookId, TransitionHook)>>,
    next_hook: AtomicU64,
}

/// The signed-in user id, or none.
///
/// Transition hooks run synchronously inside `sign_in`/`sign_out`, after
/// the new user is published, so anything they clear is gone before the
/// call returns.
#[derive(Clone)]
pub struct SessionProvider {
    inner: Arc<ProviderInner>,
}

impl Default for SessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider {
    /// A provider with nobody signed in.
    pub fn new() -> Self {
        let (user, _) = watch::channel(None);
        Self {
            inner: Arc::new(ProviderInner {
                user,
                hooks: Mutex::new(Vec::new()),
                next_hook: AtomicU64::new(1),
            }),
        }
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let provider = Self::new();
        provider.inner.user.send_replace(Some(user_id.into()));
        provider
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner.user.borrow().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.user.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.inner.user.subscribe()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        self.transition(Some(user_id.into()));
    }

    pub fn sign_out(&self) {
        self.transition(None);
    }

    fn transition(&self, next: Option<String>) {
        let previous = self.inner.user.send_replace(next.clone());
        if previous == next {
            return;
        }
        info!(from = ?previous, to = ?next, "Session changed");

        let hooks: Vec<TransitionHook> = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in hooks {
            hook(previous.as_deref(), next.as_deref());
        }
    }

    /// Register `hook(previous, next)` to run on every change of user.
    pub fn on_transition<F>(&self, hook: F) -> HookId
    where
        F: Fn(Option<&str>, Option<&str>) + Send + Sync + 'static,
    {
        let id = self.inner.next_hook.fetch_add(1, Ordering::Relaxed);
        self.inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(hook)));
        id
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut hooks = self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }
}
