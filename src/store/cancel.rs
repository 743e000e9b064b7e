//! Cancellation shared between the engine and in-flight store calls.

use crate::store::{StoreError, StoreResult};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type InterruptHook = Box<dyn FnOnce() + Send>;

/// Cancelling sets the flag, runs every registered interrupt hook once and
/// cancels all child scopes. Clones share the same scope.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    hooks: Vec<InterruptHook>,
    children: Vec<Cancellation>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A scope that is cancelled with `self` but can also be cancelled on
    /// its own. Born cancelled when `self` already is.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let attached = match self.inner.state.lock() {
            Ok(mut state) if !self.is_cancelled() => {
                state.children.push(child.clone());
                true
            }
            _ => false,
        };
        if !attached {
            child.cancel();
        }
        child
    }

    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let (hooks, children) = match self.inner.state.lock() {
            Ok(mut state) => (
                std::mem::take(&mut state.hooks),
                std::mem::take(&mut state.children),
            ),
            Err(_) => return,
        };
        for hook in hooks {
            hook();
        }
        for child in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> StoreResult<()> {
        if self.is_cancelled() {
            Err(StoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Register a hook that interrupts work running under this scope.
    /// Runs immediately when the scope is already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let hook: InterruptHook = Box::new(hook);
        let pending = match self.inner.state.lock() {
            Ok(mut state) if !self.is_cancelled() => {
                state.hooks.push(hook);
                None
            }
            _ => Some(hook),
        };
        if let Some(hook) = pending {
            hook();
        }
    }
}

impl fmt::Debug for Cancellation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancellation")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cancel_runs_hooks_once() {
        let scope = Cancellation::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        scope.on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        scope.cancel();
        scope.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(scope.check(), Err(StoreError::Cancelled)));
    }

    #[test]
    fn test_parent_cancels_children_but_not_the_reverse() {
        let parent = Cancellation::new();
        let a = parent.child();
        let b = parent.child();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!b.is_cancelled());

        parent.cancel();
        assert!(b.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn test_hook_on_cancelled_scope_runs_immediately() {
        let scope = Cancellation::new();
        scope.cancel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        scope.on_cancel(move || flag.store(true, Ordering::SeqCst));
        assert!(fired.load(Ordering::SeqCst));
    }
}
