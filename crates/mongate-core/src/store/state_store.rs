// ── Generic reactive state store ──
//
// Immutable state behind an `ArcSwap`, replaced wholesale on every
// dispatch by a pure root reducer. Subscribers live in a copy-on-write
// list so a dispatch always notifies the exact set that was subscribed
// when notification began.

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Notification callback: `(new_state, old_state)`.
///
/// Identity is the `Arc` allocation: subscribing the same `Arc` twice is a
/// no-op, and unsubscribing requires the `Arc` that was subscribed.
pub type Subscriber<S> = Arc<dyn Fn(&Arc<S>, &Arc<S>) + Send + Sync>;

/// Root reducer: derives the next state from the current one and an action.
pub type Reducer<S, A> = Box<dyn Fn(&Arc<S>, &A) -> Arc<S> + Send + Sync>;

/// A minimal reactive store.
///
/// All writes go through [`dispatch`](Self::dispatch). Reads hand out
/// `Arc<S>` snapshots that can never be mutated in place.
pub struct Store<S, A> {
    state: ArcSwap<S>,
    reducer: Reducer<S, A>,
    subscribers: ArcSwap<Vec<Subscriber<S>>>,
}

impl<S, A> Store<S, A> {
    pub fn new(initial: S, reducer: Reducer<S, A>) -> Self {
        Self {
            state: ArcSwap::from_pointee(initial),
            reducer,
            subscribers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Current state.
    pub fn state(&self) -> Arc<S> {
        self.state.load_full()
    }

    /// Apply `action` and notify every subscriber with `(new, old)`.
    ///
    /// The subscriber list is captured before the first callback runs:
    /// handlers added during notification are not called for this action,
    /// handlers removed during notification still are. No lock is held
    /// while callbacks run, so a handler may dispatch again.
    pub fn dispatch(&self, action: &A) {
        let mut next = None;
        let previous = self.state.rcu(|current| {
            let reduced = (self.reducer)(current, action);
            next = Some(Arc::clone(&reduced));
            reduced
        });
        let Some(next) = next else {
            return;
        };

        let handlers = self.subscribers.load_full();
        for handler in handlers.iter() {
            handler(&next, &previous);
        }
    }

    /// Add `handler` unless it is already subscribed. Returns `true` if added.
    pub fn subscribe(&self, handler: &Subscriber<S>) -> bool {
        let mut added = false;
        self.subscribers.rcu(|current| {
            added = !current.iter().any(|h| Arc::ptr_eq(h, handler));
            let mut list = Vec::clone(current);
            if added {
                list.push(Arc::clone(handler));
            }
            list
        });
        added
    }

    /// Remove `handler` if present. Returns `true` if it was subscribed.
    pub fn unsubscribe(&self, handler: &Subscriber<S>) -> bool {
        let mut removed = false;
        self.subscribers.rcu(|current| {
            let mut list = Vec::clone(current);
            let before = list.len();
            list.retain(|h| !Arc::ptr_eq(h, handler));
            removed = list.len() != before;
            list
        });
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }
}
