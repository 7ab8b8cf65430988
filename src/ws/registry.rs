#![expect(
    clippy::module_name_repetitions,
    reason = "Registry types expose their domain in the name for clarity"
)]

//! Listener bookkeeping for the realtime client.
//!
//! Two independent registries live here:
//!
//! - [`ListenerRegistry`]: a multimap from event name to registration-ordered
//!   message callbacks, addressed by opaque [`ListenerId`] handles
//! - [`LifecycleHooks`]: zero-argument callbacks fired on connection
//!   transitions, independent of message content
//!
//! Both survive reconnection; only an explicit client teardown clears them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

/// Opaque handle identifying a registered message listener.
///
/// Returned from `on` and required by `off`; removal is by handle identity,
/// so the same closure may be registered more than once and removed
/// individually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Callback invoked with the payload of a dispatched message.
pub type MessageCallback = Arc<dyn Fn(Value) + Send + Sync + 'static>;

#[derive(Clone)]
pub(crate) struct ListenerEntry {
    pub(crate) id: ListenerId,
    pub(crate) callback: MessageCallback,
}

/// Multimap from event name to an ordered set of message callbacks.
///
/// Keys are created lazily on first subscription and may remain (with an
/// empty set) after the last removal; the entries, not the keys, are the
/// ownership unit.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: DashMap<String, Vec<ListenerEntry>>,
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for messages of type `event`.
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let id = ListenerId::new();
        self.listeners
            .entry(event.to_owned())
            .or_default()
            .push(ListenerEntry {
                id,
                callback: Arc::new(callback),
            });
        id
    }

    /// Remove the listener registered under `id` for `event`.
    ///
    /// Removing an unknown handle, or from an event with no listeners, is a
    /// silent no-op and never affects other listeners.
    pub fn off(&self, event: &str, id: ListenerId) {
        if let Some(mut entries) = self.listeners.get_mut(event) {
            entries.retain(|entry| entry.id != id);
        }
    }

    /// Clone out the current listeners for `event`, in registration order.
    ///
    /// Dispatch operates on this snapshot so callbacks are invoked without
    /// any registry lock held and may re-enter `on`/`off` freely.
    pub(crate) fn snapshot(&self, event: &str) -> Vec<ListenerEntry> {
        self.listeners
            .get(event)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    /// Number of listeners currently registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, |entries| entries.len())
    }

    /// Drop every registered listener.
    pub fn clear(&self) {
        self.listeners.clear();
    }
}

type Hook = Arc<dyn Fn() + Send + Sync + 'static>;

/// Callback sets for connection lifecycle transitions.
///
/// Hooks have no unregistration handle; they live until the owning client is
/// torn down.
#[derive(Default)]
pub struct LifecycleHooks {
    connected: RwLock<Vec<Hook>>,
    disconnected: RwLock<Vec<Hook>>,
    exhausted: RwLock<Vec<Hook>>,
}

impl LifecycleHooks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(&self.connected, hook);
    }

    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(&self.disconnected, hook);
    }

    /// Register a hook fired once when the reconnection budget is exhausted.
    pub fn on_reconnect_exhausted<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(&self.exhausted, hook);
    }

    pub(crate) fn fire_connected(&self) {
        Self::fire(&self.connected, "connected");
    }

    pub(crate) fn fire_disconnected(&self) {
        Self::fire(&self.disconnected, "disconnected");
    }

    pub(crate) fn fire_reconnect_exhausted(&self) {
        Self::fire(&self.exhausted, "reconnect_exhausted");
    }

    /// Drop every registered hook.
    pub fn clear(&self) {
        Self::write(&self.connected).clear();
        Self::write(&self.disconnected).clear();
        Self::write(&self.exhausted).clear();
    }

    fn push<F>(&self, set: &RwLock<Vec<Hook>>, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::write(set).push(Arc::new(hook));
    }

    fn write(set: &RwLock<Vec<Hook>>) -> std::sync::RwLockWriteGuard<'_, Vec<Hook>> {
        // A Vec of Arcs has no inconsistent intermediate state to recover from
        set.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(set: &RwLock<Vec<Hook>>, transition: &str) {
        let hooks = set
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for hook in hooks {
            invoke_isolated(transition, || hook());
        }
    }
}

/// Run a callback, containing any panic it raises.
///
/// A panicking callback is logged and must never disturb sibling callbacks
/// or the caller's control flow.
pub(crate) fn invoke_isolated<F: FnOnce()>(context: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        #[cfg(feature = "tracing")]
        tracing::error!(context, "listener panicked; continuing with remaining listeners");
        #[cfg(not(feature = "tracing"))]
        let _ = context;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn listeners_invoked_in_registration_order() {
        let registry = ListenerRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            registry.on("digit_update", move |_| {
                order.lock().expect("lock poisoned").push(tag);
            });
        }

        for entry in registry.snapshot("digit_update") {
            (entry.callback)(json!({}));
        }

        assert_eq!(
            *order.lock().expect("lock poisoned"),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn off_removes_only_the_addressed_listener() {
        let registry = ListenerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_a = Arc::clone(&hits);
        let _keep = registry.on("chat_message", move |_| {
            hits_a.fetch_add(1, Ordering::SeqCst);
        });
        let remove = registry.on("chat_message", |_| panic!("removed listener must not run"));

        registry.off("chat_message", remove);

        for entry in registry.snapshot("chat_message") {
            (entry.callback)(json!({}));
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.listener_count("chat_message"), 1);
    }

    #[test]
    fn off_unknown_event_or_handle_is_noop() {
        let registry = ListenerRegistry::new();
        let id = registry.on("presence", |_| {});

        // Wrong event, then an already-removed handle
        registry.off("never_registered", id);
        registry.off("presence", id);
        registry.off("presence", id);

        assert_eq!(registry.listener_count("presence"), 0);
    }

    #[test]
    fn event_key_persists_after_last_removal() {
        let registry = ListenerRegistry::new();
        let id = registry.on("typing", |_| {});
        registry.off("typing", id);

        // The key survives with an empty set; snapshot is simply empty
        assert!(registry.snapshot("typing").is_empty());
        assert_eq!(registry.listener_count("typing"), 0);
    }

    #[test]
    fn hooks_fire_in_registration_order_and_are_isolated() {
        let hooks = LifecycleHooks::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = Arc::clone(&order);
        hooks.on_connect(move || order_a.lock().expect("lock poisoned").push("a"));
        hooks.on_connect(|| panic!("hook panic must not escape"));
        let order_b = Arc::clone(&order);
        hooks.on_connect(move || order_b.lock().expect("lock poisoned").push("b"));

        hooks.fire_connected();

        assert_eq!(*order.lock().expect("lock poisoned"), vec!["a", "b"]);
    }

    #[test]
    fn clear_drops_all_hook_sets() {
        let hooks = LifecycleHooks::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let hits = Arc::clone(&hits);
            hooks.on_disconnect(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.clear();
        hooks.fire_disconnected();
        hooks.fire_connected();
        hooks.fire_reconnect_exhausted();

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
