//! Listener registry: event name → callbacks, plus connection-state observers.
//!
//! Shared between the application (which subscribes) and the driver task
//! (which dispatches), so the maps sit behind a mutex. Callbacks are cloned
//! out of the lock before they run; a callback may subscribe or unsubscribe
//! from inside its own invocation.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::{error, warn};

use crate::codec::Envelope;
use crate::state::ConnectionState;

/// Reserved event name whose listeners receive every envelope.
pub const WILDCARD: &str = "*";

type DataCallback = Arc<dyn Fn(&Value) + Send + Sync>;
type EnvelopeCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;
type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Clone)]
enum Listener {
    /// Named events get `data`; under the wildcard key, the envelope as JSON.
    Data(DataCallback),
    /// Typed wildcard listener.
    Envelope(EnvelopeCallback),
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    events: HashMap<String, BTreeMap<u64, Listener>>,
    state_observers: BTreeMap<u64, StateCallback>,
    /// Set by `close()`; new subscriptions are refused.
    closed: bool,
}

impl Inner {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Clone, Default)]
pub struct ListenerRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to one event. Named events receive `data`; the wildcard
    /// receives the whole envelope serialized as a JSON value.
    pub fn on<F>(&self, event: &str, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.insert(event, Listener::Data(Arc::new(callback)))
    }

    /// Subscribe to every envelope with a typed callback.
    pub fn on_any<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.insert(WILDCARD, Listener::Envelope(Arc::new(callback)))
    }

    fn insert(&self, event: &str, listener: Listener) -> Subscription {
        let mut inner = self.lock();
        if inner.closed {
            warn!(event, "subscription refused: channel destroyed");
            return Subscription::inert();
        }
        let id = inner.allocate_id();
        inner
            .events
            .entry(event.to_string())
            .or_default()
            .insert(id, listener);
        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: Key::Event(event.to_string()),
            id,
        }
    }

    /// Observe connection-state transitions.
    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        if inner.closed {
            warn!("state observer refused: channel destroyed");
            return Subscription::inert();
        }
        let id = inner.allocate_id();
        inner.state_observers.insert(id, Arc::new(callback));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            key: Key::State,
            id,
        }
    }

    /// Remove every listener for `event`, or for all events when `None`.
    /// State observers are untouched.
    pub fn off(&self, event: Option<&str>) {
        let mut inner = self.lock();
        match event {
            Some(event) => {
                inner.events.remove(event);
            }
            None => inner.events.clear(),
        }
    }

    /// Deliver an envelope: named listeners first, then wildcard listeners.
    pub fn dispatch(&self, envelope: &Envelope) {
        let (named, wildcard) = {
            let inner = self.lock();
            let named: Vec<Listener> = if envelope.event == WILDCARD {
                Vec::new()
            } else {
                inner
                    .events
                    .get(&envelope.event)
                    .map(|set| set.values().cloned().collect())
                    .unwrap_or_default()
            };
            let wildcard: Vec<Listener> = inner
                .events
                .get(WILDCARD)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default();
            (named, wildcard)
        };

        for listener in &named {
            match listener {
                Listener::Data(cb) => guarded(&envelope.event, || cb(&envelope.data)),
                Listener::Envelope(cb) => guarded(&envelope.event, || cb(envelope)),
            }
        }

        if wildcard.is_empty() {
            return;
        }
        let mut as_value: Option<Value> = None;
        for listener in &wildcard {
            match listener {
                Listener::Data(cb) => {
                    let value = as_value.get_or_insert_with(|| {
                        serde_json::to_value(envelope).unwrap_or(Value::Null)
                    });
                    guarded(WILDCARD, || cb(value));
                }
                Listener::Envelope(cb) => guarded(WILDCARD, || cb(envelope)),
            }
        }
    }

    /// Tell every state observer about a transition.
    pub fn notify_state(&self, state: ConnectionState) {
        let observers: Vec<StateCallback> = self.lock().state_observers.values().cloned().collect();
        for observer in observers {
            guarded("state", || observer(state));
        }
    }

    /// Drop every listener and observer and refuse new ones.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.events.clear();
        inner.state_observers.clear();
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.lock().events.get(event).map_or(0, BTreeMap::len)
    }

    /// Number of event names with at least one listener.
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    pub fn state_observer_count(&self) -> usize {
        self.lock().state_observers.len()
    }
}

fn guarded(event: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        error!(
            event,
            panic = %panic_message(payload.as_ref()),
            "listener panicked; continuing dispatch"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

enum Key {
    Event(String),
    State,
    Inert,
}

/// Handle returned by every subscribe call. Dropping it keeps the
/// subscription alive; call [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    registry: Weak<Mutex<Inner>>,
    key: Key,
    id: u64,
}

impl Subscription {
    fn inert() -> Self {
        Self {
            registry: Weak::new(),
            key: Key::Inert,
            id: 0,
        }
    }

    /// Remove exactly this callback. Returns false if it was already gone
    /// (removed by `off`, by registry teardown, or never registered).
    pub fn unsubscribe(self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return false;
        };
        let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
        match &self.key {
            Key::Event(event) => {
                let Some(set) = inner.events.get_mut(event) else {
                    return false;
                };
                let removed = set.remove(&self.id).is_some();
                if set.is_empty() {
                    inner.events.remove(event);
                }
                removed
            }
            Key::State => inner.state_observers.remove(&self.id).is_some(),
            Key::Inert => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let key = match &self.key {
            Key::Event(event) => event.as_str(),
            Key::State => "<state>",
            Key::Inert => "<inert>",
        };
        f.debug_struct("Subscription")
            .field("key", &key)
            .field("id", &self.id)
            .finish()
    }
}
