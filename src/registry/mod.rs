//! In-process listener registry.
//!
//! Listeners are registered under an `EventName` pattern (wildcards allowed)
//! and invoked by `emit` for every concrete name their pattern matches.
//! Bounded listeners (`many`) are removed from the registry at the moment
//! their last permitted invocation is selected, so no emit can reach them
//! afterwards regardless of how many emits race.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{join_all, BoxFuture};
use serde_json::Value;

use crate::error::BoxError;
use crate::event::EventName;

/// Outcome of one listener invocation.
pub type ListenerResult = std::result::Result<Value, BoxError>;

/// An event listener.
///
/// Receives the concrete event name and the body. The returned value is the
/// reply for `ONE` requests; `Value::Null` when there is nothing to say.
pub trait Listener: Send + Sync {
    fn call(&self, event: String, body: Value) -> BoxFuture<'static, ListenerResult>;
}

impl<F, Fut> Listener for F
where
    F: Fn(String, Value) -> Fut + Send + Sync,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    fn call(&self, event: String, body: Value) -> BoxFuture<'static, ListenerResult> {
        Box::pin(self(event, body))
    }
}

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Entry {
    id: ListenerId,
    pattern: EventName,
    listener: Arc<dyn Listener>,
    remaining: Option<usize>,
}

/// Result of dispatching one event.
pub struct EmitOutcome {
    /// Listener results, in registration order.
    pub results: Vec<ListenerResult>,
    /// Patterns whose bounded listener was used up by this emit.
    pub exhausted: Vec<EventName>,
}

impl EmitOutcome {
    /// Number of listeners that were invoked.
    pub fn invoked(&self) -> usize {
        self.results.len()
    }
}

/// Wildcard-capable listener registry.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        // Entries stay consistent even if a holder panicked; no listener
        // code runs under this lock.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(
        &self,
        pattern: EventName,
        listener: Arc<dyn Listener>,
        remaining: Option<usize>,
    ) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries().push(Entry {
            id,
            pattern,
            listener,
            remaining,
        });
        id
    }

    /// Register a listener for every event matching `pattern`.
    pub fn on(&self, pattern: EventName, listener: Arc<dyn Listener>) -> ListenerId {
        self.register(pattern, listener, None)
    }

    /// Register a listener that is removed after `times` invocations.
    ///
    /// `times == 0` registers nothing useful; the listener is never invoked.
    pub fn many(&self, pattern: EventName, times: usize, listener: Arc<dyn Listener>) -> ListenerId {
        self.register(pattern, listener, Some(times))
    }

    pub fn once(&self, pattern: EventName, listener: Arc<dyn Listener>) -> ListenerId {
        self.many(pattern, 1, listener)
    }

    /// Remove a listener. Returns false if it was not registered under `pattern`.
    pub fn off(&self, pattern: &EventName, id: ListenerId) -> bool {
        let mut entries = self.entries();
        match entries
            .iter()
            .position(|e| e.id == id && &e.pattern == pattern)
        {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of listeners registered under exactly `pattern`.
    pub fn listener_count(&self, pattern: &EventName) -> usize {
        self.entries()
            .iter()
            .filter(|e| &e.pattern == pattern && e.remaining != Some(0))
            .count()
    }

    /// True if any registered pattern matches `name`.
    pub fn has_listeners(&self, name: &EventName) -> bool {
        self.entries().iter().any(|e| e.pattern.matches(name))
    }

    /// Invoke every listener matching `name` concurrently and collect results.
    pub async fn emit(&self, name: &EventName, event: &str, body: &Value) -> EmitOutcome {
        let selection = self.select(|pattern| pattern.matches(name));
        Self::invoke(selection, event, body).await
    }

    /// Invoke only the listeners registered under exactly `pattern`.
    ///
    /// Used for broker deliveries, which arrive once per bound pattern.
    pub async fn emit_exact(&self, pattern: &EventName, event: &str, body: &Value) -> EmitOutcome {
        let selection = self.select(|registered| registered == pattern);
        Self::invoke(selection, event, body).await
    }

    async fn invoke(
        (selected, exhausted): (Vec<Arc<dyn Listener>>, Vec<EventName>),
        event: &str,
        body: &Value,
    ) -> EmitOutcome {
        let calls = selected
            .iter()
            .map(|listener| listener.call(event.to_string(), body.clone()));
        let results = join_all(calls).await;
        EmitOutcome { results, exhausted }
    }

    /// Pick listeners whose pattern passes `wanted`, consuming one use from
    /// bounded ones.
    fn select(
        &self,
        wanted: impl Fn(&EventName) -> bool,
    ) -> (Vec<Arc<dyn Listener>>, Vec<EventName>) {
        let mut entries = self.entries();
        let mut selected = Vec::new();
        let mut exhausted = Vec::new();

        entries.retain_mut(|entry| {
            if !wanted(&entry.pattern) {
                return true;
            }
            match entry.remaining.as_mut() {
                None => {
                    selected.push(Arc::clone(&entry.listener));
                    true
                }
                Some(0) => false,
                Some(left) => {
                    selected.push(Arc::clone(&entry.listener));
                    *left -= 1;
                    if *left == 0 {
                        exhausted.push(entry.pattern.clone());
                        false
                    } else {
                        true
                    }
                }
            }
        });

        (selected, exhausted)
    }
}
