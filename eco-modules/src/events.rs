//! Publish/subscribe primitive shared by the resolver
//!
//! Handlers are kept per event name and invoked from a snapshot of the
//! subscriber list, so a handler may subscribe, unsubscribe or emit while a
//! dispatch is in flight without affecting that dispatch. No lock is held
//! while a handler runs.

use crate::error::ModuleError;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::trace;

/// Event name published when loaded files may have unresolved dependencies
pub const LOAD_DEPENDENCIES: &str = "load-dependencies";
/// Event name published when a module reaches READY
pub const MODULE_READY: &str = "module-ready";
/// Event name published when a namespace finished loading
pub const NAMESPACE_READY: &str = "namespace-ready";
/// Event name published when a resolution step failed asynchronously
pub const RESOLUTION_FAILED: &str = "resolution-failed";

/// Identifies one subscription so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<D> = Arc<dyn Fn(&D, SubscriptionId) + Send + Sync>;

struct BusInner<D> {
    next_id: u64,
    events: FxHashMap<String, Vec<(SubscriptionId, Handler<D>)>>,
}

/// Name-keyed event bus
pub struct EventBus<D> {
    inner: Arc<Mutex<BusInner<D>>>,
}

/// Subscription that is removed from its bus when dropped
pub struct Subscription<D: 'static> {
    bus: WeakEventBus<D>,
    name: String,
    id: SubscriptionId,
}

impl<D: 'static> Subscription<D> {
    /// Id of the guarded subscription
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl<D: 'static> Drop for Subscription<D> {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.off(&self.name, Some(self.id));
        }
    }
}

/// Non-owning handle to an [`EventBus`]
pub struct WeakEventBus<D> {
    inner: Weak<Mutex<BusInner<D>>>,
}

impl<D> Clone for EventBus<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> Clone for WeakEventBus<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<D> WeakEventBus<D> {
    /// Upgrade to a usable bus if it is still alive
    pub fn upgrade(&self) -> Option<EventBus<D>> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl<D: 'static> EventBus<D> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_id: 0,
                events: FxHashMap::default(),
            })),
        }
    }

    /// Subscribe `handler` to `name`
    pub fn on<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        self.on_with_id(name, move |data, _| handler(data))
    }

    /// Subscribe a handler that receives its own subscription id, so it
    /// can remove itself from inside a dispatch.
    pub fn on_with_id<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&D, SubscriptionId) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner
            .events
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        trace!("Subscribed {:?} to {}", id, name);
        id
    }

    /// Wrap an existing subscription in a guard that removes it on drop
    pub fn guard(&self, name: &str, id: SubscriptionId) -> Subscription<D> {
        Subscription {
            bus: self.downgrade(),
            name: name.to_string(),
            id,
        }
    }

    /// [`on`](Self::on), removed again when the returned guard is dropped
    pub fn scoped<F>(&self, name: &str, handler: F) -> Subscription<D>
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        let id = self.on(name, handler);
        self.guard(name, id)
    }

    /// Subscribe a handler that runs at most once, then removes itself
    pub fn one<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&D) + Send + Sync + 'static,
    {
        let bus = self.downgrade();
        let event = name.to_string();
        let fired = AtomicBool::new(false);
        self.on_with_id(name, move |data, id| {
            // Reentrant emits can hand the same snapshot entry out twice.
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(bus) = bus.upgrade() {
                bus.off(&event, Some(id));
            }
            handler(data);
        })
    }

    /// Remove one subscription, or every handler of `name` when `id` is `None`
    pub fn off(&self, name: &str, id: Option<SubscriptionId>) {
        let mut inner = self.inner.lock();
        match id {
            Some(id) => {
                if let Some(list) = inner.events.get_mut(name) {
                    list.retain(|(existing, _)| *existing != id);
                    if list.is_empty() {
                        inner.events.remove(name);
                    }
                }
            }
            None => {
                inner.events.remove(name);
            }
        }
    }

    /// Drop every subscription on every event
    pub fn clear(&self) {
        self.inner.lock().events.clear();
    }

    /// Deliver `data` to a snapshot of the handlers of `name`.
    /// Returns the number of handlers invoked.
    pub fn emit(&self, name: &str, data: &D) -> usize {
        let snapshot: Vec<(SubscriptionId, Handler<D>)> = match self.inner.lock().events.get(name) {
            Some(list) => list.clone(),
            None => return 0,
        };
        trace!("Emitting {} to {} handler(s)", name, snapshot.len());
        for (id, handler) in &snapshot {
            handler(data, *id);
        }
        snapshot.len()
    }

    /// Number of handlers currently subscribed to `name`
    pub fn listener_count(&self, name: &str) -> usize {
        self.inner.lock().events.get(name).map_or(0, Vec::len)
    }

    /// Create a non-owning handle
    pub fn downgrade(&self) -> WeakEventBus<D> {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<D: 'static> Default for EventBus<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Signals exchanged on the runtime bus
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Modules waiting on dependencies should start loading them
    LoadDependencies,
    /// A module reached READY
    ModuleReady {
        /// Owning namespace
        namespace: String,
        /// Module id
        id: String,
    },
    /// A namespace finished loading
    NamespaceReady {
        /// Namespace name
        name: String,
    },
    /// An asynchronous resolution step failed
    Failed {
        /// What failed, so only dependent `use` calls react
        site: FailureSite,
        /// The failure itself
        error: ModuleError,
    },
}

/// The unit an asynchronous failure belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSite {
    /// Backing file of a module or namespace
    Url(String),
    /// A registered module whose dependencies could not be loaded
    Module {
        /// Owning namespace
        namespace: String,
        /// Module id
        id: String,
    },
}

impl RuntimeEvent {
    /// Event name this signal is published under
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::LoadDependencies => LOAD_DEPENDENCIES,
            RuntimeEvent::ModuleReady { .. } => MODULE_READY,
            RuntimeEvent::NamespaceReady { .. } => NAMESPACE_READY,
            RuntimeEvent::Failed { .. } => RESOLUTION_FAILED,
        }
    }
}
