//! The namespace registry and shared resolution state

use crate::events::{EventBus, RuntimeEvent};
use crate::fetch::{FetchStatus, FetchTable, Fetcher};
use crate::namespace::Namespace;
use crate::{ModuleError, Result, RuntimeConfig};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

pub(crate) struct RuntimeInner {
    config: RuntimeConfig,
    namespaces: RwLock<FxHashMap<String, Namespace>>,
    events: EventBus<RuntimeEvent>,
    fetches: FetchTable,
    fetcher: Arc<dyn Fetcher>,
    root: Namespace,
}

/// Registry of every namespace plus the event bus and fetch table they share.
///
/// Cloning is cheap; all clones refer to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// Non-owning runtime handle held by namespaces and spawned waiters
#[derive(Clone)]
pub(crate) struct WeakRuntime(Weak<RuntimeInner>);

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.0.upgrade().map(|inner| Runtime { inner })
    }
}

impl Runtime {
    /// Create a runtime with the default configuration
    pub fn new<F: Fetcher + 'static>(fetcher: F) -> Self {
        Self::with_config(RuntimeConfig::default(), Arc::new(fetcher))
    }

    /// Create a runtime with an explicit configuration
    pub fn with_config(config: RuntimeConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RuntimeInner>| {
            let root = Namespace::new(&config.root_namespace, None, WeakRuntime(weak.clone()));
            let mut namespaces = FxHashMap::default();
            namespaces.insert(config.root_namespace.clone(), root.clone());
            RuntimeInner {
                config,
                namespaces: RwLock::new(namespaces),
                events: EventBus::new(),
                fetches: FetchTable::default(),
                fetcher,
                root,
            }
        });
        info!("Created module runtime with root namespace {}", inner.config.root_namespace);
        Self { inner }
    }

    /// The root namespace
    pub fn root(&self) -> Namespace {
        self.inner.root.clone()
    }

    /// A registered namespace
    pub fn namespace(&self, name: &str) -> Option<Namespace> {
        self.inner.namespaces.read().get(name).cloned()
    }

    /// A registered namespace, or [`ModuleError::NamespaceNotFound`]
    pub fn require_namespace(&self, name: &str) -> Result<Namespace> {
        self.namespace(name)
            .ok_or_else(|| ModuleError::NamespaceNotFound {
                name: name.to_string(),
            })
    }

    /// Names of every registered namespace, sorted
    pub fn namespace_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Get `name`, creating it under `parent` if it does not exist yet
    pub(crate) fn create_namespace(&self, name: &str, parent: &Namespace) -> Namespace {
        let created = {
            let mut namespaces = self.inner.namespaces.write();
            if let Some(existing) = namespaces.get(name) {
                return existing.clone();
            }
            let namespace = Namespace::new(name, Some(parent), self.downgrade());
            namespaces.insert(name.to_string(), namespace.clone());
            namespace
        };
        parent.add_child(created.clone());
        debug!("Created namespace {} under {}", name, parent.name());
        created
    }

    /// The shared event bus
    pub fn events(&self) -> &EventBus<RuntimeEvent> {
        &self.inner.events
    }

    /// Publish `event` under its own name
    pub fn emit(&self, event: RuntimeEvent) -> usize {
        self.inner.events.emit(event.name(), &event)
    }

    /// Fetch status of `url`
    pub fn fetch_status(&self, url: &str) -> FetchStatus {
        self.inner.fetches.status(url)
    }

    pub(crate) fn fetches(&self) -> &FetchTable {
        &self.inner.fetches
    }

    /// The fetcher backing this runtime
    pub fn fetcher(&self) -> Arc<dyn Fetcher> {
        Arc::clone(&self.inner.fetcher)
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.inner.config.root_namespace)
            .field("namespaces", &self.namespace_names())
            .finish()
    }
}
