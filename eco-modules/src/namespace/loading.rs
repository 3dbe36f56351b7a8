//! Loading the backing files of modules and namespaces

use super::Namespace;
use crate::events::{FailureSite, RuntimeEvent, SubscriptionId, MODULE_READY, NAMESPACE_READY};
use crate::fetch::{self, FetchOutcome, FetchStatus, Resource, ResourceKind, Waiter};
use crate::module::{Factory, ModuleEntry, ModuleStatus};
use crate::runtime::Runtime;
use crate::{FetchError, ModuleError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Runs `on_ready` exactly once, the first time the condition holds
struct ReadyPoll<F> {
    locked: AtomicBool,
    on_ready: Mutex<Option<F>>,
}

impl<F: FnOnce()> ReadyPoll<F> {
    fn new(on_ready: F) -> Self {
        Self {
            locked: AtomicBool::new(false),
            on_ready: Mutex::new(Some(on_ready)),
        }
    }

    fn claim(&self, is_ready: &dyn Fn() -> bool) -> Option<F> {
        if self.locked.load(Ordering::SeqCst) || !is_ready() {
            return None;
        }
        if self.locked.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.on_ready.lock().take()
    }
}

/// Check `is_ready` now and after every `event`; run `on_ready` once it holds.
///
/// Returns the poll's subscription so callers can drop interest early.
fn when_ready<C, F>(runtime: &Runtime, event: &'static str, is_ready: C, on_ready: F) -> SubscriptionId
where
    C: Fn() -> bool + Send + Sync + 'static,
    F: FnOnce() + Send + 'static,
{
    let poll = Arc::new(ReadyPoll::new(on_ready));
    let is_ready = Arc::new(is_ready);
    let events = runtime.events().clone();

    let subscription = {
        let poll = Arc::clone(&poll);
        let is_ready = Arc::clone(&is_ready);
        let bus = events.downgrade();
        events.on_with_id(event, move |_, id| {
            if let Some(on_ready) = poll.claim(&*is_ready) {
                if let Some(bus) = bus.upgrade() {
                    bus.off(event, Some(id));
                }
                on_ready();
            }
        })
    };

    if let Some(on_ready) = poll.claim(&*is_ready) {
        events.off(event, Some(subscription));
        on_ready();
    }
    subscription
}

impl Namespace {
    /// Load the backing files of `ids` and run `on_ready` once every one of
    /// them is READY.
    ///
    /// Each virtual id is fetched at most once per runtime. A URL that
    /// already failed is reported immediately as
    /// [`ModuleError::FetchFailure`]; failures discovered later are
    /// published as [`RuntimeEvent::Failed`].
    pub fn load_modules<S, F>(&self, ids: &[S], on_ready: F) -> Result<()>
    where
        S: AsRef<str>,
        F: FnOnce() + Send + 'static,
    {
        self.watch_modules(ids, on_ready).map(|_| ())
    }

    /// [`load_modules`](Self::load_modules), returning the `module-ready`
    /// subscription that waits for the ids
    pub(crate) fn watch_modules<S, F>(&self, ids: &[S], on_ready: F) -> Result<SubscriptionId>
    where
        S: AsRef<str>,
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime()?;
        let ids: Vec<String> = ids.iter().map(|id| id.as_ref().to_string()).collect();

        for requested in &ids {
            if let ModuleEntry::Unresolved { id, url, owner } = self.search_module_by_id(requested)? {
                let request = ModuleRequest {
                    requester: self.clone(),
                    requested: requested.clone(),
                    owner,
                    id,
                };
                request_module(&runtime, request, url)?;
            }
        }

        let namespace = self.clone();
        let pending = ids.clone();
        let subscription = when_ready(
            &runtime,
            MODULE_READY,
            move || {
                pending.iter().all(|id| {
                    namespace
                        .search_module_by_id(id)
                        .map(|entry| entry.status() > ModuleStatus::Created)
                        .unwrap_or(false)
                })
            },
            on_ready,
        );
        trace!("Waiting for {} module(s) in {}", ids.len(), self.name());
        Ok(subscription)
    }

    /// Load the files registering `names` and run `on_ready` once every
    /// named namespace is registered and ready
    pub fn load_namespaces<S, F>(&self, names: &[S], on_ready: F) -> Result<()>
    where
        S: AsRef<str>,
        F: FnOnce() + Send + 'static,
    {
        self.watch_namespaces(names, on_ready).map(|_| ())
    }

    /// [`load_namespaces`](Self::load_namespaces), returning the
    /// `namespace-ready` subscription that waits for the names
    pub(crate) fn watch_namespaces<S, F>(&self, names: &[S], on_ready: F) -> Result<SubscriptionId>
    where
        S: AsRef<str>,
        F: FnOnce() + Send + 'static,
    {
        let runtime = self.runtime()?;
        let names: Vec<String> = names.iter().map(|name| name.as_ref().to_string()).collect();

        for name in &names {
            match self.url_for_namespace(name) {
                Some(url) if runtime.fetch_status(&url) != FetchStatus::Fetched => {
                    request_namespace(&runtime, self, name.clone(), url)?;
                }
                _ => mark_namespace_ready(&runtime, name)?,
            }
        }

        let weak = runtime.downgrade();
        let pending = names.clone();
        let subscription = when_ready(
            &runtime,
            NAMESPACE_READY,
            move || {
                let Some(runtime) = weak.upgrade() else {
                    return false;
                };
                pending.iter().all(|name| {
                    runtime
                        .namespace(name)
                        .map_or(false, |namespace| namespace.is_ready())
                })
            },
            on_ready,
        );
        Ok(subscription)
    }
}

fn mark_namespace_ready(runtime: &Runtime, name: &str) -> Result<()> {
    let namespace = runtime.require_namespace(name)?;
    namespace.set_ready();
    debug!("Namespace {} is ready", name);
    runtime.emit(RuntimeEvent::NamespaceReady {
        name: name.to_string(),
    });
    Ok(())
}

/// Where a fetch was requested from, for error reporting
#[derive(Clone)]
struct FetchSite {
    namespace: String,
    id: String,
    url: String,
}

impl FetchSite {
    fn failure(&self, source: &Arc<FetchError>) -> ModuleError {
        ModuleError::FetchFailure {
            namespace: self.namespace.clone(),
            id: self.id.clone(),
            url: self.url.clone(),
            source: Arc::clone(source),
        }
    }
}

/// A virtual module being fetched on behalf of `requester`
struct ModuleRequest {
    /// Namespace whose lookup produced the placeholder
    requester: Namespace,
    /// Id as the requester wrote it, possibly dotted
    requested: String,
    /// Namespace whose configuration holds the URL
    owner: Namespace,
    /// Unqualified id within `owner`
    id: String,
}

impl ModuleRequest {
    fn is_registered(&self) -> bool {
        matches!(
            self.requester.search_module_by_id(&self.requested),
            Ok(ModuleEntry::Registered(_))
        )
    }
}

fn request_module(runtime: &Runtime, request: ModuleRequest, url: String) -> Result<()> {
    let site = FetchSite {
        namespace: request.owner.name().to_string(),
        id: request.id.clone(),
        url: url.clone(),
    };
    let resource = Resource::new(url);
    let kind = resource.kind;
    let weak = runtime.downgrade();

    let waiter: Waiter = {
        let site = site.clone();
        Box::new(move |outcome: &FetchOutcome| {
            let Some(runtime) = weak.upgrade() else {
                return;
            };
            let failed = |error| {
                runtime.emit(RuntimeEvent::Failed {
                    site: FailureSite::Url(site.url.clone()),
                    error,
                });
            };
            match outcome {
                Ok(()) if kind == ResourceKind::Stylesheet => {
                    if !request.is_registered() {
                        if let Err(e) = request.owner.define(&request.id, &[], Factory::empty()) {
                            failed(e);
                        }
                    }
                }
                Ok(()) if !request.is_registered() => {
                    failed(ModuleError::ModuleNotFound {
                        id: request.requested.clone(),
                        namespace: request.requester.name().to_string(),
                    });
                }
                Ok(()) => {
                    runtime.emit(RuntimeEvent::LoadDependencies);
                }
                Err(source) => failed(site.failure(source)),
            }
        })
    };

    fetch::request(runtime, resource, waiter).map_err(|source| site.failure(&source))
}

fn request_namespace(runtime: &Runtime, requester: &Namespace, name: String, url: String) -> Result<()> {
    let site = FetchSite {
        namespace: requester.name().to_string(),
        id: name.clone(),
        url: url.clone(),
    };
    let resource = Resource::new(url);
    let weak = runtime.downgrade();

    let waiter: Waiter = {
        let site = site.clone();
        Box::new(move |outcome: &FetchOutcome| {
            let Some(runtime) = weak.upgrade() else {
                return;
            };
            let result = match outcome {
                Ok(()) => mark_namespace_ready(&runtime, &name),
                Err(source) => Err(site.failure(source)),
            };
            if let Err(error) = result {
                runtime.emit(RuntimeEvent::Failed {
                    site: FailureSite::Url(site.url.clone()),
                    error,
                });
            }
        })
    };

    fetch::request(runtime, resource, waiter).map_err(|source| site.failure(&source))
}
