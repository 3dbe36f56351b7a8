//! Consuming modules: synchronous same-scope use and asynchronous
//! cross-scope use

use super::{split_qualified, Namespace};
use crate::events::{
    FailureSite, RuntimeEvent, Subscription, MODULE_READY, NAMESPACE_READY, RESOLUTION_FAILED,
};
use crate::module::{Exports, ModuleEntry};
use crate::{ModuleError, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::debug;

/// Once-only completion shared by every callback of one `use`
struct Completion<T> {
    sender: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Completion<T> {
    fn new(sender: oneshot::Sender<T>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver `value` unless something was delivered already
    fn complete(&self, value: T) -> bool {
        let sender = self.sender.lock().take();
        match sender {
            Some(sender) => sender.send(value).is_ok(),
            None => false,
        }
    }
}

type UseCompletion = Arc<Completion<Result<Vec<Exports>>>>;

/// Ready polls registered on behalf of one `use`; dropped with it
type UseWatches = Mutex<Vec<Subscription<RuntimeEvent>>>;

impl Namespace {
    /// Execute already-loaded modules of this scope and bind their exports.
    ///
    /// Namespace-qualified ids are rejected with
    /// [`ModuleError::CrossScopeViolation`] before anything runs.
    pub fn use_sync<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<Exports>> {
        let runtime = self.runtime()?;
        runtime.emit(RuntimeEvent::LoadDependencies);

        if let Some(id) = ids.iter().map(AsRef::as_ref).find(|id| id.contains('.')) {
            return Err(ModuleError::CrossScopeViolation { id: id.to_string() });
        }

        let mut exports = Vec::with_capacity(ids.len());
        for id in ids {
            let id = id.as_ref();
            let module = self.search_module_by_id(id)?.into_module()?;
            module.set_dependencies()?;
            let value = module.exec()?;
            self.inner.bindings.write().insert(id.to_string(), value.clone());
            exports.push(value);
        }
        Ok(exports)
    }

    /// Load `namespace_names` and `dependency_ids`, then execute the
    /// requested modules and return their exports in order.
    ///
    /// The namespace of every dotted id and this namespace itself are
    /// loaded as well. A failure published while the call is pending aborts
    /// it when it concerns one of the requested namespaces or the
    /// dependency graph of a requested id. Dropping the future removes
    /// every subscription it made.
    pub async fn use_modules<N, S>(&self, namespace_names: &[N], dependency_ids: &[S]) -> Result<Vec<Exports>>
    where
        N: AsRef<str>,
        S: AsRef<str>,
    {
        let runtime = self.runtime()?;
        let ids: Vec<String> = dependency_ids.iter().map(|id| id.as_ref().to_string()).collect();
        let names = self.required_namespaces(namespace_names, &ids);
        debug!("{} uses {:?} from namespaces {:?}", self.name(), ids, names);

        let (sender, receiver) = oneshot::channel();
        let completion: UseCompletion = Arc::new(Completion::new(sender));
        let watches: Arc<UseWatches> = Arc::new(Mutex::new(Vec::new()));

        let _failure = {
            let completion = Arc::clone(&completion);
            let namespace = self.clone();
            let names = names.clone();
            let ids = ids.clone();
            runtime.events().scoped(RESOLUTION_FAILED, move |event| {
                if let RuntimeEvent::Failed { site, error } = event {
                    if namespace.depends_on(&names, &ids, site) {
                        completion.complete(Err(error.clone()));
                    }
                }
            })
        };

        let namespace = self.clone();
        let on_namespaces = {
            let completion = Arc::clone(&completion);
            let watches = Arc::downgrade(&watches);
            move || {
                if let Err(e) = namespace.load_and_execute(ids, Arc::clone(&completion), watches) {
                    completion.complete(Err(e));
                }
            }
        };
        match self.watch_namespaces(&names, on_namespaces) {
            Ok(subscription) => {
                let guard = runtime.events().guard(NAMESPACE_READY, subscription);
                watches.lock().push(guard);
            }
            Err(e) => {
                completion.complete(Err(e));
            }
        }

        receiver.await.unwrap_or(Err(ModuleError::RuntimeDropped))
    }

    /// [`use_modules`](Self::use_modules), then hand the exports to `factory`
    pub async fn use_with<N, S, F, R>(
        &self,
        namespace_names: &[N],
        dependency_ids: &[S],
        factory: F,
    ) -> Result<R>
    where
        N: AsRef<str>,
        S: AsRef<str>,
        F: FnOnce(&[Exports]) -> R,
    {
        let exports = self.use_modules(namespace_names, dependency_ids).await?;
        Ok(factory(&exports))
    }

    fn load_and_execute(
        &self,
        ids: Vec<String>,
        completion: UseCompletion,
        watches: Weak<UseWatches>,
    ) -> Result<()> {
        let runtime = self.runtime()?;
        runtime.emit(RuntimeEvent::LoadDependencies);
        let namespace = self.clone();
        let requested = ids.clone();
        let subscription = self.watch_modules(&ids, move || {
            completion.complete(namespace.execute_all(&requested));
        })?;
        let guard = runtime.events().guard(MODULE_READY, subscription);
        if let Some(watches) = watches.upgrade() {
            watches.lock().push(guard);
        }
        Ok(())
    }

    /// Whether a failure at `site` concerns a `use` of `names` and `ids`
    fn depends_on(&self, names: &[String], ids: &[String], site: &FailureSite) -> bool {
        if let FailureSite::Url(url) = site {
            let namespace_url = |name: &String| self.url_for_namespace(name);
            if names.iter().filter_map(namespace_url).any(|candidate| candidate == *url) {
                return true;
            }
        }

        let mut visited = FxHashSet::default();
        let mut pending: Vec<(Namespace, String)> =
            ids.iter().map(|id| (self.clone(), id.clone())).collect();
        while let Some((namespace, id)) = pending.pop() {
            match namespace.search_module_by_id(&id) {
                Ok(ModuleEntry::Unresolved { url, .. }) => {
                    if matches!(site, FailureSite::Url(failed) if *failed == url) {
                        return true;
                    }
                }
                Ok(ModuleEntry::Registered(module)) => {
                    let Some(owner) = module.owner() else {
                        continue;
                    };
                    if let FailureSite::Module {
                        namespace: failed_namespace,
                        id: failed_id,
                    } = site
                    {
                        if failed_namespace == owner.name() && failed_id == module.id() {
                            return true;
                        }
                    }
                    if !visited.insert(format!("{}.{}", owner.name(), module.id())) {
                        continue;
                    }
                    for dependency in module.dependency_ids() {
                        pending.push((owner.clone(), dependency.clone()));
                    }
                }
                Err(_) => {}
            }
        }
        false
    }

    fn execute_all(&self, ids: &[String]) -> Result<Vec<Exports>> {
        ids.iter()
            .map(|id| {
                let module = self.search_module_by_id(id)?.into_module()?;
                module.set_dependencies()?;
                module.exec()
            })
            .collect()
    }

    /// Explicit names, the namespace of every dotted id, then this one
    fn required_namespaces<N: AsRef<str>>(&self, explicit: &[N], ids: &[String]) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let candidates = explicit
            .iter()
            .map(|name| name.as_ref())
            .chain(ids.iter().filter_map(|id| split_qualified(id).map(|(ns, _)| ns)))
            .chain(std::iter::once(self.name()));
        for name in candidates {
            if !names.iter().any(|known| known == name) {
                names.push(name.to_string());
            }
        }
        names
    }
}
