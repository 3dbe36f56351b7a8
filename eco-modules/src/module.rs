//! Modules and their lifecycle
//!
//! A [`Module`] is created by `define` in the CREATED state, becomes READY
//! once its backing files are loaded, and executes its factory at most once.

use crate::namespace::{Namespace, WeakNamespace};
use crate::{ModuleError, Result};
use parking_lot::{const_mutex, Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, trace};

/// Lifecycle status of a module, ordered from least to most resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModuleStatus {
    /// Placeholder synthesized from configuration, nothing fetched yet
    Virtual,
    /// Registered by `define`, dependencies not yet loaded
    Created,
    /// Own file and every dependency's file are loaded
    Ready,
    /// Factory is running
    Executing,
    /// Exports are final
    Executed,
}

/// Shared export value of a module.
///
/// Cloning is cheap and every clone points at the same value, so consumers
/// of one module observe the same reference.
#[derive(Clone)]
pub struct Exports(Arc<dyn Any + Send + Sync>);

impl Exports {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// The empty export every module starts with
    pub fn empty() -> Self {
        Self(Arc::new(()))
    }

    /// Whether this is the empty export
    pub fn is_empty(&self) -> bool {
        self.0.is::<()>()
    }

    /// Borrow the value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Borrow JSON exports (as produced by manifests)
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        self.downcast_ref::<serde_json::Value>()
    }

    /// Whether both handles share the same value
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Exports {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<serde_json::Value> for Exports {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Exports(empty)")
        } else if let Some(json) = self.as_json() {
            write!(f, "Exports({})", json)
        } else {
            f.write_str("Exports(..)")
        }
    }
}

/// Callable factory receiving the ordered dependency exports
pub type FactoryFn = Arc<dyn Fn(&[Exports]) -> Exports + Send + Sync>;

/// How a module produces its exports
#[derive(Clone)]
pub enum Factory {
    /// Called once with the dependency exports in declaration order
    Callable(FactoryFn),
    /// Precomputed exports, used verbatim
    Value(Exports),
}

impl Factory {
    /// Build a callable factory
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&[Exports]) -> Exports + Send + Sync + 'static,
    {
        Factory::Callable(Arc::new(f))
    }

    /// Build a value factory
    pub fn value<T: Any + Send + Sync>(value: T) -> Self {
        Factory::Value(Exports::new(value))
    }

    /// A factory producing the empty export
    pub fn empty() -> Self {
        Factory::Value(Exports::empty())
    }

    fn produce(&self, dependencies: &[Exports]) -> Exports {
        match self {
            Factory::Callable(f) => f(dependencies),
            Factory::Value(exports) => exports.clone(),
        }
    }
}

impl fmt::Debug for Factory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Factory::Callable(_) => f.write_str("Factory::Callable"),
            Factory::Value(exports) => write!(f, "Factory::Value({:?})", exports),
        }
    }
}

struct ModuleState {
    status: ModuleStatus,
    exports: Exports,
    /// Thread running the factory while EXECUTING
    executor: Option<ThreadId>,
}

/// Threads blocked in `exec` as (waiter, executor, module key)
static WAITING: Mutex<Vec<(ThreadId, ThreadId, usize)>> = const_mutex(Vec::new());

/// Whether following waiter -> executor edges from `from` reaches `target`
fn waits_on(waiting: &[(ThreadId, ThreadId, usize)], from: ThreadId, target: ThreadId) -> bool {
    let mut current = from;
    for _ in 0..=waiting.len() {
        if current == target {
            return true;
        }
        match waiting.iter().find(|(waiter, _, _)| *waiter == current) {
            Some((_, executor, _)) => current = *executor,
            None => return false,
        }
    }
    false
}

struct ModuleInner {
    id: String,
    dependency_ids: Vec<String>,
    dependencies: Mutex<FxHashMap<String, Module>>,
    factory: Factory,
    state: Mutex<ModuleState>,
    finished: Condvar,
    enabled: AtomicBool,
    owner: WeakNamespace,
}

/// A registered, resolvable unit of code
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl Module {
    pub(crate) fn new(
        id: String,
        dependency_ids: Vec<String>,
        factory: Factory,
        owner: &Namespace,
    ) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                id,
                dependency_ids,
                dependencies: Mutex::new(FxHashMap::default()),
                factory,
                state: Mutex::new(ModuleState {
                    status: ModuleStatus::Created,
                    exports: Exports::empty(),
                    executor: None,
                }),
                finished: Condvar::new(),
                enabled: AtomicBool::new(true),
                owner: owner.downgrade(),
            }),
        }
    }

    /// Module id, unique within its namespace
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Declared dependency ids in order
    pub fn dependency_ids(&self) -> &[String] {
        &self.inner.dependency_ids
    }

    /// A wired dependency, if `set_dependencies` attached it
    pub fn dependency(&self, id: &str) -> Option<Module> {
        self.inner.dependencies.lock().get(id).cloned()
    }

    /// Current lifecycle status
    pub fn status(&self) -> ModuleStatus {
        self.inner.state.lock().status
    }

    /// Cached exports (empty until executed)
    pub fn exports(&self) -> Exports {
        self.inner.state.lock().exports.clone()
    }

    /// Namespace that defined this module
    pub fn owner(&self) -> Option<Namespace> {
        self.inner.owner.upgrade()
    }

    /// Whether `exec` is allowed
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Allow `exec`
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Make `exec` fail with [`ModuleError::Disabled`]
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether both handles refer to the same module
    pub fn ptr_eq(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// CREATED -> READY; later states are left alone
    pub(crate) fn mark_ready(&self) {
        let mut state = self.inner.state.lock();
        if state.status == ModuleStatus::Created {
            state.status = ModuleStatus::Ready;
        }
    }

    /// Attach every transitive dependency module
    pub fn set_dependencies(&self) -> Result<()> {
        let mut visited = FxHashSet::default();
        self.wire(&mut visited)
    }

    fn wire(&self, visited: &mut FxHashSet<usize>) -> Result<()> {
        if !visited.insert(Arc::as_ptr(&self.inner) as usize) {
            return Ok(());
        }
        for id in &self.inner.dependency_ids {
            let dependency = self.lookup(id)?;
            dependency.wire(visited)?;
            self.inner
                .dependencies
                .lock()
                .insert(id.clone(), dependency);
        }
        Ok(())
    }

    fn lookup(&self, id: &str) -> Result<Module> {
        let owner = self.owner().ok_or(ModuleError::RuntimeDropped)?;
        owner.search_module_by_id(id)?.into_module()
    }

    fn resolve_dependency(&self, id: &str) -> Result<Module> {
        if let Some(module) = self.dependency(id) {
            return Ok(module);
        }
        let module = self.lookup(id)?;
        self.inner
            .dependencies
            .lock()
            .insert(id.to_string(), module.clone());
        Ok(module)
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Run the factory once and return the memoized exports.
    ///
    /// A module that is already executing on the calling thread (a
    /// dependency cycle) returns its in-progress cache instead of recursing.
    /// Other threads block until the executing thread settles the module,
    /// unless that thread is itself waiting on the caller.
    pub fn exec(&self) -> Result<Exports> {
        if !self.is_enabled() {
            return Err(ModuleError::Disabled {
                id: self.inner.id.clone(),
            });
        }

        let me = thread::current().id();
        let previous = {
            let mut state = self.inner.state.lock();
            loop {
                match (state.status, state.executor) {
                    (ModuleStatus::Executed, _) => return Ok(state.exports.clone()),
                    (ModuleStatus::Executing, Some(executor)) if executor != me => {
                        let mut waiting = WAITING.lock();
                        if waits_on(&waiting, executor, me) {
                            trace!("Module {} is part of a cross-thread cycle", self.inner.id);
                            return Ok(state.exports.clone());
                        }
                        waiting.push((me, executor, self.key()));
                        drop(waiting);
                        trace!("Waiting for module {} on another thread", self.inner.id);
                        self.inner.finished.wait(&mut state);
                        WAITING.lock().retain(|(waiter, _, _)| *waiter != me);
                    }
                    (ModuleStatus::Executing, _) => {
                        trace!("Module {} already executing", self.inner.id);
                        return Ok(state.exports.clone());
                    }
                    (status, _) => {
                        state.status = ModuleStatus::Executing;
                        state.executor = Some(me);
                        break status;
                    }
                }
            }
        };

        let mut arguments = Vec::with_capacity(self.inner.dependency_ids.len());
        for id in &self.inner.dependency_ids {
            let outcome = self
                .resolve_dependency(id)
                .and_then(|dependency| dependency.exec());
            match outcome {
                Ok(exports) => arguments.push(exports),
                Err(e) => {
                    self.settle(previous, None);
                    return Err(e);
                }
            }
        }

        let exports = self.inner.factory.produce(&arguments);
        self.settle(ModuleStatus::Executed, Some(exports.clone()));
        debug!("Executed module {}", self.inner.id);
        Ok(exports)
    }

    /// Leave EXECUTING and wake every thread waiting on this module
    fn settle(&self, status: ModuleStatus, exports: Option<Exports>) {
        let mut state = self.inner.state.lock();
        if let Some(exports) = exports {
            state.exports = exports;
        }
        state.status = status;
        state.executor = None;
        let key = self.key();
        WAITING.lock().retain(|(_, _, module)| *module != key);
        self.inner.finished.notify_all();
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.inner.id)
            .field("dependency_ids", &self.inner.dependency_ids)
            .field("status", &self.status())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Result of looking an id up in the namespace tree
#[derive(Clone, Debug)]
pub enum ModuleEntry {
    /// Configured but not registered yet; carries what is needed to fetch it
    Unresolved {
        /// Unqualified module id
        id: String,
        /// URL of the backing file
        url: String,
        /// Namespace whose configuration produced the URL
        owner: Namespace,
    },
    /// A module registered by `define`
    Registered(Module),
}

impl ModuleEntry {
    /// Status of the entry; placeholders are always VIRTUAL
    pub fn status(&self) -> ModuleStatus {
        match self {
            ModuleEntry::Unresolved { .. } => ModuleStatus::Virtual,
            ModuleEntry::Registered(module) => module.status(),
        }
    }

    /// Unqualified id
    pub fn id(&self) -> &str {
        match self {
            ModuleEntry::Unresolved { id, .. } => id,
            ModuleEntry::Registered(module) => module.id(),
        }
    }

    /// URL still to be fetched, if any
    pub fn url(&self) -> Option<&str> {
        match self {
            ModuleEntry::Unresolved { url, .. } => Some(url),
            ModuleEntry::Registered(_) => None,
        }
    }

    /// The registered module, or [`ModuleError::NotLoaded`]
    pub fn into_module(self) -> Result<Module> {
        match self {
            ModuleEntry::Registered(module) => Ok(module),
            ModuleEntry::Unresolved { id, owner, .. } => Err(ModuleError::NotLoaded {
                id,
                namespace: owner.name().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::Runtime;
    use std::sync::atomic::AtomicUsize;

    fn runtime() -> Runtime {
        Runtime::new(MemoryFetcher::new())
    }

    #[test]
    fn test_status_order() {
        assert!(ModuleStatus::Virtual < ModuleStatus::Created);
        assert!(ModuleStatus::Created < ModuleStatus::Ready);
        assert!(ModuleStatus::Ready < ModuleStatus::Executing);
        assert!(ModuleStatus::Executing < ModuleStatus::Executed);
    }

    #[test]
    fn test_exec_runs_factory_once() {
        let runtime = runtime();
        let root = runtime.root();
        let calls = Arc::new(AtomicUsize::new(0));

        let calls_clone = calls.clone();
        let module = root
            .define(
                "a",
                &[],
                Factory::from_fn(move |_| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                    Exports::new(7_i64)
                }),
            )
            .unwrap();

        let first = module.exec().unwrap();
        let second = module.exec().unwrap();

        assert!(first.ptr_eq(&second));
        assert_eq!(first.downcast_ref::<i64>(), Some(&7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(module.status(), ModuleStatus::Executed);
    }

    #[test]
    fn test_value_factory_is_used_verbatim() {
        let runtime = runtime();
        let module = runtime
            .root()
            .define("answer", &[], Factory::value(42_u32))
            .unwrap();

        assert_eq!(module.exec().unwrap().downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_disabled_module_fails() {
        let runtime = runtime();
        let module = runtime.root().define("off", &[], Factory::empty()).unwrap();

        module.disable();
        assert!(matches!(module.exec(), Err(ModuleError::Disabled { .. })));

        module.enable();
        assert!(module.exec().unwrap().is_empty());
    }

    #[test]
    fn test_self_cycle_terminates() {
        let runtime = runtime();
        let root = runtime.root();
        let seen_empty = Arc::new(AtomicBool::new(false));

        let seen = seen_empty.clone();
        let module = root
            .define(
                "x",
                &["x"],
                Factory::from_fn(move |deps| {
                    seen.store(deps[0].is_empty(), Ordering::SeqCst);
                    Exports::new("x")
                }),
            )
            .unwrap();

        module.set_dependencies().unwrap();
        let exports = module.exec().unwrap();

        assert_eq!(exports.downcast_ref::<&str>(), Some(&"x"));
        assert!(seen_empty.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_dependency_restores_status() {
        let runtime = runtime();
        let module = runtime
            .root()
            .define("lonely", &["nowhere"], Factory::empty())
            .unwrap();

        assert!(matches!(
            module.exec(),
            Err(ModuleError::ModuleNotFound { .. })
        ));
        assert_eq!(module.status(), ModuleStatus::Created);
    }

    #[test]
    fn test_concurrent_exec_waits_for_running_factory() {
        let runtime = runtime();
        let root = runtime.root();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        root.define(
            "a",
            &[],
            Factory::from_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(200));
                Exports::new(42_i32)
            }),
        )
        .unwrap();
        let b = root.define("b", &["a"], Factory::from_fn(|deps| deps[0].clone())).unwrap();
        let c = root.define("c", &["a"], Factory::from_fn(|deps| deps[0].clone())).unwrap();

        let first = std::thread::spawn(move || b.exec().unwrap());
        std::thread::sleep(std::time::Duration::from_millis(50));
        let second = std::thread::spawn(move || c.exec().unwrap());

        let seen_by_b = first.join().unwrap();
        let seen_by_c = second.join().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(seen_by_b.downcast_ref::<i32>(), Some(&42));
        assert_eq!(seen_by_c.downcast_ref::<i32>(), Some(&42));
        assert!(seen_by_b.ptr_eq(&seen_by_c));
    }

    #[test]
    fn test_waits_on_follows_chain() {
        let t1 = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        let t2 = std::thread::spawn(|| std::thread::current().id()).join().unwrap();
        let t3 = std::thread::current().id();

        let waiting = vec![(t1, t2, 1), (t2, t3, 2)];
        assert!(waits_on(&waiting, t1, t3));
        assert!(!waits_on(&waiting, t3, t1));
        assert!(waits_on(&waiting, t3, t3));
    }

    #[test]
    fn test_exports_debug() {
        assert_eq!(format!("{:?}", Exports::empty()), "Exports(empty)");
        assert_eq!(
            format!("{:?}", Exports::from(serde_json::json!({"a": 1}))),
            r#"Exports({"a":1})"#
        );
    }
}
