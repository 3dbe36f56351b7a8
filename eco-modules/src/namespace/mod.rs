//! Hierarchical namespaces
//!
//! A [`Namespace`] owns its modules, a URL table used to synthesize virtual
//! modules, environment-scoped data, descriptive metadata and the
//! task/service/workflow registries. Lookups fall back to the parent chain.

pub mod config;
pub mod data;
mod loading;
mod usage;

pub use config::{Meta, NamespaceConfig};
pub use data::DataStore;

use crate::events::{FailureSite, RuntimeEvent, LOAD_DEPENDENCIES};
use crate::module::{Exports, Factory, Module, ModuleEntry};
use crate::runtime::{Runtime, WeakRuntime};
use crate::workflow::Registries;
use crate::{ModuleError, Result};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub(crate) struct NamespaceInner {
    name: String,
    parent: Option<WeakNamespace>,
    runtime: WeakRuntime,
    children: RwLock<Vec<Namespace>>,
    modules: RwLock<FxHashMap<String, Module>>,
    module_ids: RwLock<Vec<String>>,
    config: RwLock<NamespaceConfig>,
    data: RwLock<DataStore>,
    meta: RwLock<Meta>,
    bindings: RwLock<FxHashMap<String, Exports>>,
    ready: AtomicBool,
    pub(crate) registries: Registries,
}

/// A named scope of modules
#[derive(Clone)]
pub struct Namespace {
    pub(crate) inner: Arc<NamespaceInner>,
}

/// Non-owning handle used for parent and owner back-references
#[derive(Clone)]
pub(crate) struct WeakNamespace(Weak<NamespaceInner>);

impl WeakNamespace {
    pub(crate) fn upgrade(&self) -> Option<Namespace> {
        self.0.upgrade().map(|inner| Namespace { inner })
    }
}

/// Split `ns.local` into its namespace and local parts
pub(crate) fn split_qualified(id: &str) -> Option<(&str, &str)> {
    id.split_once('.')
}

impl Namespace {
    pub(crate) fn new(name: &str, parent: Option<&Namespace>, runtime: WeakRuntime) -> Self {
        Self {
            inner: Arc::new(NamespaceInner {
                name: name.to_string(),
                parent: parent.map(Namespace::downgrade),
                runtime,
                children: RwLock::new(Vec::new()),
                modules: RwLock::new(FxHashMap::default()),
                module_ids: RwLock::new(Vec::new()),
                config: RwLock::new(NamespaceConfig::default()),
                data: RwLock::new(DataStore::default()),
                meta: RwLock::new(Meta::default()),
                bindings: RwLock::new(FxHashMap::default()),
                ready: AtomicBool::new(false),
                registries: Registries::default(),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakNamespace {
        WeakNamespace(Arc::downgrade(&self.inner))
    }

    /// Namespace name, unique within the runtime
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Parent scope, `None` for the root
    pub fn parent(&self) -> Option<Namespace> {
        self.inner.parent.as_ref().and_then(WeakNamespace::upgrade)
    }

    /// Child scopes in creation order
    pub fn children(&self) -> Vec<Namespace> {
        self.inner.children.read().clone()
    }

    /// Names of the child scopes in creation order
    pub fn child_names(&self) -> Vec<String> {
        self.inner
            .children
            .read()
            .iter()
            .map(|child| child.name().to_string())
            .collect()
    }

    pub(crate) fn add_child(&self, child: Namespace) {
        self.inner.children.write().push(child);
    }

    /// Runtime this namespace is registered in
    pub fn runtime(&self) -> Result<Runtime> {
        self.inner.runtime.upgrade().ok_or(ModuleError::RuntimeDropped)
    }

    /// Whether namespace loading has marked this scope complete
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ready(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
    }

    /// Create (or obtain) the namespace `name` as a child of this one.
    ///
    /// Names are unique across the runtime; an existing namespace is
    /// returned as is, wherever it lives in the tree.
    pub fn namespace(&self, name: &str) -> Result<Namespace> {
        Ok(self.runtime()?.create_namespace(name, self))
    }

    /// Merge `patch` into the resolution table
    pub fn config(&self, patch: NamespaceConfig) -> &Self {
        self.inner.config.write().merge(patch);
        self
    }

    /// Snapshot of the resolution table
    pub fn config_data(&self) -> NamespaceConfig {
        self.inner.config.read().clone()
    }

    /// Read `key` or `key.env`
    pub fn data(&self, selector: &str) -> Option<Value> {
        self.inner.data.read().get(selector)
    }

    /// Write `key` or `key.env`
    pub fn set_data(&self, selector: &str, value: Value) -> &Self {
        self.inner.data.write().set(selector, value);
        self
    }

    /// Select the active environment, namespace-wide (`env`) or for one key
    /// (`key.env`)
    pub fn env(&self, selector: &str) -> &Self {
        self.inner.data.write().set_env(selector);
        self
    }

    /// Descriptive metadata
    pub fn meta(&self) -> Meta {
        self.inner.meta.read().clone()
    }

    /// Merge descriptive metadata
    pub fn set_meta(&self, patch: Meta) -> &Self {
        self.inner.meta.write().merge(patch);
        self
    }

    /// Exports bound by a synchronous `use`
    pub fn binding(&self, id: &str) -> Option<Exports> {
        self.inner.bindings.read().get(id).cloned()
    }

    /// Locally registered module
    pub fn module(&self, id: &str) -> Option<Module> {
        self.inner.modules.read().get(id).cloned()
    }

    /// Ids of locally registered modules in definition order
    pub fn module_ids(&self) -> Vec<String> {
        self.inner.module_ids.read().clone()
    }

    /// Register a module.
    ///
    /// Without dependencies the module is READY immediately. Otherwise it
    /// waits for the next `load-dependencies` signal, loads its
    /// dependencies, and only then becomes READY.
    pub fn define(&self, id: &str, dependency_ids: &[&str], factory: Factory) -> Result<Module> {
        let runtime = self.runtime()?;
        let dependency_ids: Vec<String> = dependency_ids.iter().map(|s| s.to_string()).collect();
        let module = Module::new(id.to_string(), dependency_ids, factory, self);

        let previous = self
            .inner
            .modules
            .write()
            .insert(id.to_string(), module.clone());
        if previous.is_none() {
            self.inner.module_ids.write().push(id.to_string());
        }
        debug!(
            "Defined module {}.{} with {} dependencies",
            self.name(),
            id,
            module.dependency_ids().len()
        );

        if module.dependency_ids().is_empty() {
            module.mark_ready();
            runtime.emit(RuntimeEvent::ModuleReady {
                namespace: self.name().to_string(),
                id: id.to_string(),
            });
        } else {
            let namespace = self.clone();
            let pending = module.clone();
            runtime.events().one(LOAD_DEPENDENCIES, move |_| {
                namespace.load_dependencies_of(&pending);
            });
        }
        Ok(module)
    }

    fn load_dependencies_of(&self, module: &Module) {
        let namespace = self.clone();
        let ready = module.clone();
        let outcome = self.load_modules(module.dependency_ids(), move || {
            ready.mark_ready();
            if let Ok(runtime) = namespace.runtime() {
                runtime.emit(RuntimeEvent::ModuleReady {
                    namespace: namespace.name().to_string(),
                    id: ready.id().to_string(),
                });
            }
        });
        if let Err(e) = outcome {
            warn!("Loading dependencies of {}.{} failed: {}", self.name(), module.id(), e);
            if let Ok(runtime) = self.runtime() {
                runtime.emit(RuntimeEvent::Failed {
                    site: FailureSite::Module {
                        namespace: self.name().to_string(),
                        id: module.id().to_string(),
                    },
                    error: e,
                });
            }
        }
    }

    /// Resolve `id` to a registered module or a virtual placeholder.
    ///
    /// Lookup order: local table, `ns.local` delegation, configured URLs,
    /// then the parent chain.
    pub fn search_module_by_id(&self, id: &str) -> Result<ModuleEntry> {
        self.search(id, self.name())
    }

    fn search(&self, id: &str, origin: &str) -> Result<ModuleEntry> {
        if let Some(module) = self.module(id) {
            return Ok(ModuleEntry::Registered(module));
        }

        if let Some((namespace_name, local)) = split_qualified(id) {
            let namespace = self.runtime()?.require_namespace(namespace_name)?;
            return namespace.search(local, origin);
        }

        if let Some(url) = self.inner.config.read().module_url(id) {
            return Ok(ModuleEntry::Unresolved {
                id: id.to_string(),
                url,
                owner: self.clone(),
            });
        }

        match self.parent() {
            Some(parent) => parent.search(id, origin),
            None => Err(ModuleError::ModuleNotFound {
                id: id.to_string(),
                namespace: origin.to_string(),
            }),
        }
    }

    /// URL of the file that registers namespace `name`, searching parents
    pub fn url_for_namespace(&self, name: &str) -> Option<String> {
        let own = self.inner.config.read().namespace_url(name);
        own.or_else(|| self.parent().and_then(|parent| parent.url_for_namespace(name)))
    }

    /// Indented rendering of this namespace and its descendants
    pub fn namespace_tree(&self) -> String {
        let mut out = String::new();
        self.render_namespace(&mut out, 0);
        out
    }

    fn render_namespace(&self, out: &mut String, depth: usize) {
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), self.name());
        for child in self.children() {
            child.render_namespace(out, depth + 1);
        }
    }

    /// Indented dependency tree of one module
    pub fn module_tree(&self, id: &str) -> Result<String> {
        let mut out = String::new();
        let mut path = FxHashSet::default();
        self.render_module(id, &mut out, 0, &mut path)?;
        Ok(out)
    }

    /// Dependency trees of every local module
    pub fn modules_tree(&self) -> Result<String> {
        let mut out = String::new();
        for id in self.module_ids() {
            out.push_str(&self.module_tree(&id)?);
        }
        Ok(out)
    }

    fn render_module(
        &self,
        id: &str,
        out: &mut String,
        depth: usize,
        path: &mut FxHashSet<String>,
    ) -> Result<()> {
        let indent = "  ".repeat(depth);
        let module = match self.search_module_by_id(id)? {
            ModuleEntry::Registered(module) => module,
            ModuleEntry::Unresolved { url, .. } => {
                let _ = writeln!(out, "{}{} <{}>", indent, id, url);
                return Ok(());
            }
        };
        if !path.insert(id.to_string()) {
            let _ = writeln!(out, "{}{} (cycle)", indent, id);
            return Ok(());
        }
        let _ = writeln!(out, "{}{} [{:?}]", indent, id, module.status());
        for dependency in module.dependency_ids() {
            self.render_module(dependency, out, depth + 1, path)?;
        }
        path.remove(id);
        Ok(())
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.inner.name)
            .field("modules", &self.module_ids())
            .field("children", &self.child_names())
            .field("ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::MemoryFetcher;
    use crate::module::ModuleStatus;
    use serde_json::json;

    fn runtime() -> Runtime {
        Runtime::new(MemoryFetcher::new())
    }

    #[test]
    fn test_zero_dependency_define_is_ready() {
        let runtime = runtime();
        let module = runtime.root().define("a", &[], Factory::value(1_i32)).unwrap();
        assert_eq!(module.status(), ModuleStatus::Ready);
    }

    #[test]
    fn test_define_with_dependencies_waits() {
        let runtime = runtime();
        let root = runtime.root();
        root.define("a", &[], Factory::empty()).unwrap();
        let b = root.define("b", &["a"], Factory::empty()).unwrap();

        assert_eq!(b.status(), ModuleStatus::Created);
        runtime.emit(RuntimeEvent::LoadDependencies);
        assert_eq!(b.status(), ModuleStatus::Ready);
    }

    #[test]
    fn test_namespace_is_created_once() {
        let runtime = runtime();
        let root = runtime.root();
        let game = root.namespace("game").unwrap();
        let again = root.namespace("game").unwrap();

        assert!(Arc::ptr_eq(&game.inner, &again.inner));
        assert_eq!(root.child_names(), vec!["game"]);
        assert_eq!(game.parent().unwrap().name(), root.name());
    }

    #[test]
    fn test_search_local_config_and_parent() {
        let runtime = runtime();
        let root = runtime.root();
        root.config(NamespaceConfig {
            base: Some("/static/".into()),
            modules: [("tween".to_string(), "tween.js".to_string())].into(),
            ..Default::default()
        });
        let game = root.namespace("game").unwrap();
        game.define("local", &[], Factory::empty()).unwrap();

        assert!(matches!(
            game.search_module_by_id("local").unwrap(),
            ModuleEntry::Registered(_)
        ));
        let entry = game.search_module_by_id("tween").unwrap();
        assert_eq!(entry.url(), Some("/static/tween.js"));
        assert_eq!(entry.status(), ModuleStatus::Virtual);
        assert!(matches!(
            game.search_module_by_id("missing"),
            Err(ModuleError::ModuleNotFound { ref namespace, .. }) if namespace == "game"
        ));
    }

    #[test]
    fn test_full_module_urls() {
        let runtime = runtime();
        let root = runtime.root();
        root.config(NamespaceConfig {
            full_modules: [("cdn".to_string(), "https://cdn.test/x.js".to_string())].into(),
            ..Default::default()
        });
        assert_eq!(
            root.search_module_by_id("cdn").unwrap().url(),
            Some("https://cdn.test/x.js")
        );
    }

    #[test]
    fn test_dotted_lookup() {
        let runtime = runtime();
        let root = runtime.root();
        assert!(matches!(
            root.search_module_by_id("other.foo"),
            Err(ModuleError::NamespaceNotFound { .. })
        ));

        let other = root.namespace("other").unwrap();
        let foo = other.define("foo", &[], Factory::empty()).unwrap();
        let found = root.search_module_by_id("other.foo").unwrap().into_module().unwrap();
        assert!(found.ptr_eq(&foo));
    }

    #[test]
    fn test_redefine_replaces_module() {
        let runtime = runtime();
        let root = runtime.root();
        root.define("a", &[], Factory::value(1_i32)).unwrap();
        let second = root.define("a", &[], Factory::value(2_i32)).unwrap();

        assert!(root.module("a").unwrap().ptr_eq(&second));
        assert_eq!(root.module_ids(), vec!["a"]);
    }

    #[test]
    fn test_namespace_url_falls_back_to_parent() {
        let runtime = runtime();
        let root = runtime.root();
        root.config(NamespaceConfig {
            name_spaces: [("ui".to_string(), "ui/index.json".to_string())].into(),
            ..Default::default()
        });
        let game = root.namespace("game").unwrap();
        assert_eq!(game.url_for_namespace("ui").as_deref(), Some("/ui/index.json"));
        assert_eq!(game.url_for_namespace("nope"), None);
    }

    #[test]
    fn test_data_and_meta_through_namespace() {
        let runtime = runtime();
        let root = runtime.root();
        root.set_data("api", json!({"host": "prod"}));
        root.set_data("api.dev", json!({"host": "localhost"}));
        assert_eq!(root.data("api"), Some(json!({"host": "prod"})));
        root.env("api.dev");
        assert_eq!(root.data("api"), Some(json!({"host": "localhost"})));

        root.set_meta(Meta {
            name: Some("eco".into()),
            version: Some("1.0".into()),
            ..Default::default()
        });
        assert_eq!(root.meta().version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_trees() {
        let runtime = runtime();
        let root = runtime.root();
        let game = root.namespace("game").unwrap();
        game.namespace("ui").unwrap();
        assert_eq!(root.namespace_tree(), "eco\n  game\n    ui\n");

        root.define("a", &[], Factory::empty()).unwrap();
        root.define("b", &["a", "b"], Factory::empty()).unwrap();
        let tree = root.module_tree("b").unwrap();
        assert_eq!(tree, "b [Created]\n  a [Ready]\n  b (cycle)\n");
        assert!(root.modules_tree().unwrap().starts_with("a [Ready]\n"));
    }
}
