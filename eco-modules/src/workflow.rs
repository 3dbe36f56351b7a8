//! Named tasks, services and linear workflows over them

use crate::namespace::{Namespace, WeakNamespace};
use crate::{next_uid, ModuleError, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A workflow step
pub type TaskFn = Arc<dyn Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync>;

/// A named request/response function
pub type ServiceFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// Id-keyed table remembering registration order
struct Registry<T> {
    ids: Vec<String>,
    items: FxHashMap<String, T>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            items: FxHashMap::default(),
        }
    }
}

impl<T: Clone> Registry<T> {
    fn insert(&mut self, id: String, item: T) {
        if self.items.insert(id.clone(), item).is_none() {
            self.ids.push(id);
        }
    }

    fn get(&self, id: &str) -> Option<T> {
        self.items.get(id).cloned()
    }

    fn ids(&self) -> Vec<String> {
        self.ids.clone()
    }
}

/// Per-namespace task, service and workflow tables
#[derive(Default)]
pub(crate) struct Registries {
    tasks: RwLock<Registry<TaskFn>>,
    services: RwLock<Registry<ServiceFn>>,
    workflows: RwLock<Registry<Workflow>>,
}

/// What a running task can reach
pub struct TaskContext {
    namespace: Namespace,
    workflow_id: String,
}

impl TaskContext {
    /// Namespace the workflow belongs to
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Id of the running workflow
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Call a service of the namespace
    pub fn call_service(&self, id: &str, input: Value) -> Result<Value> {
        self.namespace.call_service(id, input)
    }

    /// Run another task of the namespace inline
    pub fn run_task(&self, id: &str) -> Result<()> {
        let task = self
            .namespace
            .inner
            .registries
            .tasks
            .read()
            .get(id)
            .ok_or_else(|| ModuleError::TaskNotFound { id: id.to_string() })?;
        debug!("Running task {} of workflow {}", id, self.workflow_id);
        task(self).map_err(|e| ModuleError::TaskFailed {
            id: id.to_string(),
            message: format!("{:#}", e),
        })
    }
}

/// An ordered sequence of task ids
#[derive(Clone)]
pub struct Workflow {
    id: String,
    task_ids: Vec<String>,
    namespace: WeakNamespace,
}

impl Workflow {
    /// Workflow id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Steps in execution order
    pub fn task_ids(&self) -> &[String] {
        &self.task_ids
    }

    /// Run every task in order, stopping at the first failure
    pub fn run(&self) -> Result<()> {
        let namespace = self.namespace.upgrade().ok_or(ModuleError::RuntimeDropped)?;
        let context = TaskContext {
            namespace,
            workflow_id: self.id.clone(),
        };
        for id in &self.task_ids {
            if let Err(e) = context.run_task(id) {
                warn!("Workflow {} aborted: {}", self.id, e);
                return Err(e);
            }
        }
        debug!("Workflow {} completed {} task(s)", self.id, self.task_ids.len());
        Ok(())
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("task_ids", &self.task_ids)
            .finish()
    }
}

impl Namespace {
    /// Register a task
    pub fn task<F>(&self, id: &str, task: F) -> &Self
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner
            .registries
            .tasks
            .write()
            .insert(id.to_string(), Arc::new(task));
        self
    }

    /// Register several tasks at once
    pub fn tasks<I, S>(&self, tasks: I) -> &Self
    where
        I: IntoIterator<Item = (S, TaskFn)>,
        S: Into<String>,
    {
        let mut registry = self.inner.registries.tasks.write();
        for (id, task) in tasks {
            registry.insert(id.into(), task);
        }
        drop(registry);
        self
    }

    /// Register a service
    pub fn service<F>(&self, id: &str, service: F) -> &Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.inner
            .registries
            .services
            .write()
            .insert(id.to_string(), Arc::new(service));
        self
    }

    /// Register several services at once
    pub fn services<I, S>(&self, services: I) -> &Self
    where
        I: IntoIterator<Item = (S, ServiceFn)>,
        S: Into<String>,
    {
        let mut registry = self.inner.registries.services.write();
        for (id, service) in services {
            registry.insert(id.into(), service);
        }
        drop(registry);
        self
    }

    /// Invoke a registered service
    pub fn call_service(&self, id: &str, input: Value) -> Result<Value> {
        let service = self
            .inner
            .registries
            .services
            .read()
            .get(id)
            .ok_or_else(|| ModuleError::ServiceNotFound { id: id.to_string() })?;
        service(input).map_err(|e| ModuleError::TaskFailed {
            id: id.to_string(),
            message: format!("{:#}", e),
        })
    }

    /// Register a workflow; `None` generates an anonymous id
    pub fn workflow(&self, id: Option<&str>, task_ids: &[&str]) -> Workflow {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| format!("_anonymous_workflow_{}", next_uid()));
        let workflow = Workflow {
            id: id.clone(),
            task_ids: task_ids.iter().map(|s| s.to_string()).collect(),
            namespace: self.downgrade(),
        };
        self.inner
            .registries
            .workflows
            .write()
            .insert(id, workflow.clone());
        workflow
    }

    /// Run a registered workflow
    pub fn run(&self, workflow_id: &str) -> Result<()> {
        let workflow = self
            .inner
            .registries
            .workflows
            .read()
            .get(workflow_id)
            .ok_or_else(|| ModuleError::WorkflowNotFound {
                id: workflow_id.to_string(),
            })?;
        workflow.run()
    }

    /// Task ids in registration order
    pub fn task_ids(&self) -> Vec<String> {
        self.inner.registries.tasks.read().ids()
    }

    /// Service ids in registration order
    pub fn service_ids(&self) -> Vec<String> {
        self.inner.registries.services.read().ids()
    }

    /// Workflow ids in registration order
    pub fn workflow_ids(&self) -> Vec<String> {
        self.inner.registries.workflows.read().ids()
    }
}
