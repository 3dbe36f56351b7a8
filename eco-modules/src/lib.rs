//! Eco Module System
//!
//! This crate provides a lazy module and namespace runtime, including:
//! - Hierarchical namespaces with configurable resolution tables
//! - Asynchronous, deduplicated loading of backing files
//! - Module lifecycle and exactly-once factory execution
//! - Environment-scoped data, tasks, services and workflows
//! - Aspect-style interception of named capabilities

pub mod aspect;
pub mod error;
pub mod events;
pub mod fetch;
pub mod manifest;
pub mod module;
pub mod namespace;
pub mod runtime;
pub mod workflow;

pub use aspect::{Advice, Aspect, Capabilities, JoinPoint};
pub use error::{FetchError, ModuleError, Result};
pub use events::{EventBus, FailureSite, RuntimeEvent, Subscription, SubscriptionId};
pub use fetch::{FetchStatus, Fetcher, FileFetcher, HttpFetcher, MemoryFetcher, Resource, ResourceKind};
pub use manifest::ModuleManifest;
pub use module::{Exports, Factory, Module, ModuleEntry, ModuleStatus};
pub use namespace::{Meta, Namespace, NamespaceConfig};
pub use runtime::Runtime;
pub use workflow::{TaskContext, Workflow};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name of the root namespace
    pub root_namespace: String,

    /// Interval between stylesheet load probes, in milliseconds
    pub stylesheet_poll_interval_ms: u64,
}

impl RuntimeConfig {
    /// Stylesheet probe interval as a [`Duration`]
    pub fn stylesheet_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stylesheet_poll_interval_ms.max(1))
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_namespace: "eco".to_string(),
            stylesheet_poll_interval_ms: 20,
        }
    }
}

static NEXT_UID: AtomicUsize = AtomicUsize::new(0);

/// Process-wide counter for anonymous aspect and workflow ids
pub(crate) fn next_uid() -> usize {
    NEXT_UID.fetch_add(1, Ordering::Relaxed)
}
