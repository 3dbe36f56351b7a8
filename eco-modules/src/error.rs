//! Module runtime error types

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Type alias for module runtime results
pub type Result<T> = std::result::Result<T, ModuleError>;

/// Errors raised while resolving, loading or executing modules.
///
/// The enum is `Clone` so a single failure can be delivered to every
/// `use` call waiting on the same resolution.
#[derive(Error, Debug, Clone)]
pub enum ModuleError {
    /// `exec` was called on a disabled module
    #[error("Module {id} is disabled")]
    Disabled {
        /// Id of the disabled module
        id: String,
    },

    /// Id could not be resolved through the local table, config or parents
    #[error("Module {id} not found in the namespace tree of {namespace}")]
    ModuleNotFound {
        /// The unresolvable id
        id: String,
        /// Namespace where the lookup started
        namespace: String,
    },

    /// A dotted id or explicit name references an unregistered namespace
    #[error("Namespace {name} does not exist")]
    NamespaceNotFound {
        /// Name of the missing namespace
        name: String,
    },

    /// Synchronous use was given a namespace-qualified id
    #[error("Synchronous use cannot cross namespaces: {id}")]
    CrossScopeViolation {
        /// The offending dotted id
        id: String,
    },

    /// Loading the backing file of a module or namespace failed
    #[error("Namespace {namespace} failed to load {id} from {url}: {source}")]
    FetchFailure {
        /// Namespace that requested the load
        namespace: String,
        /// Module id or namespace name being loaded
        id: String,
        /// URL that failed
        url: String,
        /// The underlying fetch error
        #[source]
        source: Arc<FetchError>,
    },

    /// A dependency is still a virtual placeholder
    #[error("Module {id} in namespace {namespace} has not been loaded")]
    NotLoaded {
        /// Id of the virtual module
        id: String,
        /// Namespace owning the placeholder
        namespace: String,
    },

    /// Workflow referenced an unknown task
    #[error("Task not found: {id}")]
    TaskNotFound {
        /// Missing task id
        id: String,
    },

    /// Service lookup failed
    #[error("Service not found: {id}")]
    ServiceNotFound {
        /// Missing service id
        id: String,
    },

    /// Workflow lookup failed
    #[error("Workflow not found: {id}")]
    WorkflowNotFound {
        /// Missing workflow id
        id: String,
    },

    /// A task or service returned an error
    #[error("Task {id} failed: {message}")]
    TaskFailed {
        /// Task or service id
        id: String,
        /// Rendered error chain
        message: String,
    },

    /// Aspect point cut or call on an unknown capability
    #[error("Target {name} is not registered on {context}")]
    TargetNotFound {
        /// Capability table name
        context: String,
        /// Missing target name
        name: String,
    },

    /// The owning runtime was dropped while a handle was still in use
    #[error("Module runtime has been shut down")]
    RuntimeDropped,
}

/// Errors produced by a [`Fetcher`](crate::fetch::Fetcher)
#[derive(Error, Debug)]
pub enum FetchError {
    /// URL cannot be mapped onto a resource
    #[error("Invalid resource url: {url}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
    },

    /// Nothing is served at the URL
    #[error("Resource not found: {url}")]
    NotFound {
        /// The missing URL
        url: String,
    },

    /// I/O error while reading a local resource
    #[error("IO error reading {path}: {error}")]
    Io {
        /// Path that failed to read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        error: std::io::Error,
    },

    /// Transport error while requesting a remote resource
    #[error("HTTP error fetching {url}: {error}")]
    Http {
        /// Requested URL
        url: String,
        /// The underlying client error
        #[source]
        error: reqwest::Error,
    },

    /// Remote resource answered with a non-success status
    #[error("HTTP {status} fetching {url}")]
    Status {
        /// Requested URL
        url: String,
        /// Response status code
        status: u16,
    },

    /// A script body is not a valid module manifest
    #[error("Malformed module manifest {url}: {error}")]
    Manifest {
        /// URL of the manifest
        url: String,
        /// The underlying parse error
        #[source]
        error: serde_json::Error,
    },

    /// Executing a fetched script failed
    #[error("Script {url} failed: {message}")]
    Script {
        /// URL of the script
        url: String,
        /// Rendered error chain
        message: String,
    },

    /// A fetch was requested outside of a tokio runtime
    #[error("No async executor is available to fetch {url}")]
    NoExecutor {
        /// URL that could not be fetched
        url: String,
    },
}
