//! Resource fetching and per-URL deduplication
//!
//! Every URL is fetched at most once per runtime. The first requester
//! claims the URL and spawns the fetch; later requesters join the waiter
//! list or, once the fetch finished, receive the stored outcome.

pub mod file;
pub mod http;
pub mod memory;
pub mod stylesheet;

pub use file::FileFetcher;
pub use http::HttpFetcher;
pub use memory::MemoryFetcher;

use crate::error::FetchError;
use crate::runtime::Runtime;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Kind of backing file, derived from the URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Executable unit that registers namespaces and modules
    Script,
    /// Stylesheet; loading it defines an empty module
    Stylesheet,
}

impl ResourceKind {
    /// `.css` (any case, optionally followed by a query) is a stylesheet
    pub fn from_url(url: &str) -> Self {
        let path = url.split('?').next().unwrap_or(url);
        if path.to_ascii_lowercase().ends_with(".css") {
            ResourceKind::Stylesheet
        } else {
            ResourceKind::Script
        }
    }
}

/// A URL together with its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Resource {
    /// Location of the file
    pub url: String,
    /// What the file is
    pub kind: ResourceKind,
}

impl Resource {
    /// Classify `url`
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let kind = ResourceKind::from_url(&url);
        Self { url, kind }
    }
}

/// Loads backing files.
///
/// Scripts register their namespaces and modules on `runtime` as a side
/// effect. Stylesheets only need to report completion.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Load `resource`, completing once it is fully available
    async fn fetch(&self, resource: &Resource, runtime: &Runtime) -> Result<(), FetchError>;
}

/// Per-URL fetch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FetchStatus {
    /// Never requested
    Init,
    /// Request in flight
    Fetching,
    /// Loaded successfully
    Fetched,
    /// Loading failed; later requests fail fast
    Error,
}

/// Shared outcome of one URL fetch
pub type FetchOutcome = Result<(), Arc<FetchError>>;

/// Callback run exactly once with the outcome of a fetch
pub type Waiter = Box<dyn FnOnce(&FetchOutcome) + Send>;

enum FetchEntry {
    InFlight(Vec<Waiter>),
    Done(FetchOutcome),
}

pub(crate) enum Claim {
    /// Caller owns the fetch and must start it
    Start,
    /// Waiter was queued behind an in-flight fetch
    Joined,
    /// Fetch already finished; the waiter is handed back
    Finished(FetchOutcome, Waiter),
}

/// Keyed in-flight table
#[derive(Default)]
pub(crate) struct FetchTable {
    entries: Mutex<FxHashMap<String, FetchEntry>>,
}

impl FetchTable {
    pub(crate) fn status(&self, url: &str) -> FetchStatus {
        match self.entries.lock().get(url) {
            None => FetchStatus::Init,
            Some(FetchEntry::InFlight(_)) => FetchStatus::Fetching,
            Some(FetchEntry::Done(Ok(()))) => FetchStatus::Fetched,
            Some(FetchEntry::Done(Err(_))) => FetchStatus::Error,
        }
    }

    pub(crate) fn claim(&self, url: &str, waiter: Waiter) -> Claim {
        let mut entries = self.entries.lock();
        match entries.entry(url.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(FetchEntry::InFlight(vec![waiter]));
                Claim::Start
            }
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                FetchEntry::InFlight(waiters) => {
                    waiters.push(waiter);
                    Claim::Joined
                }
                FetchEntry::Done(outcome) => Claim::Finished(outcome.clone(), waiter),
            },
        }
    }

    /// Store the outcome and run every queued waiter outside the lock.
    /// Returns the number of waiters notified.
    pub(crate) fn complete(&self, url: &str, outcome: FetchOutcome) -> usize {
        let waiters = {
            let mut entries = self.entries.lock();
            match entries.insert(url.to_string(), FetchEntry::Done(outcome.clone())) {
                Some(FetchEntry::InFlight(waiters)) => waiters,
                Some(FetchEntry::Done(previous)) => {
                    warn!("Fetch of {} completed twice; keeping the first outcome", url);
                    entries.insert(url.to_string(), FetchEntry::Done(previous));
                    return 0;
                }
                None => Vec::new(),
            }
        };
        let count = waiters.len();
        for waiter in waiters {
            waiter(&outcome);
        }
        count
    }
}

/// Request `resource`, running `waiter` once its outcome is known.
///
/// A URL that already failed is reported synchronously as `Err`.
pub(crate) fn request(
    runtime: &Runtime,
    resource: Resource,
    waiter: Waiter,
) -> Result<(), Arc<FetchError>> {
    match runtime.fetches().claim(&resource.url, waiter) {
        Claim::Start => {
            spawn_fetch(runtime, resource);
            Ok(())
        }
        Claim::Joined => {
            trace!("Joined in-flight fetch of {}", resource.url);
            Ok(())
        }
        Claim::Finished(Ok(()), waiter) => {
            trace!("Fetch cache hit for {}", resource.url);
            waiter(&Ok(()));
            Ok(())
        }
        Claim::Finished(Err(e), _) => Err(e),
    }
}

fn spawn_fetch(runtime: &Runtime, resource: Resource) {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => {
            warn!("No tokio runtime available to fetch {}", resource.url);
            let error = FetchError::NoExecutor {
                url: resource.url.clone(),
            };
            runtime.fetches().complete(&resource.url, Err(Arc::new(error)));
            return;
        }
    };

    let runtime = runtime.clone();
    handle.spawn(async move {
        debug!("Fetching {:?} {}", resource.kind, resource.url);
        let fetcher = runtime.fetcher();
        let outcome = fetcher.fetch(&resource, &runtime).await.map_err(Arc::new);
        match &outcome {
            Ok(()) => info!("Loaded {}", resource.url),
            Err(e) => warn!("Failed to load {}: {}", resource.url, e),
        }
        runtime.fetches().complete(&resource.url, outcome);
    });
}
