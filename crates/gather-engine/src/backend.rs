use std::future::Future;
use std::io;

use gather_core::{CollectionMode, LaunchError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::BoxedReader;

/// Names of the disposable environment owned by one gather run.
///
/// Derived from the run id alone, before anything is created, so teardown can
/// always target it, even after a partial allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextHandle {
    pub run_id: String,
    /// Namespace (kubernetes) or sandbox directory name (local).
    pub name: String,
}

/// Fully resolved launch parameters.
#[derive(Debug, Clone)]
pub struct GatherPlan {
    pub run_id: String,
    pub mode: CollectionMode,
    pub image: String,
    /// Collector command run inside the context.
    pub command: Vec<String>,
    pub source_dir: String,
    pub node_name: Option<String>,
    pub settle_secs: u64,
}

/// Lifecycle phase of the workload, as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadPhase {
    Running,
    Exited,
    Failed(String),
    Unknown,
}

/// Exit status of the process carrying the Transfer Channel. `None` when killed.
pub type ProcessExit = io::Result<Option<i32>>;

/// A started Remote Collector.
pub struct RemoteSession {
    /// Transfer Channel bytes.
    pub output: BoxedReader,
    /// Collector stderr, relayed into logs.
    pub diagnostics: Option<BoxedReader>,
    pub exit: JoinHandle<ProcessExit>,
    /// Cancelling kills the session process; `exit` then resolves.
    pub cancel: CancellationToken,
}

/// Where execution contexts live.
pub trait ClusterBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn context_for(&self, run_id: &str) -> ContextHandle;

    /// Image to run when `requested` is `None`.
    fn resolve_image(&self, requested: Option<&str>) -> impl Future<Output = String> + Send;

    /// Allocate the context and start the collector inside it.
    fn launch(
        &self,
        ctx: &ContextHandle,
        plan: &GatherPlan,
    ) -> impl Future<Output = Result<RemoteSession, LaunchError>> + Send;

    fn poll(&self, ctx: &ContextHandle) -> impl Future<Output = WorkloadPhase> + Send;

    /// Forcibly stop the workload. Best effort.
    fn terminate(&self, ctx: &ContextHandle) -> impl Future<Output = ()> + Send;

    /// Delete everything the context owns. Idempotent.
    fn teardown(&self, ctx: &ContextHandle) -> impl Future<Output = anyhow::Result<()>> + Send;
}
