#![forbid(unsafe_code)]

pub mod backend;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod kube;
pub mod launcher;
pub mod local;
mod process;
pub mod stream;
pub mod sync;
pub mod teardown;

use std::sync::Arc;

use gather_core::{GatherRequest, RunReport};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use backend::{ClusterBackend, ContextHandle, GatherPlan, RemoteSession, WorkloadPhase};
pub use config::{BackendKind, GatherConfig};
pub use coordinator::Coordinator;
pub use kube::KubeBackend;
pub use local::LocalBackend;

/// Run one gather against the backend named in `config`.
pub async fn gather(request: GatherRequest, config: GatherConfig, interrupt: CancellationToken) -> RunReport {
    match config.run.backend {
        BackendKind::Kubernetes => {
            if let Some(path) = kube::effective_kubeconfig(&config.kubernetes) {
                info!(kubeconfig = %path.display(), "using kubeconfig");
            }
            let backend = KubeBackend::new(config.kubernetes.clone(), config.image.clone());
            Coordinator::new(Arc::new(backend), config)
                .run_until(request, interrupt)
                .await
        }
        BackendKind::Local => {
            let backend = LocalBackend::new(config.local.clone(), config.image.clone());
            Coordinator::new(Arc::new(backend), config)
                .run_until(request, interrupt)
                .await
        }
    }
}
