use std::sync::Arc;

use gather_core::{CollectionMode, GatherRequest, LaunchError};
use tracing::info;

use crate::backend::{ClusterBackend, ContextHandle, GatherPlan, RemoteSession};
use crate::config::GatherConfig;

/// Allocates execution contexts and starts the Remote Collector in them.
pub struct Launcher<B: ClusterBackend> {
    backend: Arc<B>,
    config: GatherConfig,
}

impl<B: ClusterBackend> Launcher<B> {
    pub fn new(backend: Arc<B>, config: GatherConfig) -> Self {
        Self { backend, config }
    }

    /// Resolve image, command and placement for `request`.
    pub async fn plan(&self, run_id: &str, request: &GatherRequest) -> GatherPlan {
        let mode = request.mode();
        let image = self.backend.resolve_image(request.image.as_deref()).await;
        let command = match mode {
            CollectionMode::Custom => request.command.clone(),
            CollectionMode::Default => self.config.image.default_command.clone(),
        };
        let source_dir = request
            .source_dir
            .clone()
            .unwrap_or_else(|| self.config.run.source_dir.clone());
        let node_name = request
            .node_name
            .clone()
            .or_else(|| self.config.kubernetes.node_name.clone());

        GatherPlan {
            run_id: run_id.to_string(),
            mode,
            image,
            command,
            source_dir,
            node_name,
            settle_secs: self.config.transfer.settle_secs,
        }
    }

    /// Create the context and start the collector. Fatal for the run on error; never retried.
    pub async fn launch(
        &self,
        ctx: &ContextHandle,
        plan: &GatherPlan,
    ) -> Result<RemoteSession, LaunchError> {
        if plan.command.is_empty() {
            return Err(LaunchError::InvalidRequest(
                "no collection command configured".into(),
            ));
        }
        info!(
            run_id = %plan.run_id,
            backend = self.backend.name(),
            context = %ctx.name,
            image = %plan.image,
            mode = ?plan.mode,
            source_dir = %plan.source_dir,
            "launching gather workload"
        );
        let session = self.backend.launch(ctx, plan).await?;
        info!(run_id = %plan.run_id, context = %ctx.name, "remote collector started");
        Ok(session)
    }
}
