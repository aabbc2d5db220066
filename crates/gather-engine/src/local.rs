use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use gather_core::LaunchError;
use tokio::process::Command;
use tracing::{debug, info};

use crate::backend::{ClusterBackend, ContextHandle, GatherPlan, RemoteSession, WorkloadPhase};
use crate::config::{ImageConfig, LocalConfig};
use crate::process::{kill_group, spawn_session};
use crate::stream::wrapper_args;

/// Runs the collector as a local process inside a per-run sandbox directory.
///
/// The sandbox stands in for the namespace; the remote source directory is
/// mapped beneath it.
pub struct LocalBackend {
    config: LocalConfig,
    image: ImageConfig,
    running: Mutex<HashMap<String, u32>>,
}

impl LocalBackend {
    pub fn new(config: LocalConfig, image: ImageConfig) -> Self {
        Self {
            config,
            image,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn sandbox(&self, ctx: &ContextHandle) -> PathBuf {
        self.config.sandbox_root().join(&ctx.name)
    }

    fn take_pid(&self, ctx: &ContextHandle) -> Option<u32> {
        self.running.lock().ok()?.remove(&ctx.run_id)
    }
}

impl ClusterBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn context_for(&self, run_id: &str) -> ContextHandle {
        ContextHandle {
            run_id: run_id.to_string(),
            name: format!("must-gather-{run_id}"),
        }
    }

    async fn resolve_image(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .unwrap_or_else(|| self.image.default.clone())
    }

    async fn launch(&self, ctx: &ContextHandle, plan: &GatherPlan) -> Result<RemoteSession, LaunchError> {
        let sandbox = self.sandbox(ctx);
        let source = sandbox.join(plan.source_dir.trim_start_matches('/'));
        tokio::fs::create_dir_all(&source).await?;

        let mut cmd = Command::new(&self.config.shell);
        cmd.args(wrapper_args(&source.to_string_lossy(), plan.settle_secs, &plan.command))
            .current_dir(&sandbox)
            .env("MUST_GATHER_IMAGE", &plan.image);

        let (session, pid) = spawn_session(cmd, true).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                LaunchError::Backend(format!("shell '{}' not found", self.config.shell))
            }
            _ => LaunchError::Io(e),
        })?;
        if let (Some(pid), Ok(mut running)) = (pid, self.running.lock()) {
            running.insert(ctx.run_id.clone(), pid);
        }
        info!(sandbox = %sandbox.display(), pid = ?pid, "local collector started");
        Ok(session)
    }

    async fn poll(&self, ctx: &ContextHandle) -> WorkloadPhase {
        let registered = self
            .running
            .lock()
            .map(|r| r.contains_key(&ctx.run_id))
            .unwrap_or(false);
        if registered {
            WorkloadPhase::Running
        } else {
            WorkloadPhase::Unknown
        }
    }

    async fn terminate(&self, ctx: &ContextHandle) {
        if let Some(pid) = self.take_pid(ctx) {
            debug!(pid, "killing local collector");
            kill_group(pid).await;
        }
    }

    async fn teardown(&self, ctx: &ContextHandle) -> anyhow::Result<()> {
        if let Some(pid) = self.take_pid(ctx) {
            kill_group(pid).await;
        }
        let sandbox = self.sandbox(ctx);
        match tokio::fs::remove_dir_all(&sandbox).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove sandbox {}", sandbox.display())),
        }
    }
}
