use std::sync::Arc;

use gather_core::{FailureKind, FailureRecord};
use tracing::{info, warn};

use crate::backend::{ClusterBackend, ContextHandle};

/// Owns an execution context until it is released.
///
/// The context is torn down exactly once: either through [`TeardownGuard::release`]
/// on the normal path, or from `Drop` when the run is abandoned (panic, task
/// abort). The drop path needs a tokio runtime and is skipped without one.
pub struct TeardownGuard<B: ClusterBackend> {
    backend: Arc<B>,
    ctx: Option<ContextHandle>,
}

impl<B: ClusterBackend> TeardownGuard<B> {
    pub fn arm(backend: Arc<B>, ctx: ContextHandle) -> Self {
        Self {
            backend,
            ctx: Some(ctx),
        }
    }

    pub fn context(&self) -> Option<&ContextHandle> {
        self.ctx.as_ref()
    }

    /// Tear the context down. A failure becomes a report note, never the run outcome.
    pub async fn release(mut self) -> Option<FailureRecord> {
        let ctx = self.ctx.take()?;
        match self.backend.teardown(&ctx).await {
            Ok(()) => {
                info!(context = %ctx.name, backend = self.backend.name(), "execution context released");
                None
            }
            Err(e) => {
                warn!(context = %ctx.name, error = %e, "teardown failed");
                Some(FailureRecord::new(
                    FailureKind::Teardown,
                    ctx.name,
                    format!("{e:#}"),
                ))
            }
        }
    }
}

impl<B: ClusterBackend> Drop for TeardownGuard<B> {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(context = %ctx.name, "no runtime left to release execution context");
            return;
        };
        let backend = self.backend.clone();
        warn!(context = %ctx.name, "run abandoned; releasing execution context");
        handle.spawn(async move {
            if let Err(e) = backend.teardown(&ctx).await {
                warn!(context = %ctx.name, error = %e, "teardown failed");
            }
        });
    }
}
