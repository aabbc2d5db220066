use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gather_core::{RetryPolicy, DEFAULT_SOURCE_DIR};
use serde::{Deserialize, Serialize};

/// Which backend hosts the execution context.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Kubernetes,
    Local,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kubernetes" | "kube" | "k8s" => Ok(BackendKind::Kubernetes),
            "local" => Ok(BackendKind::Local),
            other => anyhow::bail!("unknown backend '{other}' (expected kubernetes or local)"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GatherConfig {
    pub run: RunConfig,
    pub image: ImageConfig,
    pub kubernetes: KubernetesConfig,
    pub transfer: TransferConfig,
    pub local: LocalConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    pub timeout_secs: u64,
    pub source_dir: String,
    pub backend: BackendKind,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            source_dir: DEFAULT_SOURCE_DIR.to_string(),
            backend: BackendKind::Kubernetes,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ImageConfig {
    /// Collection image used when none is requested and none is published in the cluster.
    pub default: String,
    /// Command run in default collection mode.
    pub default_command: Vec<String>,
    /// Look up `openshift/must-gather:latest` in the cluster before falling back to `default`.
    pub resolve_from_cluster: bool,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            default: "quay.io/openshift/origin-must-gather:latest".to_string(),
            default_command: vec!["/usr/bin/gather".to_string()],
            resolve_from_cluster: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubernetesConfig {
    pub kubectl: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub namespace_prefix: String,
    /// Node to pin the workload to when the request names none.
    pub node_name: Option<String>,
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Host directory mounted read-only into the workload for host service logs.
    pub host_log_dir: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
            namespace_prefix: "openshift-must-gather-".to_string(),
            node_name: None,
            ready_timeout_secs: 300,
            poll_interval_ms: 2_000,
            host_log_dir: "/var/log".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub read_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Seconds between tree scans in the streaming wrapper.
    pub settle_secs: u64,
    pub read_chunk_bytes: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            read_retries: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            settle_secs: 2,
            read_chunk_bytes: 64 * 1024,
        }
    }
}

impl TransferConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.read_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LocalConfig {
    /// Parent of per-run sandboxes. Defaults to the system temp dir.
    pub sandbox_root: Option<PathBuf>,
    pub shell: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            sandbox_root: None,
            shell: "/bin/sh".to_string(),
        }
    }
}

impl LocalConfig {
    pub fn sandbox_root(&self) -> PathBuf {
        self.sandbox_root
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

impl GatherConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let cfg: GatherConfig =
            toml::from_str(&s).with_context(|| format!("parse {}", path.display()))?;
        Ok(cfg)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let s = toml::to_string_pretty(self).with_context(|| "serialize toml")?;
        std::fs::write(path, s).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.run.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.kubernetes.poll_interval_ms.max(10))
    }
}
