use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use gather_core::LaunchError;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, ContextHandle, GatherPlan, RemoteSession, WorkloadPhase};
use crate::config::{ImageConfig, KubernetesConfig};
use crate::process::{run_captured, spawn_session};
use crate::stream::wrapper_args;

pub const POD_NAME: &str = "must-gather";
pub const CONTAINER_NAME: &str = "gather";
/// Where the host log directory appears inside the collector container.
pub const HOST_LOG_MOUNT: &str = "/host/var/log";

const IMAGE_PULL_REASONS: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];

/// Keeps the container alive so the collector can be exec'd into it.
const IDLE_SCRIPT: &str = "trap 'exit 0' TERM INT; while :; do sleep 5; done";

/// Execution contexts as dedicated namespaces, driven through `kubectl`.
pub struct KubeBackend {
    config: KubernetesConfig,
    image: ImageConfig,
}

/// Pod state as far as launching and watching it is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodStatus {
    Pending(Option<String>),
    Running,
    ImagePull(String),
    Terminated(String),
}

impl KubeBackend {
    pub fn new(config: KubernetesConfig, image: ImageConfig) -> Self {
        Self { config, image }
    }

    pub fn namespace_for(&self, run_id: &str) -> String {
        format!("{}{run_id}", self.config.namespace_prefix)
    }

    fn kubectl(&self) -> Command {
        let mut cmd = Command::new(&self.config.kubectl);
        if let Some(path) = &self.config.kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        if let Some(context) = &self.config.context {
            cmd.arg("--context").arg(context);
        }
        cmd
    }

    async fn apply(&self, manifest: &Value) -> anyhow::Result<()> {
        let mut cmd = self.kubectl();
        cmd.args(["apply", "-f", "-"]);
        run_captured(cmd, Some(serde_json::to_vec(manifest)?)).await?;
        Ok(())
    }

    async fn get_pod(&self, namespace: &str) -> anyhow::Result<Value> {
        let mut cmd = self.kubectl();
        cmd.args(["get", "pod", POD_NAME, "-n", namespace, "-o", "json"]);
        let out = run_captured(cmd, None).await?;
        serde_json::from_str(&out).context("parse pod json")
    }

    async fn delete(&self, args: &[&str]) -> anyhow::Result<()> {
        let mut cmd = self.kubectl();
        cmd.arg("delete")
            .args(args)
            .args(["--ignore-not-found", "--wait=false"]);
        run_captured(cmd, None).await?;
        Ok(())
    }

    async fn wait_running(&self, namespace: &str) -> Result<(), LaunchError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.ready_timeout_secs);
        let poll_every = Duration::from_millis(self.config.poll_interval_ms.max(100));
        let mut last_hint = None;

        loop {
            match self.get_pod(namespace).await {
                Ok(pod) => match pod_status(&pod) {
                    PodStatus::Running => return Ok(()),
                    PodStatus::ImagePull(reason) => return Err(LaunchError::ImagePull(reason)),
                    PodStatus::Terminated(reason) => return Err(LaunchError::NotReady(reason)),
                    PodStatus::Pending(hint) => {
                        if hint.is_some() {
                            last_hint = hint;
                        }
                    }
                },
                Err(e) => {
                    let message = format!("{e:#}");
                    if let err @ (LaunchError::Forbidden(_) | LaunchError::QuotaExceeded(_)) =
                        LaunchError::classify(&message)
                    {
                        return Err(err);
                    }
                    debug!(namespace, error = %message, "pod not visible yet");
                }
            }

            if tokio::time::Instant::now() >= deadline {
                let mut reason = format!(
                    "pod {POD_NAME} not running after {}s",
                    self.config.ready_timeout_secs
                );
                if let Some(hint) = last_hint {
                    reason.push_str(": ");
                    reason.push_str(&hint);
                }
                return Err(LaunchError::NotReady(reason));
            }
            tokio::time::sleep(poll_every).await;
        }
    }
}

impl ClusterBackend for KubeBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    fn context_for(&self, run_id: &str) -> ContextHandle {
        ContextHandle {
            run_id: run_id.to_string(),
            name: self.namespace_for(run_id),
        }
    }

    async fn resolve_image(&self, requested: Option<&str>) -> String {
        if let Some(image) = requested {
            return image.to_string();
        }
        if self.image.resolve_from_cluster {
            let mut cmd = self.kubectl();
            cmd.args([
                "get",
                "imagestreamtag",
                "must-gather:latest",
                "-n",
                "openshift",
                "-o",
                "jsonpath={.image.dockerImageReference}",
            ]);
            match run_captured(cmd, None).await {
                Ok(out) if !out.trim().is_empty() => return out.trim().to_string(),
                Ok(_) => debug!("cluster publishes no must-gather image"),
                Err(e) => debug!(error = %e, "cluster must-gather image lookup failed"),
            }
        }
        self.image.default.clone()
    }

    async fn launch(&self, ctx: &ContextHandle, plan: &GatherPlan) -> Result<RemoteSession, LaunchError> {
        let namespace = ctx.name.as_str();
        let classify = |e: anyhow::Error| LaunchError::classify(&format!("{e:#}"));

        self.apply(&namespace_manifest(namespace)).await.map_err(classify)?;
        self.apply(&cluster_role_binding_manifest(
            &cluster_role_binding_name(&ctx.run_id),
            namespace,
        ))
        .await
        .map_err(classify)?;
        self.apply(&pod_manifest(namespace, plan, &self.config.host_log_dir))
            .await
            .map_err(classify)?;
        info!(namespace, image = %plan.image, "gather pod created; waiting for it to run");

        self.wait_running(namespace).await?;

        let mut cmd = self.kubectl();
        cmd.args(["exec", "-i", "-n", namespace, POD_NAME, "-c", CONTAINER_NAME, "--", "/bin/sh"])
            .args(wrapper_args(&plan.source_dir, plan.settle_secs, &plan.command));
        let (session, _) = spawn_session(cmd, false).map_err(|e| {
            LaunchError::Backend(format!("start {} exec: {e}", self.config.kubectl))
        })?;
        Ok(session)
    }

    async fn poll(&self, ctx: &ContextHandle) -> WorkloadPhase {
        match self.get_pod(&ctx.name).await {
            Ok(pod) => match pod_status(&pod) {
                PodStatus::Running => WorkloadPhase::Running,
                PodStatus::Pending(_) => WorkloadPhase::Unknown,
                PodStatus::ImagePull(reason) => WorkloadPhase::Failed(reason),
                PodStatus::Terminated(reason) => {
                    if pod["status"]["phase"].as_str() == Some("Succeeded") {
                        WorkloadPhase::Exited
                    } else {
                        WorkloadPhase::Failed(reason)
                    }
                }
            },
            Err(e) => {
                debug!(namespace = %ctx.name, error = %e, "pod status unavailable");
                WorkloadPhase::Unknown
            }
        }
    }

    async fn terminate(&self, ctx: &ContextHandle) {
        if let Err(e) = self
            .delete(&["pod", POD_NAME, "-n", ctx.name.as_str(), "--grace-period=0", "--force"])
            .await
        {
            warn!(namespace = %ctx.name, error = %e, "force delete of gather pod failed");
        }
    }

    async fn teardown(&self, ctx: &ContextHandle) -> anyhow::Result<()> {
        let crb = cluster_role_binding_name(&ctx.run_id);
        let crb_res = self
            .delete(&["clusterrolebinding", crb.as_str()])
            .await
            .with_context(|| format!("delete clusterrolebinding {crb}"));
        let ns_res = self
            .delete(&["namespace", ctx.name.as_str()])
            .await
            .with_context(|| format!("delete namespace {}", ctx.name));
        crb_res.and(ns_res)
    }
}

pub fn cluster_role_binding_name(run_id: &str) -> String {
    format!("must-gather-{run_id}")
}

pub fn namespace_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": {
                "openshift.io/run-level": "0",
                "app.kubernetes.io/managed-by": "must-gather"
            },
            "annotations": {
                "openshift.io/node-selector": ""
            }
        }
    })
}

/// Grants the namespace's default service account cluster-admin for the run.
pub fn cluster_role_binding_manifest(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": {
            "name": name,
            "labels": { "app.kubernetes.io/managed-by": "must-gather" }
        },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": "cluster-admin"
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": "default",
            "namespace": namespace
        }]
    })
}

pub fn pod_manifest(namespace: &str, plan: &GatherPlan, host_log_dir: &str) -> Value {
    let mut spec = json!({
        "restartPolicy": "Never",
        "terminationGracePeriodSeconds": 0,
        "priorityClassName": "system-cluster-critical",
        "serviceAccountName": "default",
        "tolerations": [{ "operator": "Exists" }],
        "containers": [{
            "name": CONTAINER_NAME,
            "image": plan.image,
            "imagePullPolicy": "IfNotPresent",
            "command": ["/bin/sh", "-c", IDLE_SCRIPT],
            "volumeMounts": [
                { "name": "must-gather-output", "mountPath": plan.source_dir },
                { "name": "host-logs", "mountPath": HOST_LOG_MOUNT, "readOnly": true }
            ]
        }],
        "volumes": [
            { "name": "must-gather-output", "emptyDir": {} },
            { "name": "host-logs", "hostPath": { "path": host_log_dir } }
        ]
    });
    match &plan.node_name {
        Some(node) => spec["nodeName"] = json!(node),
        None => spec["nodeSelector"] = json!({ "node-role.kubernetes.io/master": "" }),
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": POD_NAME,
            "namespace": namespace,
            "labels": { "app": "must-gather", "must-gather/run-id": plan.run_id }
        },
        "spec": spec
    })
}

/// Interpret `kubectl get pod -o json` output.
pub fn pod_status(pod: &Value) -> PodStatus {
    let status = &pod["status"];
    if let Some(statuses) = status["containerStatuses"].as_array() {
        for cs in statuses {
            let waiting = &cs["state"]["waiting"];
            if let Some(reason) = waiting["reason"].as_str() {
                if IMAGE_PULL_REASONS.contains(&reason) {
                    return PodStatus::ImagePull(match waiting["message"].as_str() {
                        Some(msg) if !msg.is_empty() => format!("{reason}: {msg}"),
                        _ => reason.to_string(),
                    });
                }
            }
        }
    }

    match status["phase"].as_str() {
        Some("Running") => PodStatus::Running,
        Some("Succeeded") => PodStatus::Terminated("pod completed".into()),
        Some("Failed") => PodStatus::Terminated(
            status["message"]
                .as_str()
                .or_else(|| status["reason"].as_str())
                .unwrap_or("pod failed")
                .to_string(),
        ),
        _ => PodStatus::Pending(
            status["conditions"]
                .as_array()
                .into_iter()
                .flatten()
                .find(|c| c["status"].as_str() == Some("False"))
                .and_then(|c| c["message"].as_str())
                .map(str::to_string),
        ),
    }
}

/// Kubeconfig the backend will use, for logging.
pub fn effective_kubeconfig(config: &KubernetesConfig) -> Option<PathBuf> {
    config
        .kubeconfig
        .clone()
        .or_else(|| std::env::var_os("KUBECONFIG").map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gather_core::CollectionMode;

    fn plan(node: Option<&str>) -> GatherPlan {
        GatherPlan {
            run_id: "01jabc".into(),
            mode: CollectionMode::Default,
            image: "quay.io/openshift/origin-must-gather:latest".into(),
            command: vec!["/usr/bin/gather".into()],
            source_dir: "/must-gather".into(),
            node_name: node.map(str::to_string),
            settle_secs: 2,
        }
    }

    #[test]
    fn namespace_is_run_level_zero() {
        let ns = namespace_manifest("openshift-must-gather-01jabc");
        assert_eq!(ns["metadata"]["labels"]["openshift.io/run-level"], "0");
        assert_eq!(ns["metadata"]["name"], "openshift-must-gather-01jabc");
    }

    #[test]
    fn binding_targets_namespace_default_account() {
        let crb = cluster_role_binding_manifest("must-gather-01jabc", "ns-a");
        assert_eq!(crb["roleRef"]["name"], "cluster-admin");
        assert_eq!(crb["subjects"][0]["namespace"], "ns-a");
        assert_eq!(crb["subjects"][0]["name"], "default");
    }

    #[test]
    fn pod_mounts_source_and_host_logs() {
        let pod = pod_manifest("ns-a", &plan(None), "/var/log");
        let container = &pod["spec"]["containers"][0];
        assert_eq!(container["name"], CONTAINER_NAME);
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/must-gather");
        assert_eq!(container["volumeMounts"][1]["mountPath"], HOST_LOG_MOUNT);
        assert_eq!(container["volumeMounts"][1]["readOnly"], true);
        assert_eq!(pod["spec"]["volumes"][1]["hostPath"]["path"], "/var/log");
        assert_eq!(pod["spec"]["nodeSelector"]["node-role.kubernetes.io/master"], "");
        assert!(pod["spec"].get("nodeName").is_none());
    }

    #[test]
    fn pod_pins_requested_node() {
        let pod = pod_manifest("ns-a", &plan(Some("master-1")), "/var/log");
        assert_eq!(pod["spec"]["nodeName"], "master-1");
        assert!(pod["spec"].get("nodeSelector").is_none());
    }

    #[test]
    fn detects_image_pull_failures() {
        let pod = json!({
            "status": {
                "phase": "Pending",
                "containerStatuses": [{
                    "state": { "waiting": { "reason": "ImagePullBackOff", "message": "Back-off pulling image" } }
                }]
            }
        });
        assert_eq!(
            pod_status(&pod),
            PodStatus::ImagePull("ImagePullBackOff: Back-off pulling image".into())
        );
    }

    #[test]
    fn reads_phases() {
        assert_eq!(pod_status(&json!({"status": {"phase": "Running"}})), PodStatus::Running);
        assert_eq!(
            pod_status(&json!({"status": {"phase": "Failed", "reason": "Evicted"}})),
            PodStatus::Terminated("Evicted".into())
        );
        let pending = json!({
            "status": {
                "phase": "Pending",
                "conditions": [{ "type": "PodScheduled", "status": "False", "message": "0/3 nodes are available" }]
            }
        });
        assert_eq!(
            pod_status(&pending),
            PodStatus::Pending(Some("0/3 nodes are available".into()))
        );
    }

    #[test]
    fn namespace_uses_prefix() {
        let backend = KubeBackend::new(KubernetesConfig::default(), ImageConfig::default());
        let ctx = backend.context_for("01jabc");
        assert_eq!(ctx.name, "openshift-must-gather-01jabc");
        assert_eq!(cluster_role_binding_name("01jabc"), "must-gather-01jabc");
    }
}
