//! Output layout contract for default collection runs.

use std::path::Path;

use walkdir::WalkDir;

use crate::model::{FailureKind, FailureRecord};
use crate::paths::is_partial_name;

/// Smallest size a dump of a populated resource type can have.
pub const MIN_DUMP_SIZE: u64 = 100;

pub const REQUIRED_DIRECTORIES: &[&str] = &[
    "cluster-scoped-resources/config.openshift.io",
    "cluster-scoped-resources/operator.openshift.io",
    "cluster-scoped-resources/core",
    "cluster-scoped-resources/apiregistration.k8s.io",
    "namespaces/openshift",
    "namespaces/openshift-kube-apiserver-operator",
];

pub const REQUIRED_FILES: &[&str] = &[
    "cluster-scoped-resources/config.openshift.io/apiservers.yaml",
    "cluster-scoped-resources/config.openshift.io/authentications.yaml",
    "cluster-scoped-resources/config.openshift.io/builds.yaml",
    "cluster-scoped-resources/config.openshift.io/clusteroperators.yaml",
    "cluster-scoped-resources/config.openshift.io/clusterversions.yaml",
    "cluster-scoped-resources/config.openshift.io/consoles.yaml",
    "cluster-scoped-resources/config.openshift.io/dnses.yaml",
    "cluster-scoped-resources/config.openshift.io/featuregates.yaml",
    "cluster-scoped-resources/config.openshift.io/images.yaml",
    "cluster-scoped-resources/config.openshift.io/infrastructures.yaml",
    "cluster-scoped-resources/config.openshift.io/ingresses.yaml",
    "cluster-scoped-resources/config.openshift.io/networks.yaml",
    "cluster-scoped-resources/config.openshift.io/oauths.yaml",
    "cluster-scoped-resources/config.openshift.io/projects.yaml",
    "cluster-scoped-resources/config.openshift.io/schedulers.yaml",
    "namespaces/openshift-kube-apiserver/core/configmaps.yaml",
    "namespaces/openshift-kube-apiserver/core/secrets.yaml",
    "audit_logs/kube-apiserver.audit_logs_listing",
    "audit_logs/openshift-apiserver.audit_logs_listing",
    "host_service_logs/masters/crio_service.log",
    "host_service_logs/masters/kubelet_service.log",
];

/// Files every directory under `namespaces/` must carry.
pub const PER_NAMESPACE_FILES: &[&str] = &["core/configmaps.yaml", "core/secrets.yaml"];

/// Directories and files a default collection run must leave behind.
#[derive(Debug, Clone)]
pub struct LayoutContract {
    pub directories: Vec<String>,
    pub files: Vec<String>,
    pub per_namespace_files: Vec<String>,
    pub min_file_size: u64,
}

impl LayoutContract {
    pub fn default_collection() -> Self {
        Self {
            directories: REQUIRED_DIRECTORIES.iter().map(|s| s.to_string()).collect(),
            files: REQUIRED_FILES.iter().map(|s| s.to_string()).collect(),
            per_namespace_files: PER_NAMESPACE_FILES.iter().map(|s| s.to_string()).collect(),
            min_file_size: MIN_DUMP_SIZE,
        }
    }

    /// Check `dest` against the contract. An empty result means the tree conforms.
    pub fn validate(&self, dest: &Path) -> Vec<FailureRecord> {
        let mut out = Vec::new();

        for dir in &self.directories {
            if !dest.join(dir).is_dir() {
                out.push(violation(dir, "required directory is missing"));
            }
        }

        for file in &self.files {
            check_dump(dest, file, self.min_file_size, &mut out);
        }

        if let Ok(entries) = std::fs::read_dir(dest.join("namespaces")) {
            let mut namespaces: Vec<String> = entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            namespaces.sort();
            for ns in namespaces {
                for file in &self.per_namespace_files {
                    let rel = format!("namespaces/{ns}/{file}");
                    if self.files.contains(&rel) {
                        continue;
                    }
                    if !dest.join(&rel).is_file() {
                        out.push(violation(&rel, "required namespace dump is missing"));
                    }
                }
            }
        }

        out.extend(scan_tree(dest, true));
        out
    }
}

fn check_dump(dest: &Path, rel: &str, min_size: u64, out: &mut Vec<FailureRecord>) {
    match std::fs::metadata(dest.join(rel)) {
        Ok(meta) if meta.is_file() => {
            if meta.len() < min_size {
                out.push(violation(
                    rel,
                    format!("file is {} bytes, expected at least {min_size}", meta.len()),
                ));
            }
        }
        Ok(_) => out.push(violation(rel, "expected a file")),
        Err(_) => out.push(violation(rel, "required file is missing")),
    }
}

/// Tree-wide checks: no leftover staging files, and with `flag_empty` no
/// zero-length files either.
pub fn scan_tree(dest: &Path, flag_empty: bool) -> Vec<FailureRecord> {
    let mut out = Vec::new();
    for entry in WalkDir::new(dest).follow_links(false).sort_by_file_name() {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dest)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let name = entry.file_name().to_string_lossy();
        if is_partial_name(&name) {
            out.push(violation(&rel, "partially transferred file left behind"));
            continue;
        }
        if !flag_empty {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if meta.len() == 0 {
                out.push(violation(&rel, "file is empty"));
            }
        }
    }
    out
}

fn violation(subject: &str, reason: impl Into<String>) -> FailureRecord {
    FailureRecord::new(FailureKind::Validation, subject, reason)
}
