//! Integration tests for the core crate.

use std::time::Duration;

use gather_core::{
    CollectionMode, FailureKind, FailureRecord, GatherManifest, GatherRequest, LaunchError,
    OutputKind, OutputNode, RunReport, RunResult, RunState, TransferError,
};

#[test]
fn test_run_result_serde() {
    let ok = RunResult::Succeeded;
    let serialized = serde_json::to_string(&ok).unwrap();
    assert_eq!(serialized, r#"{"outcome":"succeeded"}"#);
    let deserialized: RunResult = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, ok);

    let partial = RunResult::PartiallyFailed(vec![FailureRecord::new(
        FailureKind::RemoteStep,
        "remote collector",
        "exited with code 1",
    )]);
    let serialized = serde_json::to_string(&partial).unwrap();
    let deserialized: RunResult = serde_json::from_str(&serialized).unwrap();
    assert_eq!(deserialized, partial);
}

#[test]
fn test_exit_codes() {
    assert_eq!(RunResult::Succeeded.exit_code(), 0);
    assert_ne!(RunResult::PartiallyFailed(vec![]).exit_code(), 0);
    assert_ne!(RunResult::TimedOut.exit_code(), 0);
    assert_ne!(RunResult::LaunchFailed("no".into()).exit_code(), 0);
}

#[test]
fn test_output_node_serde() {
    let node = OutputNode {
        path: "host_service_logs/masters/kubelet_service.log".into(),
        kind: OutputKind::File { size: 4096 },
    };
    let serialized = serde_json::to_value(&node).unwrap();
    assert_eq!(
        serialized,
        serde_json::json!({
            "path": "host_service_logs/masters/kubelet_service.log",
            "type": "file",
            "size": 4096
        })
    );
    let deserialized: OutputNode = serde_json::from_value(serialized).unwrap();
    assert_eq!(deserialized, node);
}

#[test]
fn test_transfer_error_becomes_failure_record() {
    let rec: FailureRecord = TransferError::new("a/b.yaml", "channel closed").into();
    assert_eq!(rec.kind, FailureKind::Transfer);
    assert_eq!(rec.subject, "a/b.yaml");
}

#[test]
fn test_request_validation() {
    let dir = tempfile::tempdir().unwrap();

    let fresh = GatherRequest::new(dir.path().join("not-yet-created"));
    assert!(fresh.validate().is_ok());

    let empty = GatherRequest::new(dir.path());
    assert!(empty.validate().is_ok());

    std::fs::write(dir.path().join("stale"), b"x").unwrap();
    let non_empty = GatherRequest::new(dir.path());
    assert!(matches!(
        non_empty.validate(),
        Err(LaunchError::InvalidRequest(_))
    ));

    let is_file = GatherRequest::new(dir.path().join("stale"));
    assert!(matches!(is_file.validate(), Err(LaunchError::InvalidRequest(_))));

    let relative_source = GatherRequest::new(dir.path().join("x")).with_source_dir("artifacts");
    assert!(relative_source.validate().is_err());

    let zero_timeout = GatherRequest::new(dir.path().join("y")).with_timeout(Duration::ZERO);
    assert!(zero_timeout.validate().is_err());
}

#[test]
fn test_custom_request() {
    let req = GatherRequest::new("/tmp/out")
        .with_source_dir("/artifacts")
        .with_command(["/bin/bash", "-c", "ls -l > /artifacts/ls.log"]);
    assert_eq!(req.mode(), CollectionMode::Custom);
    assert_eq!(req.resolved_source_dir(), "/artifacts");
    assert!(req.image.is_none());
}

#[test]
fn test_report_summary_lists_failures() {
    let mut manifest = GatherManifest::new();
    manifest.record_directory("audit_logs");
    manifest.record_file("audit_logs/kube-apiserver.audit_logs_listing", 300);
    let report = RunReport {
        run_id: "01j".into(),
        mode: CollectionMode::Default,
        image: Some("quay.io/openshift/origin-must-gather:latest".into()),
        dest_dir: "/tmp/out".into(),
        state: RunState::Completed,
        result: RunResult::PartiallyFailed(vec![
            FailureRecord::new(FailureKind::RemoteStep, "remote collector", "exited with code 2"),
            FailureRecord::new(FailureKind::Transfer, "namespaces/x/core/secrets.yaml", "channel closed"),
        ]),
        remote_exit_code: Some(2),
        manifest,
        notes: vec![],
        diagnostics_tail: vec!["error: the server doesn't have a resource type \"foo\"".into()],
        started_at_ms: 1,
        finished_at_ms: 2,
    };
    let text = report.summary();
    assert!(text.contains("partially failed"));
    assert!(text.contains("[remote] remote collector: exited with code 2"));
    assert!(text.contains("[transfer] namespaces/x/core/secrets.yaml"));
    assert!(text.contains("transferred 1 files (300 bytes), 1 directories"));
    assert!(text.contains("resource type"));
    assert_eq!(report.exit_code(), 1);
}

#[test]
fn test_manifest_remove_prunes_subtree() {
    let mut manifest = GatherManifest::new();
    manifest.record_directory("logs");
    manifest.record_file("logs/a.log", 10);
    manifest.record_file("logs/old/b.log", 20);
    manifest.record_file("logsheet.txt", 5);

    manifest.remove("logs/a.log");
    assert_eq!(manifest.total_bytes(), 25);

    manifest.remove("logs");
    let left: Vec<_> = manifest.nodes().map(|n| n.path).collect();
    assert_eq!(left, vec!["logsheet.txt".to_string()]);
}
