#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gather_core::{FailureKind, GatherRequest, RunResult};
use gather_engine::{Coordinator, GatherConfig, LocalBackend};

fn local(sandbox_root: &Path) -> Coordinator<LocalBackend> {
    let mut cfg = GatherConfig::default();
    cfg.local.sandbox_root = Some(sandbox_root.to_path_buf());
    cfg.transfer.settle_secs = 1;
    cfg.kubernetes.poll_interval_ms = 200;
    let backend = LocalBackend::new(cfg.local.clone(), cfg.image.clone());
    Coordinator::new(Arc::new(backend), cfg).with_drain_grace(Duration::from_secs(5))
}

fn shell(script: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into()]
}

fn entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn custom_command_output_lands_in_destination() {
    let sandboxes = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let request = GatherRequest::new(dest.path())
        .with_command(shell("ls -l / > \"$GATHER_SOURCE_DIR/ls.log\""))
        .with_timeout(Duration::from_secs(60));
    let report = local(sandboxes.path()).run(request).await;

    assert_eq!(report.result, RunResult::Succeeded, "{}", report.summary());
    assert_eq!(entries(dest.path()), vec!["ls.log".to_string()]);
    assert!(std::fs::metadata(dest.path().join("ls.log")).unwrap().len() > 0);
    assert!(entries(sandboxes.path()).is_empty(), "sandbox left behind");
}

#[tokio::test]
async fn large_files_arrive_intact() {
    let sandboxes = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let request = GatherRequest::new(dest.path())
        .with_command(shell(
            "mkdir -p nested/deeper && head -c 1048576 /dev/zero > nested/deeper/big.bin && : > empty.txt",
        ))
        .with_timeout(Duration::from_secs(60));
    let report = local(sandboxes.path()).run(request).await;

    assert_eq!(report.result, RunResult::Succeeded, "{}", report.summary());
    let big = std::fs::read(dest.path().join("nested/deeper/big.bin")).unwrap();
    assert_eq!(big.len(), 1_048_576);
    assert!(big.iter().all(|b| *b == 0));
    assert_eq!(std::fs::metadata(dest.path().join("empty.txt")).unwrap().len(), 0);
    assert_eq!(report.manifest.total_bytes(), 1_048_576);
}

#[tokio::test]
async fn failing_command_still_transfers_output() {
    let sandboxes = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let request = GatherRequest::new(dest.path())
        .with_source_dir("/work")
        .with_command(shell("mkdir -p sub && printf hello > sub/a.txt && exit 3"))
        .with_timeout(Duration::from_secs(60));
    let report = local(sandboxes.path()).run(request).await;

    let RunResult::PartiallyFailed(failures) = &report.result else {
        panic!("unexpected result: {}", report.summary());
    };
    assert_eq!(report.remote_exit_code, Some(3));
    assert!(failures.iter().all(|f| f.kind == FailureKind::RemoteStep));
    assert_eq!(std::fs::read(dest.path().join("sub/a.txt")).unwrap(), b"hello");
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn timeout_kills_the_collector() {
    let sandboxes = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let started = Instant::now();
    let request = GatherRequest::new(dest.path())
        .with_command(shell("printf done > early.txt; sleep 30"))
        .with_timeout(Duration::from_secs(3));
    let report = local(sandboxes.path()).run(request).await;

    assert_eq!(report.result, RunResult::TimedOut, "{}", report.summary());
    assert!(started.elapsed() < Duration::from_secs(20));
    for name in entries(dest.path()) {
        assert!(!name.ends_with(".gather-partial"), "partial file {name} left behind");
        assert_eq!(name, "early.txt");
        assert_eq!(std::fs::read(dest.path().join(&name)).unwrap(), b"done");
    }
    assert!(entries(sandboxes.path()).is_empty(), "sandbox left behind");
}

#[tokio::test]
async fn binary_collector_chatter_does_not_kill_it() {
    let sandboxes = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let script = "printf '\\377\\376\\n'; sleep 1; \
                  i=0; while [ $i -lt 200 ]; do echo \"line $i\"; i=$((i+1)); done; \
                  printf ok > ls.log";
    let request = GatherRequest::new(dest.path())
        .with_command(shell(script))
        .with_timeout(Duration::from_secs(60));
    let report = local(sandboxes.path()).run(request).await;

    assert_eq!(report.result, RunResult::Succeeded, "{}", report.summary());
    assert_eq!(report.remote_exit_code, Some(0));
    assert_eq!(std::fs::read(dest.path().join("ls.log")).unwrap(), b"ok");
    assert!(report.diagnostics_tail.iter().any(|l| l == "line 199"));
}

#[tokio::test]
async fn destination_tracks_rewrites_and_renames() {
    let sandboxes = tempfile::tempdir().unwrap();
    let dest = tempfile::tempdir().unwrap();

    let script = "printf aaaa > state.txt; printf x > tmp.part; mkdir -p scratch; \
                  printf y > scratch/w.txt; sleep 4; \
                  printf bbbb > state.txt; mv tmp.part final.txt; rm -r scratch";
    let request = GatherRequest::new(dest.path())
        .with_command(shell(script))
        .with_timeout(Duration::from_secs(60));
    let report = local(sandboxes.path()).run(request).await;

    assert_eq!(report.result, RunResult::Succeeded, "{}", report.summary());
    assert_eq!(std::fs::read(dest.path().join("state.txt")).unwrap(), b"bbbb");
    assert_eq!(std::fs::read(dest.path().join("final.txt")).unwrap(), b"x");
    assert_eq!(entries(dest.path()), vec!["final.txt".to_string(), "state.txt".to_string()]);
    let listed: Vec<_> = report.manifest.nodes().map(|n| n.path).collect();
    assert_eq!(listed, vec!["final.txt".to_string(), "state.txt".to_string()]);
}
