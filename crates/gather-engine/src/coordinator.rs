use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gather_core::layout::{scan_tree, LayoutContract};
use gather_core::{
    new_run_id, now_ms, CollectionMode, FailureKind, FailureRecord, GatherManifest, GatherRequest,
    RunReport, RunResult, RunState,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{ClusterBackend, ContextHandle, ProcessExit, WorkloadPhase};
use crate::channel::{BoxedReader, TransferChannel};
use crate::config::GatherConfig;
use crate::launcher::Launcher;
use crate::sync::{DrainReport, OutputSynchronizer};
use crate::teardown::TeardownGuard;

/// How long the drain may run on after the workload was forcibly stopped.
pub const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Collector stderr lines kept for the summary.
pub const DIAGNOSTICS_TAIL: usize = 50;

/// Subject used for failures of the channel as a whole rather than one file.
pub const CHANNEL_SUBJECT: &str = "<channel>";

/// Drives one gather run from launch to teardown.
pub struct Coordinator<B: ClusterBackend> {
    backend: Arc<B>,
    config: GatherConfig,
    drain_grace: Duration,
}

/// What the running phase observed.
#[derive(Default)]
struct Observed {
    drain: DrainReport,
    process_code: Option<i32>,
    workload_failure: Option<String>,
    timed_out: bool,
    interrupted: bool,
}

impl<B: ClusterBackend> Coordinator<B> {
    pub fn new(backend: Arc<B>, config: GatherConfig) -> Self {
        Self {
            backend,
            config,
            drain_grace: DRAIN_GRACE,
        }
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub async fn run(&self, request: GatherRequest) -> RunReport {
        self.run_until(request, CancellationToken::new()).await
    }

    /// Like [`Coordinator::run`], but `interrupt` cuts the run short the way the deadline does.
    pub async fn run_until(&self, request: GatherRequest, interrupt: CancellationToken) -> RunReport {
        let run_id = new_run_id();
        let started_at_ms = now_ms();
        let mode = request.mode();
        let mut state = RunState::Launching;

        let ctx = self.backend.context_for(&run_id);
        let guard = TeardownGuard::arm(self.backend.clone(), ctx.clone());
        info!(run_id = %run_id, backend = self.backend.name(), mode = ?mode, "gather run starting");

        let mut report = RunReport {
            run_id: run_id.clone(),
            mode,
            image: request.image.clone(),
            dest_dir: request.dest_dir.display().to_string(),
            state,
            result: RunResult::Succeeded,
            remote_exit_code: None,
            manifest: GatherManifest::new(),
            notes: Vec::new(),
            diagnostics_tail: Vec::new(),
            started_at_ms,
            finished_at_ms: started_at_ms,
        };

        let launcher = Launcher::new(self.backend.clone(), self.config.clone());
        let launched = match request.validate() {
            Ok(()) => {
                let plan = launcher.plan(&run_id, &request).await;
                report.image = Some(plan.image.clone());
                launcher.launch(&ctx, &plan).await
            }
            Err(e) => Err(e),
        };

        let session = match launched {
            Ok(session) => session,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "launch failed");
                advance(&mut state, RunState::LaunchFailed);
                report.notes.extend(guard.release().await);
                report.state = state;
                report.result = RunResult::LaunchFailed(e.to_string());
                report.finished_at_ms = now_ms();
                return report;
            }
        };
        advance(&mut state, RunState::Running);

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTICS_TAIL)));
        let diagnostics = session
            .diagnostics
            .map(|reader| tokio::spawn(relay_diagnostics(reader, tail.clone())));

        let synchronizer =
            OutputSynchronizer::new(request.dest_dir.clone(), self.config.transfer.retry_policy());
        let stop = synchronizer.stop_token();
        let read_chunk = self.config.transfer.read_chunk_bytes;
        let output = session.output;
        let drain = tokio::spawn(async move {
            let mut channel = TransferChannel::with_read_chunk(output, read_chunk);
            synchronizer.drain(&mut channel).await
        });

        let observed = self
            .supervise(
                &ctx,
                session.exit,
                drain,
                session.cancel,
                stop,
                request.timeout,
                &interrupt,
            )
            .await;

        if let Some(mut handle) = diagnostics {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                debug!(run_id = %run_id, "collector stderr still open; tail truncated");
                handle.abort();
            }
        }

        // Teardown is scheduled before anything is derived from the run's output.
        report.notes.extend(guard.release().await);

        let Observed {
            drain,
            process_code,
            workload_failure,
            timed_out,
            interrupted,
        } = observed;

        report.remote_exit_code = drain.exit_code.or(process_code);
        report.diagnostics_tail = match tail.lock() {
            Ok(lines) => lines.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };

        let mut failures = Vec::new();
        if let Some(reason) = &drain.channel_error {
            if !drain.complete {
                failures.push(FailureRecord::new(
                    FailureKind::Transfer,
                    CHANNEL_SUBJECT,
                    reason.clone(),
                ));
            }
        }
        if let Some(reason) = workload_failure {
            failures.push(FailureRecord::new(FailureKind::RemoteStep, "workload", reason));
        }
        failures.extend(drain.errors.into_iter().map(FailureRecord::from));
        report.manifest = drain.manifest;

        if timed_out || interrupted {
            advance(&mut state, RunState::TimedOut);
            let reason = if interrupted {
                "run interrupted before the collector finished"
            } else {
                "deadline exceeded before the collector finished"
            };
            report.notes.push(FailureRecord::new(
                FailureKind::RemoteStep,
                "remote collector",
                reason,
            ));
            report.notes.extend(failures);
            report.result = RunResult::TimedOut;
        } else {
            advance(&mut state, RunState::Completed);
            if let Some(code) = report.remote_exit_code.filter(|c| *c != 0) {
                failures.push(FailureRecord::new(
                    FailureKind::RemoteStep,
                    "remote collector",
                    format!("exited with code {code}"),
                ));
            }
            failures.extend(validate_output(mode, &request.dest_dir));
            report.result = if failures.is_empty() {
                RunResult::Succeeded
            } else {
                RunResult::PartiallyFailed(failures)
            };
        }

        report.state = state;
        report.finished_at_ms = now_ms();
        info!(
            run_id = %run_id,
            outcome = report.result.label(),
            files = report.manifest.file_count(),
            bytes = report.manifest.total_bytes(),
            remote_exit_code = ?report.remote_exit_code,
            "gather run finished"
        );
        report
    }

    /// Wait jointly for process exit and drain completion, bounded by the deadline.
    #[allow(clippy::too_many_arguments)]
    async fn supervise(
        &self,
        ctx: &ContextHandle,
        mut exit: JoinHandle<ProcessExit>,
        mut drain: JoinHandle<DrainReport>,
        cancel: CancellationToken,
        stop: CancellationToken,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Observed {
        let mut observed = Observed::default();
        let mut process: Option<Option<i32>> = None;
        let mut drained: Option<DrainReport> = None;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let poll_every = self.config.poll_interval();
        let mut watchdog = tokio::time::interval_at(tokio::time::Instant::now() + poll_every, poll_every);
        watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while process.is_none() || drained.is_none() {
            tokio::select! {
                res = &mut exit, if process.is_none() => {
                    let code = process_code(res);
                    debug!(context = %ctx.name, code = ?code, "session process exited");
                    process = Some(code);
                }
                res = &mut drain, if drained.is_none() => {
                    drained = Some(drain_result(res));
                }
                _ = watchdog.tick(), if observed.workload_failure.is_none() && process.is_none() => {
                    if let WorkloadPhase::Failed(reason) = self.backend.poll(ctx).await {
                        warn!(context = %ctx.name, reason = %reason, "workload failed");
                        observed.workload_failure = Some(reason);
                        cancel.cancel();
                    }
                }
                _ = &mut deadline => {
                    warn!(context = %ctx.name, timeout_secs = timeout.as_secs(), "deadline exceeded; terminating workload");
                    observed.timed_out = true;
                    break;
                }
                _ = interrupt.cancelled() => {
                    warn!(context = %ctx.name, "interrupted; terminating workload");
                    observed.interrupted = true;
                    break;
                }
            }
        }

        if observed.timed_out || observed.interrupted {
            cancel.cancel();
            self.backend.terminate(ctx).await;

            if drained.is_none() {
                drained = Some(match tokio::time::timeout(self.drain_grace, &mut drain).await {
                    Ok(res) => drain_result(res),
                    Err(_) => {
                        stop.cancel();
                        drain_result(drain.await)
                    }
                });
            }
            if process.is_none() {
                match tokio::time::timeout(self.drain_grace, &mut exit).await {
                    Ok(res) => process = Some(process_code(res)),
                    Err(_) => exit.abort(),
                }
            }
        }

        observed.drain = drained.unwrap_or_default();
        observed.process_code = process.flatten();
        observed
    }
}

fn advance(state: &mut RunState, next: RunState) {
    debug_assert!(state.can_transition_to(next), "{state:?} -> {next:?}");
    debug!(from = ?*state, to = ?next, "run state");
    *state = next;
}

fn process_code(res: Result<ProcessExit, JoinError>) -> Option<i32> {
    match res {
        Ok(Ok(code)) => code,
        Ok(Err(e)) => {
            warn!(error = %e, "waiting for session process failed");
            None
        }
        Err(e) => {
            warn!(error = %e, "session task failed");
            None
        }
    }
}

fn drain_result(res: Result<DrainReport, JoinError>) -> DrainReport {
    res.unwrap_or_else(|e| DrainReport {
        channel_error: Some(format!("synchronizer task failed: {e}")),
        ..DrainReport::default()
    })
}

/// Post-run checks over the destination tree.
fn validate_output(mode: CollectionMode, dest: &std::path::Path) -> Vec<FailureRecord> {
    match mode {
        CollectionMode::Default => LayoutContract::default_collection().validate(dest),
        CollectionMode::Custom => scan_tree(dest, false),
    }
}

/// Tails collector stderr until EOF. Undecodable bytes are logged lossily and a
/// read error never closes the pipe early, so the collector is not killed by SIGPIPE.
async fn relay_diagnostics(reader: BoxedReader, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                debug!(target: "collector", "{line}");
                let mut tail = match tail.lock() {
                    Ok(tail) => tail,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if tail.len() == DIAGNOSTICS_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "collector stderr read failed; discarding until EOF");
                if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                    debug!(error = %e, "collector stderr closed");
                }
                return;
            }
        }
    }
}
