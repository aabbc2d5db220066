use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, TransferError};
use crate::time::EpochMs;

/// Remote work directory the collector writes into unless overridden.
pub const DEFAULT_SOURCE_DIR: &str = "/must-gather";

/// Default deadline for one gather run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Whether the built-in collection script runs or a caller-supplied command replaces it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    Default,
    Custom,
}

/// Immutable input for one gather run.
#[derive(Debug, Clone)]
pub struct GatherRequest {
    /// Local destination directory.
    pub dest_dir: PathBuf,
    /// Remote work directory; `None` means [`DEFAULT_SOURCE_DIR`].
    pub source_dir: Option<String>,
    /// Collection image; `None` means the backend's default image.
    pub image: Option<String>,
    /// Custom command replacing the default collection script. Empty means default collection.
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Pin the workload to one node instead of any control-plane node.
    pub node_name: Option<String>,
}

impl GatherRequest {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            source_dir: None,
            image: None,
            command: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            node_name: None,
        }
    }

    pub fn with_source_dir(mut self, dir: impl Into<String>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_command<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = argv.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_node_name(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self
    }

    pub fn mode(&self) -> CollectionMode {
        if self.command.is_empty() {
            CollectionMode::Default
        } else {
            CollectionMode::Custom
        }
    }

    pub fn resolved_source_dir(&self) -> &str {
        self.source_dir.as_deref().unwrap_or(DEFAULT_SOURCE_DIR)
    }

    /// Check the request before anything is allocated in the cluster.
    pub fn validate(&self) -> Result<(), LaunchError> {
        validate_destination(&self.dest_dir)?;

        let source = self.resolved_source_dir();
        if !source.starts_with('/') {
            return Err(LaunchError::InvalidRequest(format!(
                "source directory must be an absolute path: {source}"
            )));
        }
        if source.split('/').any(|c| c == "..") {
            return Err(LaunchError::InvalidRequest(format!(
                "source directory must not contain '..': {source}"
            )));
        }
        if let Some(first) = self.command.first() {
            if first.trim().is_empty() {
                return Err(LaunchError::InvalidRequest(
                    "custom command has an empty program".into(),
                ));
            }
        }
        if self.timeout.is_zero() {
            return Err(LaunchError::InvalidRequest("timeout must be non-zero".into()));
        }
        Ok(())
    }
}

fn validate_destination(dest: &Path) -> Result<(), LaunchError> {
    let meta = match std::fs::metadata(dest) {
        Ok(m) => m,
        // Creatable: the synchronizer creates it on first write.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(LaunchError::Io(e)),
    };
    if !meta.is_dir() {
        return Err(LaunchError::InvalidRequest(format!(
            "destination '{}' exists and is not a directory",
            dest.display()
        )));
    }
    if meta.permissions().readonly() {
        return Err(LaunchError::InvalidRequest(format!(
            "destination '{}' is not writable",
            dest.display()
        )));
    }
    let mut entries = std::fs::read_dir(dest)?;
    if entries.next().is_some() {
        return Err(LaunchError::InvalidRequest(format!(
            "destination '{}' is not empty",
            dest.display()
        )));
    }
    Ok(())
}

/// Shape of one entry in the produced tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputKind {
    Directory,
    File { size: u64 },
}

/// A relative path in the destination plus its shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputNode {
    pub path: String,
    #[serde(flatten)]
    pub kind: OutputKind,
}

/// Every entry written to the destination during one run.
///
/// Keyed by relative path, so a file that is re-sent replaces its earlier entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatherManifest {
    nodes: BTreeMap<String, OutputKind>,
}

impl GatherManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_directory(&mut self, path: impl Into<String>) {
        self.nodes.insert(path.into(), OutputKind::Directory);
    }

    pub fn record_file(&mut self, path: impl Into<String>, size: u64) {
        self.nodes.insert(path.into(), OutputKind::File { size });
    }

    /// Forget `path` and, when it was a directory, everything recorded beneath it.
    pub fn remove(&mut self, path: &str) {
        if self.nodes.remove(path) == Some(OutputKind::Directory) {
            let prefix = format!("{path}/");
            self.nodes.retain(|p, _| !p.starts_with(&prefix));
        }
    }

    pub fn get(&self, path: &str) -> Option<OutputKind> {
        self.nodes.get(path).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = OutputNode> + '_ {
        self.nodes.iter().map(|(path, kind)| OutputNode {
            path: path.clone(),
            kind: *kind,
        })
    }

    pub fn files(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.nodes.iter().filter_map(|(p, k)| match k {
            OutputKind::File { size } => Some((p.as_str(), *size)),
            OutputKind::Directory => None,
        })
    }

    pub fn directories(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes
            .iter()
            .filter(|(_, k)| matches!(k, OutputKind::Directory))
            .map(|(p, _)| p.as_str())
    }

    pub fn file_count(&self) -> usize {
        self.files().count()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files().map(|(_, size)| size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// What a failure record refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A dump step inside the remote collector failed.
    RemoteStep,
    /// One file could not be copied to the destination.
    Transfer,
    /// The produced tree violates the output layout contract.
    Validation,
    /// Releasing the execution context failed. Informational only.
    Teardown,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            FailureKind::RemoteStep => "remote",
            FailureKind::Transfer => "transfer",
            FailureKind::Validation => "validation",
            FailureKind::Teardown => "teardown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureRecord {
    pub kind: FailureKind,
    /// Path or step name the failure is about.
    pub subject: String,
    pub reason: String,
}

impl FailureRecord {
    pub fn new(kind: FailureKind, subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            reason: reason.into(),
        }
    }
}

impl From<TransferError> for FailureRecord {
    fn from(e: TransferError) -> Self {
        FailureRecord::new(FailureKind::Transfer, e.path, e.reason)
    }
}

/// Terminal outcome of one gather run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded,
    PartiallyFailed(Vec<FailureRecord>),
    TimedOut,
    LaunchFailed(String),
}

impl RunResult {
    /// Process exit status: 0 only for a fully successful run.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunResult::Succeeded => 0,
            RunResult::PartiallyFailed(_) => 1,
            RunResult::TimedOut => 2,
            RunResult::LaunchFailed(_) => 3,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Succeeded)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunResult::Succeeded => "succeeded",
            RunResult::PartiallyFailed(_) => "partially failed",
            RunResult::TimedOut => "timed out",
            RunResult::LaunchFailed(_) => "launch failed",
        }
    }
}

/// Completion Coordinator states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Launching,
    Running,
    Completed,
    TimedOut,
    LaunchFailed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::TimedOut | RunState::LaunchFailed
        )
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::Launching, RunState::Running)
                | (RunState::Launching, RunState::LaunchFailed)
                | (RunState::Running, RunState::Completed)
                | (RunState::Running, RunState::TimedOut)
        )
    }
}

/// Everything the caller learns about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: CollectionMode,
    pub image: Option<String>,
    pub dest_dir: String,
    pub state: RunState,
    pub result: RunResult,
    /// Exit status of the remote collector, when it was observed.
    pub remote_exit_code: Option<i32>,
    pub manifest: GatherManifest,
    /// Notes that do not affect the result, such as teardown failures.
    #[serde(default)]
    pub notes: Vec<FailureRecord>,
    /// Last lines the remote collector wrote to stderr.
    #[serde(default)]
    pub diagnostics_tail: Vec<String>,
    pub started_at_ms: EpochMs,
    pub finished_at_ms: EpochMs,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.result.exit_code()
    }

    /// Human-readable summary listing every failing step or file.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "must-gather run {}: {}", self.run_id, self.result.label());
        let _ = writeln!(out, "  destination: {}", self.dest_dir);
        if let Some(image) = &self.image {
            let _ = writeln!(out, "  image: {image}");
        }
        match self.remote_exit_code {
            Some(code) => {
                let _ = writeln!(out, "  remote collector exit code: {code}");
            }
            None => {
                let _ = writeln!(out, "  remote collector exit code: unknown");
            }
        }
        let _ = writeln!(
            out,
            "  transferred {} files ({} bytes), {} directories",
            self.manifest.file_count(),
            self.manifest.total_bytes(),
            self.manifest.directories().count()
        );

        match &self.result {
            RunResult::PartiallyFailed(failures) => {
                let _ = writeln!(out, "  failures:");
                for f in failures {
                    let _ = writeln!(out, "    - [{}] {}: {}", f.kind.label(), f.subject, f.reason);
                }
            }
            RunResult::LaunchFailed(reason) => {
                let _ = writeln!(out, "  launch error: {reason}");
            }
            RunResult::TimedOut => {
                let _ = writeln!(
                    out,
                    "  deadline exceeded; files present in the destination are complete, others are missing"
                );
            }
            RunResult::Succeeded => {}
        }

        if !self.notes.is_empty() {
            let _ = writeln!(out, "  notes:");
            for n in &self.notes {
                let _ = writeln!(out, "    - [{}] {}: {}", n.kind.label(), n.subject, n.reason);
            }
        }

        if !self.result.is_success() && !self.diagnostics_tail.is_empty() {
            let _ = writeln!(out, "  collector stderr (last {} lines):", self.diagnostics_tail.len());
            for line in &self.diagnostics_tail {
                let _ = writeln!(out, "    {line}");
            }
        }
        out
    }
}
