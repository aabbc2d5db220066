use std::path::{Path, PathBuf};

use gather_core::paths::{normalize_remote, partial_path};
use gather_core::wire::Frame;
use gather_core::{ChannelError, GatherManifest, RetryPolicy, TransferError};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::TransferChannel;

/// What the Output Synchronizer observed on one channel.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub manifest: GatherManifest,
    pub errors: Vec<TransferError>,
    /// Exit status carried by the stream's final record.
    pub exit_code: Option<i32>,
    /// The stream ended with its exit record.
    pub complete: bool,
    /// Why draining stopped early, if it did.
    pub channel_error: Option<String>,
}

/// A file being streamed into its staging path. Dropped uncommitted, it deletes
/// the staging file, so no truncated file survives an aborted drain.
struct StagedFile {
    rel: String,
    final_path: PathBuf,
    staging: PathBuf,
    file: Option<tokio::fs::File>,
    expected: u64,
    written: u64,
    error: Option<String>,
    committed: bool,
}

impl StagedFile {
    fn failed(rel: String, expected: u64, reason: String) -> Self {
        Self {
            rel,
            final_path: PathBuf::new(),
            staging: PathBuf::new(),
            file: None,
            expected,
            written: 0,
            error: Some(reason),
            committed: false,
        }
    }

    /// Give up on this file: the staging copy goes now, the rest of its payload is discarded.
    fn abandon(&mut self, reason: String) {
        if self.error.is_none() {
            self.error = Some(reason);
        }
        self.file = None;
        if !self.staging.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&self.staging);
        }
    }

    async fn write(&mut self, bytes: &[u8]) {
        self.written += bytes.len() as u64;
        if self.error.is_some() {
            return;
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(bytes).await {
                self.error = Some(format!("write failed: {e}"));
                self.file = None;
            }
        }
    }

    async fn commit(mut self) -> Result<(String, u64), TransferError> {
        if let Some(reason) = self.error.take() {
            return Err(TransferError::new(self.rel.clone(), reason));
        }
        if self.written != self.expected {
            return Err(TransferError::new(
                self.rel.clone(),
                format!("received {} of {} bytes", self.written, self.expected),
            ));
        }
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| TransferError::new(self.rel.clone(), format!("flush failed: {e}")))?;
            file.sync_data()
                .await
                .map_err(|e| TransferError::new(self.rel.clone(), format!("sync failed: {e}")))?;
        }
        tokio::fs::rename(&self.staging, &self.final_path)
            .await
            .map_err(|e| TransferError::new(self.rel.clone(), format!("rename failed: {e}")))?;
        self.committed = true;
        Ok((self.rel.clone(), self.written))
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.committed || self.staging.as_os_str().is_empty() {
            return;
        }
        self.file = None;
        let _ = std::fs::remove_file(&self.staging);
    }
}

/// Drains a Transfer Channel into the destination directory.
pub struct OutputSynchronizer {
    dest: PathBuf,
    retry: RetryPolicy,
    stop: CancellationToken,
}

impl OutputSynchronizer {
    pub fn new(dest: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            dest: dest.into(),
            retry,
            stop: CancellationToken::new(),
        }
    }

    /// Token that makes [`OutputSynchronizer::drain`] return early, discarding the file in flight.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub async fn drain<R: AsyncRead + Unpin>(&self, channel: &mut TransferChannel<R>) -> DrainReport {
        let mut report = DrainReport::default();
        let dest_error = tokio::fs::create_dir_all(&self.dest)
            .await
            .err()
            .map(|e| format!("destination unavailable: {e}"));
        let mut current: Option<StagedFile> = None;
        // Set when retries ran out and no frame has arrived since.
        let mut stalled = false;

        loop {
            let next = tokio::select! {
                next = self.next_with_retry(channel) => next,
                _ = self.stop.cancelled() => {
                    report.channel_error = Some("draining stopped before the stream ended".into());
                    break;
                }
            };

            let frame = match next {
                Ok(Some(frame)) => {
                    stalled = false;
                    frame
                }
                Ok(None) => {
                    report.channel_error =
                        Some("stream ended before the collector reported its exit status".into());
                    break;
                }
                Err(e) if e.is_transient() && !stalled => {
                    stalled = true;
                    match current.as_mut() {
                        Some(staged) => {
                            warn!(path = %staged.rel, error = %e, "retries exhausted; dropping file");
                            staged.abandon(format!("read failed after retries: {e}"));
                        }
                        None => warn!(error = %e, "retries exhausted between files"),
                    }
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "transfer channel failed");
                    report.channel_error = Some(e.to_string());
                    break;
                }
            };

            match frame {
                Frame::Directory(path) => {
                    if let Some(reason) = &dest_error {
                        report.errors.push(TransferError::new(path, reason.clone()));
                        continue;
                    }
                    match self.make_directory(&path).await {
                        Ok(rel) => report.manifest.record_directory(rel),
                        Err(e) => {
                            warn!(path = %e.path, reason = %e.reason, "directory rejected");
                            report.errors.push(e);
                        }
                    }
                }
                Frame::FileStart { path, size } => {
                    if let Some(prev) = current.take() {
                        report.errors.push(TransferError::new(prev.rel.clone(), "file record interrupted"));
                    }
                    current = Some(match &dest_error {
                        Some(reason) => StagedFile::failed(path, size, reason.clone()),
                        None => self.stage(path, size).await,
                    });
                }
                Frame::Chunk(bytes) => match current.as_mut() {
                    Some(staged) => staged.write(&bytes).await,
                    None => {
                        report.channel_error = Some("payload outside a file record".into());
                        break;
                    }
                },
                Frame::FileEnd => {
                    if let Some(staged) = current.take() {
                        match staged.commit().await {
                            Ok((rel, size)) => {
                                debug!(path = %rel, size, "file transferred");
                                report.manifest.record_file(rel, size);
                            }
                            Err(e) => {
                                warn!(path = %e.path, reason = %e.reason, "file transfer failed");
                                report.errors.push(e);
                            }
                        }
                    }
                }
                Frame::Remove(path) => {
                    if dest_error.is_some() {
                        continue;
                    }
                    match self.remove(&path).await {
                        Ok(rel) => {
                            debug!(path = %rel, "withdrawn by the collector");
                            report.manifest.remove(&rel);
                        }
                        Err(e) => {
                            warn!(path = %e.path, reason = %e.reason, "removal rejected");
                            report.errors.push(e);
                        }
                    }
                }
                Frame::Exit(code) => {
                    report.exit_code = Some(code);
                    report.complete = true;
                    break;
                }
            }
        }

        if let Some(staged) = current.take() {
            report.errors.push(TransferError::new(
                staged.rel.clone(),
                "channel closed mid-file; partial copy discarded",
            ));
        }

        info!(
            files = report.manifest.file_count(),
            bytes = report.manifest.total_bytes(),
            errors = report.errors.len(),
            complete = report.complete,
            "output drained"
        );
        report
    }

    async fn next_with_retry<R: AsyncRead + Unpin>(
        &self,
        channel: &mut TransferChannel<R>,
    ) -> Result<Option<Frame>, ChannelError> {
        let mut attempt = 0;
        loop {
            match channel.next_frame().await {
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    let Some(delay) = self.retry.delay_for(attempt) else {
                        return Err(e);
                    };
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying channel read");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn make_directory(&self, remote: &str) -> Result<String, TransferError> {
        let rel = normalize_remote(remote)?;
        tokio::fs::create_dir_all(self.dest.join(&rel))
            .await
            .map_err(|e| TransferError::new(remote, format!("create directory failed: {e}")))?;
        Ok(rel_string(&rel))
    }

    /// Delete a path the collector withdrew. Already absent is fine.
    async fn remove(&self, remote: &str) -> Result<String, TransferError> {
        let rel = normalize_remote(remote)?;
        let target = self.dest.join(&rel);
        let removed = match tokio::fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await,
            Ok(_) => tokio::fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => Ok(rel_string(&rel)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(rel_string(&rel)),
            Err(e) => Err(TransferError::new(remote, format!("remove failed: {e}"))),
        }
    }

    async fn stage(&self, remote: String, size: u64) -> StagedFile {
        let rel = match normalize_remote(&remote) {
            Ok(rel) => rel,
            Err(e) => {
                warn!(path = %remote, reason = %e.reason, "file rejected");
                return StagedFile::failed(remote, size, e.reason);
            }
        };
        let final_path = self.dest.join(&rel);
        let staging = partial_path(&final_path);
        let rel = rel_string(&rel);

        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return StagedFile::failed(rel, size, format!("create directory failed: {e}"));
            }
        }
        match tokio::fs::File::create(&staging).await {
            Ok(file) => StagedFile {
                rel,
                final_path,
                staging,
                file: Some(file),
                expected: size,
                written: 0,
                error: None,
                committed: false,
            },
            Err(e) => StagedFile::failed(rel, size, format!("create failed: {e}")),
        }
    }
}

fn rel_string(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}
