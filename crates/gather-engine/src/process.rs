use std::io;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::RemoteSession;
use crate::channel::BoxedReader;

/// Spawn `cmd` as a remote session: stdout is the Transfer Channel, stderr the diagnostics.
///
/// With `own_group` the child leads a new process group and cancelling the
/// session kills the whole group, collector included.
pub(crate) fn spawn_session(mut cmd: Command, own_group: bool) -> io::Result<(RemoteSession, Option<u32>)> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    if own_group {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let output = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("session stdout was not captured"))?;
    let diagnostics = child.stderr.take().map(|s| Box::new(s) as BoxedReader);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let exit = tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => status.map(|s| s.code()),
            _ = token.cancelled() => {
                if own_group {
                    if let Some(pid) = pid {
                        kill_group(pid).await;
                    }
                }
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "session process already gone");
                }
                Ok(None)
            }
        }
    });

    Ok((
        RemoteSession {
            output: Box::new(output),
            diagnostics,
            exit,
            cancel,
        },
        pid,
    ))
}

/// SIGKILL every process in group `pgid`. Best effort.
pub(crate) async fn kill_group(pgid: u32) {
    let res = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{pgid}")])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = res {
        debug!(pgid, error = %e, "kill failed");
    }
}

/// Run a helper command to completion, failing with its stderr on a non-zero exit.
pub(crate) async fn run_captured(mut cmd: Command, stdin: Option<Vec<u8>>) -> anyhow::Result<String> {
    use tokio::io::AsyncWriteExt;

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
    let mut child = cmd.spawn()?;
    if let Some(bytes) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(&bytes).await?;
            pipe.shutdown().await?;
        }
    }
    let out = child.wait_with_output().await?;
    if !out.status.success() {
        anyhow::bail!("{}", String::from_utf8_lossy(&out.stderr).trim());
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}
