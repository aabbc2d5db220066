//! Lexical path safety for paths received over the Transfer Channel.

use std::path::{Component, Path, PathBuf};

use crate::error::TransferError;

/// Normalize a `/`-separated relative path received from the remote side.
///
/// Drops `.` and empty segments; rejects absolute paths, empty paths and any `..`.
pub fn normalize_remote(remote_path: &str) -> Result<PathBuf, TransferError> {
    if remote_path.starts_with('/') {
        return Err(TransferError::new(remote_path, "absolute paths are not allowed"));
    }
    let mut out = PathBuf::new();
    for comp in Path::new(remote_path).components() {
        match comp {
            Component::Normal(s) => out.push(s),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TransferError::new(remote_path, "path escapes the destination"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::new(remote_path, "absolute paths are not allowed"));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(TransferError::new(remote_path, "empty path"));
    }
    Ok(out)
}

/// Sibling path a file is streamed into before it is renamed into place.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{name}.gather-partial"))
}

/// True when `name` is a staging file left by [`partial_path`].
pub fn is_partial_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(".gather-partial")
}
