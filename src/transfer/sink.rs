//! Write-side endpoint for one transfer item.
//!
//! A sink is identified by the path the peer negotiated, not by the name it
//! ends up with on disk: collisions are resolved by renaming, and chunks
//! keep addressing the original path throughout.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pb;

/// Rename attempts before falling back to a deterministic conflict name.
const RENAME_ATTEMPTS: u32 = 1000;

/// Durably materializes one file's bytes under a target root.
pub struct FileSink {
    negotiated_path: String,
    resolved_path: PathBuf,
    file: Option<File>,
    bytes_written: u64,
    failed: bool,
}

impl FileSink {
    /// Create the on-disk file for an incoming item.
    ///
    /// `negotiated_path` is the identity chunks are checked against;
    /// `disk_relative` is where the bytes go under `root` (they differ when
    /// a parent directory was renamed). Collisions follow the documented
    /// policy: overwrite replaces in place when allowed (falling back to a
    /// rename when replacement fails), otherwise the file name gains an
    /// increasing numeric suffix before its extension.
    pub async fn create(
        root: &Path,
        negotiated_path: impl Into<String>,
        disk_relative: &str,
        overwrite: bool,
    ) -> Result<Self> {
        let target = root.join(disk_relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let resolved_path = resolve_file_collision(target, overwrite).await;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&resolved_path)
            .await?;
        debug!(path = %resolved_path.display(), "sink opened");
        Ok(Self {
            negotiated_path: negotiated_path.into(),
            resolved_path,
            file: Some(file),
            bytes_written: 0,
            failed: false,
        })
    }

    /// The path this sink was negotiated for.
    pub fn negotiated_path(&self) -> &str {
        &self.negotiated_path
    }

    /// Where the bytes actually land, after collision resolution.
    pub fn resolved_path(&self) -> &Path {
        &self.resolved_path
    }

    /// Bytes appended so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append one chunk. The chunk must declare this sink's negotiated
    /// path; the on-disk name is irrelevant to the check.
    pub async fn process_chunk(&mut self, chunk: &pb::FileChunk) -> Result<u64> {
        if chunk.relative_path != self.negotiated_path {
            return Err(Error::FilenameMismatch {
                expected: self.negotiated_path.clone(),
                actual: chunk.relative_path.clone(),
            });
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::connection(format!("sink for {:?} is closed", self.negotiated_path)))?;
        file.write_all(&chunk.data).await?;
        self.bytes_written += chunk.data.len() as u64;
        Ok(chunk.data.len() as u64)
    }

    /// Flush and release the file handle. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }

    /// Close (if open) and delete the partial file, so cancellation or an
    /// irrecoverable error leaves nothing behind. Idempotent.
    pub async fn fail(&mut self) {
        if let Err(e) = self.close().await {
            debug!("sink close during fail: {e}");
        }
        if self.failed {
            return;
        }
        self.failed = true;
        match tokio::fs::remove_file(&self.resolved_path).await {
            Ok(()) => debug!(path = %self.resolved_path.display(), "partial file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.resolved_path.display(), "could not remove partial file: {e}"),
        }
    }
}

/// Pick the on-disk path for an incoming file, applying the collision
/// policy against whatever already exists.
async fn resolve_file_collision(target: PathBuf, overwrite: bool) -> PathBuf {
    if !exists(&target).await {
        return target;
    }

    if overwrite {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => return target,
            Err(e) => debug!(path = %target.display(), "overwrite failed, renaming instead: {e}"),
        }
    }

    let (stem, extension) = split_name(&target);
    let parent = target.parent().map(Path::to_path_buf).unwrap_or_default();

    for n in 1..=RENAME_ATTEMPTS {
        let candidate = parent.join(numbered_name(&stem, n, &extension));
        if !exists(&candidate).await {
            return candidate;
        }
    }

    // Past the cap the name is deterministic rather than the transfer failing.
    parent.join(conflict_name(&stem, &extension))
}

/// Create a directory for an incoming item, renaming on collision the same
/// way files do (counter appended to the full name). Returns the resolved
/// absolute path and the possibly-renamed relative path, which callers use
/// to remap descendants.
pub async fn create_directory(
    root: &Path,
    disk_relative: &str,
    overwrite: bool,
) -> Result<(PathBuf, String)> {
    let target = root.join(disk_relative);

    // With overwrite, incoming items merge into the existing directory.
    if overwrite || !exists(&target).await {
        tokio::fs::create_dir_all(&target).await?;
        return Ok((target, disk_relative.to_string()));
    }

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent_rel = match disk_relative.rsplit_once('/') {
        Some((parent, _)) => format!("{parent}/"),
        None => String::new(),
    };
    let parent = target.parent().map(Path::to_path_buf).unwrap_or_default();

    let mut resolved = parent.join(format!("{name}-conflict"));
    let mut resolved_name = format!("{name}-conflict");
    for n in 1..=RENAME_ATTEMPTS {
        let candidate_name = format!("{name}{n}");
        let candidate = parent.join(&candidate_name);
        if !exists(&candidate).await {
            resolved = candidate;
            resolved_name = candidate_name;
            break;
        }
    }

    tokio::fs::create_dir_all(&resolved).await?;
    Ok((resolved, format!("{parent_rel}{resolved_name}")))
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    (stem, extension)
}

fn numbered_name(stem: &str, n: u32, extension: &str) -> String {
    if extension.is_empty() {
        format!("{stem}{n}")
    } else {
        format!("{stem}{n}.{extension}")
    }
}

fn conflict_name(stem: &str, extension: &str) -> String {
    if extension.is_empty() {
        format!("{stem}-conflict")
    } else {
        format!("{stem}-conflict.{extension}")
    }
}
