//! Transfer items and selection flattening.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use crate::error::{Error, Result};
use crate::pb;

/// One entry of a flattened transfer, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// A regular file.
    File {
        /// Path relative to the selection root, '/'-separated.
        relative_path: String,
        /// Absolute path on the sending device.
        source: PathBuf,
        /// Payload size in bytes.
        size: u64,
        /// Unix permission bits.
        mode: u32,
    },
    /// A directory marker, emitted before its descendants.
    Directory {
        /// Path relative to the selection root, '/'-separated.
        relative_path: String,
    },
}

impl Item {
    /// The peer-relative path of this item.
    pub fn relative_path(&self) -> &str {
        match self {
            Item::File { relative_path, .. } | Item::Directory { relative_path } => relative_path,
        }
    }

    /// Payload size; zero for directories.
    pub fn size(&self) -> u64 {
        match self {
            Item::File { size, .. } => *size,
            Item::Directory { .. } => 0,
        }
    }

    /// The wire manifest entry for this item.
    pub fn manifest(&self) -> pb::ItemManifest {
        match self {
            Item::File {
                relative_path,
                size,
                mode,
                ..
            } => pb::ItemManifest {
                relative_path: relative_path.clone(),
                size: *size,
                kind: pb::ItemKind::File as i32,
                mode: *mode,
            },
            Item::Directory { relative_path } => pb::ItemManifest {
                relative_path: relative_path.clone(),
                size: 0,
                kind: pb::ItemKind::Directory as i32,
                mode: 0o755,
            },
        }
    }
}

/// Flatten selected top-level paths into wire order: each directory becomes
/// an explicit marker followed by its descendants, depth-first, entries
/// sorted by name so the sequence is stable across runs.
pub async fn flatten(roots: &[PathBuf]) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for root in roots {
        let name = root
            .file_name()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unusable selection path {root:?}"),
                ))
            })?
            .to_string_lossy()
            .into_owned();
        flatten_entry(root, name, &mut items).await?;
    }
    Ok(items)
}

// Recursion through an async fn needs the boxed-future indirection.
fn flatten_entry<'a>(
    path: &'a Path,
    relative: String,
    items: &'a mut Vec<Item>,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.is_dir() {
            items.push(Item::Directory {
                relative_path: relative.clone(),
            });
            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(path).await?;
            while let Some(entry) = entries.next_entry().await? {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            for name in names {
                let child = path.join(&name);
                flatten_entry(&child, format!("{relative}/{name}"), items).await?;
            }
        } else {
            items.push(Item::File {
                relative_path: relative,
                source: path.to_path_buf(),
                size: metadata.len(),
                mode: file_mode(&metadata),
            });
        }
        Ok(())
    })
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flattens_nested_selection_depth_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(root.join("photos")).unwrap();
        std::fs::write(root.join("photos/b.jpg"), vec![0u8; 10]).unwrap();
        std::fs::create_dir(root.join("photos/trip")).unwrap();
        std::fs::write(root.join("photos/trip/c.jpg"), vec![0u8; 3]).unwrap();

        let items = flatten(&[root.join("a.txt"), root.join("photos")])
            .await
            .unwrap();

        let paths: Vec<_> = items.iter().map(|i| i.relative_path()).collect();
        assert_eq!(
            paths,
            ["a.txt", "photos", "photos/b.jpg", "photos/trip", "photos/trip/c.jpg"]
        );
        assert!(matches!(items[1], Item::Directory { .. }));
        assert!(matches!(items[3], Item::Directory { .. }));

        let total: u64 = items.iter().map(Item::size).sum();
        assert_eq!(total, 5 + 10 + 3);
    }

    #[tokio::test]
    async fn sibling_order_is_name_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("docs");
        std::fs::create_dir(&root).unwrap();
        for name in ["zeta.txt", "alpha.txt", "mid.txt"] {
            std::fs::write(root.join(name), b"x").unwrap();
        }

        let items = flatten(&[root]).await.unwrap();
        let paths: Vec<_> = items.iter().map(|i| i.relative_path()).collect();
        assert_eq!(paths, ["docs", "docs/alpha.txt", "docs/mid.txt", "docs/zeta.txt"]);
    }

    #[tokio::test]
    async fn missing_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        assert!(flatten(&[missing]).await.is_err());
    }
}
