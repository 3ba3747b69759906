//! Local filesystem storage backend implementation.
//!
//! Mirrors the HDFS command contract on a directory tree so the whole pipeline
//! can run (and be tested) without a cluster.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use snafu::prelude::*;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::emit;
use crate::error::{IoSnafu, NotFoundSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

use super::{Entry, StorageService, qualify};

/// Local filesystem configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    /// Directory that namespace paths are resolved under.
    pub path: String,
}

#[derive(Debug)]
pub struct LocalStorage {
    config: LocalConfig,
}

impl LocalStorage {
    pub fn new(config: LocalConfig) -> Self {
        Self { config }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        PathBuf::from(qualify(&self.config.path, path))
    }

    fn namespace_path(&self, fs_path: &Path) -> String {
        let base = Path::new(&self.config.path);
        match fs_path.strip_prefix(base) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => fs_path.to_string_lossy().into_owned(),
        }
    }

    fn entry(&self, fs_path: &Path, meta: &Metadata) -> Entry {
        Entry {
            path: self.namespace_path(fs_path),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            mode: mode_of(meta),
        }
    }

    async fn metadata(path: &Path) -> Result<Option<Metadata>, StorageError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).context(IoSnafu {
                path: path.to_string_lossy(),
            }),
        }
    }

    /// Immediate children of a directory, sorted by name.
    async fn children(dir: &Path) -> Result<Vec<(PathBuf, Metadata)>, StorageError> {
        let mut reader = tokio::fs::read_dir(dir).await.context(IoSnafu {
            path: dir.to_string_lossy(),
        })?;
        let mut children = Vec::new();
        while let Some(item) = reader.next_entry().await.context(IoSnafu {
            path: dir.to_string_lossy(),
        })? {
            let meta = item.metadata().await.context(IoSnafu {
                path: item.path().to_string_lossy(),
            })?;
            children.push((item.path(), meta));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    /// Every descendant of `root` (depth-first), excluding `root` itself.
    async fn walk(root: &Path) -> Result<Vec<(PathBuf, Metadata)>, StorageError> {
        let mut out = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for (path, meta) in Self::children(&dir).await? {
                if meta.is_dir() {
                    pending.push(path.clone());
                }
                out.push((path, meta));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn list_inner(&self, path: &str, recursive: bool) -> Result<Vec<Entry>, StorageError> {
        let target = self.resolve(path);
        let meta = Self::metadata(&target)
            .await?
            .context(NotFoundSnafu { path })?;

        if !meta.is_dir() {
            return Ok(vec![self.entry(&target, &meta)]);
        }

        let found = if recursive {
            Self::walk(&target).await?
        } else {
            Self::children(&target).await?
        };
        Ok(found
            .iter()
            .map(|(p, m)| self.entry(p, m))
            .collect())
    }

    async fn read_inner(&self, path: &str) -> Result<Bytes, StorageError> {
        let target = self.resolve(path);
        let meta = Self::metadata(&target)
            .await?
            .context(NotFoundSnafu { path })?;

        if !meta.is_dir() {
            let data = tokio::fs::read(&target).await.context(IoSnafu { path })?;
            return Ok(Bytes::from(data));
        }

        let mut merged = BytesMut::new();
        for (file, meta) in Self::children(&target).await? {
            let entry = self.entry(&file, &meta);
            if !entry.is_data_file() {
                continue;
            }
            let data = tokio::fs::read(&file).await.context(IoSnafu {
                path: entry.path.as_str(),
            })?;
            merged.extend_from_slice(&data);
            // Keep records of adjacent part files from fusing together.
            if !data.is_empty() && !data.ends_with(b"\n") {
                merged.extend_from_slice(b"\n");
            }
        }
        Ok(merged.freeze())
    }

    async fn chmod(path: &Path, mode: u32) -> Result<(), StorageError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
                .await
                .context(IoSnafu {
                    path: path.to_string_lossy(),
                })?;
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
        }
        Ok(())
    }

    fn record<T>(
        operation: StorageOperation,
        result: Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        emit!(StorageRequest {
            operation,
            status: if result.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
        });
        result
    }
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    match (meta.is_dir(), meta.permissions().readonly()) {
        (true, _) => 0o777,
        (false, true) => 0o444,
        (false, false) => 0o666,
    }
}

#[async_trait]
impl StorageService for LocalStorage {
    fn describe(&self) -> String {
        format!("file://{}", self.config.path)
    }

    async fn mkdir_recursive(&self, path: &str) -> Result<(), StorageError> {
        let result = tokio::fs::create_dir_all(self.resolve(path))
            .await
            .context(IoSnafu { path });
        Self::record(StorageOperation::Mkdir, result)
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Entry>, StorageError> {
        Self::record(StorageOperation::List, self.list_inner(path, recursive).await)
    }

    async fn test_is_directory(&self, path: &str) -> Result<bool, StorageError> {
        let result = Self::metadata(&self.resolve(path))
            .await
            .map(|m| m.is_some_and(|m| m.is_dir()));
        Self::record(StorageOperation::Test, result)
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let result = Self::metadata(&self.resolve(path))
            .await
            .map(|m| m.is_some());
        Self::record(StorageOperation::Test, result)
    }

    async fn set_permissions(
        &self,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let result = async {
            Self::metadata(&target)
                .await?
                .context(NotFoundSnafu { path })?;
            Self::chmod(&target, mode).await?;
            if recursive {
                for (child, _) in Self::walk(&target).await? {
                    Self::chmod(&child, mode).await?;
                }
            }
            Ok::<_, StorageError>(())
        }
        .await;
        Self::record(StorageOperation::Chmod, result)
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let result = match Self::metadata(&target).await {
            Ok(None) => Ok(()),
            Ok(Some(meta)) if meta.is_dir() => tokio::fs::remove_dir_all(&target)
                .await
                .context(IoSnafu { path }),
            Ok(Some(_)) => tokio::fs::remove_file(&target)
                .await
                .context(IoSnafu { path }),
            Err(e) => Err(e),
        };
        Self::record(StorageOperation::Delete, result)
    }

    async fn read_merged(&self, path: &str) -> Result<Bytes, StorageError> {
        Self::record(StorageOperation::Read, self.read_inner(path).await)
    }

    async fn read_head(&self, path: &str, n_lines: usize) -> Result<Vec<String>, StorageError> {
        let result = self.read_inner(path).await.map(|data| {
            String::from_utf8_lossy(&data)
                .lines()
                .take(n_lines)
                .map(str::to_string)
                .collect()
        });
        Self::record(StorageOperation::Read, result)
    }

    async fn write(&self, path: &str, contents: Bytes) -> Result<(), StorageError> {
        let target = self.resolve(path);
        let result = async {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.context(IoSnafu {
                    path: parent.to_string_lossy(),
                })?;
            }
            tokio::fs::write(&target, &contents)
                .await
                .context(IoSnafu { path })?;
            Ok::<_, StorageError>(())
        }
        .await;
        Self::record(StorageOperation::Write, result)
    }
}
