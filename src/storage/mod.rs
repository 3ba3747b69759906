//! Storage service abstraction.
//!
//! The pipeline only needs a narrow, idempotent command contract against its
//! backing store: create, list, test, chmod, delete, and read. `StorageService`
//! captures that contract; the backend is selected from a URL the same way for
//! every component.

mod hdfs;
mod local;

pub use hdfs::{HdfsConfig, HdfsStorage};
pub use local::{LocalConfig, LocalStorage};

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::command::CommandRunnerRef;
use crate::error::{InvalidUrlSnafu, StorageError};

/// A reference-counted storage service.
pub type StorageRef = Arc<dyn StorageService>;

/// One entry in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Absolute namespace path.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Permission bits (e.g. `0o755`).
    pub mode: u32,
}

impl Entry {
    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Committed data file: hidden `_`/`.` files and in-flight `.tmp` files excluded.
    pub fn is_data_file(&self) -> bool {
        let name = self.name();
        !self.is_dir && !name.starts_with(['_', '.']) && !name.ends_with(".tmp")
    }
}

/// Command contract against the backing store.
///
/// All paths are absolute namespace paths (`/pipeline/raw`). Operations are
/// idempotent where the contract allows: creating an existing directory and
/// deleting a missing path both succeed.
#[async_trait]
pub trait StorageService: Send + Sync + std::fmt::Debug {
    /// Human-readable location of the backend.
    fn describe(&self) -> String;

    async fn mkdir_recursive(&self, path: &str) -> Result<(), StorageError>;

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Entry>, StorageError>;

    async fn test_is_directory(&self, path: &str) -> Result<bool, StorageError>;

    async fn exists(&self, path: &str) -> Result<bool, StorageError>;

    async fn set_permissions(&self, path: &str, mode: u32, recursive: bool)
    -> Result<(), StorageError>;

    async fn delete_recursive(&self, path: &str) -> Result<(), StorageError>;

    /// Concatenated content of a file, or of every data file directly under a directory.
    async fn read_merged(&self, path: &str) -> Result<Bytes, StorageError>;

    /// First `n_lines` lines of the merged content.
    async fn read_head(&self, path: &str, n_lines: usize) -> Result<Vec<String>, StorageError>;

    /// Create or replace a file.
    async fn write(&self, path: &str, contents: Bytes) -> Result<(), StorageError>;
}

// URL patterns for the supported backends
const HDFS_URL: &str = r"^hdfs://(?P<authority>[^/]*)(?P<path>/.*)?$";
const FILE_URI: &str = r"^file://(?P<path>.*)$";
const FILE_URL: &str = r"^file:(?P<path>.*)$";
const FILE_PATH: &str = r"^/(?P<path>.*)$";

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
enum Backend {
    Hdfs,
    Local,
}

static MATCHERS: LazyLock<HashMap<Backend, Vec<Regex>>> = LazyLock::new(|| {
    let compile = |patterns: &[&str]| {
        patterns
            .iter()
            .map(|p| Regex::new(p).expect("constant URL pattern"))
            .collect::<Vec<_>>()
    };

    let mut m = HashMap::new();
    m.insert(Backend::Hdfs, compile(&[HDFS_URL]));
    m.insert(Backend::Local, compile(&[FILE_URI, FILE_URL, FILE_PATH]));
    m
});

/// Backend configuration enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Hdfs(HdfsConfig),
    Local(LocalConfig),
}

impl BackendConfig {
    /// Parse a URL into a backend configuration.
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        for (backend, patterns) in MATCHERS.iter() {
            if let Some(caps) = patterns.iter().find_map(|r| r.captures(url)) {
                let path = caps.name("path").map(|m| m.as_str()).unwrap_or("");
                return Ok(match backend {
                    Backend::Hdfs => {
                        let authority = caps
                            .name("authority")
                            .map(|m| m.as_str())
                            .filter(|a| !a.is_empty())
                            .map(str::to_string);
                        BackendConfig::Hdfs(HdfsConfig {
                            authority,
                            base: normalize_base(path),
                        })
                    }
                    Backend::Local => BackendConfig::Local(LocalConfig {
                        path: normalize_base(path),
                    }),
                });
            }
        }

        InvalidUrlSnafu {
            url: url.to_string(),
        }
        .fail()
    }
}

fn normalize_base(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Join a namespace path under a backend base directory.
pub(crate) fn qualify(base: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    match (base.trim_end_matches('/'), path) {
        ("", "") => "/".to_string(),
        (base, "") => base.to_string(),
        (base, path) => format!("{base}/{path}"),
    }
}

/// Join a child name onto a parent namespace path.
pub fn join_path(parent: &str, child: &str) -> String {
    qualify(parent, child)
}

/// Builds storage services from URLs.
pub struct StorageProvider;

impl StorageProvider {
    /// Create a storage service for the given URL.
    ///
    /// `exec_prefix` wraps CLI invocations (e.g. `docker exec namenode`) for
    /// command-driven backends; the local backend ignores it.
    pub fn for_url(
        url: &str,
        runner: CommandRunnerRef,
        exec_prefix: Vec<String>,
    ) -> Result<StorageRef, StorageError> {
        Ok(match BackendConfig::parse_url(url)? {
            BackendConfig::Hdfs(config) => Arc::new(HdfsStorage::new(config, runner, exec_prefix)),
            BackendConfig::Local(config) => Arc::new(LocalStorage::new(config)),
        })
    }
}

/// Count lines that carry data.
pub fn count_lines(bytes: &[u8]) -> u64 {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count() as u64
}

/// Parse the symbolic `rwxr-xr-x` form used by listings into permission bits.
pub fn mode_from_symbolic(perms: &str) -> Option<u32> {
    let bits = perms.get(perms.len().checked_sub(9)?..)?;
    let mut mode = 0u32;
    for (i, c) in bits.chars().enumerate() {
        let set = match (i % 3, c) {
            (_, '-') => false,
            (0, 'r') | (1, 'w') | (2, 'x') => true,
            // setuid/setgid/sticky with execute
            (2, 's') | (2, 't') => true,
            (2, 'S') | (2, 'T') => false,
            _ => return None,
        };
        if set {
            mode |= 1 << (8 - i);
        }
    }
    Some(mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdfs_url_parsing() {
        let config = BackendConfig::parse_url("hdfs://namenode:9000/data").unwrap();
        match config {
            BackendConfig::Hdfs(hdfs) => {
                assert_eq!(hdfs.authority.as_deref(), Some("namenode:9000"));
                assert_eq!(hdfs.base, "/data");
            }
            _ => panic!("Expected Hdfs config"),
        }
    }

    #[test]
    fn test_hdfs_default_fs_url() {
        let config = BackendConfig::parse_url("hdfs:///").unwrap();
        assert_eq!(
            config,
            BackendConfig::Hdfs(HdfsConfig {
                authority: None,
                base: "/".to_string(),
            })
        );
    }

    #[test]
    fn test_local_url_parsing() {
        for url in ["/tmp/avalanche", "file:///tmp/avalanche", "file:/tmp/avalanche/"] {
            match BackendConfig::parse_url(url).unwrap() {
                BackendConfig::Local(local) => assert_eq!(local.path, "/tmp/avalanche"),
                _ => panic!("Expected Local config for {url}"),
            }
        }
    }

    #[test]
    fn test_every_url_pattern_compiles() {
        assert_eq!(MATCHERS[&Backend::Hdfs].len(), 1);
        assert_eq!(MATCHERS[&Backend::Local].len(), 3);
    }

    #[test]
    fn test_invalid_url() {
        let err = BackendConfig::parse_url("s3://bucket/key").unwrap_err();
        assert!(matches!(err, StorageError::InvalidUrl { .. }));
    }

    #[test]
    fn test_qualify_paths() {
        assert_eq!(qualify("/", "/pipeline/raw"), "/pipeline/raw");
        assert_eq!(qualify("/base", "/pipeline"), "/base/pipeline");
        assert_eq!(qualify("/base", "/"), "/base");
        assert_eq!(qualify("/", "/"), "/");
        assert_eq!(join_path("/pipeline", "raw"), "/pipeline/raw");
    }

    #[test]
    fn test_symbolic_mode() {
        assert_eq!(mode_from_symbolic("drwxrwxr-x"), Some(0o775));
        assert_eq!(mode_from_symbolic("-rw-r--r--"), Some(0o644));
        assert_eq!(mode_from_symbolic("drwxrwxrwt"), Some(0o777));
        assert_eq!(mode_from_symbolic("rwx"), None);
        assert_eq!(mode_from_symbolic("drwxq-x---"), None);
    }

    #[test]
    fn test_entry_data_file() {
        let entry = Entry {
            path: "/out/_SUCCESS".to_string(),
            is_dir: false,
            size: 0,
            mode: 0o644,
        };
        assert!(!entry.is_data_file());
        let entry = Entry {
            path: "/out/part-00000".to_string(),
            ..entry
        };
        assert!(entry.is_data_file());
        assert_eq!(entry.name(), "part-00000");
        let entry = Entry {
            path: "/streaming/events.1714557600.log.tmp".to_string(),
            ..entry
        };
        assert!(!entry.is_data_file());
    }

    #[test]
    fn test_count_lines_ignores_blank() {
        assert_eq!(count_lines(b"a\n\nb\n  \nc"), 3);
        assert_eq!(count_lines(b""), 0);
    }
}
