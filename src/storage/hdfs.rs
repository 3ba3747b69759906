//! HDFS backend driven through the `hdfs dfs` CLI.

use async_trait::async_trait;
use bytes::Bytes;
use regex::Regex;
use snafu::prelude::*;
use std::sync::LazyLock;

use crate::command::{CommandRunnerRef, Invocation};
use crate::emit;
use crate::error::{ListingParseSnafu, StorageCommandSnafu, StorageError};
use crate::metrics::events::{RequestStatus, StorageOperation, StorageRequest};

use super::{Entry, StorageService, mode_from_symbolic, qualify};

/// HDFS configuration parsed from an `hdfs://authority/base` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HdfsConfig {
    /// `host:port` of the namenode; `None` uses the client's default filesystem.
    pub authority: Option<String>,
    /// Base directory that namespace paths are resolved under.
    pub base: String,
}

/// `hdfs dfs -ls` line: permissions, replication, owner, group, size, date, time, path.
static LS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<perm>[dl-][rwxsStT-]{9})\+?\s+(?:\d+|-)\s+\S+\s+\S+\s+(?P<size>\d+)\s+\S+\s+\S+\s+(?P<path>.+)$",
    )
    .expect("constant listing pattern")
});

/// Storage service backed by the HDFS command-line client.
pub struct HdfsStorage {
    config: HdfsConfig,
    runner: CommandRunnerRef,
    exec_prefix: Vec<String>,
}

impl std::fmt::Debug for HdfsStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HdfsStorage<{}>", self.describe())
    }
}

impl HdfsStorage {
    pub fn new(config: HdfsConfig, runner: CommandRunnerRef, exec_prefix: Vec<String>) -> Self {
        Self {
            config,
            runner,
            exec_prefix,
        }
    }

    fn qualify_path(&self, path: &str) -> String {
        qualify(&self.config.base, path)
    }

    /// Strip the base directory so callers get namespace paths back.
    fn relative_path(&self, path: &str) -> String {
        let base = self.config.base.trim_end_matches('/');
        // Listings may return fully qualified URIs.
        let path = match path.find("://") {
            Some(idx) => {
                let rest = &path[idx + 3..];
                rest.find('/').map(|i| &rest[i..]).unwrap_or("/")
            }
            None => path,
        };
        match path.strip_prefix(base) {
            Some(rest) if base.is_empty() || rest.is_empty() || rest.starts_with('/') => {
                if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                }
            }
            _ => path.to_string(),
        }
    }

    fn dfs<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inv = Invocation::new("hdfs").arg("dfs");
        if let Some(authority) = &self.config.authority {
            inv = inv.args(["-fs".to_string(), format!("hdfs://{authority}")]);
        }
        inv.args(args).prefixed(&self.exec_prefix)
    }

    async fn run(
        &self,
        operation: StorageOperation,
        invocation: Invocation,
    ) -> Result<String, StorageError> {
        let result = self.runner.run(&invocation).await;
        emit!(StorageRequest {
            operation,
            status: if result.is_ok() {
                RequestStatus::Success
            } else {
                RequestStatus::Error
            },
        });
        Ok(result.context(StorageCommandSnafu)?.stdout)
    }

    /// Run `-test <flag>`; exit 0 is true, exit 1 is false, anything else is an error.
    async fn test(&self, flag: &str, path: &str) -> Result<bool, StorageError> {
        let invocation = self.dfs(["-test".to_string(), flag.to_string(), self.qualify_path(path)]);
        let output = self
            .runner
            .output(&invocation)
            .await
            .context(StorageCommandSnafu)?;
        emit!(StorageRequest {
            operation: StorageOperation::Test,
            status: RequestStatus::Success,
        });
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(StorageError::StorageCommand {
                source: crate::error::CommandError::NonZeroExit {
                    program: invocation.program,
                    code: code.unwrap_or(-1),
                    stderr: output.stderr.trim().to_string(),
                },
            }),
        }
    }

    fn parse_listing(&self, stdout: &str) -> Result<Vec<Entry>, StorageError> {
        let mut entries = Vec::new();
        for line in stdout.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with("Found ") {
                continue;
            }
            let caps = LS_LINE
                .captures(line)
                .context(ListingParseSnafu { line: line.to_string() })?;
            let perm = &caps["perm"];
            entries.push(Entry {
                path: self.relative_path(&caps["path"]),
                is_dir: perm.starts_with('d'),
                size: caps["size"].parse().unwrap_or(0),
                mode: mode_from_symbolic(perm)
                    .context(ListingParseSnafu { line: line.to_string() })?,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// The file itself, or the committed data files directly under a directory.
    async fn data_files(&self, path: &str) -> Result<Vec<String>, StorageError> {
        if !self.test_is_directory(path).await? {
            return Ok(vec![self.qualify_path(path)]);
        }
        Ok(self
            .list(path, false)
            .await?
            .into_iter()
            .filter(|entry| entry.is_data_file())
            .map(|entry| self.qualify_path(&entry.path))
            .collect())
    }

    async fn cat(&self, files: Vec<String>) -> Result<String, StorageError> {
        let mut args = vec!["-cat".to_string()];
        args.extend(files);
        self.run(StorageOperation::Read, self.dfs(args)).await
    }
}

#[async_trait]
impl StorageService for HdfsStorage {
    fn describe(&self) -> String {
        match &self.config.authority {
            Some(authority) => format!("hdfs://{}{}", authority, self.config.base),
            None => format!("hdfs://{}", self.config.base),
        }
    }

    async fn mkdir_recursive(&self, path: &str) -> Result<(), StorageError> {
        let invocation = self.dfs(["-mkdir".to_string(), "-p".to_string(), self.qualify_path(path)]);
        self.run(StorageOperation::Mkdir, invocation).await?;
        Ok(())
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Entry>, StorageError> {
        let mut args = vec!["-ls".to_string()];
        if recursive {
            args.push("-R".to_string());
        }
        args.push(self.qualify_path(path));
        let stdout = self.run(StorageOperation::List, self.dfs(args)).await?;
        self.parse_listing(&stdout)
    }

    async fn test_is_directory(&self, path: &str) -> Result<bool, StorageError> {
        self.test("-d", path).await
    }

    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        self.test("-e", path).await
    }

    async fn set_permissions(
        &self,
        path: &str,
        mode: u32,
        recursive: bool,
    ) -> Result<(), StorageError> {
        let mut args = vec!["-chmod".to_string()];
        if recursive {
            args.push("-R".to_string());
        }
        args.push(format!("{mode:o}"));
        args.push(self.qualify_path(path));
        self.run(StorageOperation::Chmod, self.dfs(args)).await?;
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), StorageError> {
        let invocation = self.dfs([
            "-rm".to_string(),
            "-r".to_string(),
            "-f".to_string(),
            "-skipTrash".to_string(),
            self.qualify_path(path),
        ]);
        self.run(StorageOperation::Delete, invocation).await?;
        Ok(())
    }

    async fn read_merged(&self, path: &str) -> Result<Bytes, StorageError> {
        let files = self.data_files(path).await?;
        if files.is_empty() {
            return Ok(Bytes::new());
        }
        Ok(Bytes::from(self.cat(files).await?))
    }

    async fn read_head(&self, path: &str, n_lines: usize) -> Result<Vec<String>, StorageError> {
        // One partition at a time; later partitions are never fetched once the quota is met.
        let mut lines = Vec::with_capacity(n_lines);
        for file in self.data_files(path).await? {
            if lines.len() >= n_lines {
                break;
            }
            let remaining = n_lines - lines.len();
            let content = self.cat(vec![file]).await?;
            lines.extend(content.lines().take(remaining).map(str::to_string));
        }
        Ok(lines)
    }

    async fn write(&self, path: &str, contents: Bytes) -> Result<(), StorageError> {
        let invocation = self
            .dfs([
                "-put".to_string(),
                "-f".to_string(),
                "-".to_string(),
                self.qualify_path(path),
            ])
            .stdin(contents);
        self.run(StorageOperation::Write, invocation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, CommandRunner};
    use crate::error::CommandError;
    use std::sync::{Arc, Mutex};

    /// Records invocations and answers with a fixed output.
    struct Scripted {
        calls: Mutex<Vec<Invocation>>,
        output: CommandOutput,
    }

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(invocation.clone());
            Ok(self.output.clone())
        }
    }

    fn fixture(output: CommandOutput, base: &str) -> (HdfsStorage, Arc<Scripted>) {
        let runner = Arc::new(Scripted {
            calls: Mutex::new(Vec::new()),
            output,
        });
        let storage = HdfsStorage::new(
            HdfsConfig {
                authority: None,
                base: base.to_string(),
            },
            runner.clone(),
            vec!["docker".to_string(), "exec".to_string(), "namenode".to_string()],
        );
        (storage, runner)
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn test_mkdir_uses_parents_flag_and_prefix() {
        let (storage, runner) = fixture(ok(""), "/");
        storage.mkdir_recursive("/pipeline/raw").await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].program, "docker");
        assert_eq!(
            calls[0].args,
            vec!["exec", "namenode", "hdfs", "dfs", "-mkdir", "-p", "/pipeline/raw"]
        );
    }

    #[tokio::test]
    async fn test_list_parses_recursive_listing() {
        let listing = "\
drwxrwxr-x   - root supergroup          0 2024-05-01 10:00 /pipeline/imported
-rw-r--r--   3 root supergroup       1024 2024-05-01 10:01 /pipeline/imported/part-m-00000
drwxrwxr-x+  - root supergroup          0 2024-05-01 10:00 /pipeline/raw
";
        let (storage, _) = fixture(ok(listing), "/");
        let entries = storage.list("/pipeline", true).await.unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].path, "/pipeline/imported");
        assert!(entries[0].is_dir);
        assert_eq!(entries[0].mode, 0o775);
        assert_eq!(entries[1].size, 1024);
        assert!(entries[1].is_data_file());
        assert_eq!(entries[2].path, "/pipeline/raw");
    }

    #[tokio::test]
    async fn test_list_strips_base_and_scheme() {
        let listing = "Found 1 items\n\
drwxr-xr-x   - hdfs supergroup 0 2024-05-01 10:00 hdfs://namenode:9000/base/pipeline/raw\n";
        let (storage, runner) = fixture(ok(listing), "/base");
        let entries = storage.list("/pipeline", false).await.unwrap();

        assert_eq!(entries[0].path, "/pipeline/raw");
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0].args.last().unwrap(), "/base/pipeline");
    }

    #[tokio::test]
    async fn test_list_rejects_garbage() {
        let (storage, _) = fixture(ok("not a listing line\n"), "/");
        let err = storage.list("/", false).await.unwrap_err();
        assert!(matches!(err, StorageError::ListingParse { .. }));
    }

    #[tokio::test]
    async fn test_directory_test_exit_codes() {
        let (storage, _) = fixture(
            CommandOutput {
                code: Some(1),
                ..Default::default()
            },
            "/",
        );
        assert!(!storage.test_is_directory("/missing").await.unwrap());

        let (storage, _) = fixture(
            CommandOutput {
                code: Some(255),
                stderr: "connection refused".to_string(),
                ..Default::default()
            },
            "/",
        );
        assert!(storage.test_is_directory("/x").await.is_err());
    }

    #[tokio::test]
    async fn test_chmod_renders_octal() {
        let (storage, runner) = fixture(ok(""), "/");
        storage
            .set_permissions("/pipeline", 0o775, true)
            .await
            .unwrap();
        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].args.ends_with(&[
            "-chmod".to_string(),
            "-R".to_string(),
            "775".to_string(),
            "/pipeline".to_string()
        ]));
    }

    #[tokio::test]
    async fn test_delete_is_forceful() {
        let (storage, runner) = fixture(ok(""), "/");
        storage.delete_recursive("/pipeline/out").await.unwrap();
        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].args.contains(&"-f".to_string()));
        assert!(calls[0].args.contains(&"-skipTrash".to_string()));
    }

    /// Answers each `hdfs dfs` subcommand the way a namenode would.
    struct Namenode {
        calls: Mutex<Vec<Invocation>>,
        listing: &'static str,
        cat: CommandOutput,
    }

    #[async_trait]
    impl CommandRunner for Namenode {
        async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
            self.calls.lock().unwrap().push(invocation.clone());
            let has = |flag: &str| invocation.args.iter().any(|a| a == flag);
            Ok(if has("-test") {
                ok("")
            } else if has("-ls") {
                ok(self.listing)
            } else if has("-cat") {
                self.cat.clone()
            } else {
                ok("")
            })
        }
    }

    const JOB_OUTPUT: &str = "\
drwxr-xr-x   - hdfs supergroup          0 2024-05-01 10:00 /out/_logs
-rw-r--r--   3 hdfs supergroup          0 2024-05-01 10:00 /out/_SUCCESS
-rw-r--r--   3 hdfs supergroup         16 2024-05-01 10:00 /out/part-00000
-rw-r--r--   3 hdfs supergroup          8 2024-05-01 10:00 /out/part-00001
-rw-r--r--   3 hdfs supergroup          8 2024-05-01 10:00 /out/part-00002.tmp
";

    fn namenode(listing: &'static str, cat: CommandOutput) -> (HdfsStorage, Arc<Namenode>) {
        let runner = Arc::new(Namenode {
            calls: Mutex::new(Vec::new()),
            listing,
            cat,
        });
        let storage = HdfsStorage::new(
            HdfsConfig {
                authority: None,
                base: "/".to_string(),
            },
            runner.clone(),
            Vec::new(),
        );
        (storage, runner)
    }

    fn cat_calls(runner: &Namenode) -> Vec<Vec<String>> {
        runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.args.contains(&"-cat".to_string()))
            .map(|c| c.args.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_read_merged_reads_only_committed_parts() {
        let (storage, runner) = namenode(JOB_OUTPUT, ok("view\t2\nclick\t1\n"));
        let merged = storage.read_merged("/out").await.unwrap();

        assert_eq!(&merged[..], b"view\t2\nclick\t1\n");
        assert_eq!(
            cat_calls(&runner),
            vec![vec!["dfs", "-cat", "/out/part-00000", "/out/part-00001"]]
        );
    }

    #[tokio::test]
    async fn test_read_merged_of_marker_only_directory_is_empty() {
        let listing =
            "-rw-r--r--   3 hdfs supergroup 0 2024-05-01 10:00 /pipeline/imported/orders/_SUCCESS\n";
        let (storage, runner) = namenode(listing, ok("unexpected"));
        let merged = storage.read_merged("/pipeline/imported/orders").await.unwrap();

        assert!(merged.is_empty());
        assert!(cat_calls(&runner).is_empty());
    }

    #[tokio::test]
    async fn test_read_head_stops_at_quota() {
        let (storage, runner) = namenode(JOB_OUTPUT, ok("a\nb\nc\n"));
        let head = storage.read_head("/out", 2).await.unwrap();

        assert_eq!(head, vec!["a", "b"]);
        assert_eq!(cat_calls(&runner), vec![vec!["dfs", "-cat", "/out/part-00000"]]);
    }

    #[tokio::test]
    async fn test_read_head_surfaces_cat_failure() {
        let (storage, _) = namenode(
            JOB_OUTPUT,
            CommandOutput {
                code: Some(1),
                stderr: "cat: Could not obtain block".to_string(),
                ..Default::default()
            },
        );
        let err = storage.read_head("/out", 5).await.unwrap_err();
        assert!(matches!(err, StorageError::StorageCommand { .. }));
    }

    #[tokio::test]
    async fn test_write_streams_contents_on_stdin() {
        let (storage, runner) = fixture(ok(""), "/base");
        storage
            .write("/pipeline/raw/events.log", Bytes::from_static(b"{\"action\":\"view\"}\n"))
            .await
            .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert!(calls[0].args.ends_with(&[
            "-put".to_string(),
            "-f".to_string(),
            "-".to_string(),
            "/base/pipeline/raw/events.log".to_string()
        ]));
        assert_eq!(
            calls[0].stdin.as_deref(),
            Some(&b"{\"action\":\"view\"}\n"[..])
        );
    }
}
