//! Filtered bulk import from the relational source.
//!
//! Each `ImportSpec` is independent: connectivity check, clear target, bulk
//! copy, confirm partitions, count rows. Specs run concurrently; the run
//! policy decides whether one failure cancels the rest.

mod records;
mod sqoop;

pub use records::{CustomerRecord, Dataset, DatasetRecord, OrderRecord};
pub use sqoop::SqoopCli;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::sync::Arc;
use tracing::{info, warn};

use crate::emit;
use crate::error::{
    BulkCopySnafu, ClearTargetSnafu, CommandError, ConnectivityUnconfirmedSnafu, CountRowsSnafu,
    ImportError, ListOutputSnafu,
};
use crate::metrics::events::ImportCompleted;
use crate::pipeline::{RunPolicy, Status};
use crate::storage::{StorageRef, count_lines};

/// One predicate-filtered copy of a relational table into delimited files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Logical dataset name, unique within a run.
    pub name: String,
    pub table: String,
    /// Row filter; `None` copies the whole table.
    #[serde(default)]
    pub predicate: Option<String>,
    /// Output directory, replaced on every run.
    pub target: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Number of parallel copy tasks (mappers).
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    pub split_column: String,
    /// Typed record schema used when sampling the output.
    #[serde(default)]
    pub schema: Option<Dataset>,
}

fn default_delimiter() -> char {
    ','
}

fn default_parallelism() -> usize {
    1
}

/// Relational connectivity checks.
#[async_trait]
pub trait RelationalSource: Send + Sync {
    /// Run a trivial query.
    async fn execute(&self, query: &str) -> Result<(), CommandError>;

    /// List schema objects; an alternate connectivity proof.
    async fn list_tables(&self) -> Result<Vec<String>, CommandError>;
}

/// Runs the bulk copy for a spec.
#[async_trait]
pub trait BulkCopy: Send + Sync {
    async fn submit(&self, spec: &ImportSpec) -> Result<(), CommandError>;
}

/// Outcome of a successful import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub dataset: String,
    pub target: String,
    /// Approximate row count (non-blank lines across partitions).
    pub rows: u64,
    pub partitions: usize,
}

impl ImportResult {
    /// Zero partitions is a legitimate empty result, reported as a warning.
    pub fn status(&self) -> Status {
        if self.partitions == 0 {
            Status::Warn
        } else {
            Status::Ok
        }
    }
}

/// Runs import specs against a relational source and the storage service.
pub struct ExtractFilterLoader {
    source: Arc<dyn RelationalSource>,
    copier: Arc<dyn BulkCopy>,
    storage: StorageRef,
    probe_query: String,
}

impl ExtractFilterLoader {
    pub fn new(
        source: Arc<dyn RelationalSource>,
        copier: Arc<dyn BulkCopy>,
        storage: StorageRef,
        probe_query: impl Into<String>,
    ) -> Self {
        Self {
            source,
            copier,
            storage,
            probe_query: probe_query.into(),
        }
    }

    /// Import a single dataset.
    pub async fn run_import(&self, spec: &ImportSpec) -> Result<ImportResult, ImportError> {
        let dataset = spec.name.as_str();
        self.confirm_connectivity(dataset).await?;

        self.storage
            .delete_recursive(&spec.target)
            .await
            .context(ClearTargetSnafu { dataset })?;

        info!(dataset, table = %spec.table, target = %spec.target, "Starting bulk copy");
        self.copier
            .submit(spec)
            .await
            .context(BulkCopySnafu { dataset })?;

        let entries = match self.storage.list(&spec.target, false).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e).context(ListOutputSnafu { dataset }),
        };
        let partitions = entries.iter().filter(|e| e.is_data_file()).count();

        let rows = if partitions == 0 {
            warn!(dataset, target = %spec.target, "Import produced no partitions");
            0
        } else {
            let merged = self
                .storage
                .read_merged(&spec.target)
                .await
                .context(CountRowsSnafu { dataset })?;
            count_lines(&merged)
        };

        emit!(ImportCompleted {
            dataset: dataset.to_string(),
            rows,
            partitions,
        });
        info!(dataset, rows, partitions, "Import complete");

        Ok(ImportResult {
            dataset: dataset.to_string(),
            target: spec.target.clone(),
            rows,
            partitions,
        })
    }

    /// Either the probe query or the table listing must succeed.
    async fn confirm_connectivity(&self, dataset: &str) -> Result<(), ImportError> {
        let query_error = match self.source.execute(&self.probe_query).await {
            Ok(()) => return Ok(()),
            Err(e) => e.to_string(),
        };
        warn!(dataset, error = %query_error, "Probe query failed, trying table listing");

        match self.source.list_tables().await {
            Ok(tables) => {
                info!(dataset, tables = tables.len(), "Connectivity confirmed by table listing");
                Ok(())
            }
            Err(e) => ConnectivityUnconfirmedSnafu {
                dataset,
                query_error,
                list_error: e.to_string(),
            }
            .fail(),
        }
    }

    /// Run every spec concurrently; results are returned in spec order.
    ///
    /// Under `HaltOnFirstFailure` the first error drops the imports still in
    /// flight, which are reported as `Aborted`.
    pub async fn run_all(
        &self,
        specs: &[ImportSpec],
        policy: RunPolicy,
    ) -> Vec<Result<ImportResult, ImportError>> {
        let mut slots: Vec<Option<Result<ImportResult, ImportError>>> =
            specs.iter().map(|_| None).collect();

        {
            let mut pending: FuturesUnordered<_> = specs
                .iter()
                .enumerate()
                .map(|(i, spec)| async move { (i, self.run_import(spec).await) })
                .collect();

            while let Some((i, result)) = pending.next().await {
                let failed = result.is_err();
                slots[i] = Some(result);
                if failed && policy == RunPolicy::HaltOnFirstFailure {
                    break;
                }
            }
        }

        slots
            .into_iter()
            .zip(specs)
            .map(|(slot, spec)| {
                slot.unwrap_or_else(|| {
                    Err(ImportError::Aborted {
                        dataset: spec.name.clone(),
                    })
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalConfig, LocalStorage};
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FakeSource {
        query_ok: bool,
        list_ok: bool,
    }

    #[async_trait]
    impl RelationalSource for FakeSource {
        async fn execute(&self, _query: &str) -> Result<(), CommandError> {
            if self.query_ok {
                Ok(())
            } else {
                Err(CommandError::NonZeroExit {
                    program: "sqoop".to_string(),
                    code: 1,
                    stderr: "eval unsupported".to_string(),
                })
            }
        }

        async fn list_tables(&self) -> Result<Vec<String>, CommandError> {
            if self.list_ok {
                Ok(vec!["customers".to_string()])
            } else {
                Err(CommandError::NonZeroExit {
                    program: "sqoop".to_string(),
                    code: 1,
                    stderr: "connection refused".to_string(),
                })
            }
        }
    }

    /// Writes `rows` into the target as two partitions; fails for `fail_table`.
    struct FakeCopy {
        storage: StorageRef,
        rows: Vec<&'static str>,
        fail_table: Option<&'static str>,
        delay: Duration,
        submitted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BulkCopy for FakeCopy {
        async fn submit(&self, spec: &ImportSpec) -> Result<(), CommandError> {
            self.submitted.lock().unwrap().push(spec.name.clone());
            if self.fail_table == Some(spec.table.as_str()) {
                return Err(CommandError::NonZeroExit {
                    program: "sqoop".to_string(),
                    code: 1,
                    stderr: "import failed".to_string(),
                });
            }
            tokio::time::sleep(self.delay).await;
            let (first, second) = self.rows.split_at(self.rows.len() / 2);
            for (i, part) in [first, second].iter().enumerate() {
                if part.is_empty() {
                    continue;
                }
                let body = part.iter().map(|r| format!("{r}\n")).collect::<String>();
                self.storage
                    .write(
                        &format!("{}/part-m-0000{}", spec.target, i),
                        Bytes::from(body),
                    )
                    .await
                    .unwrap();
            }
            Ok(())
        }
    }

    fn storage(dir: &TempDir) -> StorageRef {
        Arc::new(LocalStorage::new(LocalConfig {
            path: dir.path().to_string_lossy().into_owned(),
        }))
    }

    fn spec(name: &str) -> ImportSpec {
        ImportSpec {
            name: name.to_string(),
            table: name.to_string(),
            predicate: None,
            target: format!("/pipeline/imported/{name}"),
            delimiter: ',',
            parallelism: 2,
            split_column: "id".to_string(),
            schema: None,
        }
    }

    fn loader(
        storage: StorageRef,
        source: FakeSource,
        rows: Vec<&'static str>,
        fail_table: Option<&'static str>,
        delay: Duration,
    ) -> (ExtractFilterLoader, Arc<FakeCopy>) {
        let copier = Arc::new(FakeCopy {
            storage: storage.clone(),
            rows,
            fail_table,
            delay,
            submitted: Mutex::new(Vec::new()),
        });
        (
            ExtractFilterLoader::new(Arc::new(source), copier.clone(), storage, "SELECT 1"),
            copier,
        )
    }

    const UP: FakeSource = FakeSource {
        query_ok: true,
        list_ok: true,
    };

    #[tokio::test]
    async fn test_import_counts_rows_and_partitions() {
        let dir = TempDir::new().unwrap();
        let (loader, _) = loader(storage(&dir), UP, vec!["1,a", "2,b", "3,c"], None, Duration::ZERO);

        let result = loader.run_import(&spec("customers")).await.unwrap();
        assert_eq!(result.rows, 3);
        assert_eq!(result.partitions, 2);
        assert_eq!(result.status(), Status::Ok);
    }

    #[tokio::test]
    async fn test_reimport_replaces_stale_output() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        storage
            .write(
                "/pipeline/imported/customers/part-m-00009",
                Bytes::from_static(b"stale\nstale\n"),
            )
            .await
            .unwrap();
        let (loader, _) = loader(storage, UP, vec!["1,a", "2,b"], None, Duration::ZERO);

        let first = loader.run_import(&spec("customers")).await.unwrap();
        let second = loader.run_import(&spec("customers")).await.unwrap();
        assert_eq!(first.rows, 2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_empty_import_is_warning() {
        let dir = TempDir::new().unwrap();
        let (loader, _) = loader(storage(&dir), UP, vec![], None, Duration::ZERO);

        let result = loader.run_import(&spec("customers")).await.unwrap();
        assert_eq!(result.rows, 0);
        assert_eq!(result.partitions, 0);
        assert_eq!(result.status(), Status::Warn);
    }

    #[tokio::test]
    async fn test_connectivity_falls_back_to_listing() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource {
            query_ok: false,
            list_ok: true,
        };
        let (loader, _) = loader(storage(&dir), source, vec!["1,a"], None, Duration::ZERO);
        assert!(loader.run_import(&spec("customers")).await.is_ok());
    }

    #[tokio::test]
    async fn test_connectivity_unconfirmed_skips_copy() {
        let dir = TempDir::new().unwrap();
        let source = FakeSource {
            query_ok: false,
            list_ok: false,
        };
        let (loader, copier) = loader(storage(&dir), source, vec!["1,a"], None, Duration::ZERO);

        let err = loader.run_import(&spec("customers")).await.unwrap_err();
        match err {
            ImportError::ConnectivityUnconfirmed {
                query_error,
                list_error,
                ..
            } => {
                assert!(query_error.contains("eval unsupported"));
                assert!(list_error.contains("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(copier.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_continue_policy_runs_every_spec() {
        let dir = TempDir::new().unwrap();
        let (loader, _) = loader(
            storage(&dir),
            UP,
            vec!["1,a", "2,b"],
            Some("customers"),
            Duration::from_millis(50),
        );

        let results = loader
            .run_all(&[spec("customers"), spec("orders")], RunPolicy::ContinueAndAggregate)
            .await;
        assert!(matches!(results[0], Err(ImportError::BulkCopy { .. })));
        assert_eq!(results[1].as_ref().unwrap().rows, 2);
    }

    #[tokio::test]
    async fn test_halt_policy_aborts_siblings() {
        let dir = TempDir::new().unwrap();
        let storage = storage(&dir);
        let (loader, _) = loader(
            storage.clone(),
            UP,
            vec!["1,a", "2,b"],
            Some("customers"),
            Duration::from_secs(5),
        );

        let results = loader
            .run_all(&[spec("customers"), spec("orders")], RunPolicy::HaltOnFirstFailure)
            .await;
        assert!(matches!(results[0], Err(ImportError::BulkCopy { .. })));
        assert!(matches!(results[1], Err(ImportError::Aborted { .. })));
        assert!(!storage.exists("/pipeline/imported/orders").await.unwrap());
    }
}
