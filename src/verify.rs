//! Independent health report over every pipeline artifact and service.
//!
//! Checks run concurrently and never short-circuit one another: a failing
//! check is recorded and the rest still report. The exit code is the number
//! of failing checks.

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use snafu::prelude::*;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::aggregate::{read_output, truncate};
use crate::command::CommandRunnerRef;
use crate::config::Config;
use crate::emit;
use crate::error::{
    CheckJobSnafu, CheckStorageSnafu, MissingSnafu, UnreachableSnafu, VerificationFailure,
    error_chain,
};
use crate::import::{ImportSpec, RelationalSource};
use crate::metrics::events::CheckCompleted;
use crate::pipeline::Status;
use crate::readiness::{Probe, ServiceEndpoint, await_ready};
use crate::storage::{StorageRef, count_lines};

/// Status and detail of a check that completed.
type Checked = Result<(Status, String), VerificationFailure>;

/// One verification check's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub name: String,
    pub status: Status,
    pub detail: String,
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:<4}] {:<24} {}", self.status, self.name, self.detail)
    }
}

/// Every check's outcome, in a fixed order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    checks: Vec<CheckOutcome>,
}

impl Report {
    pub fn checks(&self) -> &[CheckOutcome] {
        &self.checks
    }

    pub fn get(&self, name: &str) -> Option<&CheckOutcome> {
        self.checks.iter().find(|c| c.name == name)
    }

    fn count(&self, status: Status) -> usize {
        self.checks.iter().filter(|c| c.status == status).count()
    }

    pub fn failed(&self) -> usize {
        self.count(Status::Fail)
    }

    pub fn warned(&self) -> usize {
        self.count(Status::Warn)
    }

    /// Worst status across all checks.
    pub fn status(&self) -> Status {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(Status::Ok)
    }

    /// Process exit code: the number of failing checks, saturated.
    pub fn exit_code(&self) -> i32 {
        i32::try_from(self.failed()).unwrap_or(i32::MAX)
    }

    /// One line per check plus a summary line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for check in &self.checks {
            out.push_str(&check.to_string());
            out.push('\n');
        }
        out.push_str(&format!(
            "{} check(s): {} ok, {} warn, {} fail\n",
            self.checks.len(),
            self.count(Status::Ok),
            self.warned(),
            self.failed()
        ));
        out
    }
}

/// Probe query with table-listing fallback, as a readiness probe.
struct RelationalProbe {
    source: Arc<dyn RelationalSource>,
    query: String,
}

#[async_trait]
impl Probe for RelationalProbe {
    fn target(&self) -> String {
        "relational source".to_string()
    }

    async fn probe(&self) -> Result<(), String> {
        let query_error = match self.source.execute(&self.query).await {
            Ok(()) => return Ok(()),
            Err(e) => e.to_string(),
        };
        self.source
            .list_tables()
            .await
            .map(|_| ())
            .map_err(|e| format!("query: {query_error}; list-tables: {e}"))
    }
}

/// Re-checks each component's artifacts and services.
pub struct VerificationReporter {
    config: Config,
    storage: StorageRef,
    runner: CommandRunnerRef,
    source: Arc<dyn RelationalSource>,
}

impl VerificationReporter {
    pub fn new(
        config: Config,
        storage: StorageRef,
        runner: CommandRunnerRef,
        source: Arc<dyn RelationalSource>,
    ) -> Self {
        Self {
            config,
            storage,
            runner,
            source,
        }
    }

    /// Run every check concurrently and join them into one report.
    pub async fn verify_all(&self) -> Report {
        let mut checks: Vec<(String, BoxFuture<'_, Checked>)> = vec![
            ("namespace".to_string(), self.check_namespace().boxed()),
            ("streaming".to_string(), self.check_streaming().boxed()),
        ];
        for spec in &self.config.imports {
            checks.push((format!("import:{}", spec.name), self.check_import(spec).boxed()));
        }
        checks.push(("aggregation".to_string(), self.check_aggregation().boxed()));
        checks.push(("relational".to_string(), self.check_relational().boxed()));
        for endpoint in &self.config.services {
            checks.push((
                format!("service:{}", endpoint.name),
                self.check_service(endpoint).boxed(),
            ));
        }

        let (names, futures): (Vec<_>, Vec<_>) = checks.into_iter().unzip();
        let results = join_all(futures).await;

        let checks: Vec<CheckOutcome> = names
            .into_iter()
            .zip(results)
            .map(|(name, result)| {
                let (status, detail) = match result {
                    Ok(checked) => checked,
                    Err(e) => (Status::Fail, error_chain(&e)),
                };
                match status {
                    Status::Fail => warn!(check = %name, detail = %detail, "Check failed"),
                    _ => info!(check = %name, status = status.as_str(), detail = %detail, "Check complete"),
                }
                emit!(CheckCompleted {
                    check: name.clone(),
                    status,
                });
                CheckOutcome {
                    name,
                    status,
                    detail,
                }
            })
            .collect();

        Report { checks }
    }

    /// Every required child exists as a directory; reports data file counts.
    async fn check_namespace(&self) -> Checked {
        let tree = &self.config.namespace;
        let root_present = self
            .storage
            .test_is_directory(&tree.root)
            .await
            .context(CheckStorageSnafu { path: &tree.root })?;
        ensure!(
            root_present,
            MissingSnafu {
                resource: format!("namespace root {}", tree.root)
            }
        );

        let entries = self
            .storage
            .list(&tree.root, true)
            .await
            .context(CheckStorageSnafu { path: &tree.root })?;

        let mut counts = Vec::with_capacity(tree.children.len());
        for child in tree.child_paths() {
            let present = entries.iter().any(|e| e.path == child && e.is_dir);
            ensure!(present, MissingSnafu { resource: &child });
            let prefix = format!("{child}/");
            let files = entries
                .iter()
                .filter(|e| e.path.starts_with(&prefix) && e.is_data_file())
                .count();
            let name = child.rsplit('/').next().unwrap_or(&child).to_string();
            counts.push(format!("{name}={files}"));
        }

        Ok((
            Status::Ok,
            format!(
                "{} children present, files: {}",
                tree.children.len(),
                counts.join(" ")
            ),
        ))
    }

    /// Count streaming files and sample the newest one.
    async fn check_streaming(&self) -> Checked {
        let area = &self.config.ingestion.area;
        let entries = match self.storage.list(area, true).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                return MissingSnafu {
                    resource: format!("streaming area {area}"),
                }
                .fail();
            }
            Err(e) => return Err(e).context(CheckStorageSnafu { path: area }),
        };

        let files: Vec<_> = entries.iter().filter(|e| e.is_data_file()).collect();
        let Some(newest) = files.iter().map(|e| e.path.as_str()).max() else {
            return Ok((Status::Warn, format!("no files in {area} yet")));
        };

        let sample = self
            .storage
            .read_head(newest, self.config.verification.sample_lines)
            .await
            .context(CheckStorageSnafu { path: newest })?;
        let first = sample.first().map(|l| truncate(l, 80)).unwrap_or("<empty>");

        Ok((
            Status::Ok,
            format!("{} file(s), newest {newest}: {first}", files.len()),
        ))
    }

    /// Partition and row counts for one import, with typed sample rows.
    async fn check_import(&self, spec: &ImportSpec) -> Checked {
        let target = &spec.target;
        let entries = match self.storage.list(target, false).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => {
                return MissingSnafu {
                    resource: format!("import target {target}"),
                }
                .fail();
            }
            Err(e) => return Err(e).context(CheckStorageSnafu { path: target }),
        };

        let partitions = entries.iter().filter(|e| e.is_data_file()).count();
        if partitions == 0 {
            return Ok((Status::Warn, format!("no partitions in {target}")));
        }

        let merged = self
            .storage
            .read_merged(target)
            .await
            .context(CheckStorageSnafu { path: target })?;
        let rows = count_lines(&merged);
        if rows == 0 {
            return Ok((
                Status::Warn,
                format!("{partitions} partition(s) with no rows"),
            ));
        }

        let detail = format!("{rows} row(s) in {partitions} partition(s)");
        let Some(schema) = spec.schema else {
            return Ok((Status::Ok, detail));
        };

        let sample = self
            .storage
            .read_head(target, self.config.verification.sample_lines)
            .await
            .context(CheckStorageSnafu { path: target })?;
        for (index, line) in sample.iter().filter(|l| !l.trim().is_empty()).enumerate() {
            if let Err(e) = schema.parse_row(line, spec.delimiter) {
                return Ok((Status::Warn, format!("{detail}; sample row {}: {e}", index + 1)));
            }
        }

        Ok((Status::Ok, format!("{detail}; {} sample row(s) parsed", sample.len())))
    }

    /// The aggregation output exists and parses; lists the top keys.
    async fn check_aggregation(&self) -> Checked {
        let output = &self.config.aggregation.output;
        let present = self
            .storage
            .exists(output)
            .await
            .context(CheckStorageSnafu { path: output })?;
        ensure!(
            present,
            MissingSnafu {
                resource: format!("aggregation output {output}")
            }
        );

        let (result, partitions) = read_output(&self.storage, output)
            .await
            .context(CheckJobSnafu)?;
        if result.is_empty() {
            return Ok((Status::Warn, format!("no keys in {partitions} partition(s)")));
        }

        let top: Vec<String> = result
            .rows()
            .iter()
            .take(self.config.verification.sample_lines)
            .map(|(key, count)| format!("{key}={count}"))
            .collect();
        Ok((
            Status::Ok,
            format!(
                "{} key(s), {} record(s); top: {}",
                result.len(),
                result.total(),
                top.join(" ")
            ),
        ))
    }

    async fn check_relational(&self) -> Checked {
        let policy = self.config.verification.probe_policy();
        let probe = RelationalProbe {
            source: self.source.clone(),
            query: self.config.relational.probe_query.clone(),
        };
        let ready = await_ready(&probe, policy.max_attempts, policy.interval())
            .await
            .context(UnreachableSnafu)?;
        Ok((
            Status::Ok,
            format!("reachable after {} attempt(s)", ready.attempts),
        ))
    }

    async fn check_service(&self, endpoint: &ServiceEndpoint) -> Checked {
        let verification = &self.config.verification;
        let policy = verification.probe_policy();
        let probe = endpoint
            .probe(
                self.runner.clone(),
                Duration::from_secs(verification.http_timeout_secs),
            )
            .context(UnreachableSnafu)?;
        let ready = await_ready(probe.as_ref(), policy.max_attempts, policy.interval())
            .await
            .context(UnreachableSnafu)?;
        Ok((
            Status::Ok,
            format!("{endpoint} reachable after {} attempt(s)", ready.attempts),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, CommandRunner, Invocation};
    use crate::error::CommandError;
    use crate::readiness::Protocol;
    use crate::storage::{LocalConfig, LocalStorage};
    use bytes::Bytes;
    use tempfile::TempDir;

    struct NoCommands;

    #[async_trait]
    impl CommandRunner for NoCommands {
        async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
            Err(CommandError::NonZeroExit {
                program: invocation.program.clone(),
                code: 1,
                stderr: String::new(),
            })
        }
    }

    struct Source {
        up: bool,
    }

    #[async_trait]
    impl RelationalSource for Source {
        async fn execute(&self, _query: &str) -> Result<(), CommandError> {
            if self.up {
                Ok(())
            } else {
                Err(CommandError::NonZeroExit {
                    program: "sqoop".to_string(),
                    code: 1,
                    stderr: "Access denied".to_string(),
                })
            }
        }

        async fn list_tables(&self) -> Result<Vec<String>, CommandError> {
            self.execute("").await.map(|_| Vec::new())
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.services.clear();
        config.verification.probe_interval_secs = 0;
        config
    }

    fn reporter(dir: &TempDir, config: Config, source_up: bool) -> (VerificationReporter, StorageRef) {
        let storage: StorageRef = Arc::new(LocalStorage::new(LocalConfig {
            path: dir.path().to_string_lossy().into_owned(),
        }));
        let reporter = VerificationReporter::new(
            config,
            storage.clone(),
            Arc::new(NoCommands),
            Arc::new(Source { up: source_up }),
        );
        (reporter, storage)
    }

    async fn seed(storage: &StorageRef) {
        for child in ["streaming", "imported", "raw", "aggregated"] {
            storage
                .mkdir_recursive(&format!("/pipeline/{child}"))
                .await
                .unwrap();
        }
        storage
            .write(
                "/pipeline/imported/customers/part-m-00000",
                Bytes::from_static(b"1,Ada,Lovelace,ada@example.com,Austin,TX,USA\n"),
            )
            .await
            .unwrap();
        storage
            .write(
                "/pipeline/imported/orders/part-m-00000",
                Bytes::from_static(b"10,1,2024-05-01 10:00:00.0,COMPLETE\n"),
            )
            .await
            .unwrap();
        storage
            .write(
                "/pipeline/aggregated/action_counts/part-00000",
                Bytes::from_static(b"view\t2\nclick\t1\n"),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_check_does_not_stop_others() {
        let dir = TempDir::new().unwrap();
        let (reporter, storage) = reporter(&dir, config(), false);
        seed(&storage).await;

        let report = reporter.verify_all().await;

        assert_eq!(report.get("relational").unwrap().status, Status::Fail);
        assert_eq!(report.get("namespace").unwrap().status, Status::Ok);
        let aggregation = report.get("aggregation").unwrap();
        assert_eq!(aggregation.status, Status::Ok);
        assert!(aggregation.detail.contains("view=2 click=1"));
        assert_eq!(report.failed(), 1);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_empty_and_malformed_results_warn() {
        let dir = TempDir::new().unwrap();
        let (reporter, storage) = reporter(&dir, config(), true);
        seed(&storage).await;

        let report = reporter.verify_all().await;

        assert_eq!(report.get("streaming").unwrap().status, Status::Warn);
        assert_eq!(report.get("import:customers").unwrap().status, Status::Ok);
        // Order rows are missing the amount column.
        let orders = report.get("import:orders").unwrap();
        assert_eq!(orders.status, Status::Warn);
        assert!(orders.detail.contains("columns"));
        assert_eq!(report.failed(), 0);
        assert_eq!(report.status(), Status::Warn);
    }

    #[tokio::test]
    async fn test_missing_artifacts_fail() {
        let dir = TempDir::new().unwrap();
        let (reporter, _) = reporter(&dir, config(), true);

        let report = reporter.verify_all().await;

        for name in ["namespace", "streaming", "import:customers", "import:orders", "aggregation"] {
            assert_eq!(report.get(name).unwrap().status, Status::Fail, "{name}");
        }
        assert_eq!(report.get("relational").unwrap().status, Status::Ok);
        assert_eq!(report.failed(), 5);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_reported() {
        let dir = TempDir::new().unwrap();
        let mut config = config();
        config.services.push(ServiceEndpoint {
            name: "hiveserver".to_string(),
            address: "hiveserver:10000".to_string(),
            protocol: Protocol::Command,
            command: vec!["beeline".to_string(), "-e".to_string(), "SELECT 1".to_string()],
        });
        let (reporter, storage) = reporter(&dir, config, true);
        seed(&storage).await;

        let report = reporter.verify_all().await;
        let service = report.get("service:hiveserver").unwrap();
        assert_eq!(service.status, Status::Fail);
        assert!(service.detail.contains("not ready after 1 attempts"));
    }

    #[test]
    fn test_render_lists_every_check() {
        let report = Report {
            checks: vec![
                CheckOutcome {
                    name: "namespace".to_string(),
                    status: Status::Ok,
                    detail: "4 children present".to_string(),
                },
                CheckOutcome {
                    name: "relational".to_string(),
                    status: Status::Fail,
                    detail: "unreachable".to_string(),
                },
            ],
        };
        let rendered = report.render();
        assert!(rendered.contains("[ok  ] namespace"));
        assert!(rendered.contains("[fail] relational"));
        assert!(rendered.ends_with("2 check(s): 1 ok, 0 warn, 1 fail\n"));
    }
}
