//! Integration tests for avalanche

use async_trait::async_trait;
use avalanche::command::{CommandOutput, CommandRunner, Invocation};
use avalanche::config::Config;
use avalanche::error::CommandError;
use avalanche::import::{BulkCopy, ImportSpec, RelationalSource};
use avalanche::storage::{LocalConfig, LocalStorage, StorageRef};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

/// Every external command fails, as if the CLI tools were not installed.
struct Offline;

#[async_trait]
impl CommandRunner for Offline {
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        Err(CommandError::NonZeroExit {
            program: invocation.program.clone(),
            code: 127,
            stderr: format!("{}: command not found", invocation.program),
        })
    }
}

/// Relational source whose availability can be flipped mid-test.
struct Retail {
    up: AtomicBool,
}

impl Retail {
    fn new(up: bool) -> Arc<Self> {
        Arc::new(Self {
            up: AtomicBool::new(up),
        })
    }
}

#[async_trait]
impl RelationalSource for Retail {
    async fn execute(&self, _query: &str) -> Result<(), CommandError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CommandError::NonZeroExit {
                program: "sqoop".to_string(),
                code: 1,
                stderr: "Communications link failure".to_string(),
            })
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>, CommandError> {
        self.execute("SHOW TABLES").await?;
        Ok(vec!["customers".to_string(), "orders".to_string()])
    }
}

/// Copies fixed rows, honoring the predicate the way the database would.
struct RetailCopy {
    storage: StorageRef,
}

const CUSTOMERS: &[&str] = &[
    "1,Ada,Lovelace,ada@example.com,Austin,TX,USA",
    "2,Alan,Turing,alan@example.com,London,null,UK",
    "3,Grace,Hopper,grace@example.com,Arlington,VA,USA",
];

const ORDERS: &[&str] = &[
    "10,1,2024-05-01 10:00:00.0,COMPLETE,19.99",
    "11,2,2024-05-02 11:30:00.0,PENDING,5.00",
    "12,3,2024-05-03 09:15:00.0,COMPLETE,42.50",
];

#[async_trait]
impl BulkCopy for RetailCopy {
    async fn submit(&self, spec: &ImportSpec) -> Result<(), CommandError> {
        let (rows, wanted) = match spec.table.as_str() {
            "customers" => (CUSTOMERS, ",USA"),
            _ => (ORDERS, ",COMPLETE,"),
        };
        let selected: Vec<&str> = rows.iter().copied().filter(|r| r.contains(wanted)).collect();

        // One partition per mapper, rows dealt round-robin.
        for mapper in 0..spec.parallelism {
            let body: String = selected
                .iter()
                .skip(mapper)
                .step_by(spec.parallelism)
                .map(|r| format!("{r}\n"))
                .collect();
            if body.is_empty() {
                continue;
            }
            self.storage
                .write(
                    &format!("{}/part-m-{mapper:05}", spec.target),
                    Bytes::from(body),
                )
                .await
                .map_err(|e| CommandError::NonZeroExit {
                    program: "sqoop".to_string(),
                    code: 1,
                    stderr: e.to_string(),
                })?;
        }
        self.storage
            .write(&format!("{}/_SUCCESS", spec.target), Bytes::new())
            .await
            .map_err(|e| CommandError::NonZeroExit {
                program: "sqoop".to_string(),
                code: 1,
                stderr: e.to_string(),
            })
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.readiness.max_attempts = 1;
    config.storage.readiness.interval_secs = 0;
    config.ingestion.timeout_secs = 0;
    config.ingestion.poll_interval_secs = 0;
    config.verification.probe_interval_secs = 0;
    config.services.clear();
    config
}

fn local_storage(dir: &TempDir) -> StorageRef {
    Arc::new(LocalStorage::new(LocalConfig {
        path: dir.path().to_string_lossy().into_owned(),
    }))
}

mod pipeline_tests {
    use super::*;
    use avalanche::aggregate::LocalJobRunner;
    use avalanche::pipeline::{Orchestrator, PipelineState, RunPolicy, Stage, Status};

    fn orchestrator(storage: StorageRef, source: Arc<Retail>) -> Orchestrator {
        Orchestrator::with_collaborators(
            test_config(),
            storage.clone(),
            Arc::new(Offline),
            source,
            Arc::new(RetailCopy {
                storage: storage.clone(),
            }),
            Arc::new(LocalJobRunner::new(storage)),
        )
    }

    async fn seed_events(storage: &StorageRef) {
        storage
            .write(
                "/pipeline/streaming/2024-05-01/events.1714557600.log",
                Bytes::from_static(b"{\"action\":\"VIEW\"}\n"),
            )
            .await
            .unwrap();
        storage
            .write(
                "/pipeline/raw/events.log",
                Bytes::from_static(
                    b"{\"action\":\"view\"}\n{\"action\":\"view\"}\n{\"action\":\"click\"}\n",
                ),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let dir = TempDir::new().unwrap();
        let storage = local_storage(&dir);
        seed_events(&storage).await;
        let orchestrator = orchestrator(storage.clone(), Retail::new(true));

        let run = orchestrator.run(RunPolicy::HaltOnFirstFailure).await;

        assert_eq!(run.state(), PipelineState::Done);
        assert_eq!(run.status(), Status::Ok, "{:#?}", run.outcomes());
        let stages: Vec<Stage> = run.outcomes().iter().map(|o| o.stage).collect();
        assert_eq!(stages, Stage::ALL.to_vec());

        let output = storage
            .read_merged("/pipeline/aggregated/action_counts")
            .await
            .unwrap();
        assert_eq!(&output[..], b"view\t2\nclick\t1\n");

        let customers = storage
            .read_merged("/pipeline/imported/customers")
            .await
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&customers).lines().count(), 2);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = local_storage(&dir);
        seed_events(&storage).await;
        let orchestrator = orchestrator(storage.clone(), Retail::new(true));

        let layout = || async {
            storage
                .list("/pipeline", true)
                .await
                .unwrap()
                .into_iter()
                .map(|e| (e.path, e.is_dir, e.size))
                .collect::<Vec<_>>()
        };

        orchestrator.run(RunPolicy::HaltOnFirstFailure).await;
        let first = layout().await;
        orchestrator.run(RunPolicy::HaltOnFirstFailure).await;
        let second = layout().await;

        assert_eq!(first, second);
        let output = storage
            .read_merged("/pipeline/aggregated/action_counts")
            .await
            .unwrap();
        assert_eq!(&output[..], b"view\t2\nclick\t1\n");
    }

    #[tokio::test]
    async fn test_halted_run_names_failing_stage() {
        let dir = TempDir::new().unwrap();
        let storage = local_storage(&dir);
        seed_events(&storage).await;
        let orchestrator = orchestrator(storage.clone(), Retail::new(false));

        let run = orchestrator.run(RunPolicy::HaltOnFirstFailure).await;

        assert_eq!(run.state(), PipelineState::Aborted);
        assert_eq!(run.exit_status(), 1);
        let err = run.into_result().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Importing));
        assert!(err.to_string().contains("importing"));
        assert!(
            !storage
                .exists("/pipeline/aggregated/action_counts")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_dry_run_plan_from_file_config() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            r#"
storage:
  url: "file://{}"
aggregation:
  reducers: 2
"#,
            dir.path().display()
        );
        let config = Config::from_yaml(&yaml, false).unwrap();
        let orchestrator = Orchestrator::from_config(config).unwrap();

        let plan = orchestrator.plan();
        assert_eq!(plan.len(), 2 + orchestrator.config().imports.len() + 2);
        assert!(plan.iter().any(|l| l.contains("2 reducer(s)")));

        // Local storage needs no external commands, so provisioning works as-is.
        let tree = orchestrator.provision().await.unwrap();
        assert_eq!(tree.children.len(), 4);
        assert!(dir.path().join("pipeline/aggregated").is_dir());
    }
}

mod verify_tests {
    use super::*;
    use avalanche::aggregate::LocalJobRunner;
    use avalanche::pipeline::{Orchestrator, RunPolicy, Status};

    #[tokio::test]
    async fn test_checks_isolated_from_relational_outage() {
        let dir = TempDir::new().unwrap();
        let storage = local_storage(&dir);
        storage
            .write(
                "/pipeline/raw/events.log",
                Bytes::from_static(b"{\"action\":\"search\"}\n"),
            )
            .await
            .unwrap();
        let source = Retail::new(true);
        let orchestrator = Orchestrator::with_collaborators(
            test_config(),
            storage.clone(),
            Arc::new(Offline),
            source.clone(),
            Arc::new(RetailCopy {
                storage: storage.clone(),
            }),
            Arc::new(LocalJobRunner::new(storage.clone())),
        );
        let run = orchestrator.run(RunPolicy::HaltOnFirstFailure).await;
        assert_eq!(run.failed_stages(), 0);

        source.up.store(false, Ordering::SeqCst);
        let report = orchestrator.reporter().verify_all().await;

        assert_eq!(report.get("relational").unwrap().status, Status::Fail);
        assert_eq!(report.get("namespace").unwrap().status, Status::Ok);
        assert_eq!(report.get("aggregation").unwrap().status, Status::Ok);
        assert_eq!(report.get("import:orders").unwrap().status, Status::Ok);
        assert_eq!(report.exit_code(), 1);
        assert!(report.render().contains("[fail] relational"));
    }
}

mod streaming_tests {
    use avalanche::aggregate::{map_lines, reduce_lines};
    use avalanche::generator::{LogGenerator, LogRecord};
    use chrono::Utc;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_generated_records_through_map_and_reduce() {
        let mut generator = LogGenerator::new(StdRng::seed_from_u64(42));
        let records: Vec<LogRecord> = (0..100).map(|_| generator.next_record(Utc::now())).collect();
        let mut input: String = records
            .iter()
            .map(|r| format!("{}\n", serde_json::to_string(r).unwrap()))
            .collect();
        input.push_str("not a record\n");

        let mut mapped = Vec::new();
        let stats = map_lines(input.as_bytes(), &mut mapped).unwrap();
        assert_eq!(stats.emitted, 100);
        assert_eq!(stats.skipped, 1);

        let mut reduced = Vec::new();
        let (result, skipped) = reduce_lines(mapped.as_slice(), &mut reduced).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(result.total(), 100);

        let counts: Vec<u64> = result.rows().iter().map(|(_, c)| *c).collect();
        assert!(counts.windows(2).all(|w| w[0] >= w[1]));
    }
}
