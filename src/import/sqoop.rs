//! Sqoop command-line client for the relational source.

use async_trait::async_trait;

use crate::command::{CommandRunnerRef, Invocation};
use crate::config::RelationalConfig;
use crate::error::CommandError;

use super::{BulkCopy, ImportSpec, RelationalSource};

/// Runs `sqoop eval`, `sqoop list-tables`, and `sqoop import`.
pub struct SqoopCli {
    config: RelationalConfig,
    runner: CommandRunnerRef,
    /// Runs the connectivity checks; imports keep `runner`.
    connectivity: CommandRunnerRef,
}

impl SqoopCli {
    pub fn new(config: RelationalConfig, runner: CommandRunnerRef) -> Self {
        Self {
            config,
            connectivity: runner.clone(),
            runner,
        }
    }

    /// Use a separate (usually time-bounded) runner for `eval` and `list-tables`.
    pub fn with_connectivity_runner(mut self, runner: CommandRunnerRef) -> Self {
        self.connectivity = runner;
        self
    }

    fn command(&self, tool: &str) -> Invocation {
        let mut inv = Invocation::new("sqoop")
            .arg(tool)
            .args(["--connect", &self.config.connect])
            .args(["--username", &self.config.username]);
        if !self.config.password.is_empty() {
            inv = inv.args(["--password", &self.config.password]);
        }
        inv
    }

    pub(crate) fn import_invocation(&self, spec: &ImportSpec) -> Invocation {
        let mut inv = self
            .command("import")
            .args(["--table", &spec.table])
            .args(["--target-dir", &spec.target])
            .args(["--fields-terminated-by".to_string(), spec.delimiter.to_string()])
            .args(["-m".to_string(), spec.parallelism.to_string()])
            .args(["--split-by", &spec.split_column]);
        if let Some(predicate) = spec.predicate.as_deref().filter(|p| !p.trim().is_empty()) {
            inv = inv.args(["--where", predicate]);
        }
        inv.prefixed(&self.config.exec_prefix)
    }
}

#[async_trait]
impl RelationalSource for SqoopCli {
    async fn execute(&self, query: &str) -> Result<(), CommandError> {
        let inv = self
            .command("eval")
            .args(["--query", query])
            .prefixed(&self.config.exec_prefix);
        self.connectivity.run(&inv).await.map(|_| ())
    }

    async fn list_tables(&self) -> Result<Vec<String>, CommandError> {
        let inv = self
            .command("list-tables")
            .prefixed(&self.config.exec_prefix);
        let output = self.connectivity.run(&inv).await?;
        // Sqoop logs to stderr; stdout carries one table name per line.
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.contains(' '))
            .map(str::to_string)
            .collect())
    }
}

#[async_trait]
impl BulkCopy for SqoopCli {
    async fn submit(&self, spec: &ImportSpec) -> Result<(), CommandError> {
        self.runner
            .run(&self.import_invocation(spec))
            .await
            .map(|_| ())
    }
}
