//! External command contract.
//!
//! Every collaborator (storage CLI, bulk copy, job runner, relational probe)
//! is driven through a bounded command whose exit status and textual output
//! are interpreted by the caller. `CommandRunner` is the seam that lets tests
//! substitute scripted responses for real processes.

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::emit;
use crate::error::{
    CommandError, EmptyCommandSnafu, NonZeroExitSnafu, SpawnSnafu, TimeoutSnafu, WaitSnafu,
};
use crate::metrics::events::CommandExecuted;

/// A reference-counted command runner.
pub type CommandRunnerRef = Arc<dyn CommandRunner>;

/// A single program invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Bytes>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    /// Build an invocation from an argv vector (first element is the program).
    pub fn from_argv(argv: &[String]) -> Self {
        match argv.split_first() {
            Some((program, args)) => Self::new(program.clone()).args(args.iter().cloned()),
            None => Self::default(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: Bytes) -> Self {
        self.stdin = Some(input);
        self
    }

    /// Run this invocation through a wrapper such as `docker exec <container>`.
    ///
    /// An empty prefix returns the invocation unchanged.
    pub fn prefixed(self, prefix: &[String]) -> Self {
        let Some((program, rest)) = prefix.split_first() else {
            return self;
        };
        let mut args: Vec<String> = rest.to_vec();
        args.push(self.program);
        args.extend(self.args);
        Self {
            program: program.clone(),
            args,
            stdin: self.stdin,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        let mut redact = false;
        for arg in &self.args {
            if std::mem::replace(&mut redact, arg == "--password") {
                write!(f, " ***")?;
            } else if arg.contains(char::is_whitespace) || arg.is_empty() {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes invocations against the outside world.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and capture output regardless of exit status.
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError>;

    /// Run to completion, failing on a non-zero exit status.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        let output = self.output(invocation).await?;
        ensure!(
            output.success(),
            NonZeroExitSnafu {
                program: invocation.program.clone(),
                code: output.code.unwrap_or(-1),
                stderr: output.stderr.trim().to_string(),
            }
        );
        Ok(output)
    }
}

/// Runs invocations as local child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn output(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        ensure!(!invocation.program.is_empty(), EmptyCommandSnafu);
        debug!("Executing: {}", invocation);

        let program = invocation.program.clone();
        let start = Instant::now();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context(SpawnSnafu {
            program: program.clone(),
        })?;

        // Feed stdin from a separate task so a chatty child cannot deadlock on a full stdout pipe.
        let feeder = match (invocation.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(tokio::spawn(async move {
                let result = stdin.write_all(&input).await;
                drop(stdin);
                result
            })),
            _ => None,
        };

        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return TimeoutSnafu {
                        program,
                        secs: limit.as_secs(),
                    }
                    .fail();
                }
            },
            None => wait.await,
        }
        .context(WaitSnafu {
            program: program.clone(),
        })?;

        if let Some(feeder) = feeder {
            let written = feeder.await.unwrap_or_else(|e| Err(std::io::Error::other(e)));
            match written {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                    return Err(e).context(WaitSnafu { program });
                }
                _ => {}
            }
        }

        let output = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        emit!(CommandExecuted {
            program,
            success: output.success(),
            duration: start.elapsed(),
        });

        Ok(output)
    }
}
