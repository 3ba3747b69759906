//! Readiness gate.
//!
//! Polls a dependent service at a fixed interval until it answers or a bounded
//! attempt budget runs out. Used before provisioning (storage) and by the
//! verification report (every configured service endpoint).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::command::{CommandRunnerRef, Invocation};
use crate::emit;
use crate::error::{HttpClientSnafu, ReadinessError, TimedOutSnafu};
use crate::metrics::events::ProbeAttempt;
use crate::storage::StorageRef;

/// A side-effect-free reachability check.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Name used in logs, metrics, and errors.
    fn target(&self) -> String;

    /// One attempt. The error string is kept for the final `TimedOut`.
    async fn probe(&self) -> Result<(), String>;
}

/// The probe succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    /// Attempts used, including the successful one.
    pub attempts: u32,
}

/// Poll `probe` until it succeeds, at most `max_attempts` times.
///
/// There is no backoff: attempts are spaced by `interval` and no sleep follows
/// the final attempt.
pub async fn await_ready(
    probe: &dyn Probe,
    max_attempts: u32,
    interval: Duration,
) -> Result<Ready, ReadinessError> {
    let target = probe.target();
    let mut last_error = "no attempts allowed".to_string();

    for attempt in 1..=max_attempts {
        match probe.probe().await {
            Ok(()) => {
                emit!(ProbeAttempt {
                    target: target.clone(),
                    success: true,
                });
                info!(target = %target, attempt, "Service ready");
                return Ok(Ready { attempts: attempt });
            }
            Err(e) => {
                emit!(ProbeAttempt {
                    target: target.clone(),
                    success: false,
                });
                debug!(target = %target, attempt, max_attempts, error = %e, "Service not ready");
                last_error = e;
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }

    TimedOutSnafu {
        target,
        attempts: max_attempts,
        last_error,
    }
    .fail()
}

/// `GET <url>`; any 2xx or 3xx answer counts as reachable.
pub struct HttpProbe {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(name: &str, url: &str, timeout: Duration) -> Result<Self, ReadinessError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context(HttpClientSnafu { target: name })?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    fn target(&self) -> String {
        self.name.clone()
    }

    async fn probe(&self) -> Result<(), String> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| format!("GET {} failed: {}", self.url, e))?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Err(format!("GET {} returned {}", self.url, status))
        }
    }
}

/// Open a TCP connection to `host:port`.
pub struct TcpProbe {
    name: String,
    address: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(name: &str, address: &str, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            address: address.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn target(&self) -> String {
        self.name.clone()
    }

    async fn probe(&self) -> Result<(), String> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(format!("connect {} failed: {}", self.address, e)),
            Err(_) => Err(format!(
                "connect {} timed out after {:?}",
                self.address, self.timeout
            )),
        }
    }
}

/// Run a command; exit status 0 is success.
pub struct CommandProbe {
    name: String,
    runner: CommandRunnerRef,
    invocation: Invocation,
}

impl CommandProbe {
    pub fn new(name: &str, runner: CommandRunnerRef, invocation: Invocation) -> Self {
        Self {
            name: name.to_string(),
            runner,
            invocation,
        }
    }
}

#[async_trait]
impl Probe for CommandProbe {
    fn target(&self) -> String {
        self.name.clone()
    }

    async fn probe(&self) -> Result<(), String> {
        self.runner
            .run(&self.invocation)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// The storage service answers when its root is a listable directory.
pub struct StorageProbe {
    storage: StorageRef,
}

impl StorageProbe {
    pub fn new(storage: StorageRef) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Probe for StorageProbe {
    fn target(&self) -> String {
        self.storage.describe()
    }

    async fn probe(&self) -> Result<(), String> {
        match self.storage.test_is_directory("/").await {
            Ok(true) => Ok(()),
            Ok(false) => Err("storage root is not a directory".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// How a service endpoint is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Tcp,
    Command,
}

/// A dependent service and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    /// URL for `http`, `host:port` for `tcp`, informational for `command`.
    pub address: String,
    pub protocol: Protocol,
    /// Argv for the `command` protocol.
    #[serde(default)]
    pub command: Vec<String>,
}

impl ServiceEndpoint {
    /// Build the probe for this endpoint.
    pub fn probe(
        &self,
        runner: CommandRunnerRef,
        timeout: Duration,
    ) -> Result<Box<dyn Probe>, ReadinessError> {
        Ok(match self.protocol {
            Protocol::Http => Box::new(HttpProbe::new(&self.name, &self.address, timeout)?),
            Protocol::Tcp => Box::new(TcpProbe::new(&self.name, &self.address, timeout)),
            Protocol::Command => Box::new(CommandProbe::new(
                &self.name,
                runner,
                Invocation::from_argv(&self.command),
            )),
        })
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails until `succeed_on` attempts have been made.
    struct Counting {
        calls: AtomicU32,
        succeed_on: Option<u32>,
    }

    impl Counting {
        fn new(succeed_on: Option<u32>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on,
            }
        }
    }

    #[async_trait]
    impl Probe for Counting {
        fn target(&self) -> String {
            "counting".to_string()
        }

        async fn probe(&self) -> Result<(), String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(k) if n >= k => Ok(()),
                _ => Err(format!("attempt {n} refused")),
            }
        }
    }

    #[tokio::test]
    async fn test_times_out_after_exact_attempts() {
        let probe = Counting::new(None);
        let err = await_ready(&probe, 3, Duration::from_millis(1))
            .await
            .unwrap_err();

        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
        match err {
            ReadinessError::TimedOut {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "attempt 3 refused");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_returns_on_first_success() {
        let probe = Counting::new(Some(2));
        let ready = await_ready(&probe, 5, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(ready.attempts, 2);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_zero_attempts_never_probes() {
        let probe = Counting::new(Some(1));
        assert!(await_ready(&probe, 0, Duration::ZERO).await.is_err());
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new("local", &address, Duration::from_secs(1));
        assert!(probe.probe().await.is_ok());

        drop(listener);
        let probe = TcpProbe::new("local", &address, Duration::from_secs(1));
        assert!(probe.probe().await.is_err());
    }

    #[test]
    fn test_endpoint_deserializes_protocol() {
        let endpoint: ServiceEndpoint =
            serde_yaml::from_str("name: mysql\naddress: mysql:3306\nprotocol: tcp\n").unwrap();
        assert_eq!(endpoint.protocol, Protocol::Tcp);
        assert!(endpoint.command.is_empty());
        assert_eq!(endpoint.to_string(), "mysql (mysql:3306)");
    }
}
