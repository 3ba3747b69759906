//! Wait for the streaming ingestion collaborator.
//!
//! The streaming agent has no completion signal, so the stage polls its output
//! area until at least one data file appears or the timeout elapses.

use async_trait::async_trait;
use snafu::prelude::*;
use tracing::{info, warn};

use crate::config::IngestionConfig;
use crate::error::{IngestError, NoStreamingDataSnafu};
use crate::pipeline::Status;
use crate::readiness::{Probe, await_ready};
use crate::storage::StorageRef;

/// What the wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Data files present in the area when the wait ended.
    pub files: usize,
    /// Polls performed.
    pub polls: u32,
}

impl IngestOutcome {
    /// An empty area after the timeout is tolerated as a warning.
    pub fn status(&self) -> Status {
        if self.files == 0 {
            Status::Warn
        } else {
            Status::Ok
        }
    }
}

/// Counts data files anywhere under `area`.
pub(crate) async fn count_data_files(storage: &StorageRef, area: &str) -> Result<usize, String> {
    let entries = storage
        .list(area, true)
        .await
        .map_err(|e| e.to_string())?;
    Ok(entries.iter().filter(|e| e.is_data_file()).count())
}

struct StreamingAreaProbe {
    storage: StorageRef,
    area: String,
}

#[async_trait]
impl Probe for StreamingAreaProbe {
    fn target(&self) -> String {
        format!("streaming area {}", self.area)
    }

    async fn probe(&self) -> Result<(), String> {
        match count_data_files(&self.storage, &self.area).await? {
            0 => Err("no files yet".to_string()),
            _ => Ok(()),
        }
    }
}

/// Polls the streaming output area.
pub struct StreamingIngest {
    storage: StorageRef,
    config: IngestionConfig,
}

impl StreamingIngest {
    pub fn new(storage: StorageRef, config: IngestionConfig) -> Self {
        Self { storage, config }
    }

    /// Wait until data arrives or the poll budget is spent.
    ///
    /// An empty area is an error only when `require_data` is set.
    pub async fn await_data(&self) -> Result<IngestOutcome, IngestError> {
        let max_polls = self.config.max_polls();
        let probe = StreamingAreaProbe {
            storage: self.storage.clone(),
            area: self.config.area.clone(),
        };

        match await_ready(&probe, max_polls, self.config.poll_interval()).await {
            Ok(ready) => {
                let files = count_data_files(&self.storage, &self.config.area)
                    .await
                    .unwrap_or(0);
                info!(area = %self.config.area, files, polls = ready.attempts, "Streaming data present");
                Ok(IngestOutcome {
                    files,
                    polls: ready.attempts,
                })
            }
            Err(e) => {
                ensure!(
                    !self.config.require_data,
                    NoStreamingDataSnafu {
                        area: &self.config.area,
                        attempts: max_polls,
                    }
                );
                warn!(area = %self.config.area, error = %e, "No streaming data yet, continuing");
                Ok(IngestOutcome {
                    files: 0,
                    polls: max_polls,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalConfig, LocalStorage};
    use bytes::Bytes;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn setup(dir: &TempDir, require_data: bool) -> (StreamingIngest, StorageRef) {
        let storage: StorageRef = Arc::new(LocalStorage::new(LocalConfig {
            path: dir.path().to_string_lossy().into_owned(),
        }));
        let config = IngestionConfig {
            area: "/pipeline/streaming".to_string(),
            timeout_secs: 0,
            poll_interval_secs: 0,
            require_data,
        };
        (StreamingIngest::new(storage.clone(), config), storage)
    }

    #[tokio::test]
    async fn test_data_present() {
        let dir = TempDir::new().unwrap();
        let (ingest, storage) = setup(&dir, true);
        storage
            .write(
                "/pipeline/streaming/2024-05-01/events.1714557600.log",
                Bytes::from_static(b"{}\n"),
            )
            .await
            .unwrap();

        let outcome = ingest.await_data().await.unwrap();
        assert_eq!(outcome.files, 1);
        assert_eq!(outcome.status(), Status::Ok);
    }

    #[tokio::test]
    async fn test_empty_area_warns_by_default() {
        let dir = TempDir::new().unwrap();
        let (ingest, storage) = setup(&dir, false);
        storage.mkdir_recursive("/pipeline/streaming").await.unwrap();

        let outcome = ingest.await_data().await.unwrap();
        assert_eq!(outcome.files, 0);
        assert_eq!(outcome.status(), Status::Warn);
    }

    #[tokio::test]
    async fn test_empty_area_fails_when_required() {
        let dir = TempDir::new().unwrap();
        let (ingest, _) = setup(&dir, true);

        let err = ingest.await_data().await.unwrap_err();
        assert!(matches!(err, IngestError::NoStreamingData { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_in_progress_files_ignored() {
        let dir = TempDir::new().unwrap();
        let (ingest, storage) = setup(&dir, false);
        storage
            .write("/pipeline/streaming/events.1714557600.log.tmp", Bytes::from_static(b"{}\n"))
            .await
            .unwrap();

        assert_eq!(ingest.await_data().await.unwrap().files, 0);
    }
}
