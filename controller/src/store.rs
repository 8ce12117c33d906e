use std::{
    io::{ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use ventilation_common::{ControllerEvent, LoggingConfig, RuntimeConfig};

const QUERY_CHUNK: usize = 8 * 1024;

#[derive(Clone)]
pub struct AppStore {
    data_dir: Arc<PathBuf>,
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl AppStore {
    pub fn new() -> Self {
        let data_dir = std::env::var("VENTILATION_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.ventilation"));
        Self::at(data_dir)
    }

    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            data_dir: Arc::new(data_dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn log_path(&self, logging: &LoggingConfig) -> PathBuf {
        self.data_dir.join(&logging.log_file)
    }

    pub async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
                .with_context(|| format!("malformed {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ControllerEvent,
}

#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event: Option<String>,
    pub limit: usize,
}

impl LogQuery {
    fn matches(&self, record: &LogRecord) -> bool {
        if self.start.is_some_and(|start| record.timestamp < start) {
            return false;
        }
        if self.end.is_some_and(|end| record.timestamp > end) {
            return false;
        }
        match &self.event {
            Some(name) => record.event.name() == name,
            None => true,
        }
    }
}

/// Append-only JSON-lines event log. Writes go through a background task so emitters
/// never wait on the filesystem.
#[derive(Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<LogRecord>,
    path: Arc<PathBuf>,
    file_lock: Arc<Mutex<()>>,
}

impl EventLog {
    /// Starts the writer; it drains queued records and exits once `cancel` fires.
    pub fn spawn(path: PathBuf, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
        let log = Self {
            tx,
            path: Arc::new(path),
            file_lock: Arc::new(Mutex::new(())),
        };

        let writer = log.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = rx.recv() => match record {
                        Some(record) => writer.append(&record).await,
                        None => break,
                    },
                    _ = cancel.cancelled() => {
                        while let Ok(record) = rx.try_recv() {
                            writer.append(&record).await;
                        }
                        break;
                    }
                }
            }
        });

        (log, handle)
    }

    pub fn path(&self) -> &Path {
        self.path.as_ref()
    }

    pub fn emit(&self, event: ControllerEvent) {
        let record = LogRecord {
            timestamp: Utc::now(),
            event,
        };
        if self.tx.send(record).is_err() {
            warn!("event log writer stopped; dropping event");
        }
    }

    /// Newest `limit` matching records, returned oldest first.
    pub async fn query(&self, query: &LogQuery) -> anyhow::Result<Vec<LogRecord>> {
        self.query_in_chunks(query, QUERY_CHUNK).await
    }

    /// Reads the file backwards and stops as soon as `limit` records matched.
    async fn query_in_chunks(
        &self,
        query: &LogQuery,
        chunk_size: usize,
    ) -> anyhow::Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        if query.limit == 0 {
            return Ok(records);
        }

        let _guard = self.file_lock.lock().await;
        let mut file = match tokio::fs::File::open(self.path.as_ref()).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(records),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to open {}", self.path.display()))
            }
        };

        let mut pos = file.metadata().await?.len();
        // Tail of a line whose start lies in a chunk not read yet.
        let mut carry = Vec::new();
        'chunks: while pos > 0 {
            let step = pos.min(chunk_size as u64);
            pos -= step;
            let mut chunk = vec![0; step as usize];
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_exact(&mut chunk).await?;
            chunk.extend_from_slice(&carry);

            let complete = if pos == 0 {
                carry.clear();
                &chunk[..]
            } else {
                match chunk.iter().position(|&byte| byte == b'\n') {
                    Some(first_newline) => {
                        carry = chunk[..first_newline].to_vec();
                        &chunk[first_newline + 1..]
                    }
                    None => {
                        carry = chunk;
                        continue;
                    }
                }
            };

            for line in complete.rsplit(|&byte| byte == b'\n') {
                if line.is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_slice::<LogRecord>(line) else {
                    continue;
                };
                if query.matches(&record) {
                    records.push(record);
                    if records.len() >= query.limit {
                        break 'chunks;
                    }
                }
            }
        }

        records.reverse();
        Ok(records)
    }

    async fn append(&self, record: &LogRecord) {
        if let Err(err) = self.try_append(record).await {
            warn!("failed to append to event log {}: {err:#}", self.path.display());
        }
    }

    async fn try_append(&self, record: &LogRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.file_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_ref())
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ventilation_common::{OverrideMode, PollSource, SwitchCause};

    async fn written_log(events: Vec<ControllerEvent>) -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let (log, handle) = EventLog::spawn(dir.path().join("log.json"), cancel.clone());
        for event in events {
            log.emit(event);
        }
        cancel.cancel();
        handle.await.unwrap();
        (dir, log)
    }

    #[tokio::test]
    async fn query_filters_by_event_and_limit() {
        let (_dir, log) = written_log(vec![
            ControllerEvent::RelayTurnedOn {
                cause: SwitchCause::Regulation,
            },
            ControllerEvent::PollFailed {
                source: PollSource::RemoteStation,
                error: "timeout".to_string(),
            },
            ControllerEvent::RelayTurnedOff {
                cause: SwitchCause::Regulation,
            },
            ControllerEvent::RelayTurnedOn {
                cause: SwitchCause::ManualOverride,
            },
        ])
        .await;

        let records = log
            .query(&LogQuery {
                event: Some("relay_turned_on".to_string()),
                limit: 10,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        let events: Vec<_> = records.into_iter().map(|record| record.event).collect();
        assert_eq!(
            events,
            vec![
                ControllerEvent::RelayTurnedOn {
                    cause: SwitchCause::Regulation
                },
                ControllerEvent::RelayTurnedOn {
                    cause: SwitchCause::ManualOverride
                },
            ]
        );

        let newest = log
            .query(&LogQuery {
                limit: 2,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].event.name(), "relay_turned_off");
        assert_eq!(newest[1].event.name(), "relay_turned_on");
    }

    #[tokio::test]
    async fn query_respects_time_window() {
        let (_dir, log) = written_log(vec![ControllerEvent::ModeChanged {
            from: OverrideMode::Auto,
            to: OverrideMode::Hand,
        }])
        .await;

        let future_only = log
            .query(&LogQuery {
                start: Some(Utc::now() + chrono::Duration::hours(1)),
                limit: 10,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert!(future_only.is_empty());

        let past_window = log
            .query(&LogQuery {
                end: Some(Utc::now()),
                limit: 10,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(past_window.len(), 1);
    }

    #[tokio::test]
    async fn small_chunks_read_the_same_newest_records() {
        let events = (0..40)
            .map(|attempt| {
                if attempt % 5 == 0 {
                    ControllerEvent::ConfigReloaded
                } else {
                    ControllerEvent::PollFailed {
                        source: PollSource::LocalSensor,
                        error: format!("attempt {attempt}"),
                    }
                }
            })
            .collect();
        let (_dir, log) = written_log(events).await;

        let failures = LogQuery {
            event: Some("poll_failed".to_string()),
            limit: 3,
            ..LogQuery::default()
        };
        let newest = log.query_in_chunks(&failures, 7).await.unwrap();
        let errors: Vec<_> = newest
            .iter()
            .map(|record| match &record.event {
                ControllerEvent::PollFailed { error, .. } => error.as_str(),
                other => other.name(),
            })
            .collect();
        assert_eq!(errors, vec!["attempt 37", "attempt 38", "attempt 39"]);

        let everything = LogQuery {
            limit: 100,
            ..LogQuery::default()
        };
        let chunked = log.query_in_chunks(&everything, 7).await.unwrap();
        assert_eq!(chunked.len(), 40);
        assert_eq!(chunked, log.query(&everything).await.unwrap());
    }

    #[tokio::test]
    async fn missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (log, _handle) =
            EventLog::spawn(dir.path().join("absent.json"), CancellationToken::new());

        let records = log
            .query(&LogQuery {
                limit: 5,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn runtime_config_round_trips_through_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = AppStore::at(dir.path());
        assert_eq!(store.load_runtime_config().await.unwrap(), RuntimeConfig::default());

        let mut runtime = RuntimeConfig::default();
        runtime.api_station_id = "SMA".to_string();
        runtime.relay_mode = OverrideMode::Aus;
        store.save_runtime_config(&runtime).await.unwrap();

        assert_eq!(store.load_runtime_config().await.unwrap(), runtime);
    }
}
