use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
};

use super::StoreError;
use crate::{events::ConnectionRecord, peering::ConnectionAttempt};

const BATCH_SIZE: usize = 64;
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
const CHANNEL_CAPACITY: usize = 1000;

/// One line of the record log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Attempt(ConnectionAttempt),
    Connection(ConnectionRecord),
}

enum RecordLogCommand {
    Append(Box<Record>),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSON-lines log of everything persisted by the crawler.
///
/// Writes go through a channel to a background task which batches them, so
/// appending never waits on the disk.
#[derive(Clone)]
pub struct RecordLog {
    path: Arc<PathBuf>,
    sender: mpsc::Sender<RecordLogCommand>,
}

impl RecordLog {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let (sender, recv) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(Self::write_records(recv, file, path.clone()));
        Ok(Self {
            path: Arc::new(path),
            sender,
        })
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn append(&self, record: Record) {
        match self
            .sender
            .try_send(RecordLogCommand::Append(Box::new(record)))
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(path = ?self.path, "Record log backlog full, dropping record");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(path = ?self.path, "Record log writer stopped");
            }
        }
    }

    /// Writes out anything still buffered and waits until it is on disk.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(RecordLogCommand::Flush(tx)).await.is_ok() {
            let _ = tokio::time::timeout(Duration::from_secs(2), rx).await;
        }
    }

    async fn write_records(
        mut recv: mpsc::Receiver<RecordLogCommand>,
        mut file: File,
        path: PathBuf,
    ) {
        let mut batch = Vec::new();
        let mut pending = 0;
        let mut tick = tokio::time::interval(FLUSH_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = recv.recv() => {
                    let Some(cmd) = cmd else { break; };
                    match cmd {
                        RecordLogCommand::Append(record) => {
                            if let Err(error) = serde_json::to_writer(&mut batch, &record) {
                                tracing::error!(%error, "Failed encoding record");
                                continue;
                            }
                            batch.push(b'\n');
                            pending += 1;
                            if pending >= BATCH_SIZE {
                                Self::write_batch(&mut file, &mut batch, &path).await;
                                pending = 0;
                            }
                        }
                        RecordLogCommand::Flush(reply) => {
                            Self::write_batch(&mut file, &mut batch, &path).await;
                            pending = 0;
                            let _ = reply.send(());
                        }
                    }
                }
                _ = tick.tick() => {
                    Self::write_batch(&mut file, &mut batch, &path).await;
                    pending = 0;
                }
            }
        }

        // store remaining records on channel close
        Self::write_batch(&mut file, &mut batch, &path).await;
    }

    async fn write_batch(file: &mut File, batch: &mut Vec<u8>, path: &std::path::Path) {
        if batch.is_empty() {
            return;
        }
        let result = async {
            file.write_all(batch).await?;
            file.flush().await
        }
        .await;
        if let Err(error) = result {
            tracing::error!(%error, path = ?path, "Failed writing record log batch");
        }
        batch.clear();
    }
}
