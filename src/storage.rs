use anyhow::Result;
use chrono::{DateTime, Utc, Duration};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::events::EngineEvent;
use crate::hub::HubSubscriber;

#[derive(Debug, Serialize)]
struct EventBatch {
    batch_id: String,
    created_at: DateTime<Utc>,
    events: Vec<EngineEvent>,
}

impl EventBatch {
    fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            events: Vec::new(),
        }
    }
}

/// Persistence sink: drains the hub into compressed JSON batch files.
///
/// The engine only pushes committed events here; schema, compaction, and
/// the analytical store itself are the storage subsystem's concern.
pub struct StorageWriter {
    config: StorageConfig,
    data_directory: PathBuf,
}

impl StorageWriter {
    pub async fn new(config: StorageConfig) -> Result<Self> {
        let data_directory = config.data_directory.clone();

        if config.enabled {
            std::fs::create_dir_all(&data_directory)?;
        }

        info!("Storage writer initialized with directory: {:?}", data_directory);

        Ok(Self {
            config,
            data_directory,
        })
    }

    /// Consume the hub until cancellation, flushing on size or interval.
    pub fn spawn(self, mut subscriber: HubSubscriber, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch = EventBatch::new();
            let flush_interval =
                std::time::Duration::from_millis(self.config.flush_interval_ms.max(1));
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = subscriber.recv() => {
                        match event {
                            Some(event) => {
                                batch.events.push(event);
                                if batch.events.len() >= self.config.max_batch_size {
                                    self.flush(&mut batch).await;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        self.flush(&mut batch).await;
                    }
                }
            }

            // Drain whatever is still buffered before exiting.
            while let Some(event) = subscriber.try_recv() {
                batch.events.push(event);
                if batch.events.len() >= self.config.max_batch_size {
                    self.flush(&mut batch).await;
                }
            }
            self.flush(&mut batch).await;

            if subscriber.dropped() > 0 {
                debug!(
                    "Storage subscriber dropped {} events under backpressure",
                    subscriber.dropped()
                );
            }
            info!("Storage writer stopped");
        })
    }

    async fn flush(&self, batch: &mut EventBatch) {
        if batch.events.is_empty() {
            return;
        }
        let full = std::mem::replace(batch, EventBatch::new());
        if let Err(e) = self.write_batch(&full).await {
            error!("Failed to store batch {}: {}", full.batch_id, e);
        }
    }

    async fn write_batch(&self, batch: &EventBatch) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let json_data = serde_json::to_string(batch)?;

        if self.config.compress_batches {
            let filename = format!("events_{}.json.gz", batch.batch_id);
            let file_path = self.data_directory.join(filename);

            let compressed = self.compress_data(&json_data)?;
            tokio::fs::write(file_path, compressed).await?;
        } else {
            let filename = format!("events_{}.json", batch.batch_id);
            let file_path = self.data_directory.join(filename);

            tokio::fs::write(file_path, json_data).await?;
        }

        debug!(
            "Stored batch {} ({} events)",
            batch.batch_id,
            batch.events.len()
        );
        Ok(())
    }

    /// Remove batch files older than the retention window.
    pub async fn cleanup_old_batches(&self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let cutoff_time = Utc::now() - Duration::days(self.config.retention_days as i64);

        let mut entries = tokio::fs::read_dir(&self.data_directory).await?;
        let mut files_removed = 0;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !filename.starts_with("events_")
                || !(filename.ends_with(".json") || filename.ends_with(".json.gz"))
            {
                continue;
            }

            if let Ok(metadata) = entry.metadata().await {
                if let Ok(modified) = metadata.modified() {
                    let modified_time: DateTime<Utc> = modified.into();
                    if modified_time < cutoff_time {
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => files_removed += 1,
                            Err(e) => error!("Failed to remove file {:?}: {}", path, e),
                        }
                    }
                }
            }
        }

        if files_removed > 0 {
            info!("Storage cleanup removed {} old batch files", files_removed);
        }

        Ok(())
    }

    fn compress_data(&self, data: &str) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data.as_bytes())?;
        let compressed = encoder.finish()?;
        Ok(compressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{FileOpRecord, FileOperation, UNKNOWN_PID};
    use crate::hub::EventHub;

    fn test_config(dir: &std::path::Path, compress: bool) -> StorageConfig {
        StorageConfig {
            enabled: true,
            data_directory: dir.to_path_buf(),
            compress_batches: compress,
            max_batch_size: 4,
            flush_interval_ms: 50,
            retention_days: 30,
        }
    }

    #[tokio::test]
    async fn writes_batches_from_hub() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StorageWriter::new(test_config(dir.path(), false)).await.unwrap();

        let hub = EventHub::new(64);
        let subscriber = hub.subscribe();
        let cancel = CancellationToken::new();
        let handle = writer.spawn(subscriber, cancel.clone());

        for i in 0..10 {
            hub.publish(EngineEvent::FileOp(FileOpRecord::new(
                UNKNOWN_PID,
                FileOperation::Write,
                format!("/w/{}", i),
            )));
        }

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        cancel.cancel();
        handle.await.unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("events_"))
            .collect();
        assert!(!files.is_empty());

        // Every published event landed in some batch file.
        let mut total = 0;
        for file in files {
            let content = std::fs::read_to_string(file.path()).unwrap();
            let value: serde_json::Value = serde_json::from_str(&content).unwrap();
            total += value["events"].as_array().unwrap().len();
        }
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn compressed_batches_have_gz_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StorageWriter::new(test_config(dir.path(), true)).await.unwrap();

        let hub = EventHub::new(64);
        let subscriber = hub.subscribe();
        let cancel = CancellationToken::new();
        let handle = writer.spawn(subscriber, cancel.clone());

        hub.publish(EngineEvent::FileOp(FileOpRecord::new(
            UNKNOWN_PID,
            FileOperation::Write,
            "/w/0".to_string(),
        )));

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        cancel.cancel();
        handle.await.unwrap();

        let has_gz = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().ends_with(".json.gz"));
        assert!(has_gz);
    }
}
