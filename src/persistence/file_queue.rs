use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use time::macros::format_description;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::messaging::body::MessageBody;
use crate::messaging::serializer::TransportSerializer;
use crate::persistence::dequeued_message::{deferred, DequeuedMessage};
use crate::persistence::queue_file::QueueFile;

const DATA_FILE_EXTENSION: &str = "data";

/// A durable FIFO queue that spreads its records over a sequence of [QueueFile]s.
///
/// Records are always appended to the newest file. Once that file exceeds the configured maximum
///  size, a new file is started. Records are read from the oldest file, and a file is deleted
///  when all of its records were completed and it is not the newest file.
///
/// Files are named `{queue_name}_{UTC timestamp}-{counter}.data`, and their order on disk is
///  the order of their names' timestamp and counter.
///
/// A counting semaphore tracks the number of records that are available for reading, which
///  allows [FileQueue::dequeue] to wait for new records without polling.
pub struct FileQueue {
    config: QueueConfig,
    serializer: Arc<dyn TransportSerializer>,
    files: Arc<Mutex<VecDeque<QueueFile>>>,
    new_message_notification: Arc<Semaphore>,
}

impl FileQueue {
    pub async fn open(config: QueueConfig, serializer: Arc<dyn TransportSerializer>) -> anyhow::Result<FileQueue> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.queue_directory).await?;

        let mut existing = Vec::new();
        let mut entries = tokio::fs::read_dir(&config.queue_directory).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if let Some(key) = file_name.to_str().and_then(|n| parse_file_name(&config.queue_name, n)) {
                existing.push((key, entry.path()));
            }
        }
        existing.sort();

        let mut files = VecDeque::new();
        let mut pending = 0;
        for (_, path) in existing {
            let file = QueueFile::open(&path, serializer.clone()).await?;
            pending += file.record_count().await;
            files.push_back(file);
        }
        if files.is_empty() {
            files.push_back(create_file(&config, &serializer, None).await?);
        }

        info!("opened queue {:?} in {:?} with {} file(s) and {} pending record(s)", config.queue_name, config.queue_directory, files.len(), pending);

        Ok(FileQueue {
            config,
            serializer,
            files: Arc::new(Mutex::new(files)),
            new_message_notification: Arc::new(Semaphore::new(pending)),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.queue_name
    }

    /// Durably appends a record, starting a new file if the current one grew too big.
    pub async fn enqueue(&self, body: &MessageBody) -> anyhow::Result<()> {
        let mut files = self.files.lock().await;

        let newest = files.back()
            .ok_or_else(|| anyhow!("queue {:?} has no file to append to", self.config.queue_name))?;
        newest.enqueue(body).await?;
        let needs_rotation = newest.file_size().await > self.config.max_file_size;

        self.new_message_notification.add_permits(1);

        if needs_rotation {
            let file = create_file(&self.config, &self.serializer, Some(newest.path())).await?;
            files.push_back(file);
        }
        Ok(())
    }

    /// Waits up to `max_wait` for a record to become available and reads it. The record stays in
    ///  the queue until the returned message is completed; aborting it makes it available again.
    ///
    /// Returns `None` if no record became available in time. Records are handed out one at a time
    ///  and in order, so this also returns `None` right away while a previously dequeued message
    ///  is neither completed nor aborted.
    ///
    /// Cancel safe: dropping the returned future does not lose or skip a record.
    pub async fn dequeue(&self, max_wait: Duration) -> anyhow::Result<Option<DequeuedMessage>> {
        let permit = match tokio::time::timeout(max_wait, self.new_message_notification.acquire()).await {
            Err(_) => return Ok(None),
            Ok(permit) => permit?,
        };

        // the permit is returned unless a record was actually handed out
        let result = self.dequeue_from_files().await;
        if let Ok(Some(_)) = &result {
            permit.forget();
        }
        result
    }

    async fn dequeue_from_files(&self) -> anyhow::Result<Option<DequeuedMessage>> {
        let mut files = self.files.lock().await;

        while let Some(file) = files.front() {
            if file.has_record_in_flight().await {
                debug!("queue {:?} has a record in flight", self.config.queue_name);
                return Ok(None);
            }

            if let Some(mut msg) = file.dequeue().await? {
                let notification = self.new_message_notification.clone();
                msg.enlist_abort(deferred(move || async move {
                    notification.add_permits(1);
                    Ok(())
                }));
                let files = self.files.clone();
                msg.enlist_completion(deferred(move || async move {
                    remove_drained_files(&files).await
                }));
                return Ok(Some(msg));
            }

            if files.len() == 1 {
                break;
            }
            let pending = file.record_count().await;
            if pending > 0 {
                bail!("queue file {:?} has {} pending record(s), but none could be read", file.path(), pending);
            }
            if let Some(drained) = files.pop_front() {
                drained.delete().await?;
            }
        }

        debug!("queue {:?} was signalled but has no record to read", self.config.queue_name);
        Ok(None)
    }

    /// number of records that were not completed yet, including records that are in flight
    pub async fn pending_records(&self) -> usize {
        let files = self.files.lock().await;
        let mut result = 0;
        for file in files.iter() {
            result += file.record_count().await;
        }
        result
    }

    pub async fn file_count(&self) -> usize {
        self.files.lock().await.len()
    }

    pub async fn close(self) -> anyhow::Result<()> {
        let mut files = self.files.lock().await;
        while let Some(file) = files.pop_front() {
            file.close().await?;
        }
        debug!("closed queue {:?}", self.config.queue_name);
        Ok(())
    }
}

async fn remove_drained_files(files: &Mutex<VecDeque<QueueFile>>) -> anyhow::Result<()> {
    let mut files = files.lock().await;
    while files.len() > 1 {
        let is_drained = match files.front() {
            Some(oldest) => oldest.record_count().await == 0,
            None => false,
        };
        if !is_drained {
            break;
        }
        if let Some(drained) = files.pop_front() {
            drained.delete().await?;
        }
    }
    Ok(())
}

/// Creates a new, empty queue file whose name sorts after `newest`.
async fn create_file(config: &QueueConfig, serializer: &Arc<dyn TransportSerializer>, newest: Option<&Path>) -> anyhow::Result<QueueFile> {
    let timestamp = OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day][hour][minute][second]"))?;

    let newest_key = newest
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .and_then(|n| parse_file_name(&config.queue_name, n));
    let mut counter = match newest_key {
        Some((newest_timestamp, newest_counter)) if newest_timestamp == timestamp => newest_counter + 1,
        _ => 0,
    };

    loop {
        let path = file_path(config, &timestamp, counter);
        if !tokio::fs::try_exists(&path).await? {
            debug!("creating queue file {:?}", path);
            return QueueFile::open(path, serializer.clone()).await;
        }
        counter += 1;
    }
}

fn file_path(config: &QueueConfig, timestamp: &str, counter: u32) -> PathBuf {
    config.queue_directory.join(format!("{}_{}-{:02}.{}", config.queue_name, timestamp, counter, DATA_FILE_EXTENSION))
}

/// Returns the sort key of a data file that belongs to the queue `queue_name`
fn parse_file_name(queue_name: &str, file_name: &str) -> Option<(String, u32)> {
    let (timestamp, counter) = file_name
        .strip_prefix(queue_name)?
        .strip_prefix('_')?
        .strip_suffix(DATA_FILE_EXTENSION)?
        .strip_suffix('.')?
        .rsplit_once('-')?;
    Some((timestamp.to_string(), counter.parse().ok()?))
}
