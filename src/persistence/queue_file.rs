use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{MAX_RECORD_PAYLOAD_LEN, MAX_TYPE_TAG_LEN};
use crate::messaging::body::MessageBody;
use crate::messaging::serializer::{deserialize_record, serialize_record, TransportSerializer};
use crate::persistence::dequeued_message::{deferred, DequeuedMessage};
use crate::persistence::queue_meta_file::QueueMetaFile;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// A single append-only file of records, with a cursor file next to it that tracks the first
///  record that was not completed yet.
///
/// Record layout:
///
/// ```ascii
/// 0: type tag length (u8)
/// 1: type tag (UTF-8)
/// *: payload length (u16 LE)
/// *: payload
/// ```
///
/// Records are appended at the end and read from the cursor. A record that was read is removed
///  only by completing it, so a crash before that causes the record to be read again after a
///  restart. At most one record is in flight at a time: no further record is read until it is
///  completed or aborted.
pub struct QueueFile {
    data_path: PathBuf,
    meta_path: PathBuf,
    inner: Arc<Mutex<QueueFileInner>>,
}

struct QueueFileInner {
    writer: File,
    reader: BufReader<File>,
    read_position: u64,
    /// start position of the record that was read but not completed or aborted yet
    in_flight: Option<u64>,
    file_size: u64,
    record_count: usize,
    meta: QueueMetaFile,
    serializer: Arc<dyn TransportSerializer>,
}

struct RawRecord {
    type_tag: String,
    payload: Vec<u8>,
    /// number of bytes the record occupies in the file
    len: u64,
}

impl QueueFile {
    /// Opens a queue file and its cursor file, creating them if they do not exist. The number of
    ///  pending records is determined by scanning the data file from the cursor.
    pub async fn open(data_path: impl AsRef<Path>, serializer: Arc<dyn TransportSerializer>) -> anyhow::Result<QueueFile> {
        let data_path = data_path.as_ref().to_path_buf();
        let meta_path = data_path.with_extension("meta");
        if let Some(dir) = data_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&data_path)
            .await?;
        let file_size = writer.metadata().await?.len();

        let meta = QueueMetaFile::open(&meta_path).await?;
        let read_position = meta.next_record_position();
        if read_position > file_size {
            bail!("corrupt cursor for {:?}: position {} is past the end of the file ({} bytes)", data_path, read_position, file_size);
        }

        let mut reader = BufReader::new(File::open(&data_path).await?);
        reader.seek(SeekFrom::Start(read_position)).await?;

        let mut inner = QueueFileInner {
            writer,
            reader,
            read_position,
            in_flight: None,
            file_size,
            record_count: 0,
            meta,
            serializer,
        };
        inner.record_count = inner.count_records().await?;

        debug!(path = ?data_path, file_size, read_position, record_count = inner.record_count, "opened queue file");

        Ok(QueueFile {
            data_path,
            meta_path,
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    /// Appends a record and flushes it to disk before returning.
    pub async fn enqueue(&self, body: &MessageBody) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;

        let (type_tag, payload) = serialize_record(inner.serializer.as_ref(), body)?;
        if type_tag.len() > MAX_TYPE_TAG_LEN {
            bail!("record type tag {:?} is {} bytes long, exceeding the maximum of {}", type_tag, type_tag.len(), MAX_TYPE_TAG_LEN);
        }
        if payload.len() > MAX_RECORD_PAYLOAD_LEN {
            bail!("serialized record is {} bytes long, exceeding the maximum of {}", payload.len(), MAX_RECORD_PAYLOAD_LEN);
        }

        let mut buf = BytesMut::with_capacity(1 + type_tag.len() + 2 + payload.len());
        buf.put_u8(type_tag.len().prechecked_cast());
        buf.put_slice(type_tag.as_bytes());
        buf.put_u16_le(payload.len().prechecked_cast());
        buf.put_slice(&payload);

        if let Err(e) = inner.append(&buf).await {
            inner.discard_partial_append().await?;
            return Err(e);
        }

        inner.file_size += buf.len().safe_cast();
        inner.record_count += 1;
        trace!(path = ?self.data_path, type_tag = %type_tag, len = buf.len(), "appended record");
        Ok(())
    }

    /// Reads the next record without removing it. Returns `None` if there are no more records
    ///  to read, or if a previously read record was neither completed nor aborted yet.
    pub async fn dequeue(&self) -> anyhow::Result<Option<DequeuedMessage>> {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.is_some() {
            return Ok(None);
        }

        let start = inner.read_position;
        // a previous read may have been interrupted half way
        inner.rewind(start).await?;
        let record = match inner.read_record().await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(e) => {
                inner.rewind(start).await?;
                return Err(e);
            }
        };

        let body = match deserialize_record(inner.serializer.as_ref(), &record.type_tag, &record.payload) {
            Ok(body) => body,
            Err(e) => {
                inner.rewind(start).await?;
                return Err(e);
            }
        };

        let end = start + record.len;
        inner.read_position = end;
        inner.in_flight = Some(start);
        trace!(path = ?self.data_path, start, end, "read record");

        let for_completion = self.inner.clone();
        let for_abort = self.inner.clone();
        Ok(Some(DequeuedMessage::new(
            body,
            deferred(move || async move {
                let mut inner = for_completion.lock().await;
                inner.commit(start, end).await
            }),
            deferred(move || async move {
                let mut inner = for_abort.lock().await;
                inner.release(start).await
            }),
        )))
    }

    /// number of records that were not completed yet, including records that are in flight
    pub async fn record_count(&self) -> usize {
        self.inner.lock().await.record_count
    }

    pub async fn file_size(&self) -> u64 {
        self.inner.lock().await.file_size
    }

    pub async fn has_record_in_flight(&self) -> bool {
        self.inner.lock().await.in_flight.is_some()
    }

    pub async fn close(self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.writer.flush().await?;
        debug!(path = ?self.data_path, "closed queue file");
        Ok(())
    }

    /// Closes the file and removes both the data file and its cursor file from disk.
    pub async fn delete(self) -> anyhow::Result<()> {
        let data_path = self.data_path.clone();
        let meta_path = self.meta_path.clone();
        self.close().await?;

        tokio::fs::remove_file(&data_path).await?;
        match tokio::fs::remove_file(&meta_path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }
        debug!(path = ?data_path, "deleted queue file");
        Ok(())
    }
}

impl QueueFileInner {
    /// Reads the record at the reader's position. Clean EOF at a record boundary means there is
    ///  no record, while EOF inside a record means the file is corrupt.
    async fn read_record(&mut self) -> anyhow::Result<Option<RawRecord>> {
        let mut tag_len = [0u8; 1];
        if self.reader.read(&mut tag_len).await? == 0 {
            return Ok(None);
        }
        let tag_len: usize = tag_len[0].safe_cast();

        let mut type_tag = vec![0u8; tag_len];
        self.reader.read_exact(&mut type_tag).await.map_err(|e| self.truncated(e))?;
        let type_tag = String::from_utf8(type_tag)
            .map_err(|_| anyhow!("corrupt record at position {}: type tag is not valid UTF-8", self.read_position))?;

        let payload_len: usize = match self.reader.read_u16_le().await {
            Ok(len) => len.safe_cast(),
            Err(e) => return Err(self.truncated(e)),
        };
        let mut payload = vec![0u8; payload_len];
        self.reader.read_exact(&mut payload).await.map_err(|e| self.truncated(e))?;

        Ok(Some(RawRecord {
            type_tag,
            payload,
            len: (1 + tag_len + 2 + payload_len).safe_cast(),
        }))
    }

    fn truncated(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == ErrorKind::UnexpectedEof {
            anyhow!("corrupt queue file: truncated record at position {}", self.read_position)
        }
        else {
            e.into()
        }
    }

    async fn count_records(&mut self) -> anyhow::Result<usize> {
        let start = self.read_position;
        let mut count = 0;
        while let Some(record) = self.read_record().await? {
            self.read_position += record.len;
            count += 1;
        }
        self.rewind(start).await?;
        Ok(count)
    }

    async fn rewind(&mut self, position: u64) -> anyhow::Result<()> {
        self.reader.seek(SeekFrom::Start(position)).await?;
        self.read_position = position;
        Ok(())
    }

    async fn append(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(buf).await?;
        self.writer.flush().await?;
        self.writer.sync_data().await?;
        Ok(())
    }

    /// Cuts off whatever part of a failed append reached the file, so the next record starts at
    ///  a record boundary.
    async fn discard_partial_append(&mut self) -> anyhow::Result<()> {
        warn!(file_size = self.file_size, "discarding partially appended record");
        self.writer.set_len(self.file_size).await?;
        self.writer.sync_data().await?;
        Ok(())
    }

    fn check_in_flight(&self, start: u64) -> anyhow::Result<()> {
        if self.in_flight != Some(start) {
            bail!("record at position {} is not in flight (in flight: {:?})", start, self.in_flight);
        }
        Ok(())
    }

    async fn commit(&mut self, start: u64, end: u64) -> anyhow::Result<()> {
        self.check_in_flight(start)?;
        self.meta.write_next_record_position(end).await?;
        self.in_flight = None;
        self.record_count = self.record_count.checked_sub(1)
            .ok_or_else(|| anyhow!("completed a record at position {}, but no records are pending", start))?;
        Ok(())
    }

    /// Makes an aborted record available for reading again.
    async fn release(&mut self, start: u64) -> anyhow::Result<()> {
        self.check_in_flight(start)?;
        self.in_flight = None;
        self.rewind(start).await
    }
}
