use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use anyhow::bail;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::trace;

/// Keeps track of the next record to read in a queue file, so that reading resumes there after
///  a restart.
///
/// The file contains a single i32 (LE) and is overwritten in place on every update.
pub struct QueueMetaFile {
    path: PathBuf,
    file: File,
    next_record_position: u64,
}

impl QueueMetaFile {
    /// Opens the cursor file, creating it if it does not exist. A missing or incomplete file
    ///  means that nothing was read from the queue file yet.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<QueueMetaFile> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let next_record_position = match buf.get(..4) {
            Some(raw) => {
                let position = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                if position < 0 {
                    bail!("corrupt cursor file {:?}: negative position {}", path, position);
                }
                position as u64
            }
            None => 0,
        };

        Ok(QueueMetaFile {
            path,
            file,
            next_record_position,
        })
    }

    /// position in the queue file to read the next record from
    pub fn next_record_position(&self) -> u64 {
        self.next_record_position
    }

    pub async fn write_next_record_position(&mut self, position: u64) -> anyhow::Result<()> {
        let raw: i32 = match position.try_into() {
            Ok(raw) => raw,
            Err(_) => bail!("queue file position {} exceeds the cursor file's range", position),
        };

        trace!(path = ?self.path, position, "persisting cursor");
        self.file.seek(SeekFrom::Start(0)).await?;
        self.file.write_all(&raw.to_le_bytes()).await?;
        self.file.flush().await?;
        self.file.sync_data().await?;

        self.next_record_position = position;
        Ok(())
    }
}
