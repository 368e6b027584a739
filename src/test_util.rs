use std::cmp::min;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};

use crate::protocol::encoder::RawSender;

/// An [AsyncRead] that returns its data in chunks of at most `chunk_size` bytes per read, for
///  exercising partial reads. It reports EOF when the data is exhausted.
pub struct ChunkedReader {
    data: Vec<u8>,
    pos: usize,
    chunk_size: usize,
}
impl ChunkedReader {
    pub fn new(data: Vec<u8>, chunk_size: usize) -> ChunkedReader {
        ChunkedReader {
            data,
            pos: 0,
            chunk_size,
        }
    }
}

impl AsyncRead for ChunkedReader {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let n = min(min(self.chunk_size, self.data.len() - self.pos), buf.remaining());
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}


/// records every chunk that is sent, keeping chunk boundaries
#[derive(Debug, Default)]
pub struct RecordingSender {
    pub chunks: Vec<Vec<u8>>,
}
impl RecordingSender {
    pub fn new() -> RecordingSender {
        RecordingSender::default()
    }
}

#[async_trait]
impl RawSender for RecordingSender {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.chunks.push(buf.to_vec());
        Ok(())
    }
}
