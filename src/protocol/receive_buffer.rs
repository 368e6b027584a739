//! A receive buffer on top of a byte stream, for decoding frames that arrive in arbitrary chunks.
//!
//! The buffer is a single contiguous allocation with a read offset and a write offset:
//!
//! ```ascii
//! 0            read_offset          write_offset          capacity
//! | consumed   | available          | free                |
//! ```
//!
//! Decoders request a number of contiguous bytes through [ReceiveBuffer::ensure_available] and
//!  consume them through the `try_get_*` functions. If the bytes between `read_offset` and the end
//!  of the buffer can not hold a request, the available bytes are moved to the start of the
//!  buffer. If the request exceeds the buffer's entire capacity, the buffer is replaced by a bigger
//!  one, up to a configured limit.

use std::io;

use anyhow::bail;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::config::ReceiveBufferConfig;

pub struct ReceiveBuffer<R> {
    reader: R,
    buf: Vec<u8>,
    read_offset: usize,
    write_offset: usize,
    max_capacity: usize,
}

impl <R: AsyncRead + Unpin> ReceiveBuffer<R> {
    pub fn new(reader: R, config: &ReceiveBufferConfig) -> ReceiveBuffer<R> {
        ReceiveBuffer {
            reader,
            buf: vec![0; config.initial_capacity],
            read_offset: 0,
            write_offset: 0,
            max_capacity: config.max_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// number of received bytes that were not consumed yet
    pub fn bytes_available(&self) -> usize {
        self.write_offset - self.read_offset
    }

    /// number of bytes that can be received without moving data around
    pub fn bytes_free(&self) -> usize {
        self.buf.len() - self.write_offset
    }

    /// Makes sure that the buffer can hold `n` contiguous bytes starting at the read offset,
    ///  compacting or growing the buffer if necessary. Requests beyond the configured maximum
    ///  capacity are an error.
    pub fn ensure_capacity(&mut self, n: usize) -> anyhow::Result<()> {
        if self.read_offset + n <= self.buf.len() {
            return Ok(());
        }

        let num_available = self.bytes_available();
        if n <= self.buf.len() {
            trace!(num_available, "compacting receive buffer");
            self.buf.copy_within(self.read_offset..self.write_offset, 0);
        }
        else {
            if n > self.max_capacity {
                bail!("receive buffer would need to hold {} bytes, exceeding the configured maximum of {} bytes", n, self.max_capacity);
            }

            let new_capacity = n.max((self.buf.len() * 2).min(self.max_capacity));
            debug!(old_capacity = self.buf.len(), new_capacity, "growing receive buffer");

            let mut new_buf = vec![0; new_capacity];
            new_buf[..num_available].copy_from_slice(&self.buf[self.read_offset..self.write_offset]);
            self.buf = new_buf;
        }

        self.read_offset = 0;
        self.write_offset = num_available;
        Ok(())
    }

    /// Receives data until at least `n` bytes are available. The underlying stream reaching
    ///  EOF is reported as an [io::ErrorKind::UnexpectedEof] error.
    pub async fn ensure_available(&mut self, n: usize) -> anyhow::Result<()> {
        if self.bytes_available() >= n {
            return Ok(());
        }

        self.ensure_capacity(n)?;

        while self.bytes_available() < n {
            let num_read = self.reader.read(&mut self.buf[self.write_offset..]).await?;
            if num_read == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "peer disconnected").into());
            }
            trace!(num_read, "received data");
            self.write_offset += num_read;
        }
        Ok(())
    }

    pub fn try_get_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.try_take(1)?[0])
    }

    /// consume `n` bytes, returning a view into the buffer
    pub fn try_take(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        if self.bytes_available() < n {
            bail!("buffer underflow: requested {} bytes, {} available", n, self.bytes_available());
        }
        let start = self.read_offset;
        self.read_offset += n;
        Ok(&self.buf[start..start + n])
    }
}


#[cfg(test)]
mod test {
    use rstest::rstest;
    use crate::test_util::ChunkedReader;
    use super::*;

    fn config(initial_capacity: usize, max_capacity: usize) -> ReceiveBufferConfig {
        ReceiveBufferConfig {
            initial_capacity,
            max_capacity,
        }
    }

    #[rstest]
    #[case::single_read(100, 10)]
    #[case::one_byte_chunks(1, 10)]
    #[case::uneven_chunks(3, 10)]
    #[tokio::test]
    async fn test_ensure_available(#[case] chunk_size: usize, #[case] n: usize) {
        let data = (0..20u8).collect::<Vec<_>>();
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(data, chunk_size), &config(16, 16));

        buf.ensure_available(n).await.unwrap();
        assert!(buf.bytes_available() >= n);
        assert_eq!(buf.try_take(n).unwrap(), (0..n as u8).collect::<Vec<_>>().as_slice());
    }

    #[tokio::test]
    async fn test_eof_is_disconnect() {
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(vec![1, 2, 3], 2), &config(16, 16));

        let err = buf.ensure_available(4).await.unwrap_err();
        assert_eq!(err.downcast_ref::<io::Error>().unwrap().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_compaction() {
        let data = (0..12u8).collect::<Vec<_>>();
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(data, 100), &config(8, 8));

        buf.ensure_available(6).await.unwrap();
        assert_eq!(buf.bytes_available(), 8);
        assert_eq!(buf.try_take(6).unwrap(), &[0, 1, 2, 3, 4, 5]);

        // 2 bytes left at offset 6, 6 more needed: does not fit into the tail
        buf.ensure_available(6).await.unwrap();
        assert_eq!(buf.capacity(), 8);
        assert_eq!(buf.try_take(6).unwrap(), &[6, 7, 8, 9, 10, 11]);
        assert_eq!(buf.bytes_available(), 0);
    }

    #[tokio::test]
    async fn test_growth() {
        let data = (0..40u8).collect::<Vec<_>>();
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(data, 5), &config(8, 64));

        buf.ensure_available(3).await.unwrap();
        buf.try_take(2).unwrap();

        buf.ensure_available(30).await.unwrap();
        assert!(buf.capacity() >= 30);
        assert_eq!(buf.try_take(30).unwrap(), (2..32u8).collect::<Vec<_>>().as_slice());
    }

    #[test]
    fn test_ensure_capacity_beyond_maximum() {
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(vec![], 1), &config(8, 16));
        assert!(buf.ensure_capacity(16).is_ok());
        assert!(buf.ensure_capacity(17).is_err());
    }

    #[test]
    fn test_try_take_underflow() {
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(vec![], 1), &config(8, 8));
        assert!(buf.try_get_u8().is_err());
        assert_eq!(buf.bytes_free(), 8);
    }
}
