use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::bail;

/// The protocol version this crate speaks. A listener accepts every client announcing this
///  version or an older one.
pub const CURRENT_PROTOCOL_VERSION: u8 = 1;

/// Default TCP port of a messaging listener
pub const DEFAULT_PORT: u16 = 8335;

/// Longest type tag that fits into a queue record (the tag length is stored in a single byte)
pub const MAX_TYPE_TAG_LEN: usize = u8::MAX as usize;

/// Longest serialized payload that fits into a queue record (the length is stored as u16)
pub const MAX_RECORD_PAYLOAD_LEN: usize = u16::MAX as usize;


#[derive(Debug, Clone)]
pub struct ReceiveBufferConfig {
    /// size of the receive buffer that is allocated for every connection
    pub initial_capacity: usize,

    /// The receive buffer grows on demand if a single message does not fit into it, up to this
    ///  limit. A peer announcing a bigger message is treated as a fatal error for the connection.
    pub max_capacity: usize,
}

impl ReceiveBufferConfig {
    pub fn new() -> ReceiveBufferConfig {
        ReceiveBufferConfig {
            initial_capacity: 65535,
            max_capacity: 16*1024*1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.initial_capacity == 0 {
            bail!("receive buffer capacity must be positive");
        }
        if self.max_capacity < self.initial_capacity {
            bail!("maximum receive buffer capacity {} is smaller than the initial capacity {}", self.max_capacity, self.initial_capacity);
        }
        Ok(())
    }
}

impl Default for ReceiveBufferConfig {
    fn default() -> Self {
        ReceiveBufferConfig::new()
    }
}


#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// created on open if it does not exist. Can be shared by several queues.
    pub queue_directory: PathBuf,
    /// prefix for all of this queue's file names, must be file name friendly
    pub queue_name: String,
    /// A queue file is rotated once an append makes it larger than this (in bytes)
    pub max_file_size: u64,
}

impl QueueConfig {
    pub fn new(queue_directory: impl Into<PathBuf>, queue_name: impl Into<String>) -> QueueConfig {
        QueueConfig {
            queue_directory: queue_directory.into(),
            queue_name: queue_name.into(),
            max_file_size: 10_000_000,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_name.is_empty() {
            bail!("queue name must not be empty");
        }
        if self.queue_name.contains(|c: char| std::path::is_separator(c) || c == '_') {
            bail!("queue name {:?} must not contain path separators or '_'", self.queue_name);
        }
        if self.max_file_size == 0 {
            bail!("maximum queue file size must be positive");
        }
        Ok(())
    }
}


#[derive(Debug, Clone)]
pub struct MessagingClientConfig {
    /// name of this endpoint, used as the name of the outgoing queue
    pub endpoint_name: String,
    pub queue_directory: PathBuf,
    pub max_file_size: u64,

    pub remote_host: String,
    pub remote_port: u16,

    /// fixed delay between connection attempts while the remote endpoint is unreachable
    pub reconnect_delay: Duration,
    /// upper bound for waiting on an empty queue before the connection is checked again
    pub dequeue_timeout: Duration,

    pub receive_buffer: ReceiveBufferConfig,
}

impl MessagingClientConfig {
    pub fn new(endpoint_name: impl Into<String>, queue_directory: impl Into<PathBuf>, remote_host: impl Into<String>) -> MessagingClientConfig {
        MessagingClientConfig {
            endpoint_name: endpoint_name.into(),
            queue_directory: queue_directory.into(),
            max_file_size: 10_000_000,
            remote_host: remote_host.into(),
            remote_port: DEFAULT_PORT,
            reconnect_delay: Duration::from_secs(5),
            dequeue_timeout: Duration::from_secs(10),
            receive_buffer: ReceiveBufferConfig::new(),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            queue_directory: self.queue_directory.clone(),
            queue_name: self.endpoint_name.clone(),
            max_file_size: self.max_file_size,
        }
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.queue_config().validate()?;
        self.receive_buffer.validate()?;
        if self.remote_host.is_empty() {
            bail!("remote host must not be empty");
        }
        if self.remote_port == 0 {
            bail!("remote port must be positive");
        }
        Ok(())
    }
}


#[derive(Debug, Clone)]
pub struct MessagingServiceConfig {
    pub listener_addr: SocketAddr,
    pub receive_buffer: ReceiveBufferConfig,
}

impl MessagingServiceConfig {
    pub fn new(listener_addr: SocketAddr) -> MessagingServiceConfig {
        MessagingServiceConfig {
            listener_addr,
            receive_buffer: ReceiveBufferConfig::new(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.receive_buffer.validate()
    }
}
