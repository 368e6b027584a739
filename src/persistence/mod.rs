//! Durable storage for outgoing messages.
//!
//! [file_queue::FileQueue] is the entry point. It stores records in a sequence of
//!  [queue_file::QueueFile]s, each of which keeps its read cursor in a
//!  [queue_meta_file::QueueMetaFile]. Reading a record yields a
//!  [dequeued_message::DequeuedMessage] that must be completed or aborted.

pub mod dequeued_message;
pub mod file_queue;
pub mod queue_file;
pub mod queue_meta_file;
