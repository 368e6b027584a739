//! A simple binary protocol for transferring messages with acknowledgement over a byte stream.
//!
//! A connection starts with the client sending its protocol version:
//!
//! ```ascii
//! 0: protocol version (u8)
//! ```
//!
//! After that, the connection is a sequence of frames, each starting with its frame type:
//!
//! ```ascii
//! 0: frame type (u8): 1 = MESSAGE, 2 = ACK, 3 = NAK
//! ```
//!
//! *MESSAGE*
//!
//! A list of headers followed by the serialized body. Each header is encoded as
//!
//! ```ascii
//! 0: feature flags (u8) - 0x80 marks the last header, other bits are reserved
//! 1: name length (u8)
//! 2: name (UTF-8)
//! *: value length (u8)
//! *: value (UTF-8)
//! ```
//!
//! The headers `Content-Length` (decimal) and `MessageId` (32 hex digits) are mandatory; the
//!  serializer adds its own headers (typically `Content-Type` and `Type-Name`). The body follows
//!  the last header and is exactly `Content-Length` bytes long.
//!
//! *ACK* / *NAK*
//!
//! ```ascii
//! 0: id of the acknowledged / rejected message (16 bytes)
//! ```

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub mod decoder;
pub mod encoder;
pub mod receive_buffer;

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TransportMessageType {
    Message = 1,
    Ack = 2,
    Nak = 3,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct HeaderFeatureFlags: u8 {
        const END_OF_HEADERS = 0b1000_0000;
    }
}

/// length of a message id on the wire
pub const MESSAGE_ID_LEN: usize = 16;
