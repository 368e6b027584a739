use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::messaging::headers::{CONTENT_LENGTH, CORRELATION_ID, MESSAGE_ID};
use crate::messaging::serializer::TransportSerializer;
use crate::messaging::transport_message::{Ack, Nak, TransportMessage};
use crate::protocol::{HeaderFeatureFlags, TransportMessageType, MESSAGE_ID_LEN};
use crate::util::safe_converter::PrecheckedCast;

/// The raw send primitive the encoder writes to. Every call hands over a complete chunk of
///  bytes that must be sent before the call returns.
#[async_trait]
pub trait RawSender: Send {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()>;
}

#[async_trait]
impl <W: AsyncWrite + Unpin + Send> RawSender for W {
    async fn send(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.write_all(buf).await?;
        Ok(())
    }
}


pub struct ProtocolEncoder {
    serializer: Arc<dyn TransportSerializer>,
}

impl ProtocolEncoder {
    pub fn new(serializer: Arc<dyn TransportSerializer>) -> ProtocolEncoder {
        ProtocolEncoder {
            serializer,
        }
    }

    pub async fn encode_handshake(&self, sender: &mut impl RawSender, version: u8) -> anyhow::Result<()> {
        sender.send(&[version]).await
    }

    /// Serializes the message's body and sends the message. The message's headers are completed
    ///  as a side effect: the serializer's headers, `Content-Length` and `MessageId` are added.
    ///
    /// Headers and body are sent as two separate chunks to avoid copying the body.
    pub async fn encode_message(&self, sender: &mut impl RawSender, message: &mut TransportMessage) -> anyhow::Result<()> {
        let content = self.serializer.serialize(&message.body, &mut message.headers)?;
        message.headers.insert(CONTENT_LENGTH, content.len().to_string());
        message.headers.insert(MESSAGE_ID, message.id.simple().to_string());
        if let Some(correlation_id) = message.correlation_id {
            message.headers.insert(CORRELATION_ID, correlation_id.simple().to_string());
        }

        let mut buf = BytesMut::new();
        buf.put_u8(TransportMessageType::Message.into());

        let mut last_flags_offset = 0;
        for (name, value) in message.headers.iter() {
            last_flags_offset = buf.len();
            buf.put_u8(HeaderFeatureFlags::empty().bits());
            put_short_string(&mut buf, name)?;
            put_short_string(&mut buf, value)?;
        }
        buf[last_flags_offset] |= HeaderFeatureFlags::END_OF_HEADERS.bits();

        trace!(message_id = ?message.id, header_len = buf.len(), content_len = content.len(), "sending message");
        sender.send(&buf).await?;
        sender.send(&content).await
    }

    pub async fn encode_ack(&self, sender: &mut impl RawSender, ack: Ack) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(1 + MESSAGE_ID_LEN);
        buf.put_u8(TransportMessageType::Ack.into());
        buf.put_slice(ack.message_id().as_bytes());
        sender.send(&buf).await
    }

    pub async fn encode_nak(&self, sender: &mut impl RawSender, nak: Nak) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(1 + MESSAGE_ID_LEN);
        buf.put_u8(TransportMessageType::Nak.into());
        buf.put_slice(nak.message_id().as_bytes());
        sender.send(&buf).await
    }
}

fn put_short_string(buf: &mut BytesMut, s: &str) -> anyhow::Result<()> {
    if s.len() > u8::MAX as usize {
        bail!("header field {:?}... is {} bytes long, exceeding the maximum of 255", s.chars().take(32).collect::<String>(), s.len());
    }
    buf.put_u8(s.len().prechecked_cast());
    buf.put_slice(s.as_bytes());
    Ok(())
}
