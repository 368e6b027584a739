use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::io::AsyncRead;
use tracing::trace;
use uuid::Uuid;

use crate::messaging::headers::{Headers, CONTENT_LENGTH, CORRELATION_ID, MESSAGE_ID};
use crate::messaging::serializer::TransportSerializer;
use crate::messaging::transport_message::{Ack, Frame, Nak, TransportMessage};
use crate::protocol::receive_buffer::ReceiveBuffer;
use crate::protocol::{HeaderFeatureFlags, TransportMessageType, MESSAGE_ID_LEN};
use crate::util::safe_converter::SafeCast;

pub struct ProtocolDecoder {
    serializer: Arc<dyn TransportSerializer>,
}

impl ProtocolDecoder {
    pub fn new(serializer: Arc<dyn TransportSerializer>) -> ProtocolDecoder {
        ProtocolDecoder {
            serializer,
        }
    }

    pub async fn decode_handshake<R: AsyncRead + Unpin>(&self, buf: &mut ReceiveBuffer<R>) -> anyhow::Result<u8> {
        buf.ensure_available(1).await?;
        buf.try_get_u8()
    }

    /// Decodes the next frame, receiving more data as needed.
    pub async fn decode<R: AsyncRead + Unpin>(&self, buf: &mut ReceiveBuffer<R>) -> anyhow::Result<Frame> {
        buf.ensure_available(1).await?;
        let frame_type = buf.try_get_u8()?;

        match TransportMessageType::try_from(frame_type) {
            Ok(TransportMessageType::Message) => Ok(Frame::Message(self.decode_message(buf).await?)),
            Ok(TransportMessageType::Ack) => Ok(Frame::Ack(Ack::new(decode_message_id(buf).await?)?)),
            Ok(TransportMessageType::Nak) => Ok(Frame::Nak(Nak::new(decode_message_id(buf).await?)?)),
            Err(_) => bail!("unsupported frame type {}", frame_type),
        }
    }

    async fn decode_message<R: AsyncRead + Unpin>(&self, buf: &mut ReceiveBuffer<R>) -> anyhow::Result<TransportMessage> {
        let headers = decode_headers(buf).await?;

        let content_length: usize = headers.get(CONTENT_LENGTH)
            .ok_or_else(|| anyhow!("expected header '{}' to be specified", CONTENT_LENGTH))?
            .parse()
            .map_err(|e| anyhow!("invalid '{}' header: {}", CONTENT_LENGTH, e))?;

        let id = headers.get(MESSAGE_ID)
            .ok_or_else(|| anyhow!("all messages must have an id"))
            .and_then(parse_uuid)?;

        let correlation_id = match headers.get(CORRELATION_ID) {
            Some(s) => Some(parse_uuid(s)?),
            None => None,
        };

        buf.ensure_capacity(content_length)?;
        buf.ensure_available(content_length).await?;

        trace!(message_id = ?id, content_length, "decoding message body");
        let body = self.serializer.deserialize(buf.try_take(content_length)?, &headers)?;

        Ok(TransportMessage {
            id,
            correlation_id,
            headers,
            body,
        })
    }
}

async fn decode_headers<R: AsyncRead + Unpin>(buf: &mut ReceiveBuffer<R>) -> anyhow::Result<Headers> {
    let mut headers = Headers::new();
    loop {
        buf.ensure_available(2).await?;
        let flags = HeaderFeatureFlags::from_bits_retain(buf.try_get_u8()?);

        let name_len: usize = buf.try_get_u8()?.safe_cast();
        buf.ensure_available(name_len + 1).await?;
        let name = std::str::from_utf8(buf.try_take(name_len)?)?.to_string();

        let value_len: usize = buf.try_get_u8()?.safe_cast();
        buf.ensure_available(value_len).await?;
        let value = std::str::from_utf8(buf.try_take(value_len)?)?.to_string();

        if headers.contains(&name) {
            bail!("duplicate header {:?}", name);
        }
        headers.insert(name, value);

        if flags.contains(HeaderFeatureFlags::END_OF_HEADERS) {
            return Ok(headers);
        }
    }
}

async fn decode_message_id<R: AsyncRead + Unpin>(buf: &mut ReceiveBuffer<R>) -> anyhow::Result<Uuid> {
    buf.ensure_available(MESSAGE_ID_LEN).await?;
    Ok(Uuid::from_slice(buf.try_take(MESSAGE_ID_LEN)?)?)
}

fn parse_uuid(s: &str) -> anyhow::Result<Uuid> {
    Uuid::try_parse(s)
        .map_err(|e| anyhow!("invalid message id {:?}: {}", s, e))
}


#[cfg(test)]
mod test {
    use std::io;

    use rstest::rstest;

    use crate::config::ReceiveBufferConfig;
    use crate::messaging::body::MessageBody;
    use crate::messaging::headers::{CONTENT_TYPE, TYPE_NAME};
    use crate::messaging::serializer::JsonTransportSerializer;
    use crate::protocol::encoder::ProtocolEncoder;
    use crate::test_util::ChunkedReader;
    use super::*;

    fn serializer() -> Arc<dyn TransportSerializer> {
        Arc::new(JsonTransportSerializer::new())
    }

    fn receive_buffer(data: Vec<u8>, chunk_size: usize) -> ReceiveBuffer<ChunkedReader> {
        ReceiveBuffer::new(ChunkedReader::new(data, chunk_size), &ReceiveBufferConfig::new())
    }

    /// hand-made message without the encoder's validation
    fn raw_message(headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
        let mut result = vec![TransportMessageType::Message.into()];
        for (i, (name, value)) in headers.iter().enumerate() {
            result.push(if i == headers.len() - 1 { 0x80 } else { 0 });
            result.push(name.len() as u8);
            result.extend_from_slice(name.as_bytes());
            result.push(value.len() as u8);
            result.extend_from_slice(value.as_bytes());
        }
        result.extend_from_slice(body);
        result
    }

    #[rstest]
    #[case::ack(2)]
    #[case::nak(3)]
    #[tokio::test]
    async fn test_decode_ack_nak(#[case] frame_type: u8) {
        let id = Uuid::new_v4();
        let mut data = vec![frame_type];
        data.extend_from_slice(id.as_bytes());

        let actual = ProtocolDecoder::new(serializer())
            .decode(&mut receive_buffer(data, 100)).await.unwrap();

        match actual {
            Frame::Ack(ack) => { assert_eq!(frame_type, 2); assert_eq!(ack.message_id(), id); }
            Frame::Nak(nak) => { assert_eq!(frame_type, 3); assert_eq!(nak.message_id(), id); }
            Frame::Message(_) => panic!("expected ack or nak"),
        }
    }

    #[rstest]
    #[case::one_byte_chunks(1)]
    #[case::small_chunks(7)]
    #[case::single_chunk(100_000)]
    #[tokio::test]
    async fn test_two_messages_in_chunks(#[case] chunk_size: usize) {
        let encoder = ProtocolEncoder::new(serializer());
        let mut msg1 = TransportMessage::new(MessageBody::text("Test1"));
        let mut msg2 = TransportMessage::new(MessageBody::text("Test2"));
        msg2.correlation_id = Some(msg1.id);

        let mut data = Vec::new();
        encoder.encode_message(&mut data, &mut msg1).await.unwrap();
        encoder.encode_message(&mut data, &mut msg2).await.unwrap();

        let decoder = ProtocolDecoder::new(serializer());
        let mut buf = receive_buffer(data, chunk_size);

        let actual1 = decoder.decode(&mut buf).await.unwrap();
        let actual2 = decoder.decode(&mut buf).await.unwrap();

        assert_eq!(actual1, Frame::Message(msg1));
        assert_eq!(actual2, Frame::Message(msg2));

        let err = decoder.decode(&mut buf).await.unwrap_err();
        assert_eq!(err.downcast_ref::<io::Error>().unwrap().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_body_bigger_than_initial_buffer() {
        let encoder = ProtocolEncoder::new(serializer());
        let mut msg = TransportMessage::new(MessageBody::text("x".repeat(1000)));
        let mut data = Vec::new();
        encoder.encode_message(&mut data, &mut msg).await.unwrap();

        let config = ReceiveBufferConfig { initial_capacity: 64, max_capacity: 4096 };
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(data, 50), &config);

        let actual = ProtocolDecoder::new(serializer()).decode(&mut buf).await.unwrap();
        assert_eq!(actual, Frame::Message(msg));
    }

    #[tokio::test]
    async fn test_body_bigger_than_maximum_buffer() {
        let encoder = ProtocolEncoder::new(serializer());
        let mut msg = TransportMessage::new(MessageBody::text("x".repeat(1000)));
        let mut data = Vec::new();
        encoder.encode_message(&mut data, &mut msg).await.unwrap();

        let config = ReceiveBufferConfig { initial_capacity: 256, max_capacity: 512 };
        let mut buf = ReceiveBuffer::new(ChunkedReader::new(data, 50), &config);

        let err = ProtocolDecoder::new(serializer()).decode(&mut buf).await.unwrap_err();
        assert!(err.downcast_ref::<io::Error>().is_none());
    }

    #[tokio::test]
    async fn test_decode_handshake() {
        let mut buf = receive_buffer(vec![1, 2], 1);
        let decoder = ProtocolDecoder::new(serializer());
        assert_eq!(decoder.decode_handshake(&mut buf).await.unwrap(), 1);
        assert_eq!(decoder.decode_handshake(&mut buf).await.unwrap(), 2);
    }

    const ID: &str = "0123456789abcdef0123456789abcdef";

    #[rstest]
    #[case::missing_content_length(&[(MESSAGE_ID, ID), (TYPE_NAME, "string"), (CONTENT_TYPE, "application/json")])]
    #[case::missing_message_id(&[(CONTENT_LENGTH, "3"), (TYPE_NAME, "string"), (CONTENT_TYPE, "application/json")])]
    #[case::invalid_content_length(&[(CONTENT_LENGTH, "three"), (MESSAGE_ID, ID), (TYPE_NAME, "string"), (CONTENT_TYPE, "application/json")])]
    #[case::invalid_message_id(&[(CONTENT_LENGTH, "3"), (MESSAGE_ID, "xyz"), (TYPE_NAME, "string"), (CONTENT_TYPE, "application/json")])]
    #[case::missing_type_name(&[(CONTENT_LENGTH, "3"), (MESSAGE_ID, ID), (CONTENT_TYPE, "application/json")])]
    #[case::duplicate_header(&[(CONTENT_LENGTH, "3"), (CONTENT_LENGTH, "3"), (MESSAGE_ID, ID), (TYPE_NAME, "string"), (CONTENT_TYPE, "application/json")])]
    #[tokio::test]
    async fn test_invalid_message(#[case] headers: &[(&str, &str)]) {
        let data = raw_message(headers, b"\"a\"");
        let err = ProtocolDecoder::new(serializer())
            .decode(&mut receive_buffer(data, 100)).await.unwrap_err();
        assert!(err.downcast_ref::<io::Error>().is_none(), "{}", err);
    }

    #[tokio::test]
    async fn test_valid_raw_message() {
        let data = raw_message(&[(CONTENT_LENGTH, "3"), (MESSAGE_ID, ID), (TYPE_NAME, "string"), (CONTENT_TYPE, "application/json")], b"\"a\"");
        let actual = ProtocolDecoder::new(serializer())
            .decode(&mut receive_buffer(data, 100)).await.unwrap();

        match actual {
            Frame::Message(msg) => {
                assert_eq!(msg.id, Uuid::try_parse(ID).unwrap());
                assert_eq!(msg.body, MessageBody::text("a"));
            }
            other => panic!("expected a message, was {:?}", other),
        }
    }

    #[rstest]
    #[case::unknown_type(vec![4])]
    #[case::nil_ack(vec![2; 1].into_iter().chain([0u8; 16]).collect())]
    #[tokio::test]
    async fn test_invalid_frame(#[case] data: Vec<u8>) {
        let err = ProtocolDecoder::new(serializer())
            .decode(&mut receive_buffer(data, 100)).await.unwrap_err();
        assert!(err.downcast_ref::<io::Error>().is_none());
    }
}
