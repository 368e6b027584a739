use anyhow::anyhow;
#[cfg(test)] use mockall::automock;

use crate::messaging::body::MessageBody;
use crate::messaging::headers::{Headers, CONTENT_TYPE, TYPE_NAME};

pub const CONTENT_TYPE_JSON: &str = "application/json";


/// Turns message bodies into bytes and back. Implementations own the `Content-Type` and
///  `Type-Name` headers: `serialize` sets them, and `deserialize` relies on them.
#[cfg_attr(test, automock)]
pub trait TransportSerializer: Send + Sync {
    fn serialize(&self, body: &MessageBody, headers: &mut Headers) -> anyhow::Result<Vec<u8>>;

    fn deserialize(&self, buf: &[u8], headers: &Headers) -> anyhow::Result<MessageBody>;
}


/// Serializes a body for storage in a queue record, returning the record's type tag and payload.
///
/// The tag combines the serializer's content type and type name headers as
///  `{Content-Type};{Type-Name}` so that [deserialize_record] can restore both. Type names must
///  therefore not contain `;`.
pub fn serialize_record(serializer: &dyn TransportSerializer, body: &MessageBody) -> anyhow::Result<(String, Vec<u8>)> {
    let mut headers = Headers::new();
    let payload = serializer.serialize(body, &mut headers)?;

    let content_type = headers.get(CONTENT_TYPE)
        .ok_or_else(|| anyhow!("serializer did not set the '{}' header", CONTENT_TYPE))?;
    let type_name = headers.get(TYPE_NAME)
        .ok_or_else(|| anyhow!("serializer did not set the '{}' header", TYPE_NAME))?;

    Ok((format!("{};{}", content_type, type_name), payload))
}

pub fn deserialize_record(serializer: &dyn TransportSerializer, type_tag: &str, payload: &[u8]) -> anyhow::Result<MessageBody> {
    let (content_type, type_name) = type_tag.rsplit_once(';')
        .ok_or_else(|| anyhow!("malformed record type tag {:?}", type_tag))?;

    let mut headers = Headers::new();
    headers.insert(CONTENT_TYPE, content_type);
    headers.insert(TYPE_NAME, type_name);
    serializer.deserialize(payload, &headers)
}


/// Default serializer: JSON for text and documents, raw bodies are passed through unchanged.
#[derive(Debug, Default)]
pub struct JsonTransportSerializer {}

impl JsonTransportSerializer {
    pub fn new() -> JsonTransportSerializer {
        JsonTransportSerializer {}
    }
}

impl TransportSerializer for JsonTransportSerializer {
    fn serialize(&self, body: &MessageBody, headers: &mut Headers) -> anyhow::Result<Vec<u8>> {
        let (content_type, buf) = match body {
            MessageBody::Text(s) => (CONTENT_TYPE_JSON, serde_json::to_vec(s)?),
            MessageBody::Document { value, .. } => (CONTENT_TYPE_JSON, serde_json::to_vec(value)?),
            MessageBody::Raw { content_type, data, .. } => (content_type.as_str(), data.to_vec()),
        };

        headers.insert(TYPE_NAME, body.type_name());
        headers.insert(CONTENT_TYPE, content_type);
        Ok(buf)
    }

    fn deserialize(&self, buf: &[u8], headers: &Headers) -> anyhow::Result<MessageBody> {
        let type_name = headers.get(TYPE_NAME)
            .ok_or_else(|| anyhow!("failed to find '{}' in the message headers", TYPE_NAME))?;
        let content_type = headers.get(CONTENT_TYPE)
            .ok_or_else(|| anyhow!("failed to find '{}' in the message headers", CONTENT_TYPE))?;

        if content_type != CONTENT_TYPE_JSON {
            return Ok(MessageBody::Raw {
                type_name: type_name.to_string(),
                content_type: content_type.to_string(),
                data: bytes::Bytes::copy_from_slice(buf),
            });
        }

        if type_name == MessageBody::TEXT_TYPE_NAME {
            return Ok(MessageBody::Text(serde_json::from_slice(buf)?));
        }

        Ok(MessageBody::Document {
            type_name: type_name.to_string(),
            value: serde_json::from_slice(buf)?,
        })
    }
}
