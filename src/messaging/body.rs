use anyhow::{anyhow, bail};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Marker for application message types that travel as structured documents. The type name
///  goes on the wire and is the key for handler lookup on the receiving side, so it must be stable
///  across versions and identical on both ends.
pub trait MessageType: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}


/// The payload of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// plain string payload
    Text(String),
    /// structured payload of an application type, see [MessageType]
    Document {
        type_name: String,
        value: serde_json::Value,
    },
    /// Payload in a format the serializer does not interpret. It is passed through as is, which
    ///  allows forwarding messages between endpoints that do not know the payload's type.
    Raw {
        type_name: String,
        content_type: String,
        data: Bytes,
    },
}

impl MessageBody {
    /// type name used for [MessageBody::Text]
    pub const TEXT_TYPE_NAME: &'static str = "string";

    pub fn text(s: impl Into<String>) -> MessageBody {
        MessageBody::Text(s.into())
    }

    pub fn document<T: MessageType>(msg: &T) -> anyhow::Result<MessageBody> {
        Ok(MessageBody::Document {
            type_name: T::TYPE_NAME.to_string(),
            value: serde_json::to_value(msg)?,
        })
    }

    pub fn type_name(&self) -> &str {
        match self {
            MessageBody::Text(_) => Self::TEXT_TYPE_NAME,
            MessageBody::Document { type_name, .. } => type_name,
            MessageBody::Raw { type_name, .. } => type_name,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Converts a document body back to the application type. Fails if the body is not a
    ///  document or if it is a document of a different type.
    pub fn parse<T: MessageType>(&self) -> anyhow::Result<T> {
        match self {
            MessageBody::Document { type_name, value } => {
                if type_name != T::TYPE_NAME {
                    bail!("expected a document of type {}, was {}", T::TYPE_NAME, type_name);
                }
                Ok(T::deserialize(value)?)
            }
            other => Err(anyhow!("expected a document of type {}, was {:?}", T::TYPE_NAME, other)),
        }
    }
}

impl From<&str> for MessageBody {
    fn from(value: &str) -> Self {
        MessageBody::Text(value.to_string())
    }
}

impl From<String> for MessageBody {
    fn from(value: String) -> Self {
        MessageBody::Text(value)
    }
}
