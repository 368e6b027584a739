use anyhow::bail;
use uuid::Uuid;

use crate::messaging::body::MessageBody;
use crate::messaging::headers::Headers;

/// Envelope for a message on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub headers: Headers,
    pub body: MessageBody,
}

impl TransportMessage {
    /// create a message with a fresh unique id
    pub fn new(body: MessageBody) -> TransportMessage {
        TransportMessage {
            id: Uuid::new_v4(),
            correlation_id: None,
            headers: Headers::new(),
            body,
        }
    }
}


/// Positive acknowledgement: the receiver processed the message with this id
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Ack {
    message_id: Uuid,
}
impl Ack {
    pub fn new(message_id: Uuid) -> anyhow::Result<Ack> {
        if message_id.is_nil() {
            bail!("an ack must refer to a message id");
        }
        Ok(Ack { message_id })
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }
}

/// Negative acknowledgement: the receiver failed to process the message with this id, and the
///  sender should deliver it again
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Nak {
    message_id: Uuid,
}
impl Nak {
    pub fn new(message_id: Uuid) -> anyhow::Result<Nak> {
        if message_id.is_nil() {
            bail!("a nak must refer to a message id");
        }
        Ok(Nak { message_id })
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }
}


/// A complete unit on the wire, as returned by the decoder
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Message(TransportMessage),
    Ack(Ack),
    Nak(Nak),
}
