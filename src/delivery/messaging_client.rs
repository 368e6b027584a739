use std::sync::Arc;

use anyhow::bail;
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::MessagingClientConfig;
use crate::delivery::tcp_client::TcpClient;
use crate::messaging::body::MessageBody;
use crate::messaging::serializer::TransportSerializer;
use crate::messaging::transport_message::{Frame, TransportMessage};
use crate::persistence::file_queue::FileQueue;

/// Sends messages to a remote messaging listener with at-least-once semantics.
///
/// [MessagingClient::send] stores a message in a durable outgoing queue and returns once it is on
///  disk. [MessagingClient::run] delivers queued messages one at a time: a message is removed from
///  the queue when the listener acknowledges it, and delivered again after a rejection or a
///  broken connection.
///
/// A message that is delivered more than once keeps its message id, so receivers can detect
///  duplicates. This holds for redeliveries while the client is running, but not across restarts.
pub struct MessagingClient {
    config: MessagingClientConfig,
    serializer: Arc<dyn TransportSerializer>,
    queue: FileQueue,
}

enum Reply {
    Ack,
    Nak,
}

enum ConnectionEnd {
    Cancelled,
    Broken(anyhow::Error),
}

impl MessagingClient {
    pub async fn open(config: MessagingClientConfig, serializer: Arc<dyn TransportSerializer>) -> anyhow::Result<MessagingClient> {
        config.validate()?;
        let queue = FileQueue::open(config.queue_config(), serializer.clone()).await?;

        Ok(MessagingClient {
            config,
            serializer,
            queue,
        })
    }

    /// Durably stores a message for delivery.
    pub async fn send(&self, body: impl Into<MessageBody>) -> anyhow::Result<()> {
        self.queue.enqueue(&body.into()).await
    }

    /// number of messages that were not acknowledged yet
    pub async fn pending_records(&self) -> usize {
        self.queue.pending_records().await
    }

    /// The delivery loop: runs until it is cancelled or there is a non-recoverable error.
    ///
    /// Failure to connect and broken connections are retried indefinitely after the configured
    ///  reconnect delay. Protocol violations and storage errors end the loop.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let remote_addr = self.config.remote_addr();
        info!("starting delivery from queue {:?} to {}", self.queue.name(), remote_addr);

        let mut pending_id = None;
        loop {
            let connected = select! {
                _ = cancel.cancelled() => break,
                r = TcpClient::connect(&remote_addr, self.serializer.clone(), &self.config.receive_buffer) => r,
            };

            let end = match connected {
                Ok(mut client) => self.deliver(&mut client, &mut pending_id, &cancel).await,
                Err(e) if is_transport_fault(&e) => Ok(ConnectionEnd::Broken(e)),
                Err(e) => Err(e),
            };

            match end {
                Ok(ConnectionEnd::Cancelled) => break,
                Ok(ConnectionEnd::Broken(e)) => {
                    warn!("connection to {} failed: {} - retrying in {:?}", remote_addr, e, self.config.reconnect_delay);
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.config.reconnect_delay) => {}
                    }
                }
                Err(e) => {
                    error!("delivery to {} failed: {}", remote_addr, e);
                    return Err(e);
                }
            }
        }

        info!("delivery to {} was cancelled", remote_addr);
        Ok(())
    }

    /// Delivers messages over an established connection, one at a time. Errors are fatal, while
    ///  transport faults are reported as [ConnectionEnd::Broken].
    async fn deliver(&self, client: &mut TcpClient, pending_id: &mut Option<Uuid>, cancel: &CancellationToken) -> anyhow::Result<ConnectionEnd> {
        loop {
            let dequeued = select! {
                _ = cancel.cancelled() => return Ok(ConnectionEnd::Cancelled),
                r = self.queue.dequeue(self.config.dequeue_timeout) => r?,
            };
            let dequeued = match dequeued {
                Some(dequeued) => dequeued,
                None => continue,
            };

            let mut message = TransportMessage::new(dequeued.body().clone());
            message.id = *pending_id.get_or_insert(message.id);

            let reply = select! {
                _ = cancel.cancelled() => None,
                r = send_and_await_reply(client, &mut message) => Some(r),
            };

            match reply {
                Some(Ok(Reply::Ack)) => {
                    dequeued.complete().await?;
                    *pending_id = None;
                    debug!(message_id = ?message.id, "message was acknowledged");
                }
                Some(Ok(Reply::Nak)) => {
                    dequeued.abort().await;
                    debug!(message_id = ?message.id, "message was rejected, delivering it again");
                }
                Some(Err(e)) => {
                    dequeued.abort().await;
                    if is_transport_fault(&e) {
                        return Ok(ConnectionEnd::Broken(e));
                    }
                    return Err(e);
                }
                None => {
                    dequeued.abort().await;
                    return Ok(ConnectionEnd::Cancelled);
                }
            }
        }
    }

    pub async fn close(self) -> anyhow::Result<()> {
        self.queue.close().await
    }
}

async fn send_and_await_reply(client: &mut TcpClient, message: &mut TransportMessage) -> anyhow::Result<Reply> {
    client.send(message).await?;
    debug!(message_id = ?message.id, "sent message to {:?}", client.peer_addr());

    match client.receive().await? {
        Frame::Ack(ack) if ack.message_id() == message.id => Ok(Reply::Ack),
        Frame::Nak(nak) if nak.message_id() == message.id => Ok(Reply::Nak),
        Frame::Ack(ack) => bail!("received ack for message {} while waiting for {}", ack.message_id(), message.id),
        Frame::Nak(nak) => bail!("received nak for message {} while waiting for {}", nak.message_id(), message.id),
        Frame::Message(m) => bail!("received message {} on a sending connection", m.id),
    }
}

/// Transport faults are I/O errors, everything else is a protocol violation or a storage error.
fn is_transport_fault(e: &anyhow::Error) -> bool {
    e.downcast_ref::<std::io::Error>().is_some()
}


#[cfg(test)]
mod test {
    use std::time::Duration;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpListener;
    use crate::config::ReceiveBufferConfig;
    use crate::messaging::serializer::JsonTransportSerializer;
    use crate::messaging::transport_message::{Ack, Nak};
    use crate::protocol::decoder::ProtocolDecoder;
    use crate::protocol::encoder::ProtocolEncoder;
    use crate::protocol::receive_buffer::ReceiveBuffer;
    use super::*;

    fn serializer() -> Arc<dyn TransportSerializer> {
        Arc::new(JsonTransportSerializer::new())
    }

    fn config(dir: &std::path::Path, port: u16) -> MessagingClientConfig {
        let mut config = MessagingClientConfig::new("sender", dir, "127.0.0.1");
        config.remote_port = port;
        config.reconnect_delay = Duration::from_millis(10);
        config.dequeue_timeout = Duration::from_millis(100);
        config
    }

    /// a listener that speaks the protocol by hand
    struct FakeListener {
        listener: TcpListener,
    }
    impl FakeListener {
        async fn bind() -> FakeListener {
            FakeListener { listener: TcpListener::bind("127.0.0.1:0").await.unwrap() }
        }

        fn port(&self) -> u16 {
            self.listener.local_addr().unwrap().port()
        }

        async fn accept(&self) -> (ReceiveBuffer<OwnedReadHalf>, OwnedWriteHalf) {
            let (stream, _) = self.listener.accept().await.unwrap();
            let (reader, writer) = stream.into_split();
            let mut buf = ReceiveBuffer::new(reader, &ReceiveBufferConfig::new());
            assert_eq!(ProtocolDecoder::new(serializer()).decode_handshake(&mut buf).await.unwrap(), 1);
            (buf, writer)
        }
    }

    async fn receive_message(buf: &mut ReceiveBuffer<OwnedReadHalf>) -> TransportMessage {
        match ProtocolDecoder::new(serializer()).decode(buf).await.unwrap() {
            Frame::Message(m) => m,
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let client = MessagingClient::open(config(dir.path(), 1), serializer()).await.unwrap();
        client.send("hello").await.unwrap();
        assert_eq!(client.pending_records().await, 1);
        client.close().await.unwrap();

        let client = MessagingClient::open(config(dir.path(), 1), serializer()).await.unwrap();
        assert_eq!(client.pending_records().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_while_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut config = config(dir.path(), port);
        config.reconnect_delay = Duration::from_secs(3600);
        let client = MessagingClient::open(config, serializer()).await.unwrap();
        client.send("hello").await.unwrap();

        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            c.cancel();
        });

        tokio::time::timeout(Duration::from_secs(5), client.run(cancel)).await
            .unwrap()
            .unwrap();
        assert_eq!(client.pending_records().await, 1);
    }

    #[tokio::test]
    async fn test_ack_completes_message() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeListener::bind().await;
        let client = Arc::new(MessagingClient::open(config(dir.path(), fake.port()), serializer()).await.unwrap());
        client.send("a").await.unwrap();

        let cancel = CancellationToken::new();
        let running = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await })
        };

        let (mut buf, mut writer) = fake.accept().await;
        let msg = receive_message(&mut buf).await;
        assert_eq!(msg.body.as_text(), Some("a"));
        ProtocolEncoder::new(serializer()).encode_ack(&mut writer, Ack::new(msg.id).unwrap()).await.unwrap();

        while client.pending_records().await > 0 {
            sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_nak_redelivers_with_same_id() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeListener::bind().await;
        let client = Arc::new(MessagingClient::open(config(dir.path(), fake.port()), serializer()).await.unwrap());
        client.send("a").await.unwrap();
        client.send("b").await.unwrap();

        let cancel = CancellationToken::new();
        let running = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await })
        };

        let encoder = ProtocolEncoder::new(serializer());
        let (mut buf, mut writer) = fake.accept().await;

        let first = receive_message(&mut buf).await;
        encoder.encode_nak(&mut writer, Nak::new(first.id).unwrap()).await.unwrap();
        let second = receive_message(&mut buf).await;
        assert_eq!(second.id, first.id);
        assert_eq!(second.body.as_text(), Some("a"));
        encoder.encode_ack(&mut writer, Ack::new(second.id).unwrap()).await.unwrap();

        let third = receive_message(&mut buf).await;
        assert_ne!(third.id, first.id);
        assert_eq!(third.body.as_text(), Some("b"));

        cancel.cancel();
        running.await.unwrap().unwrap();
        assert_eq!(client.pending_records().await, 1);
    }

    #[tokio::test]
    async fn test_broken_connection_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeListener::bind().await;
        let client = Arc::new(MessagingClient::open(config(dir.path(), fake.port()), serializer()).await.unwrap());
        client.send("a").await.unwrap();

        let cancel = CancellationToken::new();
        let running = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { client.run(cancel).await })
        };

        let first = {
            let (mut buf, writer) = fake.accept().await;
            let msg = receive_message(&mut buf).await;
            drop(writer);
            drop(buf);
            msg
        };

        let (mut buf, mut writer) = fake.accept().await;
        let second = receive_message(&mut buf).await;
        assert_eq!(second.id, first.id);
        ProtocolEncoder::new(serializer()).encode_ack(&mut writer, Ack::new(second.id).unwrap()).await.unwrap();

        while client.pending_records().await > 0 {
            sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mismatched_ack_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fake = FakeListener::bind().await;
        let client = Arc::new(MessagingClient::open(config(dir.path(), fake.port()), serializer()).await.unwrap());
        client.send("a").await.unwrap();

        let running = {
            let client = client.clone();
            tokio::spawn(async move { client.run(CancellationToken::new()).await })
        };

        let (mut buf, mut writer) = fake.accept().await;
        let _ = receive_message(&mut buf).await;
        ProtocolEncoder::new(serializer()).encode_ack(&mut writer, Ack::new(Uuid::from_u128(1)).unwrap()).await.unwrap();

        assert!(running.await.unwrap().is_err());
        assert_eq!(client.pending_records().await, 1);
    }
}
