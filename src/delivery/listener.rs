use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use rustc_hash::FxHashSet;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn, Instrument, Span};

use crate::config::{MessagingServiceConfig, ReceiveBufferConfig, CURRENT_PROTOCOL_VERSION};
use crate::messaging::body::MessageType;
use crate::messaging::handler::{HandlerInvoker, HandlerRegistry, MessageHandler};
use crate::messaging::serializer::{JsonTransportSerializer, TransportSerializer};
use crate::messaging::transport_message::{Ack, Frame, Nak};
use crate::protocol::decoder::ProtocolDecoder;
use crate::protocol::encoder::ProtocolEncoder;
use crate::protocol::receive_buffer::ReceiveBuffer;


/// Receives messages from [crate::delivery::messaging_client::MessagingClient]s.
///
/// Every accepted connection is handled in a separate task: each received message is passed to
///  the [HandlerInvoker], and acknowledged if the handler succeeds or rejected if it fails.
pub struct MessagingListener {
    listener: TcpListener,
    serializer: Arc<dyn TransportSerializer>,
    invoker: Arc<dyn HandlerInvoker>,
    receive_buffer: ReceiveBufferConfig,
    active_connections: Arc<RwLock<FxHashSet<SocketAddr>>>,
}

impl MessagingListener {
    pub async fn bind(config: &MessagingServiceConfig, serializer: Arc<dyn TransportSerializer>, invoker: Arc<dyn HandlerInvoker>) -> anyhow::Result<MessagingListener> {
        config.validate()?;

        Ok(MessagingListener {
            listener: TcpListener::bind(config.listener_addr).await?,
            serializer,
            invoker,
            receive_buffer: config.receive_buffer.clone(),
            active_connections: Default::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// peer addresses of all currently connected clients
    pub async fn active_connections(&self) -> Vec<SocketAddr> {
        self.active_connections.read().await
            .iter()
            .cloned()
            .collect()
    }

    /// Accepts connections until cancelled. Cancellation also ends the handling of connections
    ///  that are open at that time, after the message they are currently processing.
    pub async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        info!("listening for messages on {:?}", self.listener.local_addr()?);

        loop {
            let (stream, addr) = select! {
                _ = cancel.cancelled() => break,
                r = self.listener.accept() => r?,
            };

            self.active_connections.write().await.insert(addr);

            let serializer = self.serializer.clone();
            let invoker = self.invoker.clone();
            let receive_buffer = self.receive_buffer.clone();
            let active_connections = self.active_connections.clone();
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                // a separate task, so the client is removed even if a handler panics
                let handling = tokio::spawn(handle_connection(addr, stream, serializer, invoker, receive_buffer, cancel));
                match handling.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("connection from {} broke with an error: {}", addr, e),
                    Err(e) => error!("handling the connection from {} failed: {}", addr, e),
                }
                active_connections.write().await.remove(&addr);
            });
        }

        info!("stopped listening for messages");
        Ok(())
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = format!("{:?}", _addr)))]
async fn handle_connection(
    _addr: SocketAddr,
    stream: TcpStream,
    serializer: Arc<dyn TransportSerializer>,
    invoker: Arc<dyn HandlerInvoker>,
    receive_buffer: ReceiveBufferConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    debug!("accepted connection");
    stream.set_nodelay(true)?;
    let (reader, mut writer) = stream.into_split();
    let mut buf = ReceiveBuffer::new(reader, &receive_buffer);
    let decoder = ProtocolDecoder::new(serializer.clone());
    let encoder = ProtocolEncoder::new(serializer);

    let version = select! {
        _ = cancel.cancelled() => return Ok(()),
        r = decoder.decode_handshake(&mut buf) => r?,
    };
    if version > CURRENT_PROTOCOL_VERSION {
        bail!("client requested protocol version {}, but only versions up to {} are supported", version, CURRENT_PROTOCOL_VERSION);
    }
    debug!(version, "received handshake");

    loop {
        let frame = select! {
            _ = cancel.cancelled() => break,
            r = decoder.decode(&mut buf) => r,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) if is_disconnect(&e) => {
                debug!("connection closed by peer");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let message = match frame {
            Frame::Message(message) => message,
            other => bail!("received {:?} on a receiving connection", other),
        };

        match invoker.handle(&message.body)
            .instrument(Span::current())
            .await
        {
            Ok(()) => {
                encoder.encode_ack(&mut writer, Ack::new(message.id)?).await?;
                trace!(message_id = ?message.id, "acknowledged message");
            }
            Err(e) => {
                warn!(message_id = ?message.id, "handler failed, rejecting message: {}", e);
                encoder.encode_nak(&mut writer, Nak::new(message.id)?).await?;
            }
        }
    }

    debug!("connection closed");
    Ok(())
}

fn is_disconnect(e: &anyhow::Error) -> bool {
    e.downcast_ref::<io::Error>()
        .map(|e| e.kind() == io::ErrorKind::UnexpectedEof)
        .unwrap_or(false)
}


/// Convenience for the receiving side: collects message handlers and starts a
///  [MessagingListener] that dispatches to them.
pub struct MessagingService {
    config: MessagingServiceConfig,
    serializer: Arc<dyn TransportSerializer>,
    handlers: HandlerRegistry,
}

impl MessagingService {
    /// a service using [JsonTransportSerializer]
    pub fn new(config: MessagingServiceConfig) -> MessagingService {
        MessagingService::with_serializer(config, Arc::new(JsonTransportSerializer::new()))
    }

    pub fn with_serializer(config: MessagingServiceConfig, serializer: Arc<dyn TransportSerializer>) -> MessagingService {
        MessagingService {
            config,
            serializer,
            handlers: HandlerRegistry::new(),
        }
    }

    pub fn register<T: MessageType>(&mut self, handler: impl MessageHandler<T>) -> anyhow::Result<()> {
        self.handlers.register(handler)
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    pub async fn bind(self) -> anyhow::Result<MessagingListener> {
        MessagingListener::bind(&self.config, self.serializer, Arc::new(self.handlers)).await
    }
}
