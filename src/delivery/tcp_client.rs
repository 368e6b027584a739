use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{ReceiveBufferConfig, CURRENT_PROTOCOL_VERSION};
use crate::messaging::serializer::TransportSerializer;
use crate::messaging::transport_message::{Frame, TransportMessage};
use crate::protocol::decoder::ProtocolDecoder;
use crate::protocol::encoder::ProtocolEncoder;
use crate::protocol::receive_buffer::ReceiveBuffer;


/// The sending side of a connection to a messaging listener. The handshake is sent when the
///  connection is established, after that the client sends messages and receives their
///  acknowledgements.
pub struct TcpClient {
    peer_addr: SocketAddr,
    writer: OwnedWriteHalf,
    receive_buffer: ReceiveBuffer<OwnedReadHalf>,
    encoder: ProtocolEncoder,
    decoder: ProtocolDecoder,
}

impl TcpClient {
    pub async fn connect(remote_addr: &str, serializer: Arc<dyn TransportSerializer>, buffer_config: &ReceiveBufferConfig) -> anyhow::Result<TcpClient> {
        let stream = TcpStream::connect(remote_addr).await?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (reader, mut writer) = stream.into_split();

        let encoder = ProtocolEncoder::new(serializer.clone());
        encoder.encode_handshake(&mut writer, CURRENT_PROTOCOL_VERSION).await?;
        debug!("connected to {:?}, sent handshake with protocol version {}", peer_addr, CURRENT_PROTOCOL_VERSION);

        Ok(TcpClient {
            peer_addr,
            writer,
            receive_buffer: ReceiveBuffer::new(reader, buffer_config),
            encoder,
            decoder: ProtocolDecoder::new(serializer),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, message: &mut TransportMessage) -> anyhow::Result<()> {
        self.encoder.encode_message(&mut self.writer, message).await
    }

    /// Waits for the next frame from the listener. Cancel safe only between frames.
    pub async fn receive(&mut self) -> anyhow::Result<Frame> {
        self.decoder.decode(&mut self.receive_buffer).await
    }
}
