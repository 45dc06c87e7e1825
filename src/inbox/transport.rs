// Push channel transport for Parley
// Contains the connector seam and its WebSocket implementation

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::debug;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};

/// Errors raised by the push transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Could not establish the connection
    #[error("Connect failed: {0}")]
    Connect(String),

    /// Connect attempt did not finish in time
    #[error("Connect timed out")]
    Timeout,

    /// The established connection failed
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    /// Peer went quiet for longer than the idle timeout
    #[error("No frames received for {0:?}")]
    Idle(std::time::Duration),
}

/// One unit of traffic received on a push channel
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Text(String),
    /// Transport-level traffic with no payload for us (WebSocket ping/pong)
    Activity,
}

/// An open push channel carrying text frames
#[async_trait]
pub trait PushStream: Send {
    /// Next frame. `None` means the peer closed the channel.
    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>>;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Opens push channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushStream>, TransportError>;
}

/// Connector backed by tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn PushStream>, TransportError> {
        debug!("Opening WebSocket to {}", url);
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        debug!("WebSocket handshake completed with status {}", response.status());
        Ok(Box::new(WebSocketPushStream { inner: stream }))
    }
}

pub struct WebSocketPushStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for WebSocketPushStream {
    async fn recv(&mut self) -> Option<Result<Incoming, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(Incoming::Text(text.as_str().to_owned()))),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(Incoming::Text(text))),
                    Err(_) => {
                        debug!("Skipping non UTF-8 binary frame ({} bytes)", bytes.len());
                        return Some(Ok(Incoming::Activity));
                    }
                },
                // Tungstenite queues the pong reply itself; flush it so the peer sees it now
                Ok(WsMessage::Ping(_)) => {
                    if let Err(e) = self.inner.flush().await {
                        return Some(Err(e.into()));
                    }
                    return Some(Ok(Incoming::Activity));
                }
                Ok(WsMessage::Pong(_)) => return Some(Ok(Incoming::Activity)),
                Ok(WsMessage::Frame(_)) => {}
                Ok(WsMessage::Close(frame)) => {
                    debug!("Peer closed push channel: {:?}", frame);
                    return None;
                }
                Err(tungstenite::Error::ConnectionClosed) => return None,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.inner.send(WsMessage::text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.inner.close(None).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
