//! WebSocket Transport Layer
//!
//! Single responsibility: open a duplex connection and expose it as a sink and
//! a stream of binary frames. No knowledge of envelopes, retries or sessions.

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, protocol::Message},
};
use tracing::debug;

use crate::error::SessionError;

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = SessionError> + Send>>;

/// Inbound half of a connection. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, SessionError>> + Send>>;

/// An established connection.
///
/// Only a [`Connector`] produces one, so holding a `Connection` means the
/// handshake is done.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<Vec<u8>, Error = SessionError> + Send + 'static,
        St: Stream<Item = Result<Vec<u8>, SessionError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Something that can open a connection to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// One connection attempt. Retrying is the caller's business.
    async fn connect(&self, url: &str) -> Result<Connection, SessionError>;
}

/// Production connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Connection, SessionError> {
        debug!(url = %url, "Connecting to WebSocket");

        let request = url
            .into_client_request()
            .map_err(|e| SessionError::Transport(format!("Failed to build request: {}", e)))?;

        let (ws, _) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| SessionError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|e| SessionError::Transport(format!("Failed to send: {}", e)))
            .with(|frame: Vec<u8>| future::ready(Ok::<_, SessionError>(Message::Binary(frame))));

        let stream = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(data)),
                    // Pong is handled automatically by tungstenite; text is not part of the protocol
                    Ok(_) => None,
                    Err(e) => Some(Err(SessionError::Transport(format!("WebSocket error: {}", e)))),
                })
            });

        debug!(url = %url, "WebSocket connected");
        Ok(Connection::new(sink, stream))
    }
}
