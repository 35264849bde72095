//! In-memory connections
//!
//! A [`MemoryConnector`] hands out one pre-built connection whose other end is
//! a [`MemoryPeer`]. The peer plays the broker: it reads what the client sent
//! and pushes frames back. Used to wire sessions together without sockets.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use std::sync::Mutex;

use super::transport::{Connection, Connector};
use crate::error::SessionError;

/// Connector that yields a single in-memory connection.
///
/// Every `connect` after the first fails, which makes it usable with the
/// link's retry loop.
pub struct MemoryConnector {
    connection: Mutex<Option<Connection>>,
}

/// The broker side of an in-memory connection.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Vec<u8>>,
    to_client: Option<mpsc::UnboundedSender<Result<Vec<u8>, SessionError>>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryPeer) {
        let (client_tx, from_client) = mpsc::unbounded::<Vec<u8>>();
        let (to_client, client_rx) = mpsc::unbounded::<Result<Vec<u8>, SessionError>>();

        let sink = client_tx.sink_map_err(|_| SessionError::Closed);
        let connection = Connection::new(sink, client_rx);

        (
            Self {
                connection: Mutex::new(Some(connection)),
            },
            MemoryPeer {
                from_client,
                to_client: Some(to_client),
            },
        )
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<Connection, SessionError> {
        let connection = match self.connection.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        connection.ok_or_else(|| {
            SessionError::Transport(format!("memory connection to {} already used", url))
        })
    }
}

impl MemoryPeer {
    /// Next frame written by the client, or `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.next().await
    }

    /// A frame the client already wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.from_client.try_recv().ok()
    }

    /// Deliver a frame to the client.
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), SessionError> {
        match self.to_client.as_mut() {
            Some(tx) => tx.send(Ok(frame)).await.map_err(|_| SessionError::Closed),
            None => Err(SessionError::Closed),
        }
    }

    /// Deliver a read error to the client, which ends its stream.
    pub async fn fail(&mut self, reason: &str) -> Result<(), SessionError> {
        match self.to_client.as_mut() {
            Some(tx) => tx
                .send(Err(SessionError::Transport(reason.to_string())))
                .await
                .map_err(|_| SessionError::Closed),
            None => Err(SessionError::Closed),
        }
    }

    /// Close the broker-to-client direction, as if the connection dropped.
    pub fn disconnect(&mut self) {
        self.to_client = None;
    }
}
