//! Broker Link
//!
//! Owns the single duplex connection to the broker.
//!
//! | Module      | Responsibility                                  |
//! |-------------|-------------------------------------------------|
//! | `endpoint`  | Locator → URL normalization                     |
//! | `transport` | Connection trait and the WebSocket connector    |
//! | `memory`    | In-memory connector for local wiring and tests  |
//!
//! # Lifecycle
//!
//! A [`Link`] can only be obtained from [`Link::open`], which does not return
//! until a connection is established. While connecting there is no `Link`, so
//! nothing can be sent over a half-open connection.
//!
//! ```text
//!   open() ──► attempt 1 (2s) ──► attempt 2 (4s) ──► ... ──► attempt 10
//!                  │                  │                          │
//!                  └──── connected ───┴──────────► Link ◄────────┘
//! ```
//!
//! Once open, a writer task drains queued frames into the connection and a
//! reader task feeds the installed handler. When the connection drops the
//! handler sees one final [`LinkEvent::Closed`]; the link does not reconnect.

mod endpoint;
pub mod memory;
mod transport;

pub use endpoint::normalize_endpoint;
pub use memory::{MemoryConnector, MemoryPeer};
pub use transport::{Connection, Connector, FrameSink, FrameStream, WebSocketConnector};

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::LinkConfig;
use crate::error::SessionError;

/// What the link reports to its handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One inbound frame, in arrival order.
    Frame(Vec<u8>),
    /// The connection is gone. Delivered once, after the last frame.
    Closed,
}

pub type MessageHandler = Arc<dyn Fn(LinkEvent) + Send + Sync>;

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

struct LinkShared {
    url: String,
    open: AtomicBool,
    /// Bytes queued for the writer but not yet accepted by the connection
    buffered: AtomicUsize,
    handler: Mutex<Option<MessageHandler>>,
    /// Stops the reader
    shutdown: Notify,
    /// Stops the writer, including a write stuck on a peer that stopped reading
    abandon_writes: Notify,
}

impl LinkShared {
    fn handler(&self) -> MutexGuard<'_, Option<MessageHandler>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: LinkEvent) {
        let handler = self.handler().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }

    fn fail(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

/// An open connection to the broker.
pub struct Link {
    shared: Arc<LinkShared>,
    config: LinkConfig,
    outbound: mpsc::UnboundedSender<Outbound>,
    stream: Mutex<Option<FrameStream>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: JoinHandle<()>,
}

impl Link {
    /// Open a link, retrying with a doubling per-attempt timeout.
    ///
    /// # Errors
    /// - `InvalidEndpoint` if the endpoint cannot be normalized
    /// - `Connection` once every attempt has failed or timed out
    pub async fn open(
        endpoint: &str,
        connector: &dyn Connector,
        config: LinkConfig,
    ) -> Result<Self, SessionError> {
        let url = normalize_endpoint(endpoint)?;
        let mut budget = config.connect_timeout();

        for attempt in 1..=config.max_connect_attempts {
            let deadline = Instant::now() + budget;
            debug!(
                url = %url,
                attempt = attempt,
                timeout_ms = budget.as_millis() as u64,
                "Opening link"
            );

            match tokio::time::timeout(budget, connector.connect(&url)).await {
                Ok(Ok(connection)) => {
                    info!(url = %url, attempt = attempt, "Link open");
                    return Ok(Self::start(url, connection, config));
                }
                Ok(Err(e)) => {
                    warn!(url = %url, attempt = attempt, error = %e, "Connection attempt failed");
                    // Keep the schedule: the next attempt starts when this budget runs out
                    tokio::time::sleep_until(deadline).await;
                }
                Err(_) => {
                    warn!(url = %url, attempt = attempt, "Connection attempt timed out, restarting");
                }
            }

            budget = budget.saturating_mul(2);
        }

        error!(url = %url, attempts = config.max_connect_attempts, "Giving up on link");
        Err(SessionError::Connection {
            endpoint: endpoint.to_string(),
            attempts: config.max_connect_attempts,
        })
    }

    fn start(url: String, connection: Connection, config: LinkConfig) -> Self {
        let shared = Arc::new(LinkShared {
            url,
            open: AtomicBool::new(true),
            buffered: AtomicUsize::new(0),
            handler: Mutex::new(None),
            shutdown: Notify::new(),
            abandon_writes: Notify::new(),
        });

        let (outbound, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_loop(connection.sink, rx, Arc::clone(&shared)));

        Self {
            shared,
            config,
            outbound,
            stream: Mutex::new(Some(connection.stream)),
            reader: Mutex::new(None),
            writer,
        }
    }

    /// Install the inbound handler.
    ///
    /// The first call starts reading; later calls replace the handler.
    pub fn on_message(&self, handler: impl Fn(LinkEvent) + Send + Sync + 'static) {
        *self.shared.handler() = Some(Arc::new(handler));

        let stream = self
            .stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stream) = stream {
            let task = tokio::spawn(reader_loop(stream, Arc::clone(&self.shared)));
            *self.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        }
    }

    /// Send one frame, waiting while the write buffer is above the high-water mark.
    ///
    /// # Errors
    /// `Closed` if the link is closed before or while waiting.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }

        while self.buffered_amount() > self.config.write_high_water_mark {
            tokio::time::sleep(self.config.backpressure_poll()).await;
            if !self.is_open() {
                return Err(SessionError::Closed);
            }
        }

        self.enqueue(frame)
    }

    /// Queue one frame without waiting on backpressure.
    ///
    /// For teardown paths that cannot suspend.
    pub fn try_send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Closed);
        }
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        let len = frame.len();
        self.shared.buffered.fetch_add(len, Ordering::SeqCst);
        self.outbound.send(Outbound::Frame(frame)).map_err(|_| {
            self.shared.buffered.fetch_sub(len, Ordering::SeqCst);
            SessionError::Closed
        })
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Bytes queued but not yet written to the connection.
    pub fn buffered_amount(&self) -> usize {
        self.shared.buffered.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Detach the handler and terminate the connection. Idempotent.
    pub fn close(&self) {
        self.shared.handler().take();
        if self.shared.open.swap(false, Ordering::SeqCst) {
            info!(url = %self.shared.url, "Closing link");
        }
        let _ = self.outbound.send(Outbound::Close);
        self.shared.abandon_writes.notify_one();
        self.shared.shutdown.notify_one();
        self.stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
        if let Some(reader) = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take() {
            reader.abort();
        }
        self.writer.abort();
        debug!(url = %self.shared.url, "Link dropped");
    }
}

/// Writer loop - runs in a spawned task.
///
/// Once the link is closed, a frame the connection has not accepted yet is
/// abandoned and the connection is dropped.
async fn writer_loop(
    mut sink: FrameSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<LinkShared>,
) {
    loop {
        let command = tokio::select! {
            biased;
            command = rx.recv() => command,
            _ = shared.abandon_writes.notified() => break,
        };

        match command {
            Some(Outbound::Frame(frame)) => {
                let len = frame.len();
                let result = tokio::select! {
                    biased;
                    result = sink.send(frame) => result,
                    _ = shared.abandon_writes.notified() => {
                        shared.buffered.fetch_sub(len, Ordering::SeqCst);
                        debug!(url = %shared.url, bytes = len, "Pending write abandoned on close");
                        break;
                    }
                };
                shared.buffered.fetch_sub(len, Ordering::SeqCst);
                if let Err(e) = result {
                    error!(url = %shared.url, error = %e, "Link write failed");
                    shared.fail();
                    break;
                }
            }
            Some(Outbound::Close) => {
                tokio::select! {
                    biased;
                    _ = sink.close() => {}
                    _ = shared.abandon_writes.notified() => {}
                }
                break;
            }
            None => break,
        }
    }
    debug!(url = %shared.url, "Writer loop ended");
}

/// Reader loop - runs in a spawned task.
///
/// Hands every frame to the handler, then reports `Closed` exactly once.
async fn reader_loop(mut stream: FrameStream, shared: Arc<LinkShared>) {
    loop {
        let next = tokio::select! {
            _ = shared.shutdown.notified() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(frame)) => shared.emit(LinkEvent::Frame(frame)),
            Some(Err(e)) => {
                warn!(url = %shared.url, error = %e, "Link read failed");
                break;
            }
            None => {
                info!(url = %shared.url, "Broker closed connection");
                break;
            }
        }
    }

    shared.open.store(false, Ordering::SeqCst);
    shared.emit(LinkEvent::Closed);
    debug!(url = %shared.url, "Reader loop ended");
}
