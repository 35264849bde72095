use super::OperationHandle;
use crate::channel::{BoundedChannel, Received};
use crate::error::SessionError;
use crate::protocol::OperationId;
use crate::sample::Sample;

/// A declared subscriber, plain or liveliness.
#[derive(Debug)]
pub struct Subscriber {
    handle: OperationHandle,
    key_expr: String,
    channel: Option<BoundedChannel<Sample>>,
}

impl Subscriber {
    pub(crate) fn new(
        handle: OperationHandle,
        key_expr: &str,
        channel: Option<BoundedChannel<Sample>>,
    ) -> Self {
        Self {
            handle,
            key_expr: key_expr.to_string(),
            channel,
        }
    }

    pub fn id(&self) -> OperationId {
        self.handle.id()
    }

    pub fn key_expr(&self) -> &str {
        &self.key_expr
    }

    /// The sample channel, for channel handlers.
    pub fn receiver(&self) -> Option<&BoundedChannel<Sample>> {
        self.channel.as_ref()
    }

    /// Next sample. Always `Disconnected` for callback handlers.
    pub async fn recv(&self) -> Received<Sample> {
        match &self.channel {
            Some(channel) => channel.receive().await,
            None => Received::Disconnected,
        }
    }

    /// Idempotent. The channel reports `Disconnected` after the queued samples.
    pub async fn undeclare(&self) -> Result<(), SessionError> {
        self.handle.undeclare().await
    }
}
