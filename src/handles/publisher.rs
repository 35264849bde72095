use super::{MatchingListener, OperationHandle};
use crate::error::SessionError;
use crate::options::PublisherOptions;
use crate::protocol::{OperationId, OutboundMessage};
use crate::sample::MatchingStatus;
use crate::session::Handler;

/// A declared publisher.
///
/// Publications carry the publisher id instead of the key expression and QoS,
/// which the broker already knows from the declaration.
#[derive(Debug)]
pub struct Publisher {
    handle: OperationHandle,
    key_expr: String,
    options: PublisherOptions,
}

impl Publisher {
    pub(crate) fn new(handle: OperationHandle, key_expr: &str, options: PublisherOptions) -> Self {
        Self {
            handle,
            key_expr: key_expr.to_string(),
            options,
        }
    }

    pub fn id(&self) -> OperationId {
        self.handle.id()
    }

    pub fn key_expr(&self) -> &str {
        &self.key_expr
    }

    pub fn options(&self) -> &PublisherOptions {
        &self.options
    }

    /// # Errors
    /// `Closed` once undeclared or the session is gone.
    pub async fn put(
        &self,
        payload: impl Into<Vec<u8>>,
        attachment: Option<Vec<u8>>,
    ) -> Result<(), SessionError> {
        let session = self.handle.live_session()?;
        session
            .send(&OutboundMessage::PublisherPut {
                publisher_id: self.id(),
                payload: payload.into(),
                encoding: self.options.encoding.clone(),
                attachment,
            })
            .await
    }

    pub async fn delete(&self, attachment: Option<Vec<u8>>) -> Result<(), SessionError> {
        let session = self.handle.live_session()?;
        session
            .send(&OutboundMessage::PublisherDelete {
                publisher_id: self.id(),
                attachment,
            })
            .await
    }

    /// Watch whether any subscriber currently matches this publisher.
    pub async fn matching_listener(
        &self,
        handler: Handler<MatchingStatus>,
    ) -> Result<MatchingListener, SessionError> {
        let session = self.handle.live_session()?;
        MatchingListener::declare(&session, self.id(), handler).await
    }

    /// Idempotent.
    pub async fn undeclare(&self) -> Result<(), SessionError> {
        self.handle.undeclare().await
    }
}
