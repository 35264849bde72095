use std::sync::Weak;

use tracing::debug;

use super::OperationHandle;
use crate::channel::{BoundedChannel, Received};
use crate::error::SessionError;
use crate::options::ReplyOptions;
use crate::protocol::{OperationId, OutboundMessage, QueryData};
use crate::session::SessionInner;

/// A declared queryable.
#[derive(Debug)]
pub struct Queryable {
    handle: OperationHandle,
    key_expr: String,
    channel: Option<BoundedChannel<Query>>,
}

impl Queryable {
    pub(crate) fn new(
        handle: OperationHandle,
        key_expr: &str,
        channel: Option<BoundedChannel<Query>>,
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

    /// The query channel, for channel handlers.
    pub fn receiver(&self) -> Option<&BoundedChannel<Query>> {
        self.channel.as_ref()
    }

    /// Next incoming query. Always `Disconnected` for callback handlers.
    pub async fn recv(&self) -> Received<Query> {
        match &self.channel {
            Some(channel) => channel.receive().await,
            None => Received::Disconnected,
        }
    }

    pub async fn undeclare(&self) -> Result<(), SessionError> {
        self.handle.undeclare().await
    }
}

/// A query received by a queryable.
///
/// Answer with any number of `reply*` calls, then [`Query::finalize`].
/// Dropping an unfinalized query sends the final marker.
#[derive(Debug)]
pub struct Query {
    data: QueryData,
    session: Weak<SessionInner>,
    finalized: bool,
}

impl Query {
    pub(crate) fn new(data: QueryData, session: Weak<SessionInner>) -> Self {
        Self {
            data,
            session,
            finalized: false,
        }
    }

    /// Broker-assigned id, echoed on every reply.
    pub fn id(&self) -> OperationId {
        self.data.query_id
    }

    pub fn key_expr(&self) -> &str {
        &self.data.key_expr
    }

    pub fn parameters(&self) -> &str {
        &self.data.parameters
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.data.payload.as_deref()
    }

    pub fn encoding(&self) -> Option<&str> {
        self.data.encoding.as_deref()
    }

    pub fn attachment(&self) -> Option<&[u8]> {
        self.data.attachment.as_deref()
    }

    pub async fn reply(
        &self,
        key_expr: &str,
        payload: impl Into<Vec<u8>>,
        options: ReplyOptions,
    ) -> Result<(), SessionError> {
        self.send(OutboundMessage::ReplyOk {
            query_id: self.id(),
            key_expr: key_expr.to_string(),
            payload: payload.into(),
            encoding: options.encoding,
            attachment: options.attachment,
        })
        .await
    }

    /// Reply with a deletion of `key_expr`.
    pub async fn reply_del(&self, key_expr: &str, options: ReplyOptions) -> Result<(), SessionError> {
        self.send(OutboundMessage::ReplyDel {
            query_id: self.id(),
            key_expr: key_expr.to_string(),
            attachment: options.attachment,
        })
        .await
    }

    pub async fn reply_err(
        &self,
        payload: impl Into<Vec<u8>>,
        encoding: Option<String>,
    ) -> Result<(), SessionError> {
        self.send(OutboundMessage::ReplyErr {
            query_id: self.id(),
            payload: payload.into(),
            encoding,
        })
        .await
    }

    /// Tell the broker no more replies are coming.
    pub async fn finalize(mut self) -> Result<(), SessionError> {
        self.finalized = true;
        self.send(OutboundMessage::ReplyFinal { query_id: self.id() }).await
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::Closed)?;
        session.send(&message).await
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        if let Some(session) = self.session.upgrade() {
            let query_id = self.id();
            if let Err(e) = session.try_send(&OutboundMessage::ReplyFinal { query_id }) {
                debug!(query_id = %query_id, error = %e, "Final reply not sent");
            }
        }
    }
}
