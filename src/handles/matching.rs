use std::sync::Arc;

use super::OperationHandle;
use crate::channel::{BoundedChannel, Received};
use crate::error::SessionError;
use crate::protocol::{OperationId, OutboundMessage};
use crate::sample::MatchingStatus;
use crate::session::registry::{OperationKind, RecordSink};
use crate::session::{Handler, SessionInner};

/// Matching-status updates for a publisher or querier.
#[derive(Debug)]
pub struct MatchingListener {
    handle: OperationHandle,
    channel: Option<BoundedChannel<MatchingStatus>>,
}

impl MatchingListener {
    pub(crate) async fn declare(
        session: &Arc<SessionInner>,
        source_id: OperationId,
        handler: Handler<MatchingStatus>,
    ) -> Result<Self, SessionError> {
        let (sink, channel) = handler.into_sink();
        let id = session
            .register(
                OperationKind::MatchingListener,
                RecordSink::Matching(sink),
                None,
                move |id| OutboundMessage::DeclareMatchingListener { id, source_id },
            )
            .await?;
        Ok(Self {
            handle: OperationHandle::new(id, session),
            channel,
        })
    }

    pub fn id(&self) -> OperationId {
        self.handle.id()
    }

    /// The status channel, for channel handlers.
    pub fn receiver(&self) -> Option<&BoundedChannel<MatchingStatus>> {
        self.channel.as_ref()
    }

    /// Next status update. Always `Disconnected` for callback handlers.
    pub async fn recv(&self) -> Received<MatchingStatus> {
        match &self.channel {
            Some(channel) => channel.receive().await,
            None => Received::Disconnected,
        }
    }

    pub async fn undeclare(&self) -> Result<(), SessionError> {
        self.handle.undeclare().await
    }
}
