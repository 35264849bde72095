use super::{MatchingListener, OperationHandle};
use crate::channel::BoundedChannel;
use crate::error::SessionError;
use crate::options::{GetOptions, QuerierOptions};
use crate::protocol::{OperationId, OutboundMessage, QueryRequest};
use crate::sample::{MatchingStatus, Reply};
use crate::session::registry::{OperationKind, RecordSink};
use crate::session::Handler;

/// A declared querier: repeated queries on one key expression with fixed
/// target, consolidation and timeout.
#[derive(Debug)]
pub struct Querier {
    handle: OperationHandle,
    key_expr: String,
    options: QuerierOptions,
}

impl Querier {
    pub(crate) fn new(handle: OperationHandle, key_expr: &str, options: QuerierOptions) -> Self {
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

    /// Issue one query.
    ///
    /// Target, consolidation and timeout come from the querier; those fields
    /// of `options` are ignored.
    pub async fn get(
        &self,
        options: GetOptions,
        handler: Handler<Reply>,
    ) -> Result<Option<BoundedChannel<Reply>>, SessionError> {
        let session = self.handle.live_session()?;
        let (sink, channel) = handler.into_sink();
        let querier_id = self.id();
        let cancellation = options.cancellation.clone();
        let request = QueryRequest {
            parameters: options.parameters,
            payload: options.payload,
            encoding: options.encoding,
            attachment: options.attachment,
            target: self.options.target,
            consolidation: self.options.consolidation,
            timeout_ms: self.options.timeout.map(|t| t.as_millis() as u64),
        };

        session
            .register(
                OperationKind::QuerierGet,
                RecordSink::Replies(sink),
                cancellation.as_ref(),
                move |id| OutboundMessage::QuerierGet {
                    id,
                    querier_id,
                    request,
                },
            )
            .await?;
        Ok(channel)
    }

    /// Watch whether any queryable currently matches this querier.
    pub async fn matching_listener(
        &self,
        handler: Handler<MatchingStatus>,
    ) -> Result<MatchingListener, SessionError> {
        let session = self.handle.live_session()?;
        MatchingListener::declare(&session, self.id(), handler).await
    }

    pub async fn undeclare(&self) -> Result<(), SessionError> {
        self.handle.undeclare().await
    }
}
