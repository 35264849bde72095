use super::{OperationHandle, Subscriber};
use crate::channel::BoundedChannel;
use crate::error::SessionError;
use crate::options::LivelinessGetOptions;
use crate::protocol::{OperationId, OutboundMessage};
use crate::sample::{Reply, Sample};
use crate::session::registry::{OperationKind, RecordSink};
use crate::session::{Handler, Session};

/// Liveliness operations of a session. See [`Session::liveliness`].
#[derive(Debug, Clone, Copy)]
pub struct Liveliness<'a> {
    session: &'a Session,
}

impl<'a> Liveliness<'a> {
    pub(crate) fn new(session: &'a Session) -> Self {
        Self { session }
    }

    /// Announce presence on `key_expr` until the token is undeclared or dropped.
    pub async fn declare_token(&self, key_expr: &str) -> Result<LivelinessToken, SessionError> {
        let inner = self.session.inner();
        let key = key_expr.to_string();
        let id = inner
            .register(OperationKind::LivelinessToken, RecordSink::Bare, None, move |id| {
                OutboundMessage::DeclareLivelinessToken { id, key_expr: key }
            })
            .await?;
        Ok(LivelinessToken {
            handle: OperationHandle::new(id, inner),
            key_expr: key_expr.to_string(),
        })
    }

    /// Watch tokens appear (put samples) and disappear (delete samples).
    ///
    /// With `history`, tokens alive at declaration time are reported first.
    pub async fn declare_subscriber(
        &self,
        key_expr: &str,
        history: bool,
        handler: Handler<Sample>,
    ) -> Result<Subscriber, SessionError> {
        let inner = self.session.inner();
        let (sink, channel) = handler.into_sink();
        let key = key_expr.to_string();
        let id = inner
            .register(
                OperationKind::LivelinessSubscriber,
                RecordSink::Samples(sink),
                None,
                move |id| OutboundMessage::DeclareLivelinessSubscriber {
                    id,
                    key_expr: key,
                    history,
                },
            )
            .await?;
        Ok(Subscriber::new(OperationHandle::new(id, inner), key_expr, channel))
    }

    /// Query the tokens currently alive on `key_expr`.
    ///
    /// Replies stream into `handler` until the final marker arrives, the
    /// token in `options` fires, or the session closes.
    pub async fn get(
        &self,
        key_expr: &str,
        options: LivelinessGetOptions,
        handler: Handler<Reply>,
    ) -> Result<Option<BoundedChannel<Reply>>, SessionError> {
        let (sink, channel) = handler.into_sink();
        let key = key_expr.to_string();
        let timeout_ms = options.timeout.map(|t| t.as_millis() as u64);
        self.session
            .inner()
            .register(
                OperationKind::LivelinessGet,
                RecordSink::Replies(sink),
                options.cancellation.as_ref(),
                move |id| OutboundMessage::LivelinessGet {
                    id,
                    key_expr: key,
                    timeout_ms,
                },
            )
            .await?;
        Ok(channel)
    }
}

/// A declared liveliness token.
#[derive(Debug)]
pub struct LivelinessToken {
    handle: OperationHandle,
    key_expr: String,
}

impl LivelinessToken {
    pub fn id(&self) -> OperationId {
        self.handle.id()
    }

    pub fn key_expr(&self) -> &str {
        &self.key_expr
    }

    pub async fn undeclare(&self) -> Result<(), SessionError> {
        self.handle.undeclare().await
    }
}
