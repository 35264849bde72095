//! Operation handles
//!
//! Handles returned by declarations. A handle holds only the operation id and
//! a weak reference to the session; the session owns the record.
//!
//! Dropping a handle that was not undeclared removes its record and queues
//! the undeclare envelope without waiting on backpressure.

mod liveliness;
mod matching;
mod publisher;
mod querier;
mod queryable;
mod subscriber;

pub use liveliness::{Liveliness, LivelinessToken};
pub use matching::MatchingListener;
pub use publisher::Publisher;
pub use querier::Querier;
pub use queryable::{Query, Queryable};
pub use subscriber::Subscriber;

use std::sync::{Arc, Weak};

use crate::error::SessionError;
use crate::protocol::OperationId;
use crate::session::SessionInner;

pub(crate) struct OperationHandle {
    id: OperationId,
    session: Weak<SessionInner>,
}

impl OperationHandle {
    pub(crate) fn new(id: OperationId, session: &Arc<SessionInner>) -> Self {
        Self {
            id,
            session: Arc::downgrade(session),
        }
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    /// The session, as long as this operation is still declared on it.
    pub(crate) fn live_session(&self) -> Result<Arc<SessionInner>, SessionError> {
        let session = self.session.upgrade().ok_or(SessionError::Closed)?;
        if !session.is_live(self.id) {
            return Err(SessionError::Closed);
        }
        Ok(session)
    }

    pub(crate) async fn undeclare(&self) -> Result<(), SessionError> {
        match self.session.upgrade() {
            Some(session) => session.undeclare(self.id).await,
            None => Ok(()),
        }
    }
}

impl Drop for OperationHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.upgrade() {
            session.undeclare_detached(self.id);
        }
    }
}

impl std::fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperationHandle({})", self.id)
    }
}
