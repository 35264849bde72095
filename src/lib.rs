//! Remote Pub/Sub - client session for a remote pub/sub broker
//!
//! Everything the application does (publish, subscribe, query, answer
//! queries, liveliness) travels as MessagePack envelopes over one WebSocket.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │  Publisher / Subscriber / Querier / Queryable / LivelinessToken
//!     ▼
//! Session ── OperationId → pending record (result sink)
//!     │
//!     ▼
//! Link ── one duplex connection, retrying open, write backpressure
//!     │
//!     ▼
//! Broker
//! ```
//!
//! | Layer       | Owns                                               |
//! |-------------|----------------------------------------------------|
//! | `link`      | The connection, its writer and reader tasks        |
//! | `session`   | Id allocation, the registry, inbound dispatch      |
//! | `handles`   | Nothing but an id and a weak session reference     |
//! | `channel`   | Bounded queues results are delivered into          |
//!
//! ## Features
//!
//! - `tls` - Enable `wss/` endpoints

pub mod cancel;
pub mod channel;
pub mod config;
pub mod error;
pub mod handles;
pub mod link;
pub mod options;
pub mod protocol;
pub mod sample;
pub mod session;

// Re-exports
pub use cancel::CancellationToken;
pub use channel::{BoundedChannel, ChannelState, OverflowPolicy, Received};
pub use config::{LinkConfig, SessionConfig};
pub use error::SessionError;
pub use handles::{
    Liveliness, LivelinessToken, MatchingListener, Publisher, Querier, Query, Queryable,
    Subscriber,
};
pub use link::{Connector, Link, LinkEvent, MemoryConnector, MemoryPeer, WebSocketConnector};
pub use options::{
    CongestionControl, ConsolidationMode, GetOptions, LivelinessGetOptions, Priority,
    PublisherOptions, PutOptions, QuerierOptions, QueryTarget, ReplyOptions,
};
pub use protocol::{InboundMessage, OperationId, OutboundMessage};
pub use sample::{MatchingStatus, Reply, ReplyError, Sample, SampleKind};
pub use session::{Handler, Session};
