//! Broker Wire Protocol
//!
//! Single responsibility: encode and decode envelopes in the broker's
//! MessagePack wire format.
//!
//! # Wire Format
//!
//! Every WebSocket binary frame carries exactly one envelope, a msgpack map
//! tagged by `type`:
//!
//! ```text
//! {
//!     "type": "declare_subscriber",   // envelope kind
//!     "id": <u32>,                    // correlation id, where the kind has one
//!     ...                             // kind-specific fields
//! }
//! ```
//!
//! Payloads and attachments are msgpack binary and never interpreted here.
//! Optional fields are written as `nil`.
//!
//! ## Correlation fields (inbound)
//!
//! | Kind              | Field           | Lifecycle  |
//! |-------------------|-----------------|------------|
//! | `sample`          | `subscriber_id` | streaming  |
//! | `query`           | `queryable_id`  | streaming  |
//! | `reply`           | `request_id`    | streaming  |
//! | `reply_final`     | `request_id`    | terminal   |
//! | `matching_status` | `listener_id`   | streaming  |
//! | `undeclared`      | `id`            | terminal   |
//! | `error`           | `id` (optional) | -          |

use rmpv::decode::read_value;
use rmpv::encode::write_value;
use rmpv::Value;
use std::fmt;
use std::io::Cursor;

use crate::error::SessionError;
use crate::options::{
    ConsolidationMode, PublisherOptions, PutOptions, QuerierOptions, QueryTarget, WireCode,
};
use crate::sample::{Reply, ReplyError, Sample, SampleKind};

/// Correlation identifier of a live operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u32);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Query parameters as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryRequest {
    pub parameters: String,
    pub payload: Option<Vec<u8>>,
    pub encoding: Option<String>,
    pub attachment: Option<Vec<u8>>,
    pub target: QueryTarget,
    pub consolidation: ConsolidationMode,
    pub timeout_ms: Option<u64>,
}

/// A query delivered to a queryable.
///
/// `query_id` is allocated by the broker and echoed on every reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryData {
    pub query_id: OperationId,
    pub key_expr: String,
    pub parameters: String,
    pub payload: Option<Vec<u8>>,
    pub encoding: Option<String>,
    pub attachment: Option<Vec<u8>>,
}

impl Default for OperationId {
    fn default() -> Self {
        OperationId(0)
    }
}

// =============================================================================
// Outbound envelopes (client → broker)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    DeclarePublisher { id: OperationId, key_expr: String, options: PublisherOptions },
    UndeclarePublisher { id: OperationId },
    DeclareSubscriber { id: OperationId, key_expr: String },
    UndeclareSubscriber { id: OperationId },
    DeclareQueryable { id: OperationId, key_expr: String, complete: bool },
    UndeclareQueryable { id: OperationId },
    DeclareQuerier { id: OperationId, key_expr: String, options: QuerierOptions },
    UndeclareQuerier { id: OperationId },
    DeclareLivelinessToken { id: OperationId, key_expr: String },
    UndeclareLivelinessToken { id: OperationId },
    DeclareLivelinessSubscriber { id: OperationId, key_expr: String, history: bool },
    UndeclareLivelinessSubscriber { id: OperationId },
    DeclareMatchingListener { id: OperationId, source_id: OperationId },
    UndeclareMatchingListener { id: OperationId },
    Put { key_expr: String, payload: Vec<u8>, options: PutOptions },
    Delete { key_expr: String, options: PutOptions },
    PublisherPut {
        publisher_id: OperationId,
        payload: Vec<u8>,
        encoding: Option<String>,
        attachment: Option<Vec<u8>>,
    },
    PublisherDelete { publisher_id: OperationId, attachment: Option<Vec<u8>> },
    Get { id: OperationId, key_expr: String, request: QueryRequest },
    QuerierGet { id: OperationId, querier_id: OperationId, request: QueryRequest },
    LivelinessGet { id: OperationId, key_expr: String, timeout_ms: Option<u64> },
    ReplyOk {
        query_id: OperationId,
        key_expr: String,
        payload: Vec<u8>,
        encoding: Option<String>,
        attachment: Option<Vec<u8>>,
    },
    ReplyDel { query_id: OperationId, key_expr: String, attachment: Option<Vec<u8>> },
    ReplyErr { query_id: OperationId, payload: Vec<u8>, encoding: Option<String> },
    ReplyFinal { query_id: OperationId },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::DeclarePublisher { .. } => "declare_publisher",
            OutboundMessage::UndeclarePublisher { .. } => "undeclare_publisher",
            OutboundMessage::DeclareSubscriber { .. } => "declare_subscriber",
            OutboundMessage::UndeclareSubscriber { .. } => "undeclare_subscriber",
            OutboundMessage::DeclareQueryable { .. } => "declare_queryable",
            OutboundMessage::UndeclareQueryable { .. } => "undeclare_queryable",
            OutboundMessage::DeclareQuerier { .. } => "declare_querier",
            OutboundMessage::UndeclareQuerier { .. } => "undeclare_querier",
            OutboundMessage::DeclareLivelinessToken { .. } => "declare_liveliness_token",
            OutboundMessage::UndeclareLivelinessToken { .. } => "undeclare_liveliness_token",
            OutboundMessage::DeclareLivelinessSubscriber { .. } => "declare_liveliness_subscriber",
            OutboundMessage::UndeclareLivelinessSubscriber { .. } => {
                "undeclare_liveliness_subscriber"
            }
            OutboundMessage::DeclareMatchingListener { .. } => "declare_matching_listener",
            OutboundMessage::UndeclareMatchingListener { .. } => "undeclare_matching_listener",
            OutboundMessage::Put { .. } => "put",
            OutboundMessage::Delete { .. } => "delete",
            OutboundMessage::PublisherPut { .. } => "publisher_put",
            OutboundMessage::PublisherDelete { .. } => "publisher_delete",
            OutboundMessage::Get { .. } => "get",
            OutboundMessage::QuerierGet { .. } => "querier_get",
            OutboundMessage::LivelinessGet { .. } => "liveliness_get",
            OutboundMessage::ReplyOk { .. } => "reply_ok",
            OutboundMessage::ReplyDel { .. } => "reply_del",
            OutboundMessage::ReplyErr { .. } => "reply_err",
            OutboundMessage::ReplyFinal { .. } => "reply_final",
        }
    }

    /// Encode into one frame.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        let env = Envelope::new(self.kind());
        let env = match self {
            OutboundMessage::DeclarePublisher { id, key_expr, options } => env
                .id("id", *id)
                .str("key_expr", key_expr)
                .opt_str("encoding", options.encoding.as_deref())
                .uint("congestion_control", options.congestion_control.code())
                .uint("priority", options.priority.code())
                .flag("express", options.express),
            OutboundMessage::DeclareSubscriber { id, key_expr }
            | OutboundMessage::DeclareLivelinessToken { id, key_expr } => {
                env.id("id", *id).str("key_expr", key_expr)
            }
            OutboundMessage::DeclareQueryable { id, key_expr, complete } => env
                .id("id", *id)
                .str("key_expr", key_expr)
                .flag("complete", *complete),
            OutboundMessage::DeclareQuerier { id, key_expr, options } => env
                .id("id", *id)
                .str("key_expr", key_expr)
                .uint("target", options.target.code())
                .uint("consolidation", options.consolidation.code())
                .opt_uint("timeout_ms", options.timeout.map(|t| t.as_millis() as u64)),
            OutboundMessage::DeclareLivelinessSubscriber { id, key_expr, history } => env
                .id("id", *id)
                .str("key_expr", key_expr)
                .flag("history", *history),
            OutboundMessage::DeclareMatchingListener { id, source_id } => {
                env.id("id", *id).id("source_id", *source_id)
            }
            OutboundMessage::UndeclarePublisher { id }
            | OutboundMessage::UndeclareSubscriber { id }
            | OutboundMessage::UndeclareQueryable { id }
            | OutboundMessage::UndeclareQuerier { id }
            | OutboundMessage::UndeclareLivelinessToken { id }
            | OutboundMessage::UndeclareLivelinessSubscriber { id }
            | OutboundMessage::UndeclareMatchingListener { id } => env.id("id", *id),
            OutboundMessage::Put { key_expr, payload, options } => env
                .str("key_expr", key_expr)
                .bytes("payload", payload)
                .put_options(options),
            OutboundMessage::Delete { key_expr, options } => {
                env.str("key_expr", key_expr).put_options(options)
            }
            OutboundMessage::PublisherPut { publisher_id, payload, encoding, attachment } => env
                .id("publisher_id", *publisher_id)
                .bytes("payload", payload)
                .opt_str("encoding", encoding.as_deref())
                .opt_bytes("attachment", attachment.as_deref()),
            OutboundMessage::PublisherDelete { publisher_id, attachment } => env
                .id("publisher_id", *publisher_id)
                .opt_bytes("attachment", attachment.as_deref()),
            OutboundMessage::Get { id, key_expr, request } => env
                .id("id", *id)
                .str("key_expr", key_expr)
                .query_request(request),
            OutboundMessage::QuerierGet { id, querier_id, request } => env
                .id("id", *id)
                .id("querier_id", *querier_id)
                .query_request(request),
            OutboundMessage::LivelinessGet { id, key_expr, timeout_ms } => env
                .id("id", *id)
                .str("key_expr", key_expr)
                .opt_uint("timeout_ms", *timeout_ms),
            OutboundMessage::ReplyOk { query_id, key_expr, payload, encoding, attachment } => env
                .id("query_id", *query_id)
                .str("key_expr", key_expr)
                .bytes("payload", payload)
                .opt_str("encoding", encoding.as_deref())
                .opt_bytes("attachment", attachment.as_deref()),
            OutboundMessage::ReplyDel { query_id, key_expr, attachment } => env
                .id("query_id", *query_id)
                .str("key_expr", key_expr)
                .opt_bytes("attachment", attachment.as_deref()),
            OutboundMessage::ReplyErr { query_id, payload, encoding } => env
                .id("query_id", *query_id)
                .bytes("payload", payload)
                .opt_str("encoding", encoding.as_deref()),
            OutboundMessage::ReplyFinal { query_id } => env.id("query_id", *query_id),
        };
        env.encode()
    }

    /// Decode a frame written by [`OutboundMessage::encode`].
    ///
    /// The client never needs this; it exists for broker-side peers.
    pub fn decode(data: &[u8]) -> Result<Self, SessionError> {
        let value = read_frame(data).map_err(SessionError::Protocol)?;
        let f = Fields::of(&value).ok_or_else(|| SessionError::Protocol("Envelope is not a map".into()))?;
        let kind = f.kind().map_err(SessionError::Protocol)?;
        Self::decode_fields(kind, &f).map_err(SessionError::Protocol)
    }

    fn decode_fields(kind: &str, f: &Fields<'_>) -> Result<Self, String> {
        let message = match kind {
            "declare_publisher" => OutboundMessage::DeclarePublisher {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
                options: PublisherOptions {
                    encoding: f.opt_string("encoding")?,
                    congestion_control: f.code("congestion_control")?,
                    priority: f.code("priority")?,
                    express: f.flag("express")?,
                },
            },
            "undeclare_publisher" => OutboundMessage::UndeclarePublisher { id: f.id("id")? },
            "declare_subscriber" => OutboundMessage::DeclareSubscriber {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
            },
            "undeclare_subscriber" => OutboundMessage::UndeclareSubscriber { id: f.id("id")? },
            "declare_queryable" => OutboundMessage::DeclareQueryable {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
                complete: f.flag("complete")?,
            },
            "undeclare_queryable" => OutboundMessage::UndeclareQueryable { id: f.id("id")? },
            "declare_querier" => OutboundMessage::DeclareQuerier {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
                options: QuerierOptions {
                    target: f.code("target")?,
                    consolidation: f.code("consolidation")?,
                    timeout: f.opt_uint("timeout_ms")?.map(std::time::Duration::from_millis),
                },
            },
            "undeclare_querier" => OutboundMessage::UndeclareQuerier { id: f.id("id")? },
            "declare_liveliness_token" => OutboundMessage::DeclareLivelinessToken {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
            },
            "undeclare_liveliness_token" => {
                OutboundMessage::UndeclareLivelinessToken { id: f.id("id")? }
            }
            "declare_liveliness_subscriber" => OutboundMessage::DeclareLivelinessSubscriber {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
                history: f.flag("history")?,
            },
            "undeclare_liveliness_subscriber" => {
                OutboundMessage::UndeclareLivelinessSubscriber { id: f.id("id")? }
            }
            "declare_matching_listener" => OutboundMessage::DeclareMatchingListener {
                id: f.id("id")?,
                source_id: f.id("source_id")?,
            },
            "undeclare_matching_listener" => {
                OutboundMessage::UndeclareMatchingListener { id: f.id("id")? }
            }
            "put" => OutboundMessage::Put {
                key_expr: f.string("key_expr")?,
                payload: f.bytes("payload")?,
                options: f.put_options()?,
            },
            "delete" => OutboundMessage::Delete {
                key_expr: f.string("key_expr")?,
                options: f.put_options()?,
            },
            "publisher_put" => OutboundMessage::PublisherPut {
                publisher_id: f.id("publisher_id")?,
                payload: f.bytes("payload")?,
                encoding: f.opt_string("encoding")?,
                attachment: f.opt_bytes("attachment")?,
            },
            "publisher_delete" => OutboundMessage::PublisherDelete {
                publisher_id: f.id("publisher_id")?,
                attachment: f.opt_bytes("attachment")?,
            },
            "get" => OutboundMessage::Get {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
                request: f.query_request()?,
            },
            "querier_get" => OutboundMessage::QuerierGet {
                id: f.id("id")?,
                querier_id: f.id("querier_id")?,
                request: f.query_request()?,
            },
            "liveliness_get" => OutboundMessage::LivelinessGet {
                id: f.id("id")?,
                key_expr: f.string("key_expr")?,
                timeout_ms: f.opt_uint("timeout_ms")?,
            },
            "reply_ok" => OutboundMessage::ReplyOk {
                query_id: f.id("query_id")?,
                key_expr: f.string("key_expr")?,
                payload: f.bytes("payload")?,
                encoding: f.opt_string("encoding")?,
                attachment: f.opt_bytes("attachment")?,
            },
            "reply_del" => OutboundMessage::ReplyDel {
                query_id: f.id("query_id")?,
                key_expr: f.string("key_expr")?,
                attachment: f.opt_bytes("attachment")?,
            },
            "reply_err" => OutboundMessage::ReplyErr {
                query_id: f.id("query_id")?,
                payload: f.bytes("payload")?,
                encoding: f.opt_string("encoding")?,
            },
            "reply_final" => OutboundMessage::ReplyFinal { query_id: f.id("query_id")? },
            other => return Err(format!("Unknown outbound type: {}", other)),
        };
        Ok(message)
    }
}

// =============================================================================
// Inbound envelopes (broker → client)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Sample { subscriber_id: OperationId, sample: Sample },
    Query { queryable_id: OperationId, query: QueryData },
    Reply { request_id: OperationId, reply: Reply },
    ReplyFinal { request_id: OperationId },
    MatchingStatus { listener_id: OperationId, matching: bool },
    /// The broker tore the operation down, or acknowledged our undeclare.
    Undeclared { id: OperationId },
    Error { id: Option<OperationId>, message: String },
}

/// An inbound frame that could not be decoded.
///
/// `correlation` is set when the frame was readable enough to tell which
/// operation it was meant for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    pub correlation: Option<OperationId>,
    pub reason: String,
}

impl DecodeError {
    fn uncorrelated(reason: impl Into<String>) -> Self {
        Self {
            correlation: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.correlation {
            Some(id) => write!(f, "malformed envelope for {}: {}", id, self.reason),
            None => write!(f, "malformed envelope: {}", self.reason),
        }
    }
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Sample { .. } => "sample",
            InboundMessage::Query { .. } => "query",
            InboundMessage::Reply { .. } => "reply",
            InboundMessage::ReplyFinal { .. } => "reply_final",
            InboundMessage::MatchingStatus { .. } => "matching_status",
            InboundMessage::Undeclared { .. } => "undeclared",
            InboundMessage::Error { .. } => "error",
        }
    }

    /// The operation this envelope is addressed to.
    pub fn correlation(&self) -> Option<OperationId> {
        match self {
            InboundMessage::Sample { subscriber_id, .. } => Some(*subscriber_id),
            InboundMessage::Query { queryable_id, .. } => Some(*queryable_id),
            InboundMessage::Reply { request_id, .. }
            | InboundMessage::ReplyFinal { request_id } => Some(*request_id),
            InboundMessage::MatchingStatus { listener_id, .. } => Some(*listener_id),
            InboundMessage::Undeclared { id } => Some(*id),
            InboundMessage::Error { id, .. } => *id,
        }
    }

    /// Terminal envelopes end the operation they are addressed to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InboundMessage::ReplyFinal { .. } | InboundMessage::Undeclared { .. }
        )
    }

    fn correlation_field(kind: &str) -> Option<&'static str> {
        match kind {
            "sample" => Some("subscriber_id"),
            "query" => Some("queryable_id"),
            "reply" | "reply_final" => Some("request_id"),
            "matching_status" => Some("listener_id"),
            "undeclared" | "error" => Some("id"),
            _ => None,
        }
    }

    /// Decode one inbound frame.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let value = read_frame(data).map_err(DecodeError::uncorrelated)?;
        let f = Fields::of(&value).ok_or_else(|| DecodeError::uncorrelated("Envelope is not a map"))?;
        let kind = f.kind().map_err(DecodeError::uncorrelated)?;
        let field = Self::correlation_field(kind)
            .ok_or_else(|| DecodeError::uncorrelated(format!("Unknown inbound type: {}", kind)))?;
        let correlation = f.id(field).ok();

        Self::decode_fields(kind, &f).map_err(|reason| DecodeError { correlation, reason })
    }

    fn decode_fields(kind: &str, f: &Fields<'_>) -> Result<Self, String> {
        let message = match kind {
            "sample" => InboundMessage::Sample {
                subscriber_id: f.id("subscriber_id")?,
                sample: f.nested("sample")?.sample()?,
            },
            "query" => InboundMessage::Query {
                queryable_id: f.id("queryable_id")?,
                query: QueryData {
                    query_id: f.id("query_id")?,
                    key_expr: f.string("key_expr")?,
                    parameters: f.string("parameters")?,
                    payload: f.opt_bytes("payload")?,
                    encoding: f.opt_string("encoding")?,
                    attachment: f.opt_bytes("attachment")?,
                },
            },
            "reply" => {
                let reply = match f.string("result")?.as_str() {
                    "ok" => Reply::Ok(f.nested("sample")?.sample()?),
                    "err" => {
                        let e = f.nested("error")?;
                        Reply::Err(ReplyError {
                            payload: e.bytes("payload")?,
                            encoding: e.opt_string("encoding")?,
                        })
                    }
                    other => return Err(format!("Unknown reply result: {}", other)),
                };
                InboundMessage::Reply {
                    request_id: f.id("request_id")?,
                    reply,
                }
            }
            "reply_final" => InboundMessage::ReplyFinal {
                request_id: f.id("request_id")?,
            },
            "matching_status" => InboundMessage::MatchingStatus {
                listener_id: f.id("listener_id")?,
                matching: f.flag("matching")?,
            },
            "undeclared" => InboundMessage::Undeclared { id: f.id("id")? },
            "error" => InboundMessage::Error {
                id: match f.present("id") {
                    Some(_) => Some(f.id("id")?),
                    None => None,
                },
                message: f.string("message")?,
            },
            other => return Err(format!("Unknown inbound type: {}", other)),
        };
        Ok(message)
    }

    /// Encode into one frame. Used by broker-side peers.
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        let env = Envelope::new(self.kind());
        let env = match self {
            InboundMessage::Sample { subscriber_id, sample } => env
                .id("subscriber_id", *subscriber_id)
                .field("sample", Envelope::sample(sample)),
            InboundMessage::Query { queryable_id, query } => env
                .id("queryable_id", *queryable_id)
                .id("query_id", query.query_id)
                .str("key_expr", &query.key_expr)
                .str("parameters", &query.parameters)
                .opt_bytes("payload", query.payload.as_deref())
                .opt_str("encoding", query.encoding.as_deref())
                .opt_bytes("attachment", query.attachment.as_deref()),
            InboundMessage::Reply { request_id, reply } => {
                let env = env.id("request_id", *request_id);
                match reply {
                    Reply::Ok(sample) => env
                        .str("result", "ok")
                        .field("sample", Envelope::sample(sample)),
                    Reply::Err(err) => env.str("result", "err").field(
                        "error",
                        Envelope::map()
                            .bytes("payload", &err.payload)
                            .opt_str("encoding", err.encoding.as_deref())
                            .into_value(),
                    ),
                }
            }
            InboundMessage::ReplyFinal { request_id } => env.id("request_id", *request_id),
            InboundMessage::MatchingStatus { listener_id, matching } => env
                .id("listener_id", *listener_id)
                .flag("matching", *matching),
            InboundMessage::Undeclared { id } => env.id("id", *id),
            InboundMessage::Error { id, message } => {
                let env = match id {
                    Some(id) => env.id("id", *id),
                    None => env,
                };
                env.str("message", message)
            }
        };
        env.encode()
    }
}

// =============================================================================
// Envelope building and field extraction
// =============================================================================

fn read_frame(data: &[u8]) -> Result<Value, String> {
    let mut cursor = Cursor::new(data);
    read_value(&mut cursor).map_err(|e| format!("Failed to decode envelope: {}", e))
}

struct Envelope {
    fields: Vec<(Value, Value)>,
}

impl Envelope {
    fn new(kind: &str) -> Self {
        Self::map().str("type", kind)
    }

    fn map() -> Self {
        Self { fields: Vec::new() }
    }

    fn field(mut self, key: &str, value: Value) -> Self {
        self.fields.push((Value::from(key), value));
        self
    }

    fn id(self, key: &str, id: OperationId) -> Self {
        self.field(key, Value::from(id.0))
    }

    fn str(self, key: &str, value: &str) -> Self {
        self.field(key, Value::from(value))
    }

    fn opt_str(self, key: &str, value: Option<&str>) -> Self {
        self.field(key, value.map(Value::from).unwrap_or(Value::Nil))
    }

    fn bytes(self, key: &str, value: &[u8]) -> Self {
        self.field(key, Value::Binary(value.to_vec()))
    }

    fn opt_bytes(self, key: &str, value: Option<&[u8]>) -> Self {
        self.field(
            key,
            value.map(|v| Value::Binary(v.to_vec())).unwrap_or(Value::Nil),
        )
    }

    fn flag(self, key: &str, value: bool) -> Self {
        self.field(key, Value::Boolean(value))
    }

    fn uint(self, key: &str, value: u64) -> Self {
        self.field(key, Value::from(value))
    }

    fn opt_uint(self, key: &str, value: Option<u64>) -> Self {
        self.field(key, value.map(Value::from).unwrap_or(Value::Nil))
    }

    fn put_options(self, options: &PutOptions) -> Self {
        self.opt_str("encoding", options.encoding.as_deref())
            .opt_bytes("attachment", options.attachment.as_deref())
            .uint("congestion_control", options.congestion_control.code())
            .uint("priority", options.priority.code())
            .flag("express", options.express)
    }

    fn query_request(self, request: &QueryRequest) -> Self {
        self.str("parameters", &request.parameters)
            .opt_bytes("payload", request.payload.as_deref())
            .opt_str("encoding", request.encoding.as_deref())
            .opt_bytes("attachment", request.attachment.as_deref())
            .uint("target", request.target.code())
            .uint("consolidation", request.consolidation.code())
            .opt_uint("timeout_ms", request.timeout_ms)
    }

    fn sample(sample: &Sample) -> Value {
        Self::map()
            .str("key_expr", &sample.key_expr)
            .bytes("payload", &sample.payload)
            .str("kind", sample.kind.as_str())
            .opt_str("encoding", sample.encoding.as_deref())
            .opt_bytes("attachment", sample.attachment.as_deref())
            .opt_str("timestamp", sample.timestamp.as_deref())
            .into_value()
    }

    fn into_value(self) -> Value {
        Value::Map(self.fields)
    }

    fn encode(self) -> Result<Vec<u8>, SessionError> {
        let mut bytes = Vec::new();
        write_value(&mut bytes, &self.into_value())
            .map_err(|e| SessionError::Protocol(format!("Failed to encode envelope: {}", e)))?;
        Ok(bytes)
    }
}

struct Fields<'a>(&'a [(Value, Value)]);

impl<'a> Fields<'a> {
    fn of(value: &'a Value) -> Option<Self> {
        value.as_map().map(|map| Fields(map.as_slice()))
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.0
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    /// The field, unless absent or nil.
    fn present(&self, key: &str) -> Option<&'a Value> {
        self.get(key).filter(|v| !v.is_nil())
    }

    fn kind(&self) -> Result<&'a str, String> {
        self.get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "Envelope missing 'type' field".to_string())
    }

    fn id(&self, key: &str) -> Result<OperationId, String> {
        self.get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .map(OperationId)
            .ok_or_else(|| format!("Missing or invalid '{}' field", key))
    }

    fn string(&self, key: &str) -> Result<String, String> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("Missing or invalid '{}' field", key))
    }

    fn opt_string(&self, key: &str) -> Result<Option<String>, String> {
        match self.present(key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| format!("Invalid '{}' field", key)),
        }
    }

    fn bytes(&self, key: &str) -> Result<Vec<u8>, String> {
        match self.get(key) {
            Some(Value::Binary(b)) => Ok(b.clone()),
            _ => Err(format!("Missing or invalid '{}' field", key)),
        }
    }

    fn opt_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        match self.present(key) {
            None => Ok(None),
            Some(Value::Binary(b)) => Ok(Some(b.clone())),
            Some(_) => Err(format!("Invalid '{}' field", key)),
        }
    }

    fn flag(&self, key: &str) -> Result<bool, String> {
        self.get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| format!("Missing or invalid '{}' field", key))
    }

    fn opt_uint(&self, key: &str) -> Result<Option<u64>, String> {
        match self.present(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| format!("Invalid '{}' field", key)),
        }
    }

    fn code<T: WireCode>(&self, key: &str) -> Result<T, String> {
        self.get(key)
            .and_then(Value::as_u64)
            .and_then(T::from_code)
            .ok_or_else(|| format!("Missing or invalid '{}' field", key))
    }

    fn nested(&self, key: &str) -> Result<Fields<'a>, String> {
        self.get(key)
            .and_then(Fields::of)
            .ok_or_else(|| format!("Missing or invalid '{}' field", key))
    }

    fn sample(&self) -> Result<Sample, String> {
        let kind = self.string("kind")?;
        Ok(Sample {
            key_expr: self.string("key_expr")?,
            payload: self.bytes("payload")?,
            kind: SampleKind::parse(&kind).ok_or_else(|| format!("Unknown sample kind: {}", kind))?,
            encoding: self.opt_string("encoding")?,
            attachment: self.opt_bytes("attachment")?,
            timestamp: self.opt_string("timestamp")?,
        })
    }

    fn put_options(&self) -> Result<PutOptions, String> {
        Ok(PutOptions {
            encoding: self.opt_string("encoding")?,
            attachment: self.opt_bytes("attachment")?,
            congestion_control: self.code("congestion_control")?,
            priority: self.code("priority")?,
            express: self.flag("express")?,
        })
    }

    fn query_request(&self) -> Result<QueryRequest, String> {
        Ok(QueryRequest {
            parameters: self.string("parameters")?,
            payload: self.opt_bytes("payload")?,
            encoding: self.opt_string("encoding")?,
            attachment: self.opt_bytes("attachment")?,
            target: self.code("target")?,
            consolidation: self.code("consolidation")?,
            timeout_ms: self.opt_uint("timeout_ms")?,
        })
    }
}
