//! Values delivered to the application

/// Whether a sample carries a value or marks its removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleKind {
    #[default]
    Put,
    Delete,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SampleKind::Put => "put",
            SampleKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "put" => Some(SampleKind::Put),
            "delete" => Some(SampleKind::Delete),
            _ => None,
        }
    }
}

/// A publication observed by a subscriber, or returned in a reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sample {
    pub key_expr: String,
    pub payload: Vec<u8>,
    pub kind: SampleKind,
    pub encoding: Option<String>,
    pub attachment: Option<Vec<u8>>,
    pub timestamp: Option<String>,
}

impl Sample {
    pub fn put(key_expr: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key_expr: key_expr.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn delete(key_expr: impl Into<String>) -> Self {
        Self {
            key_expr: key_expr.into(),
            kind: SampleKind::Delete,
            ..Default::default()
        }
    }

    /// Payload as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Error answer from a queryable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyError {
    pub payload: Vec<u8>,
    pub encoding: Option<String>,
}

/// One answer to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Sample),
    Err(ReplyError),
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn into_result(self) -> Result<Sample, ReplyError> {
        match self {
            Reply::Ok(sample) => Ok(sample),
            Reply::Err(err) => Err(err),
        }
    }
}

/// Whether any remote entity currently matches a publisher or querier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchingStatus {
    pub matching: bool,
}
