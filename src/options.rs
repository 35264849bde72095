//! Quality-of-service knobs and per-operation options
//!
//! These only travel to the broker; nothing in the session interprets them.

use std::time::Duration;

use crate::cancel::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CongestionControl {
    #[default]
    Drop,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    RealTime = 1,
    InteractiveHigh = 2,
    InteractiveLow = 3,
    DataHigh = 4,
    #[default]
    Data = 5,
    DataLow = 6,
    Background = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryTarget {
    #[default]
    BestMatching,
    All,
    AllComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsolidationMode {
    #[default]
    Auto,
    None,
    Monotonic,
    Latest,
}

/// Wire codes for the enums above.
pub(crate) trait WireCode: Sized + Copy + 'static {
    const ALL: &'static [Self];

    fn code(self) -> u64;

    fn from_code(code: u64) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.code() == code)
    }
}

impl WireCode for CongestionControl {
    const ALL: &'static [Self] = &[CongestionControl::Drop, CongestionControl::Block];

    fn code(self) -> u64 {
        self as u64
    }
}

impl WireCode for Priority {
    const ALL: &'static [Self] = &[
        Priority::RealTime,
        Priority::InteractiveHigh,
        Priority::InteractiveLow,
        Priority::DataHigh,
        Priority::Data,
        Priority::DataLow,
        Priority::Background,
    ];

    fn code(self) -> u64 {
        self as u64
    }
}

impl WireCode for QueryTarget {
    const ALL: &'static [Self] = &[QueryTarget::BestMatching, QueryTarget::All, QueryTarget::AllComplete];

    fn code(self) -> u64 {
        self as u64
    }
}

impl WireCode for ConsolidationMode {
    const ALL: &'static [Self] = &[
        ConsolidationMode::Auto,
        ConsolidationMode::None,
        ConsolidationMode::Monotonic,
        ConsolidationMode::Latest,
    ];

    fn code(self) -> u64 {
        self as u64
    }
}

/// Options for `put`/`delete`, on the session or a publisher.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PutOptions {
    pub encoding: Option<String>,
    pub attachment: Option<Vec<u8>>,
    pub congestion_control: CongestionControl,
    pub priority: Priority,
    pub express: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublisherOptions {
    pub encoding: Option<String>,
    pub congestion_control: CongestionControl,
    pub priority: Priority,
    pub express: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuerierOptions {
    pub target: QueryTarget,
    pub consolidation: ConsolidationMode,
    /// Broker-side timeout for each query
    pub timeout: Option<Duration>,
}

/// Options for one query, issued from the session or a querier.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub parameters: String,
    pub payload: Option<Vec<u8>>,
    pub encoding: Option<String>,
    pub attachment: Option<Vec<u8>>,
    pub target: QueryTarget,
    pub consolidation: ConsolidationMode,
    /// Broker-side timeout
    pub timeout: Option<Duration>,
    /// Stops local delivery when cancelled. The broker is not told.
    pub cancellation: Option<CancellationToken>,
}

impl GetOptions {
    pub fn with_parameters(parameters: impl Into<String>) -> Self {
        Self {
            parameters: parameters.into(),
            ..Default::default()
        }
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Options for a liveliness query.
#[derive(Debug, Clone, Default)]
pub struct LivelinessGetOptions {
    /// Broker-side timeout
    pub timeout: Option<Duration>,
    /// Stops local delivery when cancelled. The broker is not told.
    pub cancellation: Option<CancellationToken>,
}

impl LivelinessGetOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Options attached to a queryable's answer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReplyOptions {
    pub encoding: Option<String>,
    pub attachment: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_wire_code_is_rejected() {
        assert_eq!(Priority::from_code(2), Some(Priority::InteractiveHigh));
        assert_eq!(Priority::from_code(0), None);
        assert_eq!(ConsolidationMode::from_code(3), Some(ConsolidationMode::Latest));
        assert_eq!(QueryTarget::from_code(9), None);
    }
}
