// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Identifies which component generated a log message.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Proxy instance event loop, upstream propagation
    Proxy = 0,
    /// Per-interface querier state machine
    Querier = 1,
    /// Timer scheduling and delivery
    Timing = 2,
    /// Router-group joins/leaves and query transmission
    Sender = 3,
    /// Downstream membership aggregation
    Aggregation = 4,
    /// Configuration loading and validation
    Config = 5,
    /// Test harness and fixtures
    Test = 6,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Proxy => "Proxy",
            Facility::Querier => "Querier",
            Facility::Timing => "Timing",
            Facility::Sender => "Sender",
            Facility::Aggregation => "Aggregation",
            Facility::Config => "Config",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid).
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Proxy,
            1 => Facility::Querier,
            2 => Facility::Timing,
            3 => Facility::Sender,
            4 => Facility::Aggregation,
            5 => Facility::Config,
            6 => Facility::Test,
            _ => Facility::Unknown,
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
