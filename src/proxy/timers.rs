// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Protocol timer constants.
//!
//! Defaults follow RFC 3376 section 8 and RFC 3810 section 9. Values may be
//! overridden from configuration but do not change once a querier has
//! started.

use std::time::Duration;

pub const DEFAULT_ROBUSTNESS_VARIABLE: u8 = 2;
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(125);
pub const DEFAULT_QUERY_RESPONSE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LAST_MEMBER_QUERY_INTERVAL: Duration = Duration::from_secs(1);

/// Protocol timer values for one querier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimersValues {
    /// Robustness Variable (expected packet-loss tuning knob)
    pub robustness_variable: u8,
    /// Interval between general queries sent as querier
    pub query_interval: Duration,
    /// Max response time advertised in general queries
    pub query_response_interval: Duration,
    /// Interval between general queries during startup
    pub startup_query_interval: Duration,
    /// Number of startup-paced general queries
    pub startup_query_count: u8,
    /// Interval between group-specific queries after a leave
    pub last_member_query_interval: Duration,
    /// Number of group-specific queries after a leave
    pub last_member_query_count: u8,
}

impl Default for TimersValues {
    fn default() -> Self {
        Self {
            robustness_variable: DEFAULT_ROBUSTNESS_VARIABLE,
            query_interval: DEFAULT_QUERY_INTERVAL,
            query_response_interval: DEFAULT_QUERY_RESPONSE_INTERVAL,
            // [Startup Query Interval] = [Query Interval] / 4
            startup_query_interval: DEFAULT_QUERY_INTERVAL / 4,
            startup_query_count: DEFAULT_ROBUSTNESS_VARIABLE,
            last_member_query_interval: DEFAULT_LAST_MEMBER_QUERY_INTERVAL,
            last_member_query_count: DEFAULT_ROBUSTNESS_VARIABLE,
        }
    }
}

impl TimersValues {
    /// Multicast Address Listening Interval (aka Group Membership Interval):
    /// how long an EXCLUDE-mode group stays alive without confirmation.
    ///
    /// MALI = Robustness * [Query Interval] + [Query Response Interval]
    pub fn multicast_address_listening_interval(&self) -> Duration {
        self.query_interval * u32::from(self.robustness_variable) + self.query_response_interval
    }

    /// Older Host Present Interval, used when older-version compatibility
    /// timers are running. Same formula as MALI.
    pub fn older_host_present_interval(&self) -> Duration {
        self.multicast_address_listening_interval()
    }
}
