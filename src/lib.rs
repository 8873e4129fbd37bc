// SPDX-License-Identifier: Apache-2.0 OR MIT
//! multicast-proxy: an IGMPv3/MLDv2 querier and membership proxy.
//!
//! The daemon acts as the querier on a set of downstream interfaces, tracks
//! which multicast groups (and which sources within them) have listeners, and
//! folds that state into a single subscription on the upstream interface.
//!
//! Crate layout:
//! - [`proxy`] - the querier state machine, membership database, timer
//!   service, sender abstraction, and the per-instance event loop
//! - [`config`] - JSON5 configuration file parsing and validation
//! - [`logging`] - facility/severity logging used by all components

pub mod config;
pub mod logging;
pub mod proxy;

pub use config::{Config, ConfigError};
pub use proxy::membership_db::{FilterMode, GroupInfo, MembershipDb, ProtocolVersion};
pub use proxy::querier::{Querier, QuerierError};
pub use proxy::source_list::SourceList;
pub use proxy::{MembershipRecord, ProxyEvent, RecordType};
