// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Listener membership database, keyed by multicast group address.
//!
//! The database itself only guarantees key uniqueness; the structural
//! invariants (include/exclude list relationships, timer authority) are
//! enforced by the querier that owns it.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::source_list::SourceList;
use super::timing::FilterTimer;

/// The group-membership protocol spoken on an interface, fixed at querier
/// startup from the address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    Igmpv3,
    Mldv2,
}

impl ProtocolVersion {
    pub const fn is_ipv4(self) -> bool {
        matches!(self, ProtocolVersion::Igmpv3)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::Igmpv3 => "IGMPv3",
            ProtocolVersion::Mldv2 => "MLDv2",
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-group filter directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Accept only the listed sources
    Include,
    /// Accept everything except the exclude list
    Exclude,
}

impl Default for FilterMode {
    fn default() -> Self {
        FilterMode::Include
    }
}

impl std::fmt::Display for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterMode::Include => write!(f, "INCLUDE"),
            FilterMode::Exclude => write!(f, "EXCLUDE"),
        }
    }
}

/// Listener state for one multicast group.
#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub filter_mode: FilterMode,
    /// In INCLUDE mode: the desired sources. In EXCLUDE mode: sources pulled
    /// back into "wanted" despite the exclude base (the requested list).
    pub include_requested_list: SourceList,
    /// Sources refused in EXCLUDE mode; empty in INCLUDE mode.
    pub exclude_list: SourceList,
    /// The authoritative filter timer for this group. Replacing the handle
    /// makes any previously scheduled delivery stale.
    pub filter_timer: Option<Arc<FilterTimer>>,
}

impl std::fmt::Display for GroupInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.filter_mode {
            FilterMode::Include => write!(
                f,
                "{} requested: {}",
                self.filter_mode, self.include_requested_list
            ),
            FilterMode::Exclude => write!(
                f,
                "{} requested: {} excluded: {}",
                self.filter_mode, self.include_requested_list, self.exclude_list
            ),
        }
    }
}

/// Map from group address to listener state, plus the querier-role scalars.
/// The compatibility mode is fixed at construction and never changes for the
/// querier's lifetime.
#[derive(Debug)]
pub struct MembershipDb {
    pub group_info: BTreeMap<IpAddr, GroupInfo>,
    pub compatibility_mode_variable: ProtocolVersion,
    pub is_querier: bool,
}

impl MembershipDb {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            group_info: BTreeMap::new(),
            compatibility_mode_variable: version,
            is_querier: true,
        }
    }

    /// Look up a group, inserting a neutral record (INCLUDE, empty lists)
    /// when absent.
    pub fn entry(&mut self, gaddr: IpAddr) -> &mut GroupInfo {
        self.group_info.entry(gaddr).or_default()
    }

    pub fn get(&self, gaddr: &IpAddr) -> Option<&GroupInfo> {
        self.group_info.get(gaddr)
    }

    pub fn get_mut(&mut self, gaddr: &IpAddr) -> Option<&mut GroupInfo> {
        self.group_info.get_mut(gaddr)
    }

    pub fn erase(&mut self, gaddr: &IpAddr) -> Option<GroupInfo> {
        self.group_info.remove(gaddr)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &GroupInfo)> {
        self.group_info.iter()
    }

    pub fn len(&self) -> usize {
        self.group_info.len()
    }

    pub fn is_empty(&self) -> bool {
        self.group_info.is_empty()
    }
}

impl std::fmt::Display for MembershipDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "compatibility mode: {}, querier: {}",
            self.compatibility_mode_variable, self.is_querier
        )?;
        if self.group_info.is_empty() {
            writeln!(f, "no group memberships")?;
        }
        for (gaddr, info) in &self.group_info {
            writeln!(f, "group {gaddr}: {info}")?;
        }
        Ok(())
    }
}
