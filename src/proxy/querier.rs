// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-interface querier state machine (RFC 3376 section 6.4, RFC 3810
//! section 7.4).
//!
//! The querier owns the membership database for its interface. Incoming
//! listener reports mutate per-group filter state through the
//! mode-by-record-type transition table; EXCLUDE-mode groups age out through
//! filter timers delivered back by the timing service.
//!
//! Filter timers are never canceled. Arming a new timer installs its handle
//! in the database entry, which makes any earlier handle stale; deliveries
//! are checked against the installed handle and dropped when they no longer
//! match.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::logging::{Facility, Logger};
use crate::{log_debug, log_error};

use super::aggregation::GroupMem;
use super::membership_db::{FilterMode, GroupInfo, MembershipDb, ProtocolVersion};
use super::sender::Sender;
use super::source_list::SourceList;
use super::timers::TimersValues;
use super::timing::{FilterTimer, TimerMsg, Timing};
use super::{MembershipRecord, ProxyEvent, RecordType};

/// All-routers group (RFC 2236 section 9): 224.0.0.2
pub const IPV4_ALL_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);
/// IGMPv3-capable routers (IANA): 224.0.0.22
pub const IPV4_IGMPV3_ROUTERS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);
/// Link-local all-routers (RFC 2710 section 8): ff02::2
pub const IPV6_ALL_ROUTERS_LINK_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);
/// Site-local all-routers (IANA): ff05::2
pub const IPV6_ALL_ROUTERS_SITE_LOCAL: Ipv6Addr = Ipv6Addr::new(0xff05, 0, 0, 0, 0, 0, 0, 2);
/// All MLDv2-capable routers (RFC 3810 section 7): ff02::16
pub const IPV6_MLDV2_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x16);

/// Construction failures; the querier must not be accepted by its owner.
#[derive(Debug, Error)]
pub enum QuerierError {
    #[error("failed to subscribe router group {group} on interface {if_index}: {source}")]
    RouterGroupSubscription {
        group: IpAddr,
        if_index: u32,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of applying one report record to one group's state: the new filter
/// state plus whether the filter timer must be re-armed to MALI.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RecordTransition {
    filter_mode: FilterMode,
    include_requested_list: SourceList,
    exclude_list: SourceList,
    arm_filter_timer: bool,
}

/// The record-processing table, as a pure function of the current state and
/// the received record. `x` is the include/requested list, `y` the exclude
/// list, `report` the record's source list.
fn apply_record(
    filter_mode: FilterMode,
    x: &SourceList,
    y: &SourceList,
    record_type: RecordType,
    report: &SourceList,
) -> RecordTransition {
    use RecordType::*;

    match filter_mode {
        // Router state INCLUDE (A), report source list B.
        FilterMode::Include => match record_type {
            // INCLUDE (A) + IS_IN (B) / ALLOW (B) / TO_IN (B) -> INCLUDE (A+B)
            ModeIsInclude | AllowNewSources | ChangeToIncludeMode => RecordTransition {
                filter_mode: FilterMode::Include,
                include_requested_list: x + report,
                exclude_list: SourceList::new(),
                arm_filter_timer: false,
            },
            // INCLUDE (A) + IS_EX (B) / TO_EX (B) -> EXCLUDE (A*B, B-A),
            // filter timer = MALI
            ModeIsExclude | ChangeToExcludeMode => RecordTransition {
                filter_mode: FilterMode::Exclude,
                include_requested_list: x * report,
                exclude_list: report - x,
                arm_filter_timer: true,
            },
            // INCLUDE (A) + BLOCK (B) -> INCLUDE (A)
            BlockOldSources => RecordTransition {
                filter_mode: FilterMode::Include,
                include_requested_list: x.clone(),
                exclude_list: SourceList::new(),
                arm_filter_timer: false,
            },
        },
        // Router state EXCLUDE (X, Y), report source list A.
        FilterMode::Exclude => match record_type {
            // EXCLUDE (X,Y) + IS_IN (A) / ALLOW (A) / TO_IN (A)
            //   -> EXCLUDE (X+A, Y-A)
            ModeIsInclude | AllowNewSources | ChangeToIncludeMode => RecordTransition {
                filter_mode: FilterMode::Exclude,
                include_requested_list: x + report,
                exclude_list: y - report,
                arm_filter_timer: false,
            },
            // EXCLUDE (X,Y) + IS_EX (A) / TO_EX (A) -> EXCLUDE (A-Y, Y*A),
            // filter timer = MALI
            ModeIsExclude | ChangeToExcludeMode => RecordTransition {
                filter_mode: FilterMode::Exclude,
                include_requested_list: report - y,
                exclude_list: y * report,
                arm_filter_timer: true,
            },
            // EXCLUDE (X,Y) + BLOCK (A) -> EXCLUDE (X+(A-Y), Y)
            BlockOldSources => RecordTransition {
                filter_mode: FilterMode::Exclude,
                include_requested_list: x + &(report - y),
                exclude_list: y.clone(),
                arm_filter_timer: false,
            },
        },
    }
}

/// The querier for one downstream interface.
pub struct Querier {
    if_index: u32,
    if_name: String,
    version: ProtocolVersion,
    db: MembershipDb,
    timers_values: TimersValues,
    sender: Arc<dyn Sender>,
    timing: Timing,
    /// Delivery target for timer messages (the owning proxy's event channel).
    reply_tx: mpsc::Sender<ProxyEvent>,
    logger: Logger,
}

impl Querier {
    /// Create the querier: joins the router-side multicast groups for the
    /// address family and initializes the membership database. Joined groups
    /// are rolled back if a later join fails.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: ProtocolVersion,
        if_index: u32,
        if_name: String,
        sender: Arc<dyn Sender>,
        timing: Timing,
        reply_tx: mpsc::Sender<ProxyEvent>,
        timers_values: TimersValues,
        logger: Logger,
    ) -> Result<Self, QuerierError> {
        let groups = router_groups(version);
        for (joined, group) in groups.iter().enumerate() {
            if let Err(source) = sender.send_report(if_index, *group) {
                for already_joined in &groups[..joined] {
                    let _ = sender.send_leave(if_index, *already_joined);
                }
                log_error!(
                    logger,
                    Facility::Querier,
                    &format!("failed to subscribe multicast router group {group}")
                );
                return Err(QuerierError::RouterGroupSubscription {
                    group: *group,
                    if_index,
                    source,
                });
            }
        }

        Ok(Self {
            if_index,
            if_name,
            version,
            db: MembershipDb::new(version),
            timers_values,
            sender,
            timing,
            reply_tx,
            logger,
        })
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn db(&self) -> &MembershipDb {
        &self.db
    }

    pub fn timers_values(&self) -> &TimersValues {
        &self.timers_values
    }

    /// Process one decoded listener report record.
    pub fn receive_record(&mut self, record: MembershipRecord) {
        let MembershipRecord {
            record_type,
            gaddr,
            sources,
            report_version,
        } = record;

        log_debug!(
            self.logger,
            Facility::Querier,
            &format!(
                "record {record_type:?} for {gaddr} sources {sources} (report version {report_version})"
            )
        );

        if !gaddr.is_multicast() || !self.matches_family(&gaddr) {
            log_debug!(
                self.logger,
                Facility::Querier,
                &format!("ignoring record for non-multicast or wrong-family group {gaddr}")
            );
            return;
        }

        // A group without an entry starts from the neutral record:
        // INCLUDE with empty lists.
        let transition = match self.db.get(&gaddr) {
            Some(info) => apply_record(
                info.filter_mode,
                &info.include_requested_list,
                &info.exclude_list,
                record_type,
                &sources,
            ),
            None => apply_record(
                FilterMode::Include,
                &SourceList::new(),
                &SourceList::new(),
                record_type,
                &sources,
            ),
        };

        // An INCLUDE entry with nothing requested carries no listener state.
        if transition.filter_mode == FilterMode::Include
            && transition.include_requested_list.is_empty()
        {
            self.db.erase(&gaddr);
            return;
        }

        let new_timer = transition.arm_filter_timer.then(|| self.mali(gaddr));
        let info = self.db.entry(gaddr);
        info.filter_mode = transition.filter_mode;
        info.include_requested_list = transition.include_requested_list;
        info.exclude_list = transition.exclude_list;
        if let Some(timer) = new_timer {
            // Installing the new handle supersedes (and thereby cancels) any
            // previously armed filter timer.
            info.filter_timer = Some(timer);
        }
    }

    /// Entry point for timer messages delivered by the timing service.
    pub fn timer_triggered(&mut self, msg: &TimerMsg) {
        let ft = match msg {
            TimerMsg::Filter(ft) => ft,
            other => {
                log_error!(
                    self.logger,
                    Facility::Querier,
                    &format!("unexpected timer message {other:?}")
                );
                return;
            }
        };

        // Only the in-flight delivery still holds the handle: the database
        // entry was erased or the handle replaced and dropped since
        // enrollment.
        if Arc::strong_count(ft) <= 1 {
            log_debug!(
                self.logger,
                Facility::Querier,
                &format!("filter timer for {} is outdated", ft.gaddr())
            );
            return;
        }

        let gaddr = ft.gaddr();
        let Some(info) = self.db.get_mut(&gaddr) else {
            log_error!(
                self.logger,
                Facility::Querier,
                &format!("filter timer for {gaddr} still referenced but group not found")
            );
            return;
        };

        match &info.filter_timer {
            Some(installed) if Arc::ptr_eq(installed, ft) => {}
            _ => {
                log_debug!(
                    self.logger,
                    Facility::Querier,
                    &format!("delivered filter timer for {gaddr} superseded, dropping")
                );
                return;
            }
        }

        // Filter timer expired: no more listeners in EXCLUDE mode for this
        // group. An empty requested list deletes the record; otherwise the
        // group falls back to INCLUDE of the requested sources.
        match info.filter_mode {
            FilterMode::Exclude => {
                if info.include_requested_list.is_empty() {
                    self.db.erase(&gaddr);
                } else {
                    info.filter_mode = FilterMode::Include;
                    info.exclude_list.clear();
                    info.filter_timer = None;
                }
            }
            FilterMode::Include => {
                log_error!(
                    self.logger,
                    Facility::Querier,
                    &format!("filter timer fired for {gaddr} in INCLUDE mode")
                );
            }
        }
    }

    /// Reserved for non-querier operation: receiving a query from another
    /// querier would restart compatibility timers. This instance always
    /// assumes the querier role, so nothing happens here yet.
    pub fn receive_query(&mut self) {}

    /// Arm a fresh filter timer for `gaddr` to the Multicast Address
    /// Listening Interval and return its handle for installation in the
    /// database entry.
    fn mali(&self, gaddr: IpAddr) -> Arc<FilterTimer> {
        let duration = self.timers_values.multicast_address_listening_interval();
        let timer = Arc::new(FilterTimer::new(self.if_index, gaddr, duration));
        self.timing.add_time(
            duration,
            &self.reply_tx,
            TimerMsg::Filter(Arc::clone(&timer)),
        );
        timer
    }

    /// Current per-group memberships, in the form the aggregation layer
    /// consumes: INCLUDE of the requested sources, or EXCLUDE of the exclude
    /// list.
    pub fn memberships(&self) -> impl Iterator<Item = (IpAddr, GroupMem)> + '_ {
        self.db.iter().map(|(gaddr, info)| {
            let mem = match info.filter_mode {
                FilterMode::Include => GroupMem::include(info.include_requested_list.clone()),
                FilterMode::Exclude => GroupMem::exclude(info.exclude_list.clone()),
            };
            (*gaddr, mem)
        })
    }

    pub fn group(&self, gaddr: &IpAddr) -> Option<&GroupInfo> {
        self.db.get(gaddr)
    }

    fn matches_family(&self, addr: &IpAddr) -> bool {
        self.version.is_ipv4() == addr.is_ipv4()
    }
}

impl Drop for Querier {
    fn drop(&mut self) {
        for group in router_groups(self.version) {
            if let Err(err) = self.sender.send_leave(self.if_index, group) {
                log_error!(
                    self.logger,
                    Facility::Querier,
                    &format!("failed to leave router group {group}: {err}")
                );
            }
        }
    }
}

impl std::fmt::Display for Querier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "##-- interface: {} (index: {}) --##",
            self.if_name, self.if_index
        )?;
        write!(f, "{}", self.db)
    }
}

/// The router-side multicast groups a querier subscribes for its family.
fn router_groups(version: ProtocolVersion) -> Vec<IpAddr> {
    match version {
        ProtocolVersion::Igmpv3 => vec![
            IpAddr::V4(IPV4_ALL_ROUTERS),
            IpAddr::V4(IPV4_IGMPV3_ROUTERS),
        ],
        ProtocolVersion::Mldv2 => vec![
            IpAddr::V6(IPV6_ALL_ROUTERS_LINK_LOCAL),
            IpAddr::V6(IPV6_ALL_ROUTERS_SITE_LOCAL),
            IpAddr::V6(IPV6_MLDV2_ROUTERS),
        ],
    }
}
