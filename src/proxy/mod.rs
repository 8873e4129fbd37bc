// SPDX-License-Identifier: Apache-2.0 OR MIT
//! The proxy instance: one upstream interface fed by a set of downstream
//! queriers.
//!
//! All state mutation runs on the instance's event loop: decoded listener
//! reports and timer deliveries enter through one mpsc channel and are
//! handled strictly in order, so the queriers never see concurrent access.
//! After every event the downstream memberships are re-aggregated and the
//! upstream subscription adjusted to match.

pub mod aggregation;
pub mod membership_db;
pub mod querier;
pub mod sender;
pub mod source_list;
pub mod timers;
pub mod timing;

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use crate::logging::{Facility, Logger};
use crate::{log_debug, log_error, log_info, log_notice, log_warning};

use aggregation::{GroupMem, MembershipAggregation};
use membership_db::ProtocolVersion;
use querier::Querier;
use sender::Sender;
use timers::TimersValues;
use timing::{GeneralQueryTimer, TimerMsg, Timing};

/// Depth of the per-instance event channel.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Multicast address record types carried in IGMPv3/MLDv2 listener reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    ModeIsInclude,
    ModeIsExclude,
    ChangeToIncludeMode,
    ChangeToExcludeMode,
    AllowNewSources,
    BlockOldSources,
}

/// One decoded group record from a listener report.
#[derive(Debug, Clone)]
pub struct MembershipRecord {
    pub record_type: RecordType,
    pub gaddr: IpAddr,
    pub sources: source_list::SourceList,
    /// Report protocol version; accepted for future older-version
    /// compatibility handling, currently ignored.
    pub report_version: u8,
}

/// Everything the proxy instance's event loop reacts to.
#[derive(Debug)]
pub enum ProxyEvent {
    /// A listener report record arrived on a downstream interface.
    Record {
        if_index: u32,
        record: MembershipRecord,
    },
    /// A timer enrolled with the timing service came due.
    TimerExpired(TimerMsg),
    /// Stop the event loop.
    Shutdown,
}

/// A resolved network interface (name plus kernel index).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
    pub name: String,
    pub index: u32,
}

/// Per-downstream general-query pacing state.
struct QueryPacing {
    startup_queries_left: u8,
}

/// One proxy instance: the queriers for its downstream interfaces, the
/// aggregated upstream subscription, and the event loop connecting them.
pub struct ProxyInstance {
    name: String,
    queriers: HashMap<u32, Querier>,
    upstream: InterfaceBinding,
    upstream_groups: BTreeMap<IpAddr, GroupMem>,
    pacing: HashMap<u32, QueryPacing>,
    timers: TimersValues,
    sender: Arc<dyn Sender>,
    timing: Timing,
    event_tx: mpsc::Sender<ProxyEvent>,
    event_rx: mpsc::Receiver<ProxyEvent>,
    logger: Logger,
}

impl ProxyInstance {
    /// Build the instance: one querier per downstream interface (joining its
    /// router groups), and an immediate first general query scheduled per
    /// interface.
    pub fn new(
        name: String,
        version: ProtocolVersion,
        upstream: InterfaceBinding,
        downstream: Vec<InterfaceBinding>,
        timers: TimersValues,
        sender: Arc<dyn Sender>,
        timing: Timing,
        logger: Logger,
    ) -> Result<Self> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let mut queriers = HashMap::new();
        let mut pacing = HashMap::new();
        for binding in downstream {
            let querier = Querier::new(
                version,
                binding.index,
                binding.name.clone(),
                Arc::clone(&sender),
                timing.clone(),
                event_tx.clone(),
                timers.clone(),
                logger.clone(),
            )
            .with_context(|| {
                format!(
                    "starting querier on downstream interface {} (instance {name})",
                    binding.name
                )
            })?;
            queriers.insert(binding.index, querier);
            pacing.insert(
                binding.index,
                QueryPacing {
                    startup_queries_left: timers.startup_query_count,
                },
            );

            // First general query fires as soon as the loop runs.
            timing.add_time(
                std::time::Duration::ZERO,
                &event_tx,
                TimerMsg::GeneralQuery(Arc::new(GeneralQueryTimer::new(binding.index))),
            );
        }

        log_notice!(
            logger,
            Facility::Proxy,
            &format!(
                "instance {name}: {} downstream querier(s), upstream {}",
                queriers.len(),
                upstream.name
            )
        );

        Ok(Self {
            name,
            queriers,
            upstream,
            upstream_groups: BTreeMap::new(),
            pacing,
            timers,
            sender,
            timing,
            event_tx,
            event_rx,
            logger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle for feeding events into this instance (packet receivers,
    /// shutdown, tests).
    pub fn event_sender(&self) -> mpsc::Sender<ProxyEvent> {
        self.event_tx.clone()
    }

    pub fn querier(&self, if_index: u32) -> Option<&Querier> {
        self.queriers.get(&if_index)
    }

    /// The current aggregated upstream subscription.
    pub fn upstream_groups(&self) -> &BTreeMap<IpAddr, GroupMem> {
        &self.upstream_groups
    }

    /// Run the event loop until shutdown or channel closure.
    pub async fn run(mut self) {
        while let Some(event) = self.event_rx.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        log_notice!(
            self.logger,
            Facility::Proxy,
            &format!("instance {}: event loop stopped", self.name)
        );
    }

    /// Apply one event; returns false when the loop should stop. Runtime
    /// anomalies are logged and swallowed so the loop survives them.
    pub fn handle_event(&mut self, event: ProxyEvent) -> bool {
        match event {
            ProxyEvent::Record { if_index, record } => {
                match self.queriers.get_mut(&if_index) {
                    Some(querier) => querier.receive_record(record),
                    None => log_warning!(
                        self.logger,
                        Facility::Proxy,
                        &format!("record for unknown downstream interface {if_index}")
                    ),
                }
            }
            ProxyEvent::TimerExpired(msg) => match &msg {
                TimerMsg::Filter(ft) => match self.queriers.get_mut(&ft.if_index()) {
                    Some(querier) => querier.timer_triggered(&msg),
                    None => log_debug!(
                        self.logger,
                        Facility::Proxy,
                        &format!(
                            "filter timer for departed interface {}, dropping",
                            ft.if_index()
                        )
                    ),
                },
                TimerMsg::GeneralQuery(gq) => self.general_query_due(gq.if_index()),
            },
            ProxyEvent::Shutdown => return false,
        }
        self.update_upstream();
        true
    }

    /// Send the paced general query for a downstream interface and re-arm
    /// its timer: `startup_query_count` rounds at the startup interval,
    /// thereafter every query interval.
    fn general_query_due(&mut self, if_index: u32) {
        if !self.queriers.contains_key(&if_index) {
            return;
        }
        if let Err(err) = self.sender.send_general_query(if_index, &self.timers) {
            log_error!(
                self.logger,
                Facility::Proxy,
                &format!("general query on interface {if_index} failed: {err}")
            );
        }

        let next = match self.pacing.get_mut(&if_index) {
            Some(pacing) if pacing.startup_queries_left > 0 => {
                pacing.startup_queries_left -= 1;
                self.timers.startup_query_interval
            }
            _ => self.timers.query_interval,
        };
        self.timing.add_time(
            next,
            &self.event_tx,
            TimerMsg::GeneralQuery(Arc::new(GeneralQueryTimer::new(if_index))),
        );
    }

    /// Re-aggregate all downstream memberships and adjust the upstream
    /// subscription to the difference.
    fn update_upstream(&mut self) {
        let mut aggregation = MembershipAggregation::new();
        for querier in self.queriers.values() {
            for (gaddr, mem) in querier.memberships() {
                aggregation.add_membership(gaddr, mem);
            }
        }
        let next = aggregation.into_groups();

        for (gaddr, mem) in &next {
            match self.upstream_groups.get(gaddr) {
                None => {
                    log_notice!(
                        self.logger,
                        Facility::Aggregation,
                        &format!(
                            "instance {}: subscribing {gaddr} upstream ({mem})",
                            self.name
                        )
                    );
                    if let Err(err) = self.sender.send_report(self.upstream.index, *gaddr) {
                        log_error!(
                            self.logger,
                            Facility::Aggregation,
                            &format!("upstream join for {gaddr} failed: {err}")
                        );
                    }
                }
                Some(previous) if previous != mem => {
                    log_info!(
                        self.logger,
                        Facility::Aggregation,
                        &format!(
                            "instance {}: upstream membership for {gaddr} now {mem}",
                            self.name
                        )
                    );
                }
                Some(_) => {}
            }
        }

        let departed: Vec<IpAddr> = self
            .upstream_groups
            .keys()
            .filter(|gaddr| !next.contains_key(*gaddr))
            .copied()
            .collect();
        for gaddr in departed {
            log_notice!(
                self.logger,
                Facility::Aggregation,
                &format!("instance {}: unsubscribing {gaddr} upstream", self.name)
            );
            if let Err(err) = self.sender.send_leave(self.upstream.index, gaddr) {
                log_error!(
                    self.logger,
                    Facility::Aggregation,
                    &format!("upstream leave for {gaddr} failed: {err}")
                );
            }
        }

        self.upstream_groups = next;
    }
}

impl std::fmt::Display for ProxyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "== proxy instance: {} ==", self.name)?;
        let mut indices: Vec<u32> = self.queriers.keys().copied().collect();
        indices.sort_unstable();
        for index in indices {
            write!(f, "{}", self.queriers[&index])?;
        }
        writeln!(f, "upstream ({}):", self.upstream.name)?;
        if self.upstream_groups.is_empty() {
            writeln!(f, "no subscriptions")?;
        }
        for (gaddr, mem) in &self.upstream_groups {
            writeln!(f, "group {gaddr}: {mem}")?;
        }
        Ok(())
    }
}
