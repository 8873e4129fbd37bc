// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Timer scheduling and delivery.
//!
//! Queriers enroll opaque timer messages with [`Timing::add_time`]; the
//! [`TimingWorker`] task keeps pending deliveries in a priority queue and
//! sends each message to its target event channel at fire time. There is no
//! cancellation: a delivered message is only acted on if the membership
//! database still references the same handle, so replaced or orphaned timers
//! die at the delivery check.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::logging::{Facility, Logger};
use crate::{log_debug, log_info, log_warning};

use super::ProxyEvent;

/// Depth of the enrollment channel; enrollments beyond this are dropped with
/// a warning rather than blocking the event loop.
const ENROLL_QUEUE_DEPTH: usize = 256;

/// Filter-timer payload: identifies the group whose EXCLUDE state expires.
///
/// Identity matters more than content: the membership database stores the
/// `Arc` handle of the most recently armed timer, and delivery compares
/// handles with `Arc::ptr_eq`.
#[derive(Debug)]
pub struct FilterTimer {
    if_index: u32,
    gaddr: IpAddr,
    duration: Duration,
}

impl FilterTimer {
    pub fn new(if_index: u32, gaddr: IpAddr, duration: Duration) -> Self {
        Self {
            if_index,
            gaddr,
            duration,
        }
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn gaddr(&self) -> IpAddr {
        self.gaddr
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// General-query pacing payload for one downstream interface.
#[derive(Debug)]
pub struct GeneralQueryTimer {
    if_index: u32,
}

impl GeneralQueryTimer {
    pub fn new(if_index: u32) -> Self {
        Self { if_index }
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }
}

/// Opaque timer message delivered back through the proxy event channel.
#[derive(Debug, Clone)]
pub enum TimerMsg {
    Filter(std::sync::Arc<FilterTimer>),
    GeneralQuery(std::sync::Arc<GeneralQueryTimer>),
}

impl TimerMsg {
    pub fn if_index(&self) -> u32 {
        match self {
            TimerMsg::Filter(ft) => ft.if_index(),
            TimerMsg::GeneralQuery(gq) => gq.if_index(),
        }
    }
}

/// One enrollment: deliver `msg` to `target` at `fire_at`.
pub struct TimerRequest {
    pub fire_at: Instant,
    pub target: mpsc::Sender<ProxyEvent>,
    pub msg: TimerMsg,
}

impl PartialEq for TimerRequest {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at
    }
}

impl Eq for TimerRequest {}

impl PartialOrd for TimerRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

/// Cloneable enrollment handle shared by all queriers of a proxy.
#[derive(Clone)]
pub struct Timing {
    enroll_tx: mpsc::Sender<TimerRequest>,
    logger: Logger,
}

impl Timing {
    /// Create the handle together with the worker that must be spawned to
    /// drive deliveries.
    pub fn new(logger: Logger) -> (Self, TimingWorker) {
        let (enroll_tx, enroll_rx) = mpsc::channel(ENROLL_QUEUE_DEPTH);
        let timing = Self {
            enroll_tx,
            logger: logger.clone(),
        };
        let worker = TimingWorker {
            pending: BinaryHeap::new(),
            enroll_rx,
            logger,
        };
        (timing, worker)
    }

    /// Schedule `msg` for delivery to `target` after `duration`.
    /// Fire-and-forget: enrollment failures are logged, never propagated.
    pub fn add_time(&self, duration: Duration, target: &mpsc::Sender<ProxyEvent>, msg: TimerMsg) {
        let request = TimerRequest {
            fire_at: Instant::now() + duration,
            target: target.clone(),
            msg,
        };
        if self.enroll_tx.try_send(request).is_err() {
            log_warning!(
                self.logger,
                Facility::Timing,
                "timer enrollment queue full, dropping timer"
            );
        }
    }
}

/// The scheduler task: sleeps until the next pending delivery, fires all
/// expired timers, and accepts new enrollments in between.
pub struct TimingWorker {
    pending: BinaryHeap<std::cmp::Reverse<TimerRequest>>,
    enroll_rx: mpsc::Receiver<TimerRequest>,
    logger: Logger,
}

impl TimingWorker {
    pub async fn run(mut self) {
        log_info!(self.logger, Facility::Timing, "timing service started");

        loop {
            let sleep_duration = match self.pending.peek() {
                Some(std::cmp::Reverse(next)) => {
                    next.fire_at.saturating_duration_since(Instant::now())
                }
                // Nothing pending: sleep until an enrollment arrives.
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = sleep(sleep_duration) => {
                    self.fire_expired().await;
                }
                request = self.enroll_rx.recv() => {
                    match request {
                        Some(request) => {
                            self.pending.push(std::cmp::Reverse(request));
                            log_debug!(
                                self.logger,
                                Facility::Timing,
                                &format!("timer enrolled, {} pending", self.pending.len())
                            );
                        }
                        None => {
                            log_info!(
                                self.logger,
                                Facility::Timing,
                                "enrollment channel closed, timing service exiting"
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn fire_expired(&mut self) {
        let now = Instant::now();
        while let Some(std::cmp::Reverse(next)) = self.pending.peek() {
            if next.fire_at > now {
                break;
            }
            let request = self.pending.pop().unwrap().0;
            if request
                .target
                .send(ProxyEvent::TimerExpired(request.msg))
                .await
                .is_err()
            {
                // The owning proxy is gone; its remaining timers are moot.
                log_debug!(
                    self.logger,
                    Facility::Timing,
                    "timer target channel closed, delivery dropped"
                );
            }
        }
    }
}
