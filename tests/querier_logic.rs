// SPDX-License-Identifier: Apache-2.0 OR MIT
// End-to-end querier scenarios: record ingress, filter-timer expiry, timer
// staleness, and upstream propagation through a running proxy instance.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use multicast_proxy::logging::{LogRegistry, Severity};
use multicast_proxy::proxy::membership_db::{FilterMode, ProtocolVersion};
use multicast_proxy::proxy::querier::Querier;
use multicast_proxy::proxy::sender::Sender;
use multicast_proxy::proxy::source_list::SourceList;
use multicast_proxy::proxy::timers::TimersValues;
use multicast_proxy::proxy::timing::{TimerMsg, Timing, TimingWorker};
use multicast_proxy::proxy::{
    InterfaceBinding, MembershipRecord, ProxyEvent, ProxyInstance, RecordType,
};

// --- Test helpers ---

#[derive(Debug, Clone, PartialEq, Eq)]
enum SenderOp {
    Report(u32, IpAddr),
    Leave(u32, IpAddr),
    GeneralQuery(u32),
}

#[derive(Default)]
struct RecordingSender {
    ops: Mutex<Vec<SenderOp>>,
}

impl RecordingSender {
    fn ops(&self) -> Vec<SenderOp> {
        self.ops.lock().unwrap().clone()
    }
}

impl Sender for RecordingSender {
    fn send_report(&self, if_index: u32, gaddr: IpAddr) -> anyhow::Result<()> {
        self.ops.lock().unwrap().push(SenderOp::Report(if_index, gaddr));
        Ok(())
    }

    fn send_leave(&self, if_index: u32, gaddr: IpAddr) -> anyhow::Result<()> {
        self.ops.lock().unwrap().push(SenderOp::Leave(if_index, gaddr));
        Ok(())
    }

    fn send_general_query(&self, if_index: u32, _timers: &TimersValues) -> anyhow::Result<()> {
        self.ops.lock().unwrap().push(SenderOp::GeneralQuery(if_index));
        Ok(())
    }
}

fn list(addrs: &[&str]) -> SourceList {
    addrs.iter().map(|a| a.parse().unwrap()).collect()
}

fn record(record_type: RecordType, gaddr: &str, sources: &[&str]) -> MembershipRecord {
    MembershipRecord {
        record_type,
        gaddr: gaddr.parse().unwrap(),
        sources: list(sources),
        report_version: 3,
    }
}

struct QuerierFixture {
    querier: Querier,
    _reply_rx: mpsc::Receiver<ProxyEvent>,
    _worker: TimingWorker,
}

fn querier_fixture() -> QuerierFixture {
    let logger = LogRegistry::new(512, Severity::Debug).logger();
    let (timing, worker) = Timing::new(logger.clone());
    let (reply_tx, reply_rx) = mpsc::channel(64);
    let querier = Querier::new(
        ProtocolVersion::Igmpv3,
        3,
        "dn0".to_string(),
        Arc::new(RecordingSender::default()),
        timing,
        reply_tx,
        TimersValues::default(),
        logger,
    )
    .unwrap();
    QuerierFixture {
        querier,
        _reply_rx: reply_rx,
        _worker: worker,
    }
}

fn assert_state(querier: &Querier, gaddr: &str, mode: FilterMode, x: &[&str], y: &[&str]) {
    let info = querier
        .group(&gaddr.parse().unwrap())
        .expect("group entry present");
    assert_eq!(info.filter_mode, mode);
    assert_eq!(info.include_requested_list, list(x));
    assert_eq!(info.exclude_list, list(y));
}

const G: &str = "239.1.1.1";
const S1: &str = "1.1.1.1";
const S2: &str = "2.2.2.2";
const S3: &str = "3.3.3.3";

// --- Querier scenarios ---

#[test]
fn fresh_group_via_mode_is_include() {
    let mut f = querier_fixture();
    assert!(f.querier.db().is_empty());

    f.querier
        .receive_record(record(RecordType::ModeIsInclude, G, &[S1, S2]));

    assert_state(&f.querier, G, FilterMode::Include, &[S1, S2], &[]);
    assert!(f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .is_none());
}

#[test]
fn include_to_exclude_via_change_to_exclude() {
    let mut f = querier_fixture();
    f.querier
        .receive_record(record(RecordType::ModeIsInclude, G, &[S1, S2]));
    f.querier
        .receive_record(record(RecordType::ChangeToExcludeMode, G, &[S2, S3]));

    assert_state(&f.querier, G, FilterMode::Exclude, &[S2], &[S3]);
    let info = f.querier.group(&G.parse().unwrap()).unwrap();
    let timer = info.filter_timer.as_ref().expect("filter timer armed");
    assert_eq!(timer.duration(), Duration::from_secs(260));
    assert_eq!(timer.gaddr(), G.parse::<IpAddr>().unwrap());
}

#[test]
fn exclude_allow_pulls_sources_back() {
    let mut f = querier_fixture();
    f.querier
        .receive_record(record(RecordType::ModeIsInclude, G, &[S1, S2]));
    f.querier
        .receive_record(record(RecordType::ChangeToExcludeMode, G, &[S2, S3]));
    let armed = f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .clone()
        .unwrap();

    f.querier
        .receive_record(record(RecordType::AllowNewSources, G, &[S3]));

    assert_state(&f.querier, G, FilterMode::Exclude, &[S2, S3], &[]);
    let still_armed = f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .clone()
        .unwrap();
    assert!(
        Arc::ptr_eq(&armed, &still_armed),
        "ALLOW must not re-arm the filter timer"
    );
}

#[test]
fn filter_timer_expiry_with_requested_sources_falls_back_to_include() {
    let mut f = querier_fixture();
    f.querier
        .receive_record(record(RecordType::ModeIsInclude, G, &[S1, S2]));
    f.querier
        .receive_record(record(RecordType::ChangeToExcludeMode, G, &[S2, S3]));

    let timer = f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .clone()
        .unwrap();
    f.querier.timer_triggered(&TimerMsg::Filter(timer));

    assert_state(&f.querier, G, FilterMode::Include, &[S2], &[]);
}

#[test]
fn filter_timer_expiry_without_requested_sources_deletes_group() {
    let mut f = querier_fixture();
    f.querier
        .receive_record(record(RecordType::ModeIsExclude, G, &[S1]));
    assert_state(&f.querier, G, FilterMode::Exclude, &[], &[S1]);

    let timer = f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .clone()
        .unwrap();
    f.querier.timer_triggered(&TimerMsg::Filter(timer));

    assert!(f.querier.group(&G.parse().unwrap()).is_none());
}

#[test]
fn replaced_filter_timer_is_ignored_on_delivery() {
    let mut f = querier_fixture();
    f.querier
        .receive_record(record(RecordType::ModeIsInclude, G, &[S1, S2]));
    f.querier
        .receive_record(record(RecordType::ChangeToExcludeMode, G, &[S2, S3]));
    let first = f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .clone()
        .unwrap();

    // A second TO_EX re-arms; the first timer's later delivery must not
    // change anything. TO_EX {s1} over EXCLUDE ({s2},{s3}) gives ({s1},{}).
    f.querier
        .receive_record(record(RecordType::ChangeToExcludeMode, G, &[S1]));
    assert_state(&f.querier, G, FilterMode::Exclude, &[S1], &[]);

    f.querier.timer_triggered(&TimerMsg::Filter(first));
    assert_state(&f.querier, G, FilterMode::Exclude, &[S1], &[]);
    assert!(f
        .querier
        .group(&G.parse().unwrap())
        .unwrap()
        .filter_timer
        .is_some());
}

// --- Full instance, real timing service ---

#[tokio::test(start_paused = true)]
async fn instance_ages_out_exclude_group_and_leaves_upstream() {
    let logger = LogRegistry::new(2048, Severity::Debug).logger();
    let sender = Arc::new(RecordingSender::default());
    let (timing, worker) = Timing::new(logger.clone());
    tokio::spawn(worker.run());

    let instance = ProxyInstance::new(
        "lan".to_string(),
        ProtocolVersion::Igmpv3,
        InterfaceBinding {
            name: "up0".to_string(),
            index: 1,
        },
        vec![InterfaceBinding {
            name: "dn0".to_string(),
            index: 10,
        }],
        TimersValues::default(),
        sender.clone(),
        timing,
        logger,
    )
    .unwrap();
    let events = instance.event_sender();
    let task = tokio::spawn(instance.run());

    let gaddr: IpAddr = G.parse().unwrap();
    events
        .send(ProxyEvent::Record {
            if_index: 10,
            record: record(RecordType::ModeIsExclude, G, &[S1]),
        })
        .await
        .unwrap();

    // Let the loop apply the record and propagate the upstream join.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(sender.ops().contains(&SenderOp::Report(1, gaddr)));

    // MALI is 260 s; after it passes the group must be gone and the
    // upstream subscription released.
    tokio::time::sleep(Duration::from_secs(261)).await;
    assert!(sender.ops().contains(&SenderOp::Leave(1, gaddr)));

    // General queries were paced meanwhile (startup pacing, then steady).
    let queries = sender
        .ops()
        .iter()
        .filter(|op| **op == SenderOp::GeneralQuery(10))
        .count();
    assert!(queries >= 2, "expected paced general queries, got {queries}");

    events.send(ProxyEvent::Shutdown).await.unwrap();
    task.await.unwrap();

    // Dropping the instance's querier leaves the router groups.
    assert!(sender
        .ops()
        .iter()
        .any(|op| matches!(op, SenderOp::Leave(10, _))));
}
