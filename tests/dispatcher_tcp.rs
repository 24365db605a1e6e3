use std::net::SocketAddr;
use std::net::TcpStream;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use meterflow::broker::Broker;
use meterflow::broker::Role;
use meterflow::config::DispatcherConfig;
use meterflow::config::StandbyPolicy;
use meterflow::dispatcher::CycleReport;
use meterflow::dispatcher::Delivery;
use meterflow::dispatcher::Dispatcher;
use meterflow::dispatcher::Outcome;
use meterflow::metrics::Metrics;
use meterflow::partition::ShareKind;
use meterflow::record::Batch;
use meterflow::record::Record;
use meterflow::wire;

fn readings(n: usize) -> Batch {
    Batch::new(
        (0..n)
            .map(|i| {
                Record::from_iter([
                    ("compteur_id", format!("{:06}", 100_000 + i)),
                    ("timestamp", "2024-05-01 08:00:00".to_string()),
                    ("consommation", format!("{}.5 kWh", i % 10)),
                ])
            })
            .collect(),
    )
}

fn meter_ids(batch: &Batch) -> Vec<String> {
    batch
        .records()
        .iter()
        .map(|r| r.get("compteur_id").unwrap().to_string())
        .collect()
}

/// What a fake unit got from the dispatcher.
#[derive(Debug)]
enum Received {
    Share(Batch),
    Nothing,
}

impl Received {
    fn share(self) -> Batch {
        match self {
            Received::Share(batch) => batch,
            Received::Nothing => panic!("unit received nothing"),
        }
    }
}

/// Connects, optionally signals a breakdown after `signal_after`,
/// then reads until the dispatcher pushes or closes.
fn fake_unit(stream: TcpStream, signal_after: Option<Duration>) -> JoinHandle<Received> {
    thread::spawn(move || {
        let mut stream = stream;
        if let Some(delay) = signal_after {
            thread::sleep(delay);
            wire::send_failure_signal(&mut stream).unwrap();
        }
        match wire::recv_batch(&mut stream) {
            Ok(Some((_, batch))) => Received::Share(batch),
            Ok(None) => Received::Nothing,
            Err(err) => panic!("unit read failed: {err}"),
        }
    })
}

struct Harness {
    addr: SocketAddr,
    dispatcher: JoinHandle<CycleReport>,
    metrics: std::sync::Arc<Metrics>,
}

fn start(config: DispatcherConfig, batch: Batch) -> Harness {
    let broker = Broker::bind(config.listen, config.accept_timeout, config.active_peer).unwrap();
    let addr = broker.local_addr().unwrap();
    let metrics = Metrics::new().unwrap();
    let dispatcher = Dispatcher::new(config, metrics.clone());
    let dispatcher = thread::spawn(move || dispatcher.serve(&broker, batch).unwrap());
    Harness {
        addr,
        dispatcher,
        metrics,
    }
}

fn config(standby: StandbyPolicy, receive_timeout: Duration) -> DispatcherConfig {
    DispatcherConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        accept_timeout: Duration::from_millis(300),
        receive_timeout,
        active_peer: "127.0.0.1".parse().unwrap(),
        standby,
        ..Default::default()
    }
}

#[test]
fn silent_active_gets_majority_and_passive_nothing() {
    let batch = readings(100);
    let harness = start(
        config(StandbyPolicy::Reserve, Duration::from_millis(400)),
        batch.clone(),
    );
    // Same host for both, so arrival order decides the active unit.
    let active = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);
    let passive = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);

    let share = active.join().unwrap().share();
    assert_eq!(share.len(), 67);
    assert_eq!(meter_ids(&share), meter_ids(&batch.slice(33..100)));
    assert!(matches!(passive.join().unwrap(), Received::Nothing));

    let report = harness.dispatcher.join().unwrap();
    assert_eq!(report.records, 100);
    assert_eq!(report.retained, 33);
    assert_eq!(report.undelivered, 0);
    assert!(!report.failover);
    assert_eq!(report.peer(Role::Active).unwrap().outcome, Some(Outcome::Silent));
    assert_eq!(report.peer(Role::Passive).unwrap().outcome, None);
    assert_eq!(report.peer(Role::Passive).unwrap().delivery, Delivery::Closed);
    assert_eq!(
        harness
            .metrics
            .pushes
            .with_label_values(&["active", "majority"])
            .get(),
        1
    );
}

#[test]
fn breakdown_fails_over_to_passive_immediately() {
    let batch = readings(100);
    let receive_timeout = Duration::from_secs(10);
    let harness = start(config(StandbyPolicy::Reserve, receive_timeout), batch.clone());
    let started = Instant::now();
    let active = fake_unit(
        TcpStream::connect(harness.addr).unwrap(),
        Some(Duration::from_millis(200)),
    );
    let passive = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);

    let share = passive.join().unwrap().share();
    assert_eq!(meter_ids(&share), meter_ids(&batch));
    assert!(matches!(active.join().unwrap(), Received::Nothing));

    let report = harness.dispatcher.join().unwrap();
    assert!(started.elapsed() < receive_timeout / 2, "failover waited for the window");
    assert!(report.failover);
    assert_eq!(report.retained, 0);
    assert_eq!(report.undelivered, 0);
    assert_eq!(report.pushed(), 100);
    assert_eq!(report.peer(Role::Active).unwrap().outcome, Some(Outcome::Breakdown));
    assert!(matches!(
        report.peer(Role::Passive).unwrap().delivery,
        Delivery::Pushed {
            share: ShareKind::Combined,
            records: 100,
            ..
        }
    ));
    assert_eq!(harness.metrics.failovers.get(), 1);
}

#[test]
fn active_hanging_up_counts_as_breakdown() {
    let batch = readings(30);
    let harness = start(
        config(StandbyPolicy::Reserve, Duration::from_secs(5)),
        batch,
    );
    let active = TcpStream::connect(harness.addr).unwrap();
    let passive = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);
    thread::sleep(Duration::from_millis(100));
    drop(active);

    assert_eq!(passive.join().unwrap().share().len(), 30);
    let report = harness.dispatcher.join().unwrap();
    assert_eq!(report.peer(Role::Active).unwrap().outcome, Some(Outcome::HungUp));
    assert!(report.failover);
}

#[test]
fn share_policy_gives_passive_the_minority() {
    let batch = readings(100);
    let harness = start(
        config(StandbyPolicy::Share, Duration::from_millis(400)),
        batch.clone(),
    );
    let active = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);
    let passive = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);

    let majority = active.join().unwrap().share();
    let minority = passive.join().unwrap().share();
    assert_eq!(minority.len(), 33);
    assert_eq!(majority.len(), 67);
    assert_eq!(meter_ids(&minority.concat(majority)), meter_ids(&batch));

    let report = harness.dispatcher.join().unwrap();
    assert_eq!(report.retained, 0);
    assert_eq!(report.pushed(), 100);
}

#[test]
fn share_policy_passive_breakdown_sends_everything_to_active() {
    let batch = readings(100);
    let harness = start(
        config(StandbyPolicy::Share, Duration::from_secs(10)),
        batch.clone(),
    );
    let active = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);
    let passive = fake_unit(
        TcpStream::connect(harness.addr).unwrap(),
        Some(Duration::from_millis(100)),
    );

    assert_eq!(meter_ids(&active.join().unwrap().share()), meter_ids(&batch));
    assert!(matches!(passive.join().unwrap(), Received::Nothing));
    assert!(harness.dispatcher.join().unwrap().failover);
}

#[test]
fn sole_unit_gets_the_combined_share() {
    let batch = readings(10);
    let harness = start(
        config(StandbyPolicy::Reserve, Duration::from_millis(200)),
        batch.clone(),
    );
    let sole = fake_unit(TcpStream::connect(harness.addr).unwrap(), None);

    assert_eq!(meter_ids(&sole.join().unwrap().share()), meter_ids(&batch));
    let report = harness.dispatcher.join().unwrap();
    assert_eq!(report.peers.len(), 1);
    assert_eq!(report.peers[0].role, Role::Sole);
    assert_eq!(report.retained, 0);
}

#[test]
fn sole_unit_breaking_down_leaves_batch_undelivered() {
    let harness = start(
        config(StandbyPolicy::Reserve, Duration::from_secs(5)),
        readings(12),
    );
    let sole = fake_unit(
        TcpStream::connect(harness.addr).unwrap(),
        Some(Duration::from_millis(50)),
    );

    assert!(matches!(sole.join().unwrap(), Received::Nothing));
    let report = harness.dispatcher.join().unwrap();
    assert_eq!(report.undelivered, 12);
    assert_eq!(report.pushed(), 0);
    assert!(!report.failover);
}

#[test]
fn unrecognized_traffic_does_not_end_the_window() {
    let batch = readings(9);
    let harness = start(
        config(StandbyPolicy::Reserve, Duration::from_millis(400)),
        batch,
    );
    let mut chatty = TcpStream::connect(harness.addr).unwrap();
    std::io::Write::write_all(&mut chatty, b"hello").unwrap();
    let active = fake_unit(chatty, None);

    assert_eq!(active.join().unwrap().share().len(), 9);
    let report = harness.dispatcher.join().unwrap();
    assert_eq!(report.peers[0].outcome, Some(Outcome::Silent));
}
