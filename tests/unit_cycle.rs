use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use meterflow::broker::Broker;
use meterflow::broker::Role;
use meterflow::config::DispatcherConfig;
use meterflow::config::ProbeConfig;
use meterflow::config::StandbyPolicy;
use meterflow::config::UnitConfig;
use meterflow::dispatcher::CycleReport;
use meterflow::dispatcher::Dispatcher;
use meterflow::dispatcher::Outcome;
use meterflow::metrics::Metrics;
use meterflow::record::Batch;
use meterflow::record::BatchId;
use meterflow::record::Record;
use meterflow::recovery::ArtifactName;
use meterflow::recovery::CheckpointStore;
use meterflow::unit::Unit;
use meterflow::unit::UnitOutcome;

fn readings(n: usize) -> Batch {
    Batch::new(
        (0..n)
            .map(|i| {
                Record::from_iter([
                    ("compteur_id", format!("{}", 300_000 + i)),
                    ("timestamp", "2024-05-01 08:00:00".to_string()),
                    ("consommation", format!("{}.5 kWh", i % 10)),
                    ("type_client", "residentiel".to_string()),
                    ("wilaya", "Oran".to_string()),
                    ("ville", "Es Senia".to_string()),
                    ("localisation", "35.6476,-0.6209".to_string()),
                    ("region", "Ouest".to_string()),
                    ("code_postal", "31100".to_string()),
                    ("fournisseur", "Sonelgaz".to_string()),
                    ("tarif", "0.12".to_string()),
                    ("puissance_souscrite", "6 kW".to_string()),
                    ("type_compteur", "Smart Meter Gen 2".to_string()),
                ])
            })
            .collect(),
    )
}

fn start_dispatcher(
    standby: StandbyPolicy,
    receive_timeout: Duration,
    batch: Batch,
) -> (SocketAddr, JoinHandle<CycleReport>) {
    let config = DispatcherConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        accept_timeout: Duration::from_secs(2),
        receive_timeout,
        active_peer: "127.0.0.1".parse().unwrap(),
        standby,
        ..Default::default()
    };
    let broker = Broker::bind(config.listen, config.accept_timeout, config.active_peer).unwrap();
    let addr = broker.local_addr().unwrap();
    let dispatcher = Dispatcher::new(config, Metrics::new().unwrap());
    let handle = thread::spawn(move || dispatcher.serve(&broker, batch).unwrap());
    (addr, handle)
}

fn unit(dispatcher: SocketAddr, checkpoint_dir: &Path, simulate_breakdown: bool) -> Unit {
    let config = UnitConfig {
        dispatcher,
        checkpoint_dir: checkpoint_dir.to_path_buf(),
        probe: ProbeConfig::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap(),
        simulate_breakdown,
        ..Default::default()
    };
    Unit::new(config, Metrics::new().unwrap()).unwrap()
}

fn spawn_unit(unit: Unit) -> JoinHandle<UnitOutcome> {
    thread::spawn(move || {
        let report = unit.run().unwrap();
        assert!(report.recovered.is_empty());
        report.cycle
    })
}

#[test]
fn breakdown_hands_the_whole_batch_to_the_other_unit() {
    let batch = readings(12);
    let id = BatchId::from_payload(&batch.to_csv().unwrap());
    let (addr, dispatcher) =
        start_dispatcher(StandbyPolicy::Reserve, Duration::from_secs(10), batch);

    // Connects first, so it is the active unit.
    let broken_dir = tempfile::tempdir().unwrap();
    let broken = unit(addr, broken_dir.path(), true).run().unwrap();
    assert_eq!(broken.cycle, UnitOutcome::SignalledBreakdown);

    let healthy_dir = tempfile::tempdir().unwrap();
    let healthy = unit(addr, healthy_dir.path(), false);
    let store = Arc::clone(healthy.store());
    let outcome = spawn_unit(healthy).join().unwrap();
    assert_eq!(
        outcome,
        UnitOutcome::Delivered {
            batch: id,
            records: 12,
            rejected: 0,
            anomalies: 0,
            artifact: "output.csv".to_string(),
        }
    );
    assert!(store.exists(ArtifactName::Output, id).unwrap());

    let report = dispatcher.join().unwrap();
    assert!(report.failover);
    assert_eq!(report.peer(Role::Active).unwrap().outcome, Some(Outcome::Breakdown));
    assert_eq!(report.pushed(), 12);
}

#[test]
fn healthy_pair_under_reserve_leaves_passive_idle() {
    let batch = readings(12);
    let majority = batch.slice(4..12);
    let id = BatchId::from_payload(&majority.to_csv().unwrap());
    let (addr, dispatcher) =
        start_dispatcher(StandbyPolicy::Reserve, Duration::from_millis(300), batch);

    let active_dir = tempfile::tempdir().unwrap();
    let active = spawn_unit(unit(addr, active_dir.path(), false));
    thread::sleep(Duration::from_millis(200));
    let passive_dir = tempfile::tempdir().unwrap();
    let passive = spawn_unit(unit(addr, passive_dir.path(), false));

    assert_eq!(passive.join().unwrap(), UnitOutcome::NothingAssigned);
    assert!(matches!(
        active.join().unwrap(),
        UnitOutcome::Delivered { batch, records: 8, ref artifact, .. }
            if batch == id && artifact == "output.csv"
    ));
    let report = dispatcher.join().unwrap();
    assert!(!report.failover);
    assert_eq!(report.retained, 4);
}
