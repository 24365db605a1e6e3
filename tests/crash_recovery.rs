use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meterflow::config::ProbeConfig;
use meterflow::config::StoreBackend;
use meterflow::config::UnitConfig;
use meterflow::errors::Error;
use meterflow::metrics::Metrics;
use meterflow::pipeline::Pipeline;
use meterflow::pipeline::StageKind;
use meterflow::pipeline::WorkerPool;
use meterflow::record::Batch;
use meterflow::record::BatchId;
use meterflow::record::Record;
use meterflow::recovery::store;
use meterflow::recovery::store::FsStore;
use meterflow::recovery::ArtifactName;
use meterflow::recovery::BatchState;
use meterflow::recovery::CheckpointStore;
use meterflow::recovery::Checkpointer;
use meterflow::recovery::RecoveryPlan;
use meterflow::recovery::RecoveryPlanner;
use meterflow::unit::Unit;
use meterflow::unit::UnitOutcome;

fn reading(meter: &str, consumption: &str, client: &str) -> Record {
    Record::from_iter([
        ("compteur_id", meter),
        ("timestamp", "2024-05-01 08:00:00"),
        ("consommation", consumption),
        ("type_client", client),
        ("wilaya", "Alger"),
        ("ville", "Bab Ezzouar"),
        ("localisation", "36.7268,3.1829"),
        ("region", "Nord"),
        ("code_postal", "16024"),
        ("fournisseur", "Sonelgaz"),
        ("tarif", "0.12"),
        ("puissance_souscrite", "6 kW"),
        ("type_compteur", "Smart Meter Gen 2"),
    ])
}

fn input() -> Batch {
    Batch::new(vec![
        reading("200001", "1500 wh", "residentiel"),
        reading("2000x2", "3 kWh", "residentiel"),
        reading("200003", "7.25 kWh", "Industriel"),
        reading("200004", "-4 kWh", "commercial"),
        reading("200005", "0.8 kWh", "COMMERCIAL"),
    ])
}

fn batch_id(batch: &Batch) -> BatchId {
    BatchId::from_payload(&batch.to_csv().unwrap())
}

fn pipeline(metrics: &Arc<Metrics>) -> Pipeline {
    Pipeline::standard(WorkerPool::new(2).unwrap(), metrics.clone()).unwrap()
}

fn planner(store: Arc<dyn CheckpointStore>, metrics: &Arc<Metrics>, window_ms: u64) -> RecoveryPlanner {
    let probe = ProbeConfig::new(Duration::from_millis(window_ms), Duration::from_millis(10)).unwrap();
    RecoveryPlanner::new(store, probe, metrics.clone())
}

#[test]
fn takeover_after_validation_matches_full_run() {
    let metrics = Metrics::new().unwrap();
    let batch = input();
    let id = batch_id(&batch);

    let full_dir = tempfile::tempdir().unwrap();
    let full_store: Arc<dyn CheckpointStore> = Arc::new(FsStore::new(full_dir.path()));
    let full = pipeline(&metrics)
        .run(&Checkpointer::new(full_store.clone(), id), batch)
        .unwrap();
    assert_eq!(full.batch.len(), 3);
    assert_eq!(full.rejections.len(), 2);

    // The producer died right after writing its validation artifact.
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FsStore::new(dir.path()));
    let validated = full_store
        .read(ArtifactName::Stage(StageKind::Validation), id)
        .unwrap();
    store
        .write(ArtifactName::Stage(StageKind::Validation), id, &validated)
        .unwrap();

    let planner = planner(store.clone(), &metrics, 100);
    let plan = planner.plan(id).unwrap();
    assert_eq!(
        plan,
        RecoveryPlan::TakeOver {
            from: StageKind::Validation
        }
    );
    let recovered = planner.take_over(id, StageKind::Validation, &pipeline(&metrics)).unwrap();

    assert_eq!(recovered.artifact, ArtifactName::RecoveredOutput);
    assert_eq!(recovered.batch.records(), full.batch.records());
    assert_eq!(
        store.read(ArtifactName::RecoveredOutput, id).unwrap().records(),
        full.batch.records()
    );
    // Remaining stages ran without checkpoints of their own.
    assert!(!store
        .exists(ArtifactName::Stage(StageKind::Normalization), id)
        .unwrap());
    assert_eq!(
        BatchState::inspect(store.as_ref(), id).unwrap(),
        BatchState::Delivered
    );
}

#[test]
fn live_producer_is_left_alone() {
    let metrics = Metrics::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FsStore::new(dir.path()));
    let batch = input();
    let id = batch_id(&batch);
    store
        .write(ArtifactName::Stage(StageKind::Validation), id, &batch)
        .unwrap();

    let producer = {
        let store = store.clone();
        let batch = batch.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            store
                .write(ArtifactName::Stage(StageKind::Normalization), id, &batch)
                .unwrap();
        })
    };

    let plan = planner(store.clone(), &metrics, 2_000).plan(id).unwrap();
    producer.join().unwrap();
    assert_eq!(
        plan,
        RecoveryPlan::Alive {
            reached: ArtifactName::Stage(StageKind::Normalization)
        }
    );
    assert!(!store.exists(ArtifactName::RecoveredOutput, id).unwrap());
    assert_eq!(
        metrics.recoveries.with_label_values(&["alive"]).get(),
        1
    );
}

#[test]
fn corrupt_artifact_stops_recovery() {
    let metrics = Metrics::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let fs = FsStore::new(dir.path());
    let id = batch_id(&input());
    let path = fs.artifact_path(ArtifactName::Stage(StageKind::Validation), id);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "compteur_id,timestamp\n200001\n").unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(fs);

    let planner = planner(store.clone(), &metrics, 50);
    let plan = planner.plan(id).unwrap();
    let RecoveryPlan::TakeOver { from } = plan else {
        panic!("expected a takeover, got {plan:?}");
    };
    let err = planner.take_over(id, from, &pipeline(&metrics)).unwrap_err();
    assert!(matches!(err, Error::CorruptArtifact { .. }), "got: {err}");
    assert!(!store.exists(ArtifactName::RecoveredOutput, id).unwrap());

    let config = UnitConfig {
        checkpoint_dir: dir.path().to_path_buf(),
        probe: ProbeConfig::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap(),
        ..Default::default()
    };
    let unit = Unit::new(config, metrics).unwrap();
    assert!(matches!(
        unit.recover_all(),
        Err(Error::CorruptArtifact { .. })
    ));
}

#[test]
fn finished_transformation_is_delivered_as_recovered_output() {
    let metrics = Metrics::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FsStore::new(dir.path()));
    let batch = input();
    let id = batch_id(&batch);

    // A run that died between its last checkpoint and its output.
    let full = pipeline(&metrics)
        .run(&Checkpointer::new(store.clone(), id), batch)
        .unwrap();
    std::fs::remove_file(FsStore::new(dir.path()).artifact_path(ArtifactName::Output, id)).unwrap();

    let planner = planner(store.clone(), &metrics, 50);
    assert_eq!(
        planner.plan(id).unwrap(),
        RecoveryPlan::TakeOver {
            from: StageKind::Transformation
        }
    );
    let recovered = planner
        .take_over(id, StageKind::Transformation, &pipeline(&metrics))
        .unwrap();
    assert_eq!(recovered.batch.records(), full.batch.records());
    assert!(store.exists(ArtifactName::RecoveredOutput, id).unwrap());
}

#[test]
fn checkpoints_never_skip_a_stage() {
    let metrics = Metrics::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn CheckpointStore> = Arc::new(FsStore::new(dir.path()));
    let batch = input();
    let id = batch_id(&batch);

    let ckpt = Checkpointer::new(store.clone(), id);
    let err = ckpt
        .checkpoint(StageKind::Normalization, &batch)
        .unwrap_err();
    assert!(matches!(err, Error::StageOrder { .. }), "got: {err}");
    assert!(store.batches().unwrap().is_empty());

    pipeline(&metrics)
        .run(&Checkpointer::new(store.clone(), id), batch)
        .unwrap();
    let mut files: Vec<String> = std::fs::read_dir(dir.path().join(id.to_string()))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(
        files,
        vec![
            "output.csv",
            "stage_1_validation.csv",
            "stage_2_normalization.csv",
            "stage_3_transformation.csv",
        ]
    );
}

#[test]
fn sqlite_backend_supports_takeover() {
    let metrics = Metrics::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = store::open(StoreBackend::Sqlite, dir.path()).unwrap();
    let batch = input();
    let id = batch_id(&batch);
    store
        .write(ArtifactName::Stage(StageKind::Validation), id, &batch)
        .unwrap();

    let planner = planner(store.clone(), &metrics, 50);
    let RecoveryPlan::TakeOver { from } = planner.plan(id).unwrap() else {
        panic!("expected a takeover");
    };
    let out = planner.take_over(id, from, &pipeline(&metrics)).unwrap();
    assert_eq!(out.artifact, ArtifactName::RecoveredOutput);

    // Reopening sees the same state.
    drop(planner);
    drop(store);
    let store = store::open(StoreBackend::Sqlite, dir.path()).unwrap();
    assert_eq!(store.batches().unwrap(), vec![id]);
    assert_eq!(
        BatchState::inspect(store.as_ref(), id).unwrap(),
        BatchState::Delivered
    );
}

#[test]
fn unit_resumes_a_redelivered_share() {
    let metrics = Metrics::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let batch = input();
    let id = batch_id(&batch);
    let config = UnitConfig {
        checkpoint_dir: dir.path().to_path_buf(),
        probe: ProbeConfig::new(Duration::from_millis(50), Duration::from_millis(10)).unwrap(),
        ..Default::default()
    };
    let unit = Unit::new(config, metrics).unwrap();
    unit.store()
        .write(ArtifactName::Stage(StageKind::Validation), id, &batch)
        .unwrap();

    let outcome = unit.process(id, batch).unwrap();
    assert!(matches!(
        outcome,
        UnitOutcome::Delivered { ref artifact, .. } if artifact == "output_recovered.csv"
    ));
}
