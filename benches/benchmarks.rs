use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion};

use meterflow::metrics::Metrics;
use meterflow::pipeline::Pipeline;
use meterflow::pipeline::WorkerPool;
use meterflow::record::Batch;
use meterflow::record::BatchId;
use meterflow::record::Record;
use meterflow::recovery::store::InMemStore;
use meterflow::recovery::CheckpointStore;
use meterflow::recovery::Checkpointer;

fn readings(n: usize) -> Batch {
    Batch::new(
        (0..n)
            .map(|i| {
                let meter = format!("{:06}", 100_000 + i);
                let consumption = format!("{}.{} kWh", i % 90, i % 10);
                Record::from_iter([
                    ("compteur_id", meter.as_str()),
                    ("timestamp", "2024-05-01 08:00:00"),
                    ("consommation", consumption.as_str()),
                    ("type_client", "residentiel"),
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
            })
            .collect(),
    )
}

fn bench_pipeline(b: &mut Bencher, workers: usize, batch: &Batch) {
    let metrics = Metrics::new().unwrap();
    let pipeline = Pipeline::standard(WorkerPool::new(workers).unwrap(), metrics).unwrap();
    let id = BatchId::from_payload(&batch.to_csv().unwrap());

    b.iter(|| {
        let store: Arc<dyn CheckpointStore> = Arc::new(InMemStore::new());
        let ckpt = Checkpointer::new(store, id);
        pipeline.run(&ckpt, batch.clone()).unwrap()
    });
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let batch = readings(10_000);

    let mut group = c.benchmark_group("pipeline");
    for workers in [1, 2, 4] {
        group.bench_function(BenchmarkId::new("standard", workers), |b| {
            bench_pipeline(b, workers, &batch);
        });
    }
    group.finish();

    c.bench_function("csv_encode", |b| b.iter(|| batch.to_csv().unwrap()));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
