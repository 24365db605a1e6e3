//! Process metrics in the Prometheus exposition format.
//!
//! Each process owns one [`Metrics`] with its own registry and hands
//! an [`Arc`] of it to the components that record into it. The
//! optional [`crate::webserver`] renders the registry on `/metrics`.

use std::sync::Arc;

use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;

use crate::errors::Result;

const NAMESPACE: &str = "meterflow";

pub struct Metrics {
    registry: Registry,
    pub records_rejected: IntCounter,
    pub record_anomalies: IntCounter,
    pub stage_duration: HistogramVec,
    pub pushes: IntCounterVec,
    pub failovers: IntCounter,
    pub recoveries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new_custom(Some(NAMESPACE.to_string()), None)?;

        let records_rejected = IntCounter::new(
            "records_rejected_total",
            "Records dropped because validation reported errors",
        )?;
        let record_anomalies = IntCounter::new(
            "record_anomalies_total",
            "Advisory anomalies reported by validation",
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new("stage_duration_seconds", "Wall time to run one stage over a batch")
                .buckets(vec![
                    0.0, 0.0005, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5,
                    5.0, 7.5, 10.0,
                ]),
            &["stage"],
        )?;
        let pushes = IntCounterVec::new(
            Opts::new("pushes_total", "Shares pushed to units"),
            &["role", "share"],
        )?;
        let failovers = IntCounter::new(
            "failovers_total",
            "Cycles where a share was re-routed after a unit broke down",
        )?;
        let recoveries = IntCounterVec::new(
            Opts::new("recoveries_total", "Recovery planner decisions"),
            &["decision"],
        )?;

        registry.register(Box::new(records_rejected.clone()))?;
        registry.register(Box::new(record_anomalies.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(pushes.clone()))?;
        registry.register(Box::new(failovers.clone()))?;
        registry.register(Box::new(recoveries.clone()))?;

        Ok(Arc::new(Self {
            registry,
            records_rejected,
            record_anomalies,
            stage_duration,
            pushes,
            failovers,
            recoveries,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the text exposition format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }
}

pub(crate) fn render(registry: &Registry) -> Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[test]
fn render_includes_namespaced_counters() {
    let metrics = Metrics::new().unwrap();
    metrics.records_rejected.inc_by(3);
    metrics
        .pushes
        .with_label_values(&["active", "majority"])
        .inc();
    let text = metrics.render().unwrap();
    assert!(text.contains("meterflow_records_rejected_total 3"), "got: {text}");
    assert!(
        text.contains("meterflow_pushes_total{role=\"active\",share=\"majority\"} 1"),
        "got: {text}"
    );
}

#[test]
fn with_timer_records_one_observation() {
    let metrics = Metrics::new().unwrap();
    let value = crate::with_timer!(metrics.stage_duration, &["validation"], 40 + 2);
    assert_eq!(value, 42);
    let count = metrics
        .stage_duration
        .with_label_values(&["validation"])
        .get_sample_count();
    assert_eq!(count, 1);
}
