use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref RECONCILE_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("jobbatch_reconcile_total", "Reconciliations by result."),
        &["result"]
    )
    .expect("valid metric definition");
    pub static ref CHILD_JOBS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "jobbatch_child_jobs_created_total",
        "Total number of child jobs created."
    )
    .expect("valid metric definition");
    pub static ref BATCHES_COMPLETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("jobbatch_batches_completed_total", "Batches marked complete, by outcome."),
        &["outcome"]
    )
    .expect("valid metric definition");
    pub static ref QUEUE_DEPTH: IntGauge = IntGauge::new(
        "jobbatch_queue_depth",
        "Keys waiting in the work queue."
    )
    .expect("valid metric definition");
    pub static ref QUEUE_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "jobbatch_queue_retries_total",
        "Keys requeued with backoff after a failed reconciliation."
    )
    .expect("valid metric definition");
}

/// Register every controller metric with [`REGISTRY`]. Call once at startup.
pub fn register_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(RECONCILE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CHILD_JOBS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(BATCHES_COMPLETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(QUEUE_RETRIES_TOTAL.clone()))?;
    Ok(())
}

// Text exposition format
pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# failed to encode metrics: {}\n", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
