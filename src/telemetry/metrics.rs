//! Prometheus recorder installation and named counters.
//!
//! The edge that would expose `/metrics` over HTTP is external to this
//! crate (§1); installing the recorder here still makes every `counter!`/
//! `histogram!` call below live for whatever operator surface wraps this
//! engine, the same way the rest of this codebase installs its recorder
//! once at startup.

use metrics_exporter_prometheus::PrometheusBuilder;

pub fn install_recorder() -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .install()
        .map_err(|e| anyhow::anyhow!("failed to install prometheus recorder: {e}"))
}

pub fn record_duplicate_dropped() {
    metrics::counter!("ims_ingest_duplicate_dropped_total").increment(1);
}

pub fn record_gap_detected() {
    metrics::counter!("ims_ingest_gap_detected_total").increment(1);
}

pub fn record_decode_failure() {
    metrics::counter!("ims_ingest_decode_failure_total").increment(1);
}

pub fn record_position_invalid() {
    metrics::counter!("ims_position_invalid_total").increment(1);
}

pub fn record_validation(status: &'static str) {
    metrics::counter!("ims_validation_total", "status" => status).increment(1);
}

pub fn record_locate_decision(state: &'static str) {
    metrics::counter!("ims_locate_decision_total", "state" => state).increment(1);
}
