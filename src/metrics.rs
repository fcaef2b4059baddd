//! Prometheus metrics
//!
//! Registered on the default registry the first time they are touched and
//! exposed by the `/metrics` server in `main`.

use prometheus::{IntCounterVec, IntGaugeVec, Opts};
use std::sync::OnceLock;
use tracing::warn;

pub struct Metrics {
    /// `directpv_reconcile_total{resource,result}`
    pub reconcile_total: IntCounterVec,
    /// `directpv_drives{status}`
    pub drives: IntGaugeVec,
    /// `directpv_volume_stage_total{result}`
    pub volume_stage_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    match prometheus::register_int_counter_vec!(name, help, labels) {
        Ok(c) => c,
        Err(e) => {
            warn!(metric = name, error = %e, "metric registration failed");
            // Labels and name are static, so construction cannot fail here.
            IntCounterVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|_| unreachable!("static metric options"))
        }
    }
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    match prometheus::register_int_gauge_vec!(name, help, labels) {
        Ok(g) => g,
        Err(e) => {
            warn!(metric = name, error = %e, "metric registration failed");
            IntGaugeVec::new(Opts::new(name, help), labels)
                .unwrap_or_else(|_| unreachable!("static metric options"))
        }
    }
}

/// Process-wide metric handles
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(|| Metrics {
        reconcile_total: counter_vec(
            "directpv_reconcile_total",
            "Reconcile attempts by resource and result",
            &["resource", "result"],
        ),
        drives: gauge_vec(
            "directpv_drives",
            "Drives on this node by status",
            &["status"],
        ),
        volume_stage_total: counter_vec(
            "directpv_volume_stage_total",
            "NodeStageVolume calls by result",
            &["result"],
        ),
    })
}

/// Count one reconcile of `resource` ending in `result`
pub fn record_reconcile(resource: &str, result: &str) {
    metrics()
        .reconcile_total
        .with_label_values(&[resource, result])
        .inc();
}

/// Count one stage call
pub fn record_stage(ok: bool) {
    let result = if ok { "success" } else { "error" };
    metrics().volume_stage_total.with_label_values(&[result]).inc();
}
