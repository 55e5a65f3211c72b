use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;

/// Counts a multiplexed client for as long as it is registered with an endpoint.
#[derive(Debug)]
pub struct ActiveClientGuard {
    mode: &'static str,
}

impl ActiveClientGuard {
    pub fn new(mode: &'static str) -> Self {
        metrics::counter!("tunneler_clients_total", "mode" => mode).increment(1);
        metrics::gauge!("tunneler_active_clients", "mode" => mode).increment(1.0);
        Self { mode }
    }
}

impl Drop for ActiveClientGuard {
    fn drop(&mut self) {
        metrics::gauge!("tunneler_active_clients", "mode" => self.mode).decrement(1.0);
    }
}

pub fn record_bytes_out(n: usize) {
    metrics::counter!("tunneler_bytes_out_total").increment(n as u64);
}

pub fn record_bytes_in(n: usize) {
    metrics::counter!("tunneler_bytes_in_total").increment(n as u64);
}

pub fn record_dial_failure() {
    metrics::counter!("tunneler_dial_failures_total").increment(1);
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
