// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use std::sync::OnceLock;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs + metrics)
pub fn init_telemetry() {
    // 1. Logs
    let installed = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "concord_node=debug,concord_cli=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }

    // 2. Metrics (Prometheus)
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROM_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
            }
        }
        Err(e) => {
            tracing::warn!("Prometheus recorder not installed: {}", e);
            return;
        }
    }

    metrics::describe_counter!("concord_entries_applied_total", "Committed entries applied by the state machine");
    metrics::describe_counter!("concord_entries_rejected_total", "Entries whose result carried a nonzero code");
    metrics::describe_counter!("concord_proposal_retries_total", "Proposal or read attempts that failed and were retried");
    metrics::describe_counter!("concord_broadcast_failures_total", "Subscriber publishes that failed during a broadcast");
    metrics::describe_histogram!("concord_update_batch_seconds", "Time taken to apply and commit one update batch");
    metrics::describe_gauge!("concord_applied_index", "Last durably applied log index");
    metrics::describe_gauge!("concord_leader_replica", "Replica id of the current shard leader");
    metrics::describe_gauge!("concord_subscriptions_active", "Registered subscriptions per topic");

    metrics::gauge!("concord_node_up", 1.0);
}

/// Render metrics in Prometheus exposition format.
pub fn render_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
