//! Prometheus metrics for the queue.
//!
//! Initialize once at startup and hand clones to the shard and processor:
//! ```ignore
//! let metrics = shoal::metrics::init()?;
//! shoal::metrics::run_metrics_server(addr, metrics.clone(), shutdown_rx).await;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use tokio::sync::broadcast;
use tracing::{debug, error};

/// Buckets for queue latency (enqueue to lease), in seconds
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0,
];

const PEEK_SIZE_BUCKETS: &[f64] = &[0.0, 1.0, 5.0, 10.0, 50.0, 100.0, 300.0, 1000.0, 5000.0];

/// Metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    items_enqueued: CounterVec,
    items_leased: CounterVec,
    items_dequeued: CounterVec,
    items_requeued: CounterVec,
    items_scavenged: CounterVec,
    items_refilled: CounterVec,
    items_normalized: CounterVec,
    lease_constraints: CounterVec,
    refills: CounterVec,
    active_set_removals: CounterVec,
    continuations: CounterVec,
    shadow_partitions_processed: CounterVec,
    script_conflicts: CounterVec,
    item_latency: HistogramVec,
    peek_size: HistogramVec,
    account_leases: GaugeVec,
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// `route` is either "ready" or "backlog".
    pub fn record_enqueue(&self, shard: &str, kind: &str, route: &str) {
        self.items_enqueued
            .with_label_values(&[shard, kind, route])
            .inc();
    }

    pub fn record_lease(&self, shard: &str, latency_secs: f64) {
        self.items_leased.with_label_values(&[shard]).inc();
        self.item_latency
            .with_label_values(&[shard])
            .observe(latency_secs.max(0.0));
    }

    pub fn record_lease_constraint(&self, shard: &str, constraint: &str) {
        self.lease_constraints
            .with_label_values(&[shard, constraint])
            .inc();
    }

    pub fn record_dequeue(&self, shard: &str) {
        self.items_dequeued.with_label_values(&[shard]).inc();
    }

    pub fn record_requeue(&self, shard: &str, reason: &str) {
        self.items_requeued.with_label_values(&[shard, reason]).inc();
    }

    pub fn record_scavenged(&self, shard: &str, count: u64) {
        self.items_scavenged
            .with_label_values(&[shard])
            .inc_by(count as f64);
    }

    pub fn record_refill(&self, shard: &str, constraint: &str, refilled: u64) {
        self.refills.with_label_values(&[shard, constraint]).inc();
        self.items_refilled
            .with_label_values(&[shard])
            .inc_by(refilled as f64);
    }

    pub fn record_normalized(&self, shard: &str, count: u64) {
        self.items_normalized
            .with_label_values(&[shard])
            .inc_by(count as f64);
    }

    /// `dimension` is "account", "partition" or "custom_key".
    pub fn record_active_set_removal(&self, shard: &str, dimension: &str, count: u64) {
        self.active_set_removals
            .with_label_values(&[shard, dimension])
            .inc_by(count as f64);
    }

    /// `kind` is "ready" or "shadow"; `event` describes what happened to the entry.
    pub fn record_continuation(&self, kind: &str, event: &str) {
        self.continuations.with_label_values(&[kind, event]).inc();
    }

    pub fn record_shadow_partition_processed(&self, shard: &str, outcome: &str) {
        self.shadow_partitions_processed
            .with_label_values(&[shard, outcome])
            .inc();
    }

    pub fn record_script_conflict(&self, script: &str) {
        self.script_conflicts.with_label_values(&[script]).inc();
    }

    pub fn record_peek_size(&self, shard: &str, kind: &str, size: usize) {
        self.peek_size
            .with_label_values(&[shard, kind])
            .observe(size as f64);
    }

    pub fn set_account_leases(&self, shard: &str, count: usize) {
        self.account_leases
            .with_label_values(&[shard])
            .set(count as f64);
    }
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> anyhow::Result<CounterVec> {
    Ok(register(
        registry,
        CounterVec::new(Opts::new(name, help), labels)?,
    ))
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let items_enqueued = counter(
        &registry,
        "shoal_items_enqueued_total",
        "Total number of queue items enqueued",
        &["shard", "kind", "route"],
    )?;
    let items_leased = counter(
        &registry,
        "shoal_items_leased_total",
        "Total number of queue items leased for execution",
        &["shard"],
    )?;
    let items_dequeued = counter(
        &registry,
        "shoal_items_dequeued_total",
        "Total number of queue items removed after completion",
        &["shard"],
    )?;
    let items_requeued = counter(
        &registry,
        "shoal_items_requeued_total",
        "Total number of queue items put back for a later attempt",
        &["shard", "reason"],
    )?;
    let items_scavenged = counter(
        &registry,
        "shoal_items_scavenged_total",
        "Total number of expired leases reclaimed by the scavenger",
        &["shard"],
    )?;
    let items_refilled = counter(
        &registry,
        "shoal_items_refilled_total",
        "Total number of items moved from backlogs into ready queues",
        &["shard"],
    )?;
    let items_normalized = counter(
        &registry,
        "shoal_items_normalized_total",
        "Total number of items moved out of outdated backlogs",
        &["shard"],
    )?;
    let lease_constraints = counter(
        &registry,
        "shoal_lease_constraints_total",
        "Item leases rejected by a concurrency or throttle constraint",
        &["shard", "constraint"],
    )?;
    let refills = counter(
        &registry,
        "shoal_backlog_refills_total",
        "Backlog refill attempts by limiting constraint",
        &["shard", "constraint"],
    )?;
    let active_set_removals = counter(
        &registry,
        "shoal_active_set_removals_total",
        "Stale entries removed from active sets by the active checker",
        &["shard", "dimension"],
    )?;
    let continuations = counter(
        &registry,
        "shoal_continuations_total",
        "Continuation map events",
        &["kind", "event"],
    )?;
    let shadow_partitions_processed = counter(
        &registry,
        "shoal_shadow_partitions_processed_total",
        "Shadow partitions processed by the shadow scanner",
        &["shard", "outcome"],
    )?;
    let script_conflicts = counter(
        &registry,
        "shoal_script_conflicts_total",
        "Script transactions that hit a write conflict and were retried",
        &["script"],
    )?;

    let item_latency = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "shoal_item_latency_seconds",
                "Time between an item becoming runnable and being leased",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["shard"],
        )?,
    );
    let peek_size = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new("shoal_peek_size", "Number of entries returned by peeks")
                .buckets(PEEK_SIZE_BUCKETS.to_vec()),
            &["shard", "kind"],
        )?,
    );
    let account_leases = register(
        &registry,
        GaugeVec::new(
            Opts::new(
                "shoal_guaranteed_capacity_leases",
                "Guaranteed-capacity account leases held by this process",
            ),
            &["shard"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        items_enqueued,
        items_leased,
        items_dequeued,
        items_requeued,
        items_scavenged,
        items_refilled,
        items_normalized,
        lease_constraints,
        refills,
        active_set_removals,
        continuations,
        shadow_partitions_processed,
        script_conflicts,
        item_latency,
        peek_size,
        account_leases,
    })
}

impl Metrics {
    /// Current values in the Prometheus text exposition format.
    pub fn render(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

async fn scrape(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, TextEncoder::new().format_type().to_string())], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve `/metrics` on `addr` until `shutdown` fires or its sender is dropped.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Metrics,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    debug!(addr = %addr, "serving metrics");
    let app = Router::new().route("/metrics", get(scrape)).with_state(metrics);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    debug!("metrics server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_values() {
        let metrics = init().unwrap();
        metrics.record_enqueue("s0", "start", "backlog");
        metrics.record_refill("s0", "none", 3);
        metrics.set_account_leases("s0", 2);
        let text = String::from_utf8(metrics.render().unwrap()).unwrap();
        let enqueued = text
            .lines()
            .find(|l| l.starts_with("shoal_items_enqueued_total{"))
            .unwrap();
        assert!(enqueued.contains(r#"route="backlog""#) && enqueued.ends_with(" 1"));
        assert!(text.contains(r#"shoal_items_refilled_total{shard="s0"} 3"#));
        assert!(text.contains(r#"shoal_guaranteed_capacity_leases{shard="s0"} 2"#));
    }

    #[test]
    fn registries_are_independent() {
        let a = init().unwrap();
        let b = init().unwrap();
        a.record_dequeue("s0");
        let text = String::from_utf8(b.render().unwrap()).unwrap();
        assert!(!text.contains(r#"shoal_items_dequeued_total{shard="s0"} 1"#));
    }
}
