// Private module declaration
mod exposition;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

pub use exposition::render_text;

// ============================================================================
// Metrics Module - Prometheus metrics for store observability
// ============================================================================
//
// Provides metrics for:
// - Entity writes and queries (per backend, per operation)
// - Event appends and optimistic-concurrency rejections
// - Message sends, acknowledgements and handler failures
// - Operation latency
//
// Each backend owns one registry; hosts scrape it via `registry()`.
// ============================================================================

pub struct StoreMetrics {
    registry: Registry,

    // Data Store Metrics
    pub entity_writes: IntCounterVec,
    pub queries: IntCounterVec,
    pub query_rows: IntCounterVec,

    // Event Store Metrics
    pub events_appended: IntCounterVec,
    pub concurrency_conflicts: IntCounterVec,

    // Message Bus Metrics
    pub messages_sent: IntCounterVec,
    pub messages_acknowledged: IntCounterVec,
    pub handler_failures: IntCounterVec,

    pub operation_duration: HistogramVec,
}

impl StoreMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        // Data Store Metrics
        let entity_writes = IntCounterVec::new(
            Opts::new("store_entity_writes_total", "Entity writes by operation"),
            &["backend", "operation"],
        )?;
        registry.register(Box::new(entity_writes.clone()))?;

        let queries = IntCounterVec::new(
            Opts::new("store_queries_total", "Queries evaluated"),
            &["backend"],
        )?;
        registry.register(Box::new(queries.clone()))?;

        let query_rows = IntCounterVec::new(
            Opts::new("store_query_rows_total", "Rows returned by queries"),
            &["backend"],
        )?;
        registry.register(Box::new(query_rows.clone()))?;

        // Event Store Metrics
        let events_appended = IntCounterVec::new(
            Opts::new("store_events_appended_total", "Events appended to streams"),
            &["backend"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let concurrency_conflicts = IntCounterVec::new(
            Opts::new("store_concurrency_conflicts_total", "Rejected appends by conflict kind"),
            &["backend", "kind"],
        )?;
        registry.register(Box::new(concurrency_conflicts.clone()))?;

        // Message Bus Metrics
        let messages_sent = IntCounterVec::new(
            Opts::new("store_messages_sent_total", "Messages sent to topics"),
            &["backend"],
        )?;
        registry.register(Box::new(messages_sent.clone()))?;

        let messages_acknowledged = IntCounterVec::new(
            Opts::new("store_messages_acknowledged_total", "Messages removed after a successful handler"),
            &["backend"],
        )?;
        registry.register(Box::new(messages_acknowledged.clone()))?;

        let handler_failures = IntCounterVec::new(
            Opts::new("store_handler_failures_total", "Handler failures leaving the message pending"),
            &["backend", "reason"],
        )?;
        registry.register(Box::new(handler_failures.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new("store_operation_duration_seconds", "Store operation duration")
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
            &["backend", "operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        Ok(Self {
            registry,
            entity_writes,
            queries,
            query_rows,
            events_appended,
            concurrency_conflicts,
            messages_sent,
            messages_acknowledged,
            handler_failures,
            operation_duration,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_write(&self, backend: &str, operation: &str) {
        self.entity_writes.with_label_values(&[backend, operation]).inc();
    }

    pub fn record_query(&self, backend: &str, rows: usize) {
        self.queries.with_label_values(&[backend]).inc();
        self.query_rows.with_label_values(&[backend]).inc_by(rows as u64);
    }

    pub fn record_append(&self, backend: &str, events: usize) {
        self.events_appended.with_label_values(&[backend]).inc_by(events as u64);
    }

    pub fn record_conflict(&self, backend: &str, kind: &str) {
        self.concurrency_conflicts.with_label_values(&[backend, kind]).inc();
    }

    pub fn record_send(&self, backend: &str) {
        self.messages_sent.with_label_values(&[backend]).inc();
    }

    pub fn record_ack(&self, backend: &str) {
        self.messages_acknowledged.with_label_values(&[backend]).inc();
    }

    pub fn record_handler_failure(&self, backend: &str, reason: &str) {
        self.handler_failures.with_label_values(&[backend, reason]).inc();
    }

    pub fn observe(&self, backend: &str, operation: &str, duration_secs: f64) {
        self.operation_duration
            .with_label_values(&[backend, operation])
            .observe(duration_secs);
    }
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new().expect("metric definitions are static and register once")
    }
}
