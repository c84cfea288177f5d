/// Prometheus metrics catalog, scoped to indexer and resolver concerns, in
/// the teacher's registry-plus-lazily-registered-gauges style.
use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BLOCKS_PROCESSED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("claimhub_blocks_processed_total", "Blocks successfully advanced").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static BLOCKS_ROLLED_BACK: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("claimhub_blocks_rolled_back_total", "Blocks rolled back during a reorg").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CURRENT_HEIGHT: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("claimhub_current_height", "Height of the last committed block").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static OP_STACK_SIZE: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new("claimhub_op_stack_size", "Number of ops staged per committed block")).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static TAKEOVERS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("claimhub_takeovers_total", "Name takeovers recorded").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CLAIMS_ADDED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("claimhub_claims_added_total", "Claims added or updated").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CLAIMS_ABANDONED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("claimhub_claims_abandoned_total", "Claims abandoned").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SIGNATURES_INVALIDATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("claimhub_signatures_invalidated_total", "Claim signatures invalidated by a channel abandonment").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RESOLVE_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(Opts::new("claimhub_resolve_requests_total", "Resolve requests by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static QUERY_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new("claimhub_query_latency_seconds", "Resolve/search query latency")).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

/// Renders the registry in Prometheus text exposition format.
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    encoder.encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
