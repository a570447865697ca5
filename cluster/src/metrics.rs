use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Server {
    pub server: String,
}

impl Server {
    pub fn new(index: usize) -> Self {
        Self {
            server: format!("s{index}"),
        }
    }
}

/// Counters and gauges shared by the router and the users of a simulation.
///
/// Metrics that are never registered still count (which is convenient in tests).
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    pub requests_sent: Counter,
    pub requests_duplicated: Counter,
    pub requests_routed: Counter,
    pub requests_completed: Counter,
    pub requests_dropped: Counter,
    pub timeouts: Counter,
    pub faults: Counter,
    pub rebalances: Counter,
    pub restarts: Counter,
    pub queue_length: Family<Server, Gauge>,
    pub busy_cores: Family<Server, Gauge>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "requests_sent",
            "Requests sent by users after thinking",
            metrics.requests_sent.clone(),
        );
        registry.register(
            "requests_duplicated",
            "Requests sent by users as part of a retry storm",
            metrics.requests_duplicated.clone(),
        );
        registry.register(
            "requests_routed",
            "Requests forwarded to a server queue",
            metrics.requests_routed.clone(),
        );
        registry.register(
            "requests_completed",
            "Requests whose job finished on a core",
            metrics.requests_completed.clone(),
        );
        registry.register(
            "requests_dropped",
            "Requests lost to a server restart",
            metrics.requests_dropped.clone(),
        );
        registry.register(
            "timeouts",
            "Requests that went unanswered for the user timeout",
            metrics.timeouts.clone(),
        );
        registry.register("faults", "Injected user faults", metrics.faults.clone());
        registry.register(
            "rebalances",
            "User cohorts migrated between servers",
            metrics.rebalances.clone(),
        );
        registry.register(
            "restarts",
            "Servers restarted by the rebalancer",
            metrics.restarts.clone(),
        );
        registry.register(
            "queue_length",
            "Requests waiting for a core",
            metrics.queue_length.clone(),
        );
        registry.register(
            "busy_cores",
            "Cores running a job",
            metrics.busy_cores.clone(),
        );
        metrics
    }
}
