//! Prometheus metrics for presence and fan-out.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub online_users: IntGauge,
    pub open_connections: IntGauge,
    /// Label `outcome`: delivered | closed | timed_out.
    pub deliveries: IntCounterVec,
    pub evictions: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("flitch_realtime".to_string()), None)?;

        let online_users = IntGauge::new("online_users", "Users holding at least one open connection")?;
        let open_connections = IntGauge::new("open_connections", "Open transport connections")?;
        let deliveries = IntCounterVec::new(
            Opts::new("deliveries_total", "Per-connection event deliveries by outcome"),
            &["outcome"],
        )?;
        let evictions = IntCounter::new(
            "evictions_total",
            "Connections removed after a failed delivery",
        )?;

        registry.register(Box::new(online_users.clone()))?;
        registry.register(Box::new(open_connections.clone()))?;
        registry.register(Box::new(deliveries.clone()))?;
        registry.register(Box::new(evictions.clone()))?;

        Ok(Self {
            registry,
            online_users,
            open_connections,
            deliveries,
            evictions,
        })
    }

    /// Text exposition format for `GET /metrics`.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
