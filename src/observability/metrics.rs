use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder};
use toolbridge_core::core::metrics::{
    ACTIVE_BRIDGES, CIRCUIT_OPEN_REJECTIONS_TOTAL, CIRCUIT_STATE, CIRCUIT_TRANSITIONS_TOTAL,
    DISCOVERIES_TOTAL, INVOCATIONS_TOTAL, INVOCATION_DURATION_SECONDS, INVOCATION_FAILURES_TOTAL,
    TRANSPORT_CONNECTS_TOTAL,
};

const DEFAULT_DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    pub port: u16,
    pub host: String,
    pub duration_buckets: Option<Vec<f64>>,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            port: 29000,
            host: "0.0.0.0".to_string(),
            duration_buckets: None,
        }
    }
}

impl PrometheusConfig {
    /// Falls back to all interfaces when `host` does not parse.
    pub fn socket_addr(&self) -> SocketAddr {
        let ip_addr: IpAddr = self
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip_addr, self.port)
    }
}

pub fn init_metrics() {
    describe_counter!(
        INVOCATIONS_TOTAL,
        "Total capability invocations by server and outcome"
    );
    describe_counter!(
        INVOCATION_FAILURES_TOTAL,
        "Failed capability invocations by server and failure kind"
    );
    describe_histogram!(
        INVOCATION_DURATION_SECONDS,
        "Capability invocation duration in seconds"
    );
    describe_counter!(
        CIRCUIT_OPEN_REJECTIONS_TOTAL,
        "Invocations rejected because the server circuit was open"
    );
    describe_gauge!(
        CIRCUIT_STATE,
        "Circuit state per server (0=closed, 1=open)"
    );
    describe_counter!(
        CIRCUIT_TRANSITIONS_TOTAL,
        "Circuit state transitions by server"
    );
    describe_gauge!(
        ACTIVE_BRIDGES,
        "Execution contexts currently holding a bridge"
    );
    describe_counter!(
        TRANSPORT_CONNECTS_TOTAL,
        "Transport connect attempts by transport and outcome"
    );
    describe_counter!(
        DISCOVERIES_TOTAL,
        "Capability discovery runs by server and outcome"
    );
}

/// Install the Prometheus recorder and its scrape listener.
///
/// Must run inside a Tokio runtime.
pub fn start_prometheus(config: PrometheusConfig) -> Result<SocketAddr, BuildError> {
    init_metrics();

    let socket_addr = config.socket_addr();
    let buckets = config
        .duration_buckets
        .unwrap_or_else(|| DEFAULT_DURATION_BUCKETS.to_vec());

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .upkeep_timeout(Duration::from_secs(5 * 60))
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), &buckets)?
        .install()?;

    Ok(socket_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr() {
        let config = PrometheusConfig {
            port: 9100,
            host: "127.0.0.1".to_string(),
            duration_buckets: None,
        };
        assert_eq!(config.socket_addr(), "127.0.0.1:9100".parse().unwrap());

        let bad_host = PrometheusConfig {
            host: "not-an-ip".to_string(),
            ..Default::default()
        };
        assert_eq!(bad_host.socket_addr(), "0.0.0.0:29000".parse().unwrap());
    }
}
