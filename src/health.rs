//! Waiting for nodes to (re)join the cluster, judged by their Mesos metrics.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{LaunchError, Result};
use crate::topology::{ClusterTopology, Role};

/// Value the rejoin metrics report once a node is healthy.
pub const REJOINED: f64 = 1.0;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// The flat metrics snapshot served by the Mesos process on `host:port`.
    async fn snapshot(&self, host: &str, port: u16) -> Result<Value>;
}

/// Reads `/metrics/snapshot` over plain HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpMetrics {
    client: reqwest::Client,
}

impl HttpMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsSource for HttpMetrics {
    async fn snapshot(&self, host: &str, port: u16) -> Result<Value> {
        let url = format!("http://{}:{}/metrics/snapshot", host, port);
        let response = self.client.get(&url).send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Polls `host` until `key` in its snapshot equals `expected`.
///
/// Unreachable hosts and malformed snapshots are retried until `timeout` elapses,
/// which is reported as `RejoinTimeout`.
pub async fn wait_for_metric(
    source: &dyn MetricsSource,
    host: &str,
    role: Role,
    key: &str,
    expected: f64,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let port = role.metrics_port();
    let poll = async {
        loop {
            match source.snapshot(host, port).await {
                Ok(snapshot) => {
                    let current = snapshot.get(key).and_then(Value::as_f64);
                    if current == Some(expected) {
                        return;
                    }
                    tracing::debug!(host, key, ?current, "Metric not at expected value yet");
                }
                Err(e) => tracing::debug!(host, error = %e, "Metrics not available yet"),
            }
            tokio::time::sleep(poll_interval).await;
        }
    };
    match tokio::time::timeout(timeout, poll).await {
        Ok(()) => {
            tracing::info!(host, %role, "Node has joined the cluster");
            Ok(())
        }
        Err(_) => Err(LaunchError::RejoinTimeout {
            host: host.to_string(),
            role: role.display_name().to_string(),
        }),
    }
}

/// Waits for the role's rejoin metric on `host`.
pub async fn wait_for_rejoin(
    source: &dyn MetricsSource,
    host: &str,
    role: Role,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    wait_for_metric(
        source,
        host,
        role,
        role.rejoin_metric(),
        REJOINED,
        poll_interval,
        timeout,
    )
    .await
}

/// Waits for every master, then every agent. Each host gets its own `timeout`.
pub async fn wait_for_cluster(
    source: &dyn MetricsSource,
    topology: &ClusterTopology,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    for role in Role::ALL {
        for host in topology.hosts_for(role) {
            wait_for_rejoin(source, &host.public_ip, role, poll_interval, timeout).await?;
        }
    }
    Ok(())
}
