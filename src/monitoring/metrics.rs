// Copyright (c) 2026 Zonechain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Prometheus metrics for the consensus node.

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use thiserror::Error;

/// Metrics errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus")]
    Prom,
}

/// Metrics container.
#[derive(Clone)]
pub struct Metrics {
    /// Registry.
    pub registry: Registry,

    /// Proposals that reached quorum.
    pub proposals_finalized_total: IntCounter,
    /// Proposals abandoned after the confirm round.
    pub proposals_abandoned_total: IntCounter,
    /// Confirm rounds started.
    pub confirm_rounds_total: IntCounter,
    /// Committed leader rotations.
    pub view_changes_total: IntCounter,
    /// Blocks sealed by this node.
    pub blocks_sealed_total: IntCounter,
    /// Blocks accepted from peers.
    pub blocks_applied_total: IntCounter,
    /// Current chain height gauge.
    pub block_height: IntGauge,
    /// Frames dropped for decode or signature failures.
    pub invalid_frames_total: IntCounter,
    /// Connected gossip peers.
    pub gossip_peers: IntGauge,
}

impl Metrics {
    /// Create and register metrics.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let proposals_finalized_total = IntCounter::new(
            "zonechain_proposals_finalized_total",
            "Proposals that reached quorum",
        )
        .map_err(|_| MetricsError::Prom)?;
        let proposals_abandoned_total = IntCounter::new(
            "zonechain_proposals_abandoned_total",
            "Proposals abandoned after the confirm round",
        )
        .map_err(|_| MetricsError::Prom)?;
        let confirm_rounds_total = IntCounter::new(
            "zonechain_confirm_rounds_total",
            "Confirm rounds started",
        )
        .map_err(|_| MetricsError::Prom)?;
        let view_changes_total = IntCounter::new(
            "zonechain_view_changes_total",
            "Committed leader rotations",
        )
        .map_err(|_| MetricsError::Prom)?;
        let blocks_sealed_total =
            IntCounter::new("zonechain_blocks_sealed_total", "Blocks sealed locally")
                .map_err(|_| MetricsError::Prom)?;
        let blocks_applied_total =
            IntCounter::new("zonechain_blocks_applied_total", "Blocks accepted from peers")
                .map_err(|_| MetricsError::Prom)?;
        let block_height = IntGauge::new("zonechain_block_height", "Current chain height")
            .map_err(|_| MetricsError::Prom)?;
        let invalid_frames_total = IntCounter::new(
            "zonechain_invalid_frames_total",
            "Frames dropped for decode or signature failures",
        )
        .map_err(|_| MetricsError::Prom)?;
        let gossip_peers = IntGauge::new("zonechain_gossip_peers", "Connected gossip peers")
            .map_err(|_| MetricsError::Prom)?;

        for collector in [
            Box::new(proposals_finalized_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(proposals_abandoned_total.clone()),
            Box::new(confirm_rounds_total.clone()),
            Box::new(view_changes_total.clone()),
            Box::new(blocks_sealed_total.clone()),
            Box::new(blocks_applied_total.clone()),
            Box::new(block_height.clone()),
            Box::new(invalid_frames_total.clone()),
            Box::new(gossip_peers.clone()),
        ] {
            registry.register(collector).map_err(|_| MetricsError::Prom)?;
        }

        Ok(Self {
            registry,
            proposals_finalized_total,
            proposals_abandoned_total,
            confirm_rounds_total,
            view_changes_total,
            blocks_sealed_total,
            blocks_applied_total,
            block_height,
            invalid_frames_total,
            gossip_peers,
        })
    }

    /// Text exposition of all registered metrics.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

/// Serve the text exposition over plain HTTP until shutdown fires.
pub async fn serve(
    addr: String,
    metrics: std::sync::Arc<Metrics>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    use tokio::io::AsyncWriteExt;

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(%addr, err = %e, "metrics listener bind failed");
            return;
        }
    };
    tracing::info!(%addr, "metrics listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((mut stream, _peer)) = accepted else { continue };
                let body = metrics.render();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_and_render() {
        let m = Metrics::new().unwrap();
        m.proposals_finalized_total.inc();
        m.block_height.set(3);
        let text = m.render();
        assert!(text.contains("zonechain_proposals_finalized_total 1"));
        assert!(text.contains("zonechain_block_height 3"));
    }
}
