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

//! Local client ingress: one UDP datagram carries one JSON order.
//!
//! Orders get no response; a client observes the outcome through later zone
//! lookups. The reader never blocks on the consumer - a full queue drops the
//! datagram with a warning.

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::types::CHANNEL_DEPTH;

/// Largest accepted datagram.
pub const MAX_DATAGRAM: usize = 1024;

/// Ingress errors. Binding the socket is the only fatal boot step here.
#[derive(Debug, Error)]
pub enum IngressError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Bind the order socket and spawn the reader task. Returns the bound
/// address, the raw order queue and the task handle.
pub async fn spawn_ingress(
    addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(std::net::SocketAddr, mpsc::Receiver<Vec<u8>>, JoinHandle<()>), IngressError> {
    let socket = UdpSocket::bind(addr).await.map_err(|e| IngressError::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    let local = socket.local_addr().map_err(|e| IngressError::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    info!(addr = %local, "order ingress listening");

    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let handle = tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                recv = socket.recv_from(&mut buf) => {
                    match recv {
                        Ok((len, _peer)) => {
                            if tx.try_send(buf[..len].to_vec()).is_err() {
                                warn!("order queue full; dropping datagram");
                            }
                        }
                        Err(e) => {
                            warn!(err = %e, "order socket read failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("order ingress stopping");
                    break;
                }
            }
        }
    });

    Ok((local, rx, handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn datagrams_reach_the_order_queue() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (addr, mut rx, _handle) = spawn_ingress("127.0.0.1:0", shutdown_rx).await.unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"{\"order\":1}", addr).await.unwrap();

        let order = rx.recv().await.unwrap();
        assert_eq!(order, b"{\"order\":1}");
    }

    #[tokio::test]
    async fn shutdown_stops_the_reader() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_addr, _rx, handle) = spawn_ingress("127.0.0.1:0", shutdown_rx).await.unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
