#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Zonechain node entrypoint.
//!
//! Loads the TOML config named on the command line, opens the identity
//! directory and zone store, wires the consensus tasks to the libp2p gossip
//! transport and runs until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use zonechain::core::chain::{Chain, ChainConfig};
use zonechain::core::messages::{MessageType, ViewChangeReason};
use zonechain::core::proposer::{Replicator, ReplicatorConfig};
use zonechain::core::security::authority::Authority;
use zonechain::core::state::zone_store::ZoneStore;
use zonechain::core::types::{NodeConfig, CHANNEL_DEPTH};
use zonechain::core::view::ViewManager;
use zonechain::monitoring::metrics::{self, Metrics};
use zonechain::networking::p2p::{spawn_p2p, P2pConfig, P2pEvent};
use zonechain::networking::{ingress, Gossip, Router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .try_init();

    let config_path = std::env::args()
        .nth(1)
        .context("usage: zonechain <config.toml>")?;
    let cfg = NodeConfig::from_file(&config_path)?;

    let authority = Arc::new(
        Authority::open(&cfg.data_dir, cfg.node_name())
            .context("opening the identity directory")?,
    );
    let store = ZoneStore::open(&format!("{}/db", cfg.data_dir)).context("opening the zone store")?;
    let metrics = Arc::new(Metrics::new().context("registering metrics")?);

    info!(
        node = %authority.local_name(),
        members = authority.network_size(),
        "zonechain node starting"
    );

    // Inbound demux: register every consumed frame tag before the transport
    // starts. AuditResponse stays unrouted (reserved round).
    let mut router = Router::new();
    let proposal_rx = router.register(MessageType::Proposal);
    let reply_rx = router.register(MessageType::ProposalResult);
    let confirm_rx = router.register(MessageType::Commit);
    let change_rx = router.register(MessageType::ViewChange);
    let result_rx = router.register(MessageType::ViewChangeResult);
    let retrieve_rx = router.register(MessageType::RetrieveLeader);
    let response_rx = router.register(MessageType::RetrieveLeaderResponse);
    let block_rx = router.register(MessageType::Block);
    let router = Arc::new(router);

    let p2p_cfg = P2pConfig {
        listen_addr: format!("/ip4/0.0.0.0/tcp/{}", cfg.port),
        topic_prefix: "zonechain-consensus".to_string(),
        data_dir: cfg.data_dir.clone(),
        bootstrap: cfg.peers.clone(),
    };
    let (transport, mut p2p_events, p2p_task) =
        spawn_p2p(p2p_cfg, authority.clone(), router.clone(), metrics.clone())
            .map_err(|e| anyhow::anyhow!("p2p start failed: {e}"))?;
    let transport: Arc<dyn Gossip> = transport;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (_order_addr, order_rx, ingress_task) =
        ingress::spawn_ingress(&cfg.udp_addr, shutdown_rx.clone())
            .await
            .context("binding the order socket")?;

    let view = Arc::new(ViewManager::new(
        authority.clone(),
        transport.clone(),
        metrics.clone(),
    ));
    let chain = Chain::new(
        authority.clone(),
        store.clone(),
        transport.clone(),
        view.clone(),
        metrics.clone(),
        ChainConfig {
            block_interval: Duration::from_millis(cfg.block_interval_ms),
            block_overtime: Duration::from_millis(cfg.block_overtime_ms),
            proposal_pow: cfg.proposal_pow,
        },
    );

    let (finalized_tx, finalized_rx) = mpsc::channel(CHANNEL_DEPTH);
    let (missed_tx, missed_rx) = mpsc::channel(CHANNEL_DEPTH);
    let replicator = Replicator::new(
        authority.clone(),
        store.clone(),
        transport,
        metrics.clone(),
        ReplicatorConfig {
            proposal_timeout: Duration::from_millis(cfg.proposal_timeout_ms),
            proposal_pow: cfg.proposal_pow,
        },
        finalized_tx,
        missed_tx,
    );

    let mut tasks = vec![
        tokio::spawn(replicator.clone().run(
            order_rx,
            reply_rx,
            proposal_rx,
            confirm_rx,
            shutdown_rx.clone(),
        )),
        tokio::spawn(view.clone().run_change_loop(
            change_rx,
            result_rx,
            missed_rx,
            shutdown_rx.clone(),
        )),
        tokio::spawn(
            view.clone()
                .run_retrieve_loop(retrieve_rx, response_rx, shutdown_rx.clone()),
        ),
        tokio::spawn(chain.clone().run(finalized_rx, block_rx, shutdown_rx.clone())),
        ingress_task,
    ];

    // Failure detector: a vanished leader triggers a view change.
    {
        let view = view.clone();
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = p2p_events.recv() => match ev {
                        Some(P2pEvent::PeerDisconnected(Some(name))) => {
                            if view.leader_name().as_ref() == Some(&name) {
                                warn!(leader = %name, "leader disconnected");
                                view.trigger_view_change(ViewChangeReason::LeaderDead, None);
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    if let Some(addr) = cfg.metrics_addr.clone() {
        tasks.push(tokio::spawn(metrics::serve(
            addr,
            metrics.clone(),
            shutdown_rx.clone(),
        )));
    }

    view.start_retrieval();

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    if let Err(e) = store.flush() {
        warn!(err = %e, "final store flush failed");
    }
    // Transport goes down last so final frames drain.
    p2p_task.abort();
    let _ = p2p_task.await;
    Ok(())
}
