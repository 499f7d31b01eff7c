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

//! libp2p gossip transport: persistent identity, a shared broadcast topic
//! and one topic per member for reliable point-to-point delivery.
//!
//! Outbound frames go through a bounded channel into the swarm task; inbound
//! gossipsub messages are decoded and fanned out through the node's
//! [`Router`]. Broadcasts loop back locally so a node observes its own
//! frames, matching the in-process hub.

use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use libp2p::{
    core::upgrade,
    gossipsub::{self, IdentTopic, MessageAuthenticity},
    identify, noise, ping,
    swarm::{NetworkBehaviour, Swarm, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, Transport,
};

use libp2p::futures::StreamExt;
use libp2p::swarm::Config as SwarmConfig;

use crate::core::messages::Frame;
use crate::core::security::authority::Authority;
use crate::core::types::{NodeName, CHANNEL_DEPTH};
use crate::monitoring::metrics::Metrics;
use crate::networking::{Gossip, Router};

/// Events emitted by the P2P task.
#[derive(Clone, Debug)]
pub enum P2pEvent {
    /// Peer connected.
    PeerConnected(PeerId),
    /// Peer identified itself with a registered member name.
    PeerIdentified(PeerId, NodeName),
    /// Peer disconnected; the name is known once the peer identified.
    PeerDisconnected(Option<NodeName>),
}

/// Receiver of P2P events.
pub type EventRx = mpsc::Receiver<P2pEvent>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("io")]
    Io,
    #[error("config")]
    Config,
}

/// Runtime configuration for the P2P subsystem.
#[derive(Clone, Debug)]
pub struct P2pConfig {
    /// Listen address as string (e.g. "/ip4/0.0.0.0/tcp/5300").
    pub listen_addr: String,
    /// Topic prefix; the shared topic is the prefix itself.
    pub topic_prefix: String,
    /// Data directory used for the persistent transport identity.
    pub data_dir: String,
    /// Bootstrap peers.
    pub bootstrap: Vec<String>,
}

enum Dest {
    Shared,
    Member(NodeName),
}

struct OutFrame {
    bytes: Vec<u8>,
    dest: Dest,
}

/// Outbound endpoint handed to consensus tasks.
pub struct P2pHandle {
    local: NodeName,
    roster: Vec<NodeName>,
    router: Arc<Router>,
    outbound_tx: mpsc::Sender<OutFrame>,
}

impl P2pHandle {
    fn ship(&self, bytes: Vec<u8>, dest: Dest) {
        if self
            .outbound_tx
            .try_send(OutFrame { bytes, dest })
            .is_err()
        {
            warn!("outbound queue full; frame dropped");
        }
    }
}

impl Gossip for P2pHandle {
    fn queue_broadcast(&self, frame: Frame) {
        let bytes = frame.encode();
        self.router.route(frame);
        self.ship(bytes, Dest::Shared);
    }

    fn fanout(&self, frame: Frame) {
        let bytes = frame.encode();
        self.router.route(frame);
        for member in &self.roster {
            if member != &self.local {
                self.ship(bytes.clone(), Dest::Member(member.clone()));
            }
        }
    }

    fn send_to(&self, frame: Frame, to: &NodeName) {
        if to == &self.local {
            self.router.route(frame);
            return;
        }
        self.ship(frame.encode(), Dest::Member(to.clone()));
    }
}

#[derive(Debug)]
enum BehaviourEvent {
    Gossipsub(gossipsub::Event),
    Identify(identify::Event),
    Ping(()),
}
impl From<gossipsub::Event> for BehaviourEvent {
    fn from(e: gossipsub::Event) -> Self {
        Self::Gossipsub(e)
    }
}
impl From<identify::Event> for BehaviourEvent {
    fn from(e: identify::Event) -> Self {
        Self::Identify(e)
    }
}
impl From<ping::Event> for BehaviourEvent {
    fn from(_e: ping::Event) -> Self {
        Self::Ping(())
    }
}

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "BehaviourEvent")]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    identify: identify::Behaviour,
    ping: ping::Behaviour,
}

fn ensure_dir(path: &str) -> Result<(), P2pError> {
    let p = Path::new(path);
    if !p.exists() {
        std::fs::create_dir_all(p).map_err(|_| P2pError::Io)?;
    }
    Ok(())
}

fn member_topic(prefix: &str, name: &NodeName) -> IdentTopic {
    IdentTopic::new(format!("{prefix}/node/{name}"))
}

/// Spawn the P2P task. Inbound frames flow through `router`; the returned
/// handle is the outbound endpoint.
pub fn spawn_p2p(
    cfg: P2pConfig,
    authority: Arc<Authority>,
    router: Arc<Router>,
    metrics: Arc<Metrics>,
) -> Result<(Arc<P2pHandle>, EventRx, tokio::task::JoinHandle<()>), P2pError> {
    ensure_dir(&cfg.data_dir)?;

    let (local_peer_id, id_keys) =
        crate::networking::p2p_identity::load_or_create_identity(&cfg.data_dir)
            .map_err(|_| P2pError::Io)?;

    let (out_tx, mut out_rx) = mpsc::channel::<OutFrame>(CHANNEL_DEPTH);
    let (ev_tx, ev_rx) = mpsc::channel::<P2pEvent>(128);

    let local = authority.local_name().clone();
    let handle = Arc::new(P2pHandle {
        local: local.clone(),
        roster: authority.roster().to_vec(),
        router: router.clone(),
        outbound_tx: out_tx,
    });

    let listen_addr = cfg.listen_addr.clone();
    let prefix = cfg.topic_prefix.clone();
    let bootstrap = cfg.bootstrap.clone();

    let join = tokio::spawn(async move {
        let noise_keys = match noise::Config::new(&id_keys) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to build noise config");
                return;
            }
        };

        let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
            .upgrade(upgrade::Version::V1)
            .authenticate(noise_keys)
            .multiplex(yamux::Config::default())
            .boxed();

        let gcfg = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Permissive)
            .heartbeat_interval(Duration::from_secs(1))
            .build()
            .unwrap_or_else(|_| gossipsub::Config::default());

        let mut gossipsub = match gossipsub::Behaviour::new(
            MessageAuthenticity::Signed(id_keys.clone()),
            gcfg,
        ) {
            Ok(v) => v,
            Err(_) => {
                warn!("failed to create gossipsub behaviour");
                return;
            }
        };

        let shared_topic = IdentTopic::new(prefix.clone());
        let own_topic = member_topic(&prefix, &local);
        for topic in [&shared_topic, &own_topic] {
            if let Err(e) = gossipsub.subscribe(topic) {
                warn!(err = ?e, "failed to subscribe topic");
            }
        }

        // The agent string carries the member name so the failure detector
        // can name disconnected peers.
        let identify = identify::Behaviour::new(
            identify::Config::new("zonechain/1.0.0".to_string(), id_keys.public())
                .with_agent_version(local.as_str().to_string()),
        );

        let ping = ping::Behaviour::new(
            ping::Config::new()
                .with_interval(Duration::from_secs(10))
                .with_timeout(Duration::from_secs(20)),
        );

        let behaviour = Behaviour {
            gossipsub,
            identify,
            ping,
        };

        let mut swarm = Swarm::new(
            transport,
            behaviour,
            local_peer_id,
            SwarmConfig::with_tokio_executor(),
        );

        let listen: Multiaddr = match listen_addr.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(addr = %listen_addr, "bad listen_addr");
                return;
            }
        };
        if let Err(e) = swarm.listen_on(listen) {
            warn!(err = ?e, "listen_on failed");
            return;
        }

        for b in bootstrap.iter().map(|x| x.trim()).filter(|x| !x.is_empty()) {
            match b.parse::<Multiaddr>() {
                Ok(ma) => {
                    if let Err(e) = swarm.dial(ma.clone()) {
                        warn!(boot = %b, err = ?e, "dial bootstrap failed");
                    } else {
                        info!(boot = %b, "dialing bootstrap");
                    }
                }
                Err(_) => warn!(boot = %b, "bad bootstrap addr; skipping"),
            }
        }

        info!(%local_peer_id, topic = %prefix, "p2p loop started");
        metrics.gossip_peers.set(0);

        let mut names: HashMap<PeerId, NodeName> = HashMap::new();

        loop {
            tokio::select! {
                maybe_out = out_rx.recv() => {
                    match maybe_out {
                        Some(out) => {
                            let topic = match &out.dest {
                                Dest::Shared => shared_topic.clone(),
                                Dest::Member(name) => member_topic(&prefix, name),
                            };
                            if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic, out.bytes) {
                                warn!(err = ?e, "gossipsub publish failed");
                            }
                        }
                        None => {
                            warn!("outbound channel closed; stopping p2p task");
                            break;
                        }
                    }
                }

                ev = swarm.select_next_some() => {
                    match ev {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "listening");
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            metrics.gossip_peers.inc();
                            let _ = ev_tx.send(P2pEvent::PeerConnected(peer_id)).await;
                            info!(%peer_id, "peer connected");
                        }

                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            metrics.gossip_peers.dec();
                            let name = names.remove(&peer_id);
                            let _ = ev_tx.send(P2pEvent::PeerDisconnected(name.clone())).await;
                            info!(%peer_id, name = ?name, "peer disconnected");
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                            router.route_raw(&message.data);
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, info })) => {
                            let name = NodeName::new(info.agent_version.clone());
                            if names.get(&peer_id) != Some(&name) {
                                names.insert(peer_id, name.clone());
                                let _ = ev_tx.send(P2pEvent::PeerIdentified(peer_id, name)).await;
                            }
                        }

                        SwarmEvent::Behaviour(BehaviourEvent::Identify(_)) => {}
                        SwarmEvent::Behaviour(BehaviourEvent::Ping(_)) => {}

                        _ => {}
                    }
                }
            }
        }
    });

    Ok((handle, ev_rx, join))
}
