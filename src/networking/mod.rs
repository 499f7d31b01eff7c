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

//! Gossip transport seam, frame routing and client ingress.
//!
//! Consensus code talks to [`Gossip`] only; the libp2p stack in [`p2p`] and
//! the in-process hub in [`memory`] both implement it. Inbound frames are
//! demultiplexed by tag through a [`Router`] into bounded per-type queues.

pub mod ingress;
pub mod memory;
pub mod p2p;
pub mod p2p_identity;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::core::messages::{Frame, MessageType};
use crate::core::types::{NodeName, CHANNEL_DEPTH, MAX_GOSSIP_PAYLOAD};

/// Outbound transport operations.
///
/// `broadcast` picks the path by size: frames under [`MAX_GOSSIP_PAYLOAD`]
/// ride the unreliable gossip queue, larger ones fan out reliably to every
/// member.
pub trait Gossip: Send + Sync + 'static {
    /// Queue a frame on the unreliable broadcast path.
    fn queue_broadcast(&self, frame: Frame);

    /// Deliver a frame reliably to every known member.
    fn fanout(&self, frame: Frame);

    /// Deliver a frame reliably to one member.
    fn send_to(&self, frame: Frame, to: &NodeName);

    /// Size-dispatching broadcast per the wire contract.
    fn broadcast(&self, frame: Frame) {
        if frame.encoded_len() >= MAX_GOSSIP_PAYLOAD {
            self.fanout(frame);
        } else {
            self.queue_broadcast(frame);
        }
    }
}

const TAG_COUNT: usize = 9;

fn slot(t: MessageType) -> usize {
    (t as u8 as usize) - 1
}

/// Demultiplexes inbound frames into bounded per-type payload queues.
///
/// Register consumers before the transport starts; frames for unregistered
/// tags are dropped with a debug log, full queues drop with a warning and
/// never block the network reader.
#[derive(Default)]
pub struct Router {
    slots: [Option<mpsc::Sender<Vec<u8>>>; TAG_COUNT],
}

impl Router {
    /// Empty router with no consumers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue for one frame tag and return its receiving end.
    pub fn register(&mut self, message_type: MessageType) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        self.slots[slot(message_type)] = Some(tx);
        rx
    }

    /// Route one decoded frame. Never blocks.
    pub fn route(&self, frame: Frame) {
        let t = frame.message_type;
        match &self.slots[slot(t)] {
            None => debug!(message_type = ?t, "no consumer for frame; dropping"),
            Some(tx) => {
                if let Err(e) = tx.try_send(frame.payload) {
                    warn!(message_type = ?t, err = %e, "inbound queue full; dropping frame");
                }
            }
        }
    }

    /// Decode raw wire bytes and route them.
    pub fn route_raw(&self, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) => self.route(frame),
            Err(e) => debug!(err = %e, "undecodable frame; dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_to_registered_consumer() {
        let mut router = Router::new();
        let mut rx = router.register(MessageType::Proposal);
        router.route(Frame::new(MessageType::Proposal, vec![1, 2]));
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2]);
    }

    #[test]
    fn unregistered_tag_is_dropped() {
        let mut router = Router::new();
        let mut rx = router.register(MessageType::Proposal);
        router.route(Frame::new(MessageType::Commit, vec![9]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let mut router = Router::new();
        let mut rx = router.register(MessageType::Block);
        for i in 0..(CHANNEL_DEPTH + 10) {
            router.route(Frame::new(MessageType::Block, vec![i as u8]));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CHANNEL_DEPTH);
    }

    #[test]
    fn raw_garbage_is_dropped() {
        let mut router = Router::new();
        let mut rx = router.register(MessageType::Proposal);
        router.route_raw(&[]);
        router.route_raw(&[0xFF, 1, 2]);
        assert!(rx.try_recv().is_err());
    }
}
