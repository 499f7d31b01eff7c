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

//! In-process transport hub for local clusters and test harnesses.
//!
//! Every frame is delivered synchronously into the destination's router;
//! broadcast delivery includes the sender (self-delivery mirrors the gossip
//! layer, where a node observes its own broadcasts).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::core::messages::Frame;
use crate::core::types::NodeName;
use crate::networking::{Gossip, Router};

#[derive(Default)]
struct HubState {
    routers: HashMap<NodeName, Arc<Router>>,
    // Names that receive nothing; simulates crashed peers.
    silenced: Vec<NodeName>,
}

/// Shared in-memory wire connecting any number of nodes.
#[derive(Clone, Default)]
pub struct MemoryHub {
    state: Arc<RwLock<HubState>>,
    // Serialises deliveries so per-sender frame order is preserved.
    delivery: Arc<Mutex<()>>,
}

impl MemoryHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node's router and get its transport endpoint.
    pub fn attach(&self, name: NodeName, router: Arc<Router>) -> MemoryTransport {
        self.state
            .write()
            .expect("hub lock poisoned")
            .routers
            .insert(name.clone(), router);
        MemoryTransport {
            hub: self.clone(),
            local: name,
        }
    }

    /// Stop delivering frames to `name`.
    pub fn silence(&self, name: &NodeName) {
        self.state
            .write()
            .expect("hub lock poisoned")
            .silenced
            .push(name.clone());
    }

    fn deliver_all(&self, frame: &Frame) {
        let _guard = self.delivery.lock().expect("hub lock poisoned");
        let state = self.state.read().expect("hub lock poisoned");
        for (name, router) in state.routers.iter() {
            if state.silenced.contains(name) {
                continue;
            }
            router.route(frame.clone());
        }
    }

    fn deliver_one(&self, frame: &Frame, to: &NodeName) {
        let _guard = self.delivery.lock().expect("hub lock poisoned");
        let state = self.state.read().expect("hub lock poisoned");
        if state.silenced.contains(to) {
            return;
        }
        if let Some(router) = state.routers.get(to) {
            router.route(frame.clone());
        }
    }
}

/// One node's endpoint on a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    local: NodeName,
}

impl MemoryTransport {
    /// The attached node's name.
    pub fn local_name(&self) -> &NodeName {
        &self.local
    }
}

impl Gossip for MemoryTransport {
    fn queue_broadcast(&self, frame: Frame) {
        self.hub.deliver_all(&frame);
    }

    fn fanout(&self, frame: Frame) {
        self.hub.deliver_all(&frame);
    }

    fn send_to(&self, frame: Frame, to: &NodeName) {
        self.hub.deliver_one(&frame, to);
    }
}
