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

//! Zonechain - a permissioned, blockchain-backed naming service.
//!
//! A fixed set of certificate-authenticated nodes agrees on an append-only
//! log of zone-name operations (claim, modify, relinquish). This crate
//! provides:
//! - Canonical message encoding, hashing and Ed25519 signing bound to a
//!   static identity directory
//! - Proof-of-work admission control for zone claims
//! - Quorum replication with a confirm-round escalation under a Byzantine
//!   fault model
//! - View (term, leader) management with startup retrieval and rotation on
//!   timeout
//! - Merkle-committed blocks sealed by the current leader and applied to a
//!   durable zone store
//! - Gossip transport over libp2p, structured logging and Prometheus metrics

/// Protocol core (types, messages, consensus, blocks, storage, identity).
pub mod core;
/// Observability (metrics).
pub mod monitoring;
/// Gossip transport, frame routing and client ingress.
pub mod networking;
