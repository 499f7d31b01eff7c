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

//! Protocol core: types, messages, admission, consensus and blocks.

/// Block structure, Merkle commitment and wire layout.
pub mod block;
/// Chain service: sealing, verification and application.
pub mod chain;
/// Wire messages and their hash/sign/verify rules.
pub mod messages;
/// Proof-of-work admission control.
pub mod pow;
/// Proposal origination and acknowledgement tallying.
pub mod proposer;
/// Identity directory and signing (certificate authority collaborator).
pub mod security;
/// Durable zone records (key-value collaborator).
pub mod state;
/// Deterministic core types and canonical encoding.
pub mod types;
/// View (term, leader) management.
pub mod view;
