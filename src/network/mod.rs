// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Network Module Implementation
//!
//! This module provides the connection engine of the server: the accepted
//! stream lifecycle, the framing contract used to reassemble frames, the
//! registry of live connections and the listener that survives process
//! rotation.
//!
//! # Components
//!
//! - `Connection`: one accepted stream with its read path and write path
//! - `FramingProtocol`: splits the byte stream into frames and wraps replies
//! - `ConnectionRegistry`: live connections by id
//! - `Listener`: the accept side, bound fresh or inherited from the previous process
//! - `graceful`: descriptor handoff and control signals (unix)

pub use connection::{Connection, ConnectionId, Outbound, PropertyValue};
pub use frame::{extract_frames, FramingProtocol, LengthPrefixedProtocol, LineProtocol};
pub use listener::Listener;
pub use registry::ConnectionRegistry;

mod connection;
mod frame;
#[cfg(unix)]
pub mod graceful;
mod listener;
mod registry;
