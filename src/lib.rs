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

mod network;
mod request;
mod service;
mod utils;

pub use network::{
    extract_frames, Connection, ConnectionId, ConnectionRegistry, FramingProtocol,
    LengthPrefixedProtocol, LineProtocol, Listener, Outbound, PropertyValue,
};
#[cfg(unix)]
pub use network::graceful;
pub use request::{
    ClientId, ConnectionHook, DecodedClientId, EventHandler, Flow, Message, Middleware,
    OverloadHook, Request, RequestHook,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, BoundServer, Dispatcher,
    GeneralConfig, LogConfig, NetworkConfig, RequestCounters, RunModel, Server, ServerConfig,
    ServerContext, Shutdown, WorkerPoolConfig, CLOSE_FLUSH_DELAY, ENV_PREFIX,
};
#[cfg(unix)]
pub use service::{check_operation, check_start, process_alive, ControlOutcome, Operation, PidFile};
pub use utils::{PoolConfig, PoolHandler, WorkerPool};
