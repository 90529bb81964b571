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

pub use app_error::{AppError, AppResult};
pub use config::{
    GeneralConfig, LogConfig, NetworkConfig, RunModel, ServerConfig, WorkerPoolConfig, ENV_PREFIX,
};
#[cfg(unix)]
pub use control::{check_operation, check_start, process_alive, ControlOutcome, Operation, PidFile};
pub use dispatcher::{Dispatcher, RequestCounters};
pub use server::{BoundServer, Server, ServerContext, CLOSE_FLUSH_DELAY};
#[cfg(test)]
pub(crate) use server::test_context;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
#[cfg(unix)]
mod control;
mod dispatcher;
mod server;
mod shutdown;
mod tracing_config;
