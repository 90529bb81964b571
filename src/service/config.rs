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

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};

/// Prefix of environment variables overriding the config file,
/// e.g. `STONENET__NETWORK__PORT=9000`.
pub const ENV_PREFIX: &str = "STONENET";

/// Runtime model, selects the log output format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunModel {
    #[default]
    Dev,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub model: RunModel,
    pub pid_file: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: RunModel::Dev,
            pid_file: PathBuf::from("./stonenet.pid"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub ip: String,
    pub port: u16,
    pub max_connection: usize,
    /// tcp keep-alive idle time
    pub keepalive_secs: u64,
    pub read_buffer_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "0.0.0.0".to_string(),
            port: 9503,
            max_connection: 10240,
            keepalive_secs: 180,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl NetworkConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub monitor_interval_ms: u64,
    pub worker_check_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 10,
            monitor_interval_ms: 5000,
            worker_check_timeout_ms: 200,
        }
    }
}

impl WorkerPoolConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn worker_check_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_check_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub file_name: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            file_name: "stonenet.log".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub worker_pool: WorkerPoolConfig,
    pub log: LogConfig,
}

impl ServerConfig {
    /// Loads the config file at `path`, then applies `STONENET__*` overrides.
    /// Missing keys keep their defaults.
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ServerConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.worker_pool.num_workers == 0 {
            return Err(AppError::Config(
                "worker_pool.num_workers must be greater than 0".to_string(),
            ));
        }
        if self.network.read_buffer_size == 0 {
            return Err(AppError::Config(
                "network.read_buffer_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
