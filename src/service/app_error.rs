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

use crate::network::ConnectionId;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("configuration error: {0}")]
    Config(String),

    /// connection errors
    #[error("connection {0} closed")]
    ConnectionClosed(ConnectionId),

    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("no property: {0}")]
    PropertyNotFound(String),

    /// framing errors
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    /// process control errors
    #[error("the server is running, pid {0}")]
    AlreadyRunning(i32),

    #[error("the server is not running")]
    NotRunning,

    #[error("signal delivery error: {0}")]
    Signal(String),

    #[error("spawn successor error: {0}")]
    Spawn(String),
}
