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

use std::fmt;
use std::net::SocketAddr;

use crate::network::ConnectionId;
use crate::{AppError, AppResult};

/// External handle of a connection: hex of `"<remote address>:<connection id>"`.
///
/// The connection id is recoverable from the string alone, without a registry
/// lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedClientId {
    pub address: SocketAddr,
    pub connection_id: ConnectionId,
}

impl ClientId {
    pub fn new(remote_addr: SocketAddr, connection_id: ConnectionId) -> Self {
        ClientId(hex::encode(format!("{}:{}", remote_addr, connection_id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode(&self) -> AppResult<DecodedClientId> {
        let raw = hex::decode(&self.0)
            .map_err(|e| AppError::InvalidClientId(format!("{}: {}", self.0, e)))?;
        let raw = String::from_utf8(raw)
            .map_err(|e| AppError::InvalidClientId(format!("{}: {}", self.0, e)))?;
        // split on the last ':' so bracketed ipv6 addresses survive
        let (address, connection_id) = raw
            .rsplit_once(':')
            .ok_or_else(|| AppError::InvalidClientId(format!("{}: missing separator", raw)))?;
        let address = address
            .parse::<SocketAddr>()
            .map_err(|e| AppError::InvalidClientId(format!("{}: {}", raw, e)))?;
        let connection_id = connection_id
            .parse::<ConnectionId>()
            .map_err(|e| AppError::InvalidClientId(format!("{}: {}", raw, e)))?;
        Ok(DecodedClientId {
            address,
            connection_id,
        })
    }

    pub fn connection_id(&self) -> AppResult<ConnectionId> {
        Ok(self.decode()?.connection_id)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        ClientId(value)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        ClientId(value.to_string())
    }
}
