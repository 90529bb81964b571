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

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::{AppError, AppResult};

use super::{Connection, ConnectionId};

/// Live connections keyed by id.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        self.connections.write().insert(connection.id(), connection);
    }

    pub fn del(&self, id: ConnectionId) {
        self.connections.write().remove(&id);
    }

    pub fn get(&self, id: ConnectionId) -> AppResult<Arc<Connection>> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(AppError::ConnectionNotFound(id))
    }

    pub fn num(&self) -> usize {
        self.connections.read().len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stops every live connection.
    ///
    /// The map is emptied under the write lock and the connections are stopped
    /// after it is released, so their own `del` calls find nothing to remove.
    pub async fn clear(&self) {
        let connections: Vec<_> = self.connections.write().drain().map(|(_, c)| c).collect();
        debug!("clearing {} connections", connections.len());
        for connection in connections {
            connection.stop().await;
        }
    }
}
