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

use std::sync::Arc;

use bytes::Bytes;

use crate::network::Connection;
use crate::service::ServerContext;
use crate::AppResult;

use super::{ClientId, Message};

/// A decoded message bound to the connection it arrived on.
///
/// Consumed by exactly one worker.
#[derive(Debug)]
pub struct Request {
    connection: Arc<Connection>,
    message: Message,
    seq: u64,
    worker_id: usize,
    client_id: ClientId,
}

impl Request {
    pub fn new(connection: Arc<Connection>, message: Message, seq: u64, worker_id: usize) -> Self {
        let client_id = connection.client_id().clone();
        Request {
            connection,
            message,
            seq,
            worker_id,
            client_id,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn server(&self) -> &Arc<ServerContext> {
        self.connection.server()
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn data(&self) -> &Bytes {
        self.message.data()
    }

    pub fn id(&self) -> u32 {
        self.message.id()
    }

    pub fn len(&self) -> u32 {
        self.message.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// global sequence number taken when the frame was decoded
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Sends `data` back on the connection this request arrived on.
    pub async fn reply(&self, data: impl Into<Bytes>) -> AppResult<()> {
        self.connection.send(data).await
    }
}
