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
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::net::TcpStream;
use tracing::trace;

use crate::network::Connection;

use super::{ClientId, Request};

/// Application callbacks.
///
/// Only `on_message` is required. `on_connect` and `on_close` run once per
/// admitted connection; `on_worker_start` runs once when the worker pool starts.
pub trait EventHandler: Send + Sync + 'static {
    fn on_message<'a>(&'a self, request: &'a Request)
        -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    fn on_connect<'a>(
        &'a self,
        _connection: &'a Arc<Connection>,
        _client_id: &'a ClientId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    fn on_close<'a>(
        &'a self,
        _connection: &'a Arc<Connection>,
        _client_id: &'a ClientId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async {})
    }

    fn on_worker_start(&self) {}
}

/// Result of one middleware for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// skip the rest of the chain for this request only
    Abort,
}

pub type Middleware = Arc<dyn Fn(&Request) -> Flow + Send + Sync>;
pub type RequestHook = Arc<dyn Fn(&Request) + Send + Sync>;
pub type ConnectionHook = Arc<dyn Fn(&Connection) + Send + Sync>;
/// Called with a stream that is about to be rejected because the server is full.
pub type OverloadHook = Arc<dyn Fn(&TcpStream) + Send + Sync>;

/// middleware -> before -> on_message -> after
pub struct HandlerChain {
    event_handler: Arc<dyn EventHandler>,
    middlewares: Vec<Middleware>,
    before: Option<RequestHook>,
    after: Option<RequestHook>,
}

impl HandlerChain {
    pub fn new(
        event_handler: Arc<dyn EventHandler>,
        middlewares: Vec<Middleware>,
        before: Option<RequestHook>,
        after: Option<RequestHook>,
    ) -> Self {
        HandlerChain {
            event_handler,
            middlewares,
            before,
            after,
        }
    }

    pub fn event_handler(&self) -> &Arc<dyn EventHandler> {
        &self.event_handler
    }

    pub async fn process(&self, request: &Request) -> Flow {
        for (index, middleware) in self.middlewares.iter().enumerate() {
            if middleware(request) == Flow::Abort {
                trace!(
                    "request {} aborted by middleware {}",
                    request.seq(),
                    index
                );
                return Flow::Abort;
            }
        }
        if let Some(before) = &self.before {
            before(request);
        }
        self.event_handler.on_message(request).await;
        if let Some(after) = &self.after {
            after(request);
        }
        Flow::Continue
    }
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("middlewares", &self.middlewares.len())
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}
