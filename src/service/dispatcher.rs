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

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, trace};

use crate::network::Connection;
use crate::request::{EventHandler, Flow, HandlerChain, Message, Middleware, Request, RequestHook};
use crate::utils::{PoolConfig, PoolHandler, WorkerPool};
use crate::{AppError, AppResult};

use super::WorkerPoolConfig;

/// Request sequence allocator and live request gauge, kept apart so routing
/// never depends on a value that completions decrement.
#[derive(Debug, Default)]
pub struct RequestCounters {
    next_seq: AtomicU64,
    in_flight: AtomicI64,
}

impl RequestCounters {
    /// Next global sequence number, wraps at `u64::MAX`.
    pub fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Approximate number of dispatched requests not yet finished.
    pub fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn request_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Clone)]
struct RequestWorker {
    chain: Arc<HandlerChain>,
    counters: Arc<RequestCounters>,
}

impl PoolHandler<Request> for RequestWorker {
    fn handle(&self, request: Request) -> impl Future<Output = ()> + Send {
        let chain = self.chain.clone();
        let counters = self.counters.clone();
        async move {
            if chain.process(&request).await == Flow::Abort {
                trace!(
                    "request {} from connection {} aborted",
                    request.seq(),
                    request.connection().id()
                );
            }
            counters.request_finished();
        }
    }
}

/// Routes every decoded request to worker `seq % pool_size`.
#[derive(Debug)]
pub struct Dispatcher {
    pool: WorkerPool<Request>,
    chain: Arc<HandlerChain>,
    counters: Arc<RequestCounters>,
    pool_size: usize,
}

impl Dispatcher {
    /// Starts the worker pool.
    ///
    /// Without an event handler there is nothing to hand requests to, so the
    /// pool refuses to start.
    pub fn start(
        event_handler: Option<Arc<dyn EventHandler>>,
        middlewares: Vec<Middleware>,
        before: Option<RequestHook>,
        after: Option<RequestHook>,
        config: &WorkerPoolConfig,
        notify_shutdown: broadcast::Sender<()>,
    ) -> AppResult<Dispatcher> {
        let Some(event_handler) = event_handler else {
            error!("You must set an event handler before starting the worker pool");
            return Err(AppError::Config("no event handler registered".to_string()));
        };
        if config.num_workers == 0 {
            error!("worker pool size must be greater than 0");
            return Err(AppError::Config("worker pool size is 0".to_string()));
        }

        event_handler.on_worker_start();

        let counters = Arc::new(RequestCounters::default());
        let chain = Arc::new(HandlerChain::new(event_handler, middlewares, before, after));
        let worker = RequestWorker {
            chain: chain.clone(),
            counters: counters.clone(),
        };
        let pool_config = PoolConfig {
            queue_depth: 1,
            num_workers: config.num_workers,
            monitor_interval: config.monitor_interval(),
            worker_check_timeout: config.worker_check_timeout(),
        };
        let pool = WorkerPool::new(notify_shutdown, worker, pool_config);
        info!("[WorkPool] {} workers are running", config.num_workers);

        Ok(Dispatcher {
            pool,
            chain,
            counters,
            pool_size: config.num_workers,
        })
    }

    pub fn route(&self, seq: u64) -> usize {
        route(seq, self.pool_size)
    }

    /// Hands one decoded message to its worker, waiting until the worker's
    /// queue has room.
    pub async fn dispatch(&self, connection: Arc<Connection>, message: Message) -> AppResult<()> {
        let seq = self.counters.next_seq();
        let worker_id = self.route(seq);
        let request = Request::new(connection, message, seq, worker_id);
        self.counters.request_started();
        if let Err(e) = self.pool.send(request, worker_id).await {
            self.counters.request_finished();
            return Err(e);
        }
        Ok(())
    }

    pub fn event_handler(&self) -> &Arc<dyn EventHandler> {
        self.chain.event_handler()
    }

    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }
}

fn route(seq: u64, pool_size: usize) -> usize {
    (seq % pool_size as u64) as usize
}
