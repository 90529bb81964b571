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
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::network::{Connection, ConnectionRegistry, FramingProtocol, Listener};
use crate::request::{
    ClientId, ConnectionHook, EventHandler, Flow, Middleware, OverloadHook, Request, RequestHook,
};
use crate::AppResult;

#[cfg(unix)]
use super::control::{self, PidFile};
use super::{Dispatcher, RequestCounters, ServerConfig};
#[cfg(unix)]
use crate::network::graceful::{self, ControlSignal, ControlSignals};

/// Time given to the write path to flush the last payload of
/// [`ServerContext::close_client`] before the close marker is queued.
pub const CLOSE_FLUSH_DELAY: Duration = Duration::from_secs(2);

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(1);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Collects the application callbacks, then binds and serves.
pub struct Server {
    config: ServerConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    protocol: Option<Arc<dyn FramingProtocol>>,
    middlewares: Vec<Middleware>,
    before: Option<RequestHook>,
    after: Option<RequestHook>,
    on_start: Option<ConnectionHook>,
    on_stop: Option<ConnectionHook>,
    overload: Option<OverloadHook>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Server {
            config,
            event_handler: None,
            protocol: None,
            middlewares: Vec::new(),
            before: None,
            after: None,
            on_start: None,
            on_stop: None,
            overload: None,
        }
    }

    pub fn set_event_handler<H: EventHandler>(mut self, handler: H) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }

    /// Without a protocol every read is handed over as one raw message.
    pub fn set_protocol<P: FramingProtocol>(mut self, protocol: P) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    /// Middlewares run in registration order.
    pub fn use_middleware<F>(mut self, middleware: F) -> Self
    where
        F: Fn(&Request) -> Flow + Send + Sync + 'static,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request) + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(hook));
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    /// Called once for every connection rejected because the server is full.
    pub fn overload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TcpStream) + Send + Sync + 'static,
    {
        self.overload = Some(Arc::new(hook));
        self
    }

    pub fn set_max_connections(mut self, max_connection: usize) -> Self {
        self.config.network.max_connection = max_connection;
        self
    }

    pub fn set_worker_pool_size(mut self, num_workers: usize) -> Self {
        self.config.worker_pool.num_workers = num_workers;
        self
    }

    /// Opens the listener and starts the worker pool.
    pub async fn bind(self) -> AppResult<BoundServer> {
        self.config.validate()?;

        let listener = Listener::open(
            &self.config.network.listen_address(),
            self.config.network.keepalive(),
        )
        .await?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let dispatcher = Dispatcher::start(
            self.event_handler,
            self.middlewares,
            self.before,
            self.after,
            &self.config.worker_pool,
            notify_shutdown.clone(),
        )?;

        let context = Arc::new(ServerContext::new(
            self.config,
            dispatcher,
            self.protocol,
            self.on_start,
            self.on_stop,
            self.overload,
        ));
        let (drain_tx, drain_rx) = mpsc::channel(1);

        Ok(BoundServer {
            context,
            listener,
            drain_tx,
            drain_rx,
            notify_shutdown,
        })
    }

    /// Serves until a terminate or rotate signal has been handled and every
    /// connection has drained.
    ///
    /// Refuses to start while another live process owns the pid file, except in
    /// the successor of a rotation, which overwrites it with its own pid.
    #[cfg(unix)]
    pub async fn run(self) -> AppResult<()> {
        let pid_file = PidFile::new(&self.config.general.pid_file);
        control::check_start(&pid_file)?;
        let signals = ControlSignals::new()?;

        let bound = self.bind().await?;
        pid_file.write(std::process::id())?;

        tokio::spawn(watch_control_signals(
            bound.context().clone(),
            signals,
            bound.listener_fd(),
            pid_file,
        ));
        bound.serve().await
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("event_handler", &self.event_handler.is_some())
            .field("protocol", &self.protocol.is_some())
            .field("middlewares", &self.middlewares.len())
            .finish()
    }
}

#[cfg(unix)]
async fn watch_control_signals(
    context: Arc<ServerContext>,
    mut signals: ControlSignals,
    listener_fd: RawFd,
    pid_file: PidFile,
) {
    loop {
        let signal = tokio::select! {
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
            _ = context.stop_accepting.cancelled() => break,
        };
        match signal {
            ControlSignal::Rotate => {
                if context.is_exiting() {
                    warn!("rotation requested while exiting, ignored");
                    continue;
                }
                match graceful::spawn_successor(listener_fd) {
                    Ok(pid) => {
                        info!("successor process {} started, draining this one", pid);
                        context.begin_drain();
                    }
                    Err(e) => {
                        // keep serving, nothing was handed over
                        error!("rotation abandoned: {}", e);
                    }
                }
            }
            ControlSignal::Terminate => {
                info!("terminate signal received, draining");
                if let Err(e) = pid_file.remove() {
                    error!("remove pid file {} err: {}", pid_file.path().display(), e);
                }
                context.begin_drain();
            }
        }
    }
    debug!("control signal watcher exiting");
}

/// A server whose listener is open and whose workers are running.
#[derive(Debug)]
pub struct BoundServer {
    context: Arc<ServerContext>,
    listener: Listener,
    drain_tx: mpsc::Sender<()>,
    drain_rx: mpsc::Receiver<()>,
    notify_shutdown: broadcast::Sender<()>,
}

impl BoundServer {
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    #[cfg(unix)]
    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    /// Accepts until [`ServerContext::begin_drain`] is called, then waits for
    /// every admitted connection to stop and shuts the worker pool down.
    pub async fn serve(self) -> AppResult<()> {
        let BoundServer {
            context,
            listener,
            drain_tx,
            mut drain_rx,
            notify_shutdown,
        } = self;
        info!(
            "tcp server serving on {}, {} workers",
            listener.local_addr()?,
            context.dispatcher().pool_size()
        );

        let mut backoff = ACCEPT_BACKOFF_MIN;
        loop {
            let accepted = tokio::select! {
                _ = context.stop_accepting.cancelled() => break,
                res = listener.accept() => res,
            };
            let (stream, remote_addr) = match accepted {
                Ok(accepted) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    accepted
                }
                Err(e) => {
                    error!("accept err: {}, retry in {:?}", e, backoff);
                    tokio::select! {
                        _ = context.stop_accepting.cancelled() => break,
                        _ = time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };

            let drain_token = drain_tx.clone();
            let max_connection = context.config().network.max_connection;
            if context.registry().num() >= max_connection {
                warn!(
                    "too many connections, max = {}, rejecting {}",
                    max_connection, remote_addr
                );
                context.run_overload(&stream);
                drop(stream);
                drop(drain_token);
                continue;
            }
            Connection::new(context.clone(), remote_addr, drain_token).start(stream);
        }

        // closing the socket here, a successor keeps its own copy
        drop(listener);
        drop(drain_tx);
        info!(
            "stopped accepting, waiting for {} connections to finish",
            context.registry().num()
        );
        // resolves to None once every drain token is dropped
        let _ = drain_rx.recv().await;
        let _ = notify_shutdown.send(());
        info!("all connections drained, tcp server exit");
        Ok(())
    }
}

/// State shared by the accept loop, every connection and the application.
pub struct ServerContext {
    config: ServerConfig,
    registry: ConnectionRegistry,
    dispatcher: Dispatcher,
    protocol: Option<Arc<dyn FramingProtocol>>,
    on_start: Option<ConnectionHook>,
    on_stop: Option<ConnectionHook>,
    overload: Option<OverloadHook>,
    next_connection_id: AtomicU64,
    stop_accepting: CancellationToken,
}

impl ServerContext {
    fn new(
        config: ServerConfig,
        dispatcher: Dispatcher,
        protocol: Option<Arc<dyn FramingProtocol>>,
        on_start: Option<ConnectionHook>,
        on_stop: Option<ConnectionHook>,
        overload: Option<OverloadHook>,
    ) -> Self {
        ServerContext {
            config,
            registry: ConnectionRegistry::new(),
            dispatcher,
            protocol,
            on_start,
            on_stop,
            overload,
            next_connection_id: AtomicU64::new(1),
            stop_accepting: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn counters(&self) -> &Arc<RequestCounters> {
        self.dispatcher.counters()
    }

    pub fn protocol(&self) -> Option<&Arc<dyn FramingProtocol>> {
        self.protocol.as_ref()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) async fn run_on_start(&self, connection: &Arc<Connection>) {
        if let Some(on_start) = &self.on_start {
            on_start(connection.as_ref());
        }
        self.dispatcher
            .event_handler()
            .on_connect(connection, connection.client_id())
            .await;
    }

    pub(crate) async fn run_on_stop(&self, connection: &Arc<Connection>) {
        if let Some(on_stop) = &self.on_stop {
            on_stop(connection.as_ref());
        }
        self.dispatcher
            .event_handler()
            .on_close(connection, connection.client_id())
            .await;
    }

    fn run_overload(&self, stream: &TcpStream) {
        if let Some(overload) = &self.overload {
            overload(stream);
        }
    }

    fn lookup(&self, client_id: &ClientId) -> AppResult<Arc<Connection>> {
        client_id
            .connection_id()
            .and_then(|id| self.registry.get(id))
            .inspect_err(|e| error!("lookup client {} err: {}", client_id, e))
    }

    /// Sends `data` to the connection behind `client_id`.
    pub async fn send_to_client(&self, client_id: &ClientId, data: impl Into<Bytes>) -> AppResult<()> {
        let connection = self.lookup(client_id)?;
        connection.send(data).await
    }

    pub fn is_online(&self, client_id: &ClientId) -> bool {
        self.lookup(client_id).is_ok()
    }

    /// Sends a last payload, waits [`CLOSE_FLUSH_DELAY`], then closes the
    /// connection once everything queued before has been written.
    pub async fn close_client(&self, client_id: &ClientId, data: impl Into<Bytes>) -> AppResult<()> {
        let connection = self.lookup(client_id)?;
        connection.send(data).await?;
        time::sleep(CLOSE_FLUSH_DELAY).await;
        connection.close().await
    }

    /// Stops accepting. Admitted connections keep running until they end.
    pub fn begin_drain(&self) {
        self.stop_accepting.cancel();
    }

    pub fn is_exiting(&self) -> bool {
        self.stop_accepting.is_cancelled()
    }

    /// Stops accepting and stops every live connection.
    pub async fn stop(&self) {
        self.begin_drain();
        self.registry.clear().await;
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("address", &self.config.network.listen_address())
            .field("connections", &self.registry.num())
            .field("dispatcher", &self.dispatcher)
            .field("exiting", &self.is_exiting())
            .finish()
    }
}

/// A context with default config and no listener, for unit tests.
/// Must be called inside a runtime, the worker pool spawns its tasks.
#[cfg(test)]
pub(crate) fn test_context(event_handler: Option<Arc<dyn EventHandler>>) -> Arc<ServerContext> {
    use std::future::Future;
    use std::pin::Pin;

    struct Discard;

    impl EventHandler for Discard {
        fn on_message<'a>(
            &'a self,
            _request: &'a Request,
        ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
            Box::pin(async {})
        }
    }

    let config = ServerConfig::default();
    let event_handler = event_handler.unwrap_or_else(|| Arc::new(Discard));
    let (notify_shutdown, _) = broadcast::channel(1);
    let dispatcher = Dispatcher::start(
        Some(event_handler),
        Vec::new(),
        None,
        None,
        &config.worker_pool,
        notify_shutdown,
    )
    .expect("default worker pool config is valid");
    Arc::new(ServerContext::new(config, dispatcher, None, None, None, None))
}
