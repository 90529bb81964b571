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

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use socket2::{SockRef, Socket};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::network::frame::{extract_frames, FramingProtocol};
use crate::request::{ClientId, Message};
use crate::service::ServerContext;
use crate::{AppError, AppResult};

pub type ConnectionId = u64;
pub type PropertyValue = Arc<dyn Any + Send + Sync>;

/// Entry of the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Data(Bytes),
    /// flush what was queued before, then close the connection
    Close,
}

/// One accepted stream.
///
/// The read path and the write path run as two tasks tied together by the
/// exit token. Whichever side fails first calls [`Connection::stop`], which
/// cancels the token and shuts the socket down under the other one. `stop`
/// runs its body exactly once.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    client_id: ClientId,
    closed: AtomicBool,
    outbound_tx: async_channel::Sender<Outbound>,
    outbound_rx: async_channel::Receiver<Outbound>,
    exit: CancellationToken,
    /// second handle on the accepted socket, shut down by `stop`
    socket: Mutex<Option<Socket>>,
    properties: RwLock<HashMap<String, PropertyValue>>,
    protocol: Option<Arc<dyn FramingProtocol>>,
    server: Arc<ServerContext>,
    /// dropped on stop, the listener drains until every token is gone
    drain_token: Mutex<Option<mpsc::Sender<()>>>,
}

impl Connection {
    /// Assigns the next connection id and registers the connection.
    pub fn new(
        server: Arc<ServerContext>,
        remote_addr: SocketAddr,
        drain_token: mpsc::Sender<()>,
    ) -> Arc<Connection> {
        let id = server.next_connection_id();
        // depth one, a second sender waits until the write path takes the first entry
        let (outbound_tx, outbound_rx) = async_channel::bounded(1);
        let connection = Arc::new(Connection {
            id,
            remote_addr,
            client_id: ClientId::new(remote_addr, id),
            closed: AtomicBool::new(false),
            outbound_tx,
            outbound_rx,
            exit: CancellationToken::new(),
            socket: Mutex::new(None),
            properties: RwLock::new(HashMap::new()),
            protocol: server.protocol().cloned(),
            server,
            drain_token: Mutex::new(Some(drain_token)),
        });
        connection.server.registry().add(connection.clone());
        connection
    }

    /// Spawns the read path, the write path and the connect hooks.
    pub fn start(self: &Arc<Self>, stream: TcpStream) {
        info!(
            "connection coming in, connection_id = {}, addr = {}",
            self.id, self.remote_addr
        );
        match SockRef::from(&stream).try_clone() {
            Ok(socket) => *self.socket.lock() = Some(socket),
            Err(e) => warn!("connection {} keeps no socket handle: {}", self.id, e),
        }
        if self.is_closed() {
            // stopped before it ever ran, dropping the stream closes it
            self.socket.lock().take();
            return;
        }
        let (reader, writer) = stream.into_split();

        tokio::spawn(self.clone().read_loop(reader));
        tokio::spawn(self.clone().write_loop(writer));

        let connection = self.clone();
        tokio::spawn(async move {
            connection.server.run_on_start(&connection).await;
        });
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let read_buffer_size = self.server.config().network.read_buffer_size;
        let mut buffer = BytesMut::with_capacity(read_buffer_size);
        loop {
            buffer.reserve(read_buffer_size);
            let read = tokio::select! {
                res = reader.read_buf(&mut buffer) => res,
                _ = self.exit.cancelled() => {
                    debug!("connection {} read path received exit signal", self.id);
                    break;
                }
            };
            match read {
                Ok(0) => {
                    debug!("connection {} closed by peer", self.id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("read msg data err: {}, connection_id = {}", e, self.id);
                    break;
                }
            }
            if let Err(e) = self.dispatch_buffered(&mut buffer).await {
                error!("connection {} dispatch error: {}", self.id, e);
                break;
            }
        }
        self.stop().await;
    }

    /// Turns the buffered bytes into requests, in stream order.
    async fn dispatch_buffered(self: &Arc<Self>, buffer: &mut BytesMut) -> AppResult<()> {
        let messages = match &self.protocol {
            Some(protocol) => extract_frames(protocol.as_ref(), buffer)?
                .into_iter()
                .map(|(payload, wire_len)| {
                    let id = protocol.message_id(&payload);
                    Message::new(payload, wire_len).with_id(id)
                })
                .collect(),
            None => {
                if buffer.is_empty() {
                    return Ok(());
                }
                let data = buffer.split().freeze();
                let len = data.len();
                vec![Message::new(data, len)]
            }
        };
        for message in messages {
            if self.is_closed() {
                debug!("connection {} stopped, dropping buffered frames", self.id);
                break;
            }
            self.server
                .dispatcher()
                .dispatch(self.clone(), message)
                .await?;
        }
        Ok(())
    }

    async fn write_loop(self: Arc<Self>, writer: OwnedWriteHalf) {
        let mut writer = BufWriter::new(writer);
        loop {
            let outbound = tokio::select! {
                res = self.outbound_rx.recv() => match res {
                    Ok(outbound) => outbound,
                    Err(_) => {
                        debug!("connection {} outbound queue closed", self.id);
                        break;
                    }
                },
                _ = self.exit.cancelled() => {
                    debug!("connection {} write path received exit signal", self.id);
                    break;
                }
            };
            match outbound {
                Outbound::Data(data) => {
                    let written = tokio::select! {
                        res = Self::write_entry(&mut writer, &data) => res,
                        _ = self.exit.cancelled() => {
                            debug!("connection {} stopped during a write", self.id);
                            break;
                        }
                    };
                    if let Err(e) = written {
                        // no retry, the close hook tells the application
                        error!("send data err: {}, connection_id = {}", e, self.id);
                        self.stop().await;
                        break;
                    }
                }
                Outbound::Close => {
                    if let Err(e) = Self::close_gracefully(&mut writer).await {
                        error!("close connection {} err: {}", self.id, e);
                    }
                    self.stop().await;
                    break;
                }
            }
        }
    }

    async fn write_entry(writer: &mut BufWriter<OwnedWriteHalf>, data: &[u8]) -> AppResult<()> {
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close_gracefully(writer: &mut BufWriter<OwnedWriteHalf>) -> AppResult<()> {
        writer.flush().await?;
        let stream: &TcpStream = writer.get_ref().as_ref();
        // linger off, close returns at once and the kernel keeps flushing
        SockRef::from(stream).set_linger(None)?;
        writer.shutdown().await?;
        Ok(())
    }

    /// Idempotent. Safe to race between the read path, the write path and an
    /// external kick.
    pub async fn stop(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(
            "connection close, connection_id = {}, addr = {}",
            self.id, self.remote_addr
        );
        self.server.run_on_stop(self).await;
        self.exit.cancel();
        // a path blocked on a stalled peer wakes up with an error
        if let Some(socket) = self.socket.lock().take() {
            if let Err(e) = socket.shutdown(std::net::Shutdown::Both) {
                debug!("connection {} socket shutdown: {}", self.id, e);
            }
        }
        self.outbound_tx.close();
        self.drain_token.lock().take();
        self.server.registry().del(self.id);
    }

    /// Frames `data` with the configured protocol and queues it for the write
    /// path. Waits while the previous entry has not been taken yet.
    pub async fn send(&self, data: impl Into<Bytes>) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.id));
        }
        let data = data.into();
        let data = match &self.protocol {
            Some(protocol) => protocol.pack(&data),
            None => data,
        };
        self.outbound_tx
            .send(Outbound::Data(data))
            .await
            .map_err(|_| AppError::ConnectionClosed(self.id))
    }

    /// Queues the close marker, everything sent before it is written first.
    pub async fn close(&self) -> AppResult<()> {
        if self.is_closed() {
            return Err(AppError::ConnectionClosed(self.id));
        }
        self.outbound_tx
            .send(Outbound::Close)
            .await
            .map_err(|_| AppError::ConnectionClosed(self.id))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_property<V>(&self, key: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        self.properties.write().insert(key.into(), Arc::new(value));
    }

    pub fn get_property(&self, key: &str) -> AppResult<PropertyValue> {
        self.properties
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::PropertyNotFound(key.to_string()))
    }

    /// Like [`Connection::get_property`], downcast to `V`.
    pub fn get_property_as<V>(&self, key: &str) -> AppResult<Arc<V>>
    where
        V: Any + Send + Sync,
    {
        self.get_property(key)?
            .downcast::<V>()
            .map_err(|_| AppError::InvalidValue(format!("property {} has another type", key)))
    }

    pub fn del_property(&self, key: &str) {
        self.properties.write().remove(key);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .field("framed", &self.protocol.is_some())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        debug!("connection {} dropped", self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::service::test_context;

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server_side, remote_addr) = listener.accept().await.unwrap();
        (server_side, client, remote_addr)
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let context = test_context(None);
        let (drain_tx, _drain_rx) = mpsc::channel(1);
        let (server_side, mut client, remote_addr) = socket_pair().await;

        let connection = Connection::new(context.clone(), remote_addr, drain_tx);
        connection.start(server_side);
        assert!(context.registry().get(connection.id()).is_ok());

        connection.stop().await;
        assert!(connection.is_closed());
        assert!(matches!(
            connection.send(Bytes::from_static(b"late")).await,
            Err(AppError::ConnectionClosed(_))
        ));
        assert!(matches!(
            context.registry().get(connection.id()),
            Err(AppError::ConnectionNotFound(_))
        ));

        // nothing was written, the peer only sees the close
        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_drops_drain_token() {
        let context = test_context(None);
        let (drain_tx, mut drain_rx) = mpsc::channel::<()>(1);
        let (server_side, _client, remote_addr) = socket_pair().await;

        let connection = Connection::new(context.clone(), remote_addr, drain_tx);
        connection.start(server_side);

        let first = connection.clone();
        let second = connection.clone();
        tokio::join!(first.stop(), second.stop(), connection.stop());

        // every sender is gone once the single stop body ran
        let drained = tokio::time::timeout(Duration::from_secs(5), drain_rx.recv())
            .await
            .unwrap();
        assert!(drained.is_none());
        assert_eq!(context.registry().num(), 0);
    }

    #[tokio::test]
    async fn test_close_marker_flushes_then_closes() {
        let context = test_context(None);
        let (drain_tx, _drain_rx) = mpsc::channel(1);
        let (server_side, mut client, remote_addr) = socket_pair().await;

        let connection = Connection::new(context.clone(), remote_addr, drain_tx);
        connection.start(server_side);

        connection.send(Bytes::from_static(b"bye")).await.unwrap();
        connection.close().await.unwrap();

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, b"bye");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !connection.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stop_closes_stalled_stream() {
        let context = test_context(None);
        let (drain_tx, _drain_rx) = mpsc::channel(1);
        let (server_side, mut client, remote_addr) = socket_pair().await;

        let connection = Connection::new(context.clone(), remote_addr, drain_tx);
        connection.start(server_side);

        // the client never reads, the write path ends up blocked on a full socket
        let sender = connection.clone();
        let filler = tokio::spawn(async move {
            let chunk = Bytes::from(vec![b'x'; 1024 * 1024]);
            while sender.send(chunk.clone()).await.is_ok() {}
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        connection.stop().await;
        tokio::time::timeout(Duration::from_secs(5), filler)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let mut write_errors = 0;
        for _ in 0..20 {
            if client.write_all(b"still there?").await.is_err() {
                write_errors += 1;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(write_errors > 0, "socket still open after stop");
    }

    #[tokio::test]
    async fn test_property_bag() {
        let context = test_context(None);
        let (drain_tx, _drain_rx) = mpsc::channel(1);
        let (server_side, _client, remote_addr) = socket_pair().await;
        let connection = Connection::new(context, remote_addr, drain_tx);
        drop(server_side);

        connection.set_property("user", "alice".to_string());
        connection.set_property("level", 3u32);

        let user = connection.get_property_as::<String>("user").unwrap();
        assert_eq!(user.as_str(), "alice");
        assert_eq!(*connection.get_property_as::<u32>("level").unwrap(), 3);
        assert!(matches!(
            connection.get_property_as::<u64>("level"),
            Err(AppError::InvalidValue(_))
        ));

        connection.del_property("user");
        assert!(matches!(
            connection.get_property("user"),
            Err(AppError::PropertyNotFound(_))
        ));
    }
}
