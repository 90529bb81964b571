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

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::{AppError, AppResult};

#[cfg(unix)]
use super::graceful;

/// The listening socket of one process generation.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    keepalive: Duration,
}

impl Listener {
    /// Binds `address`, or takes over the socket inherited from the previous
    /// generation when this process was started by a rotation.
    pub async fn open(address: &str, keepalive: Duration) -> AppResult<Listener> {
        #[cfg(unix)]
        {
            if graceful::is_restarted_generation() {
                let listener = Self::inherit(keepalive)?;
                info!(
                    "tcp server inherited listener on {} from previous process",
                    listener.local_addr()?
                );
                return Ok(listener);
            }
        }
        Self::bind(address, keepalive).await
    }

    pub async fn bind(address: &str, keepalive: Duration) -> AppResult<Listener> {
        match TcpListener::bind(address).await {
            Ok(inner) => {
                info!("tcp server binding to {} for listening", address);
                Ok(Listener { inner, keepalive })
            }
            Err(err) => {
                let error_msg = format!(
                    "Failed to bind server to address: {} - Error: {}",
                    address, err
                );
                error!(error_msg);
                Err(AppError::IllegalStateError(error_msg))
            }
        }
    }

    #[cfg(unix)]
    pub fn inherit(keepalive: Duration) -> AppResult<Listener> {
        let std_listener = graceful::inherited_listener()?;
        std_listener.set_nonblocking(true)?;
        Ok(Listener {
            inner: TcpListener::from_std(std_listener)?,
            keepalive,
        })
    }

    /// Accepts one stream with tcp keep-alive enabled.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, remote_addr) = self.inner.accept().await?;
        let keepalive = TcpKeepalive::new().with_time(self.keepalive);
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("enable keep-alive for {} err: {}", remote_addr, e);
        }
        Ok((stream, remote_addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(unix)]
impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
