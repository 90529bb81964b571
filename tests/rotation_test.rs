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

#![cfg(target_os = "linux")]

use std::ffi::OsString;
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use stonenet::{graceful, Listener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

const SUCCESSOR: &str = "successor_echoes_one_byte";

/// Runs only inside the process spawned by `test_successor_serves_same_address`.
#[tokio::test]
#[ignore = "started in a child process with the listener on fd 3"]
async fn successor_echoes_one_byte() {
    if !graceful::is_restarted_generation() {
        return;
    }
    // the address is ignored, the listener comes from fd 3
    let listener = Listener::open("127.0.0.1:1", Duration::from_secs(180))
        .await
        .unwrap();
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut byte = [0u8; 1];
    stream.read_exact(&mut byte).await.unwrap();
    stream.write_all(&byte).await.unwrap();
    stream.flush().await.unwrap();
}

#[tokio::test]
async fn test_successor_serves_same_address() {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let program = std::env::current_exe().unwrap();
    let args: Vec<OsString> = ["--exact", SUCCESSOR, "--ignored", "--test-threads=1"]
        .iter()
        .map(OsString::from)
        .collect();
    let pid = graceful::spawn_with_listener(&program, &args, listener.as_raw_fd()).unwrap();
    // from here on only the successor holds the socket
    drop(listener);

    let mut client = time::timeout(Duration::from_secs(30), TcpStream::connect(addr))
        .await
        .expect("connect timed out")
        .unwrap();
    client.write_all(b"z").await.unwrap();
    let mut reply = [0u8; 1];
    time::timeout(Duration::from_secs(30), client.read_exact(&mut reply))
        .await
        .expect("successor never answered")
        .unwrap();
    assert_eq!(&reply, b"z");

    let status = tokio::task::spawn_blocking(move || {
        let mut status = 0;
        let waited = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
        assert_eq!(waited, pid as libc::pid_t);
        status
    })
    .await
    .unwrap();
    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 0);
}
