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

//! Process rotation plumbing (unix only).
//!
//! A rotation re-executes the current binary with the same arguments, the
//! [`GRACEFUL_ENV_KEY`] marker set and the listening socket duplicated into
//! descriptor [`INHERITED_LISTENER_FD`]. The new process rebuilds its listener
//! from that descriptor instead of binding, so the socket never closes.

use std::ffi::OsString;
use std::io;
use std::net::TcpListener as StdTcpListener;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

use crate::{AppError, AppResult};

pub const GRACEFUL_ENV_KEY: &str = "STONENET_GRACEFUL";
pub const GRACEFUL_ENV_VALUE: &str = "1";
/// first descriptor after stdin, stdout and stderr
pub const INHERITED_LISTENER_FD: RawFd = 3;

pub fn is_restarted_generation() -> bool {
    std::env::var_os(GRACEFUL_ENV_KEY).is_some_and(|value| !value.is_empty())
}

/// Takes ownership of the listener passed down by the previous generation.
pub fn inherited_listener() -> AppResult<StdTcpListener> {
    // SAFETY: F_GETFD only inspects the descriptor table
    if unsafe { libc::fcntl(INHERITED_LISTENER_FD, libc::F_GETFD) } == -1 {
        return Err(AppError::IllegalStateError(format!(
            "restart marker set but descriptor {} is not open: {}",
            INHERITED_LISTENER_FD,
            io::Error::last_os_error()
        )));
    }
    // SAFETY: the descriptor is open and nothing else in this process owns it
    Ok(unsafe { StdTcpListener::from_raw_fd(INHERITED_LISTENER_FD) })
}

/// Re-executes the running binary with the listener inherited on fd 3.
///
/// Returns the pid of the new process.
pub fn spawn_successor(listener_fd: RawFd) -> AppResult<u32> {
    let program = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    spawn_with_listener(&program, &args, listener_fd)
}

pub fn spawn_with_listener(program: &Path, args: &[OsString], listener_fd: RawFd) -> AppResult<u32> {
    let mut command = Command::new(program);
    command
        .args(args)
        .env(GRACEFUL_ENV_KEY, GRACEFUL_ENV_VALUE);
    // SAFETY: the hook runs between fork and exec and only calls
    // async-signal-safe functions (fcntl, dup2)
    unsafe {
        command.pre_exec(move || inherit_fd(listener_fd, INHERITED_LISTENER_FD));
    }
    let child = command
        .spawn()
        .map_err(|e| AppError::Spawn(format!("{}: {}", program.display(), e)))?;
    debug!("spawned {} with listener fd {}", child.id(), listener_fd);
    Ok(child.id())
}

/// Places `fd` at `target` without close-on-exec.
fn inherit_fd(fd: RawFd, target: RawFd) -> io::Result<()> {
    if fd == target {
        // dup2 onto itself keeps FD_CLOEXEC, clear it by hand
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
            return Err(io::Error::last_os_error());
        }
        return Ok(());
    }
    if unsafe { libc::dup2(fd, target) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGUSR2: hand the listener to a new process, then drain
    Rotate,
    /// SIGTERM or Ctrl-C: drain and exit
    Terminate,
}

pub struct ControlSignals {
    rotate: Signal,
    terminate: Signal,
}

impl ControlSignals {
    pub fn new() -> AppResult<Self> {
        Ok(ControlSignals {
            rotate: signal(SignalKind::user_defined2())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    pub async fn recv(&mut self) -> Option<ControlSignal> {
        tokio::select! {
            res = self.rotate.recv() => res.map(|_| ControlSignal::Rotate),
            res = self.terminate.recv() => res.map(|_| ControlSignal::Terminate),
            res = tokio::signal::ctrl_c() => res.ok().map(|_| ControlSignal::Terminate),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::io::AsRawFd;

    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn test_child_sees_listener_and_marker() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let script = r#"[ "$STONENET_GRACEFUL" = 1 ] && [ -e /proc/self/fd/3 ]"#;
        let args = vec![OsString::from("-c"), OsString::from(script)];

        let pid = spawn_with_listener(Path::new("/bin/sh"), &args, listener.as_raw_fd()).unwrap();
        assert!(pid > 0);

        // reap the child and check its verdict
        let mut status = 0;
        let waited = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
        assert_eq!(waited, pid as libc::pid_t);
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    #[test]
    fn test_inherit_fd_onto_itself_clears_cloexec() {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_raw_fd();
        // std opens sockets close-on-exec
        let before = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(before & libc::FD_CLOEXEC, 0);

        inherit_fd(fd, fd).unwrap();
        let after = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(after & libc::FD_CLOEXEC, 0);
    }
}
