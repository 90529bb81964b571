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

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::network::graceful;
use crate::{AppError, AppResult};

/// `start | restart | stop`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Operation {
    Start,
    Restart,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// go on and serve in this process
    Serve,
    /// the running server at this pid was signalled
    Signalled(i32),
}

/// Decimal pid of the running server.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        PidFile {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, pid: u32) -> AppResult<()> {
        fs::write(&self.path, pid.to_string())?;
        info!("pid {} written to {}", pid, self.path.display());
        Ok(())
    }

    /// `None` when there is no pid file or it does not hold a pid.
    pub fn read(&self) -> AppResult<Option<i32>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match content.trim().parse::<i32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(
                    "ignore pid file {} with content {:?}",
                    self.path.display(),
                    content
                );
                Ok(None)
            }
        }
    }

    pub fn remove(&self) -> AppResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the permission and existence checks only
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Refuses to start while the pid file names a live process, unless this
/// process is the successor of a rotation.
pub fn check_start(pid_file: &PidFile) -> AppResult<()> {
    if graceful::is_restarted_generation() {
        return Ok(());
    }
    match pid_file.read()? {
        Some(pid) if process_alive(pid) => Err(AppError::AlreadyRunning(pid)),
        Some(pid) => {
            warn!("stale pid file {} names dead process {}", pid_file.path().display(), pid);
            Ok(())
        }
        None => Ok(()),
    }
}

fn send_signal(pid: i32, signal: libc::c_int) -> AppResult<()> {
    // SAFETY: plain kill(2) on a pid read from our own pid file
    if unsafe { libc::kill(pid, signal) } == -1 {
        return Err(AppError::Signal(format!(
            "signal {} to pid {}: {}",
            signal,
            pid,
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Runs the control side of an operation.
///
/// `start` only checks the pid file; `restart` and `stop` signal the running
/// server with SIGUSR2 and SIGTERM.
pub fn check_operation(operation: Operation, pid_file: &PidFile) -> AppResult<ControlOutcome> {
    match operation {
        Operation::Start => {
            check_start(pid_file)?;
            Ok(ControlOutcome::Serve)
        }
        Operation::Restart | Operation::Stop => {
            let pid = pid_file.read()?.ok_or(AppError::NotRunning)?;
            let signal = if operation == Operation::Restart {
                libc::SIGUSR2
            } else {
                libc::SIGTERM
            };
            send_signal(pid, signal)?;
            info!("{:?} signal sent to pid {}", operation, pid);
            Ok(ControlOutcome::Signalled(pid))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid_file_in(dir: &tempfile::TempDir) -> PidFile {
        PidFile::new(dir.path().join("stonenet.pid"))
    }

    #[test]
    fn test_pid_file_round_trip() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = pid_file_in(&dir);
        assert_eq!(pid_file.read()?, None);

        pid_file.write(4242)?;
        assert_eq!(fs::read_to_string(pid_file.path())?, "4242");
        assert_eq!(pid_file.read()?, Some(4242));

        pid_file.remove()?;
        assert_eq!(pid_file.read()?, None);
        // removing a missing file is fine
        pid_file.remove()?;
        Ok(())
    }

    #[test]
    fn test_garbage_pid_file_is_ignored() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = pid_file_in(&dir);
        fs::write(pid_file.path(), "not a pid")?;
        assert_eq!(pid_file.read()?, None);
        fs::write(pid_file.path(), "0")?;
        assert_eq!(pid_file.read()?, None);
        Ok(())
    }

    #[test]
    fn test_start_refused_while_running() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = pid_file_in(&dir);

        assert_eq!(
            check_operation(Operation::Start, &pid_file)?,
            ControlOutcome::Serve
        );

        // this test process is certainly alive
        pid_file.write(std::process::id())?;
        let result = check_operation(Operation::Start, &pid_file);
        if graceful::is_restarted_generation() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(AppError::AlreadyRunning(_))));
        }
        Ok(())
    }

    #[test]
    fn test_restart_and_stop_need_a_running_server() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let pid_file = pid_file_in(&dir);
        assert!(matches!(
            check_operation(Operation::Restart, &pid_file),
            Err(AppError::NotRunning)
        ));
        assert!(matches!(
            check_operation(Operation::Stop, &pid_file),
            Err(AppError::NotRunning)
        ));
        Ok(())
    }

    #[test]
    fn test_liveness() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }
}
