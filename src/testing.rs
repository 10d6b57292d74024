//! In-memory stand-ins for worker processes and the launcher

use crate::error::SpawnError;
use crate::launcher::Launch;
use crate::process::WorkerProcess;
use crate::registry::Worker;
use crate::transport::Transport;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Observable state of a [`FakeProcess`]
#[derive(Debug, Default)]
pub struct FakeState {
    pub exited: bool,
    pub terminated: bool,
    pub killed: bool,
    pub waits: usize,
    /// Exit as soon as SIGTERM arrives
    pub exit_on_terminate: bool,
}

pub struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<FakeState>>,
}

impl FakeProcess {
    pub fn new(pid: u32) -> (Self, Arc<Mutex<FakeState>>) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                pid,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl WorkerProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        self.state.lock().exited
    }

    fn terminate(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.terminated = true;
        if state.exit_on_terminate {
            state.exited = true;
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.killed = true;
        state.exited = true;
        Ok(())
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<ExitStatus>> {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            state.lock().waits += 1;
            loop {
                if state.lock().exited {
                    return Ok(ExitStatus::from_raw(0));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }
}

/// Launcher that hands out fake processes with socket files in `dir`
pub struct FakeLauncher {
    dir: PathBuf,
    idle_timeout: Duration,
    delay: Mutex<Duration>,
    fail_next: AtomicBool,
    processes: Mutex<Vec<Arc<Mutex<FakeState>>>>,
}

impl FakeLauncher {
    pub fn new(dir: &Path, idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            idle_timeout,
            delay: Mutex::new(Duration::ZERO),
            fail_next: AtomicBool::new(false),
            processes: Mutex::new(Vec::new()),
        })
    }

    /// Make every launch take `delay`
    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock() = delay;
        self
    }

    /// Number of workers launched so far
    pub fn launches(&self) -> usize {
        self.processes.lock().len()
    }

    /// State of the `index`th launched process
    pub fn process(&self, index: usize) -> Arc<Mutex<FakeState>> {
        Arc::clone(&self.processes.lock()[index])
    }

    pub fn socket_exists(&self, index: usize) -> bool {
        self.socket_path(index).exists()
    }

    /// Fail the next launch with a start error
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn socket_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.sock", index))
    }
}

impl Launch for FakeLauncher {
    fn launch<'a>(
        &'a self,
        identity: &'a Path,
        binary_modified: SystemTime,
    ) -> BoxFuture<'a, Result<Worker, SpawnError>> {
        Box::pin(async move {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(SpawnError::Start {
                    path: identity.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::Other, "launch refused"),
                });
            }

            let mut processes = self.processes.lock();
            let index = processes.len();
            let socket = self.socket_path(index);
            std::fs::write(&socket, "").map_err(|source| SpawnError::Transport {
                path: identity.to_path_buf(),
                source,
            })?;

            let (process, state) = FakeProcess::new(1000 + index as u32);
            processes.push(state);

            Ok(Worker::new(
                identity.to_path_buf(),
                Box::new(process),
                Transport::NamedSocket(socket),
                binary_modified,
                self.idle_timeout,
            ))
        })
    }
}

/// Write a small executable script and return its canonical path
pub fn write_executable(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    std::fs::canonicalize(&path).unwrap()
}

/// Push a file's mtime `by` into the future and return the new mtime
pub fn touch_forward(path: &Path, by: Duration) -> SystemTime {
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + by).unwrap();
    drop(file);
    std::fs::metadata(path).unwrap().modified().unwrap()
}
