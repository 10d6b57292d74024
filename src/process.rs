//! Worker process capability and shutdown sequencing
//!
//! The registry never touches `tokio::process::Child` directly. It talks to a
//! [`WorkerProcess`], which lets unit tests substitute an in-memory process.

use futures::future::BoxFuture;
use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

/// Capability over a running worker process
pub trait WorkerProcess: Send {
    /// OS process id captured at spawn time
    fn pid(&self) -> u32;

    /// Non-blocking liveness check. Reaps the process if it already exited.
    fn has_exited(&mut self) -> bool;

    /// Ask the process to stop (SIGTERM)
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process to stop (SIGKILL)
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit and reap it
    fn wait(&mut self) -> BoxFuture<'_, io::Result<ExitStatus>>;
}

/// A worker backed by a real child process
pub struct OsProcess {
    child: Child,
    pid: u32,
}

impl OsProcess {
    pub fn new(child: Child) -> Self {
        let pid = child.id().unwrap_or(0);
        Self { child, pid }
    }
}

impl WorkerProcess for OsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                debug!(pid = self.pid, error = %e, "try_wait failed, treating worker as exited");
                true
            }
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        // `id()` is None once the child has been reaped, so a recycled pid is
        // never signalled.
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if result != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(err);
                }
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            self.child.start_kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.child.id().is_none() {
            return Ok(());
        }
        self.child.start_kill()
    }

    fn wait(&mut self) -> BoxFuture<'_, io::Result<ExitStatus>> {
        Box::pin(self.child.wait())
    }
}

/// How a worker is brought down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// The process already exited; only reap it
    ReapOnly,
    /// SIGKILL right away
    Immediate,
    /// SIGTERM, then SIGKILL once the grace period runs out
    Graceful(Duration),
}

/// Bring a worker process down according to `policy`. Always reaps the
/// process before returning so no zombie is left behind.
pub async fn shut_down(process: &mut dyn WorkerProcess, policy: ShutdownPolicy, identity: &Path) {
    let pid = process.pid();
    let identity = identity.display();

    let policy = match policy {
        // A live process would never be reaped by waiting alone
        ShutdownPolicy::ReapOnly if !process.has_exited() => ShutdownPolicy::Immediate,
        other => other,
    };

    match policy {
        ShutdownPolicy::ReapOnly => {}
        ShutdownPolicy::Immediate => {
            debug!(%identity, pid, "Sending SIGKILL to worker");
            if let Err(e) = process.kill() {
                warn!(%identity, pid, error = %e, "Failed to kill worker");
            }
        }
        ShutdownPolicy::Graceful(grace_period) => {
            if !process.has_exited() {
                info!(%identity, pid, "Sending SIGTERM to worker");
                if let Err(e) = process.terminate() {
                    warn!(%identity, pid, error = %e, "Failed to send SIGTERM to worker");
                }

                match tokio::time::timeout(grace_period, process.wait()).await {
                    Ok(Ok(status)) => {
                        info!(%identity, pid, ?status, "Worker exited gracefully");
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(%identity, pid, error = %e, "Error waiting for worker to exit");
                    }
                    Err(_) => {
                        warn!(
                            %identity,
                            pid,
                            grace_period_ms = grace_period.as_millis() as u64,
                            "Grace period exceeded, sending SIGKILL"
                        );
                    }
                }
                if let Err(e) = process.kill() {
                    warn!(%identity, pid, error = %e, "Failed to kill worker");
                }
            }
        }
    }

    match process.wait().await {
        Ok(status) => debug!(%identity, pid, ?status, "Worker reaped"),
        Err(e) => warn!(%identity, pid, error = %e, "Error waiting for worker"),
    }
}

/// Relay every line of a captured worker stream into the log
pub fn relay_output<R>(stream: R, worker: String, pid: u32, stream_name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(worker = %worker, pid, stream = stream_name, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(worker = %worker, pid, stream = stream_name, error = %e, "Error reading worker output");
                    break;
                }
            }
        }
    });
}
