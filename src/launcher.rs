//! Starting worker processes
//!
//! Two transport modes, chosen once by whether a socket directory is
//! configured:
//!
//! - socket mode: the worker gets `<socket_dir>/<name>.sock` as its only
//!   argument and creates the listener itself. stdout and stderr are logged.
//! - stdin mode: the gateway binds an unnamed listener and passes it as the
//!   worker's stdin, then closes its own copy. Only stderr is logged.
//!
//! Either way the launcher polls the worker's endpoint until it accepts a
//! connection, and checks the process is still running, before handing the
//! worker to the registry.

use crate::config::WorkerConfig;
use crate::error::SpawnError;
use crate::process::{relay_output, shut_down, OsProcess, ShutdownPolicy, WorkerProcess};
use crate::registry::Worker;
use crate::transport::{Endpoint, Transport};
use futures::future::BoxFuture;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Upper bound for a single readiness connect attempt
const READINESS_CONNECT_TIMEOUT: Duration = Duration::from_millis(50);

/// Creates ready workers for the registry
pub trait Launch: Send + Sync {
    fn launch<'a>(
        &'a self,
        identity: &'a Path,
        binary_modified: SystemTime,
    ) -> BoxFuture<'a, Result<Worker, SpawnError>>;
}

/// Launches real worker processes
pub struct ProcessLauncher {
    config: WorkerConfig,
}

impl ProcessLauncher {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Path of the sidecar environment file for a worker binary
    pub fn env_file_path(&self, identity: &Path) -> PathBuf {
        let raw = identity.to_string_lossy();
        let stem = raw.strip_suffix(self.config.suffix.as_str()).unwrap_or(&raw);
        PathBuf::from(format!("{}.env", stem))
    }

    /// Socket-safe name for a worker: its path below the worker root with
    /// separators flattened
    pub fn socket_name(&self, identity: &Path) -> String {
        let relative = identity
            .strip_prefix(&self.config.root)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .or_else(|| identity.file_name().map(Path::new))
            .unwrap_or(identity);
        relative.to_string_lossy().trim_start_matches('/').replace('/', "_")
    }

    async fn spawn(&self, identity: &Path, binary_modified: SystemTime) -> Result<Worker, SpawnError> {
        let env_path = self.env_file_path(identity);
        let extra_env = load_env_file(&env_path).await?;

        let name = self.socket_name(identity);
        let mut transport = match self.config.socket_dir {
            Some(ref dir) => prepare_named_socket(dir, &name)
                .map_err(|source| SpawnError::Transport {
                    path: identity.to_path_buf(),
                    source,
                })?,
            None => Transport::bind_inherited(&name).map_err(|source| SpawnError::Transport {
                path: identity.to_path_buf(),
                source,
            })?,
        };

        let mut cmd = Command::new(identity);
        match transport {
            Transport::NamedSocket(ref path) => {
                cmd.arg(path);
                cmd.stdin(Stdio::null());
                cmd.stdout(Stdio::piped());
            }
            Transport::InheritedListener { .. } => {
                let stdin = match transport.child_stdin() {
                    Ok(stdin) => stdin,
                    Err(source) => {
                        release_quietly(transport, identity);
                        return Err(SpawnError::Transport {
                            path: identity.to_path_buf(),
                            source,
                        });
                    }
                };
                cmd.stdin(stdin);
            }
        }
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(vars) = extra_env {
            debug!(path = %env_path.display(), count = vars.len(), "Loaded worker environment file");
            cmd.envs(vars);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                release_quietly(transport, identity);
                if source.kind() == io::ErrorKind::NotFound {
                    return Err(SpawnError::BinaryMissing(identity.to_path_buf()));
                }
                return Err(SpawnError::Start {
                    path: identity.to_path_buf(),
                    source,
                });
            }
        };

        // The command and the transport both hold a copy of an inherited
        // listener. From here on the worker's copy must be the only one.
        drop(cmd);
        transport.hand_over();

        let pid = child.id().unwrap_or(0);
        let worker_name = identity
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| identity.display().to_string());
        if let Some(stderr) = child.stderr.take() {
            relay_output(stderr, worker_name.clone(), pid, "stderr");
        }
        if let Some(stdout) = child.stdout.take() {
            relay_output(stdout, worker_name, pid, "stdout");
        }

        let mut process = OsProcess::new(child);
        let endpoint = transport.endpoint();
        info!(
            identity = %identity.display(),
            pid,
            mode = transport.mode(),
            %endpoint,
            "Started worker process"
        );

        if let Err(e) = wait_until_ready(
            &mut process,
            &endpoint,
            identity,
            self.config.readiness_attempts,
            self.config.readiness_interval(),
        )
        .await
        {
            warn!(identity = %identity.display(), pid, error = %e, "Worker failed to become ready");
            shut_down(&mut process, ShutdownPolicy::Immediate, identity).await;
            release_quietly(transport, identity);
            return Err(e);
        }

        Ok(Worker::new(
            identity.to_path_buf(),
            Box::new(process),
            transport,
            binary_modified,
            self.config.idle_timeout(),
        ))
    }
}

impl Launch for ProcessLauncher {
    fn launch<'a>(
        &'a self,
        identity: &'a Path,
        binary_modified: SystemTime,
    ) -> BoxFuture<'a, Result<Worker, SpawnError>> {
        Box::pin(self.spawn(identity, binary_modified))
    }
}

fn prepare_named_socket(dir: &Path, name: &str) -> io::Result<Transport> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.sock", name));
    match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale worker socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(Transport::NamedSocket(path))
}

fn release_quietly(transport: Transport, identity: &Path) {
    if let Err(e) = transport.release() {
        warn!(identity = %identity.display(), error = %e, "Failed to release worker transport");
    }
}

/// Poll the worker's endpoint until it accepts a connection. Gives up early if
/// the process exits, including right after a connection was accepted.
pub async fn wait_until_ready(
    process: &mut dyn WorkerProcess,
    endpoint: &Endpoint,
    identity: &Path,
    attempts: u32,
    interval: Duration,
) -> Result<(), SpawnError> {
    let mut last_error = io::Error::new(io::ErrorKind::TimedOut, "no connection attempt made");

    for attempt in 1..=attempts {
        match tokio::time::timeout(READINESS_CONNECT_TIMEOUT, endpoint.connect()).await {
            Ok(Ok(_stream)) => {
                if process.has_exited() {
                    return Err(exited_early(process, identity).await);
                }
                debug!(identity = %identity.display(), attempt, "Worker accepting connections");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => last_error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
        }

        if process.has_exited() {
            return Err(exited_early(process, identity).await);
        }

        tokio::time::sleep(interval).await;
    }

    Err(SpawnError::NotReady {
        path: identity.to_path_buf(),
        attempts,
        source: last_error,
    })
}

async fn exited_early(process: &mut dyn WorkerProcess, identity: &Path) -> SpawnError {
    let status = match process.wait().await {
        Ok(status) => status.to_string(),
        Err(e) => e.to_string(),
    };
    SpawnError::ExitedEarly {
        path: identity.to_path_buf(),
        status,
    }
}

/// Read a `KEY=VALUE` environment file. Blank lines, `#` comments and lines
/// without `=` are skipped. Returns `None` when the file does not exist.
pub async fn load_env_file(path: &Path) -> Result<Option<Vec<(String, String)>>, SpawnError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SpawnError::EnvFile {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Ok(Some(parse_env(&content)))
}

fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}
