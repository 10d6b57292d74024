use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP listener and static fallback
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker directory and process lifecycle settings
    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the gateway listens on (default: 0.0.0.0:8080)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Optional directory served for requests that do not resolve to a worker.
    /// Dot-prefixed files and directories are never served or listed.
    pub static_root: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            static_root: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Directory holding the worker executables
    #[serde(default = "default_worker_root")]
    pub root: PathBuf,

    /// File name suffix that marks an executable as a worker
    #[serde(default = "default_suffix")]
    pub suffix: String,

    /// Directory for worker sockets. When set, each worker receives its socket
    /// path as its only argument; when unset, the gateway hands the worker a
    /// ready listener on stdin.
    pub socket_dir: Option<PathBuf>,

    /// Idle time in seconds before a worker is stopped (0 disables idle eviction)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Grace period in milliseconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Number of connect attempts while waiting for a new worker
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    /// Delay in milliseconds between readiness connect attempts
    #[serde(default = "default_readiness_interval")]
    pub readiness_interval_ms: u64,

    /// Seconds between idle reaper cycles
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            root: default_worker_root(),
            suffix: default_suffix(),
            socket_dir: None,
            idle_timeout_secs: default_idle_timeout(),
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            readiness_attempts: default_readiness_attempts(),
            readiness_interval_ms: default_readiness_interval(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}

impl WorkerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    /// Whether workers create their own named sockets
    pub fn socket_mode(&self) -> bool {
        self.socket_dir.is_some()
    }

    /// Check whether a path names a worker binary by suffix alone
    pub fn is_worker_name(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.len() > self.suffix.len() && n.ends_with(&self.suffix))
            .unwrap_or(false)
    }
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_worker_root() -> PathBuf {
    PathBuf::from("/web")
}

fn default_suffix() -> String {
    ".fcgi".to_string()
}

fn default_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_shutdown_grace_period() -> u64 {
    1000
}

fn default_readiness_attempts() -> u32 {
    100
}

fn default_readiness_interval() -> u64 {
    20
}

fn default_reap_interval() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and resolve the worker and static roots to
    /// absolute paths. Errors here are fatal at startup.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match std::fs::canonicalize(&self.workers.root) {
            Ok(root) if root.is_dir() => self.workers.root = root,
            Ok(root) => errors.push(format!("worker root {} is not a directory", root.display())),
            Err(e) => errors.push(format!(
                "cannot access worker root {}: {}",
                self.workers.root.display(),
                e
            )),
        }

        if let Some(ref static_root) = self.server.static_root {
            match std::fs::canonicalize(static_root) {
                Ok(root) if root.is_dir() => self.server.static_root = Some(root),
                Ok(root) => errors.push(format!("static root {} is not a directory", root.display())),
                Err(e) => errors.push(format!(
                    "cannot access static root {}: {}",
                    static_root.display(),
                    e
                )),
            }
        }

        if self.workers.suffix.is_empty() {
            errors.push("worker suffix must not be empty".to_string());
        }

        if self.workers.readiness_attempts == 0 {
            errors.push("readiness_attempts must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
