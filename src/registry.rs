//! Registry of running workers
//!
//! Each worker identity (the absolute path of its executable) owns one slot.
//! A slot's async mutex serializes the health check and the whole
//! create/replace sequence for that identity, so concurrent first requests
//! spawn exactly one process while unrelated identities proceed in parallel.
//! Slots are never removed from the map; an empty slot is `None`.
//!
//! A replacement runs in its own task holding the slot, so a request that is
//! dropped midway still leaves the slot with the old worker fully retired and
//! the new one registered.

use crate::error::SpawnError;
use crate::launcher::Launch;
use crate::process::{shut_down, ShutdownPolicy, WorkerProcess};
use crate::transport::{Endpoint, Transport};
use dashmap::DashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

type Slot = Arc<Mutex<Option<Worker>>>;

/// Why a worker is being retired. The reason alone picks the shutdown policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// The reaper found the process already gone
    Exited,
    /// A request found the process gone
    UnhealthyProcess,
    /// Unused for longer than its idle timeout
    IdleTimeout,
    /// The executable was rewritten on disk
    BinaryChanged,
    /// The gateway is stopping
    Shutdown,
}

impl RetireReason {
    pub fn policy(self, grace_period: Duration) -> ShutdownPolicy {
        match self {
            RetireReason::Exited | RetireReason::UnhealthyProcess => ShutdownPolicy::ReapOnly,
            RetireReason::IdleTimeout => ShutdownPolicy::Immediate,
            RetireReason::BinaryChanged | RetireReason::Shutdown => {
                ShutdownPolicy::Graceful(grace_period)
            }
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RetireReason::Exited => "exited",
            RetireReason::UnhealthyProcess => "unhealthy",
            RetireReason::IdleTimeout => "idle timeout",
            RetireReason::BinaryChanged => "binary changed",
            RetireReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

enum Health {
    Usable,
    Exited,
    Stale,
}

/// A running worker and the resources it owns
pub struct Worker {
    identity: PathBuf,
    generation: u64,
    process: Box<dyn WorkerProcess>,
    transport: Transport,
    last_used: Instant,
    binary_modified: SystemTime,
    idle_timeout: Duration,
}

impl Worker {
    pub fn new(
        identity: PathBuf,
        process: Box<dyn WorkerProcess>,
        transport: Transport,
        binary_modified: SystemTime,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            generation: NEXT_GENERATION.fetch_add(1, Ordering::Relaxed),
            process,
            transport,
            last_used: Instant::now(),
            binary_modified,
            idle_timeout,
        }
    }

    pub fn lease(&self) -> WorkerLease {
        WorkerLease {
            identity: self.identity.clone(),
            generation: self.generation,
            pid: self.process.pid(),
            endpoint: self.transport.endpoint(),
            binary_modified: self.binary_modified,
            last_used: self.last_used,
        }
    }

    fn health(&mut self, current_modified: SystemTime) -> Health {
        if self.process.has_exited() {
            Health::Exited
        } else if current_modified > self.binary_modified {
            Health::Stale
        } else {
            Health::Usable
        }
    }

    fn idle_expired(&self, now: Instant) -> bool {
        !self.idle_timeout.is_zero() && now.saturating_duration_since(self.last_used) > self.idle_timeout
    }

    /// Stop the process per the reason's policy, then release the transport
    pub async fn retire(mut self, reason: RetireReason, grace_period: Duration) {
        let pid = self.process.pid();
        info!(identity = %self.identity.display(), pid, %reason, "Retiring worker");

        shut_down(self.process.as_mut(), reason.policy(grace_period), &self.identity).await;

        let endpoint = self.transport.endpoint();
        if let Err(e) = self.transport.release() {
            warn!(identity = %self.identity.display(), %endpoint, error = %e, "Failed to release worker transport");
        }
    }
}

/// Snapshot of a ready worker, handed to the protocol bridge. Owns no OS
/// resources.
#[derive(Debug, Clone)]
pub struct WorkerLease {
    pub identity: PathBuf,
    pub generation: u64,
    pub pid: u32,
    pub endpoint: Endpoint,
    pub binary_modified: SystemTime,
    pub last_used: Instant,
}

/// Outcome of one reaper cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub exited: usize,
    pub idle: usize,
    pub busy: usize,
}

/// Owns every worker, keyed by identity
pub struct Registry {
    slots: DashMap<PathBuf, Slot>,
    launcher: Arc<dyn Launch>,
    grace_period: Duration,
}

impl Registry {
    pub fn new(launcher: Arc<dyn Launch>, grace_period: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            launcher,
            grace_period,
        }
    }

    fn slot(&self, identity: &Path) -> Slot {
        self.slots
            .entry(identity.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn existing_slot(&self, identity: &Path) -> Option<Slot> {
        self.slots.get(identity).map(|slot| Arc::clone(slot.value()))
    }

    fn all_slots(&self) -> Vec<(PathBuf, Slot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Return a usable worker for `identity`, retiring an exited or stale one
    /// and launching a replacement when needed.
    pub async fn get_or_create(&self, identity: &Path) -> Result<WorkerLease, SpawnError> {
        let mut guard = self.slot(identity).lock_owned().await;

        let modified = binary_modified(identity).await?;

        let reason = match guard.as_mut() {
            Some(worker) => match worker.health(modified) {
                Health::Usable => {
                    worker.last_used = Instant::now();
                    return Ok(worker.lease());
                }
                Health::Exited => Some(RetireReason::UnhealthyProcess),
                Health::Stale => Some(RetireReason::BinaryChanged),
            },
            None => None,
        };

        let launcher = Arc::clone(&self.launcher);
        let grace_period = self.grace_period;
        let path = identity.to_path_buf();
        let replace = tokio::spawn(async move {
            if let (Some(reason), Some(worker)) = (reason, guard.take()) {
                worker.retire(reason, grace_period).await;
            }

            let worker = launcher.launch(&path, modified).await?;
            let lease = worker.lease();
            info!(
                identity = %path.display(),
                pid = lease.pid,
                endpoint = %lease.endpoint,
                "Worker ready"
            );
            *guard = Some(worker);
            Ok::<_, SpawnError>(lease)
        });

        replace.await.map_err(|e| SpawnError::Start {
            path: identity.to_path_buf(),
            source: io::Error::other(e),
        })?
    }

    /// Record a completed dispatch. Skipped when the slot is busy with a
    /// replacement or a reap, and ignored if the worker was replaced meanwhile.
    pub fn touch(&self, lease: &WorkerLease) {
        let Some(slot) = self.existing_slot(&lease.identity) else {
            return;
        };
        let Ok(mut guard) = slot.try_lock() else {
            debug!(identity = %lease.identity.display(), "Worker slot busy, last use not recorded");
            return;
        };
        if let Some(worker) = guard.as_mut() {
            if worker.generation == lease.generation {
                worker.last_used = Instant::now();
            }
        }
    }

    /// Retire the worker for `identity`, if one is registered
    pub async fn retire(&self, identity: &Path, reason: RetireReason) -> bool {
        let Some(slot) = self.existing_slot(identity) else {
            return false;
        };
        let mut guard = slot.lock().await;
        match guard.take() {
            Some(worker) => {
                worker.retire(reason, self.grace_period).await;
                true
            }
            None => false,
        }
    }

    /// Retire the worker for `identity` only if the executable on disk is
    /// newer than the one it was started from, or is gone
    pub async fn retire_if_stale(&self, identity: &Path) -> bool {
        let Some(slot) = self.existing_slot(identity) else {
            return false;
        };
        let mut guard = slot.lock().await;
        let Some(recorded) = guard.as_ref().map(|worker| worker.binary_modified) else {
            return false;
        };

        if let Ok(current) = binary_modified(identity).await {
            if current <= recorded {
                debug!(identity = %identity.display(), "Worker already runs the current binary");
                return false;
            }
        }

        match guard.take() {
            Some(worker) => {
                worker.retire(RetireReason::BinaryChanged, self.grace_period).await;
                true
            }
            None => false,
        }
    }

    /// One idle-reaper cycle. Workers whose process exited are reaped
    /// regardless of idle time; others are killed once their idle timeout has
    /// passed. Slots busy with a spawn or retirement are left for next cycle.
    pub async fn reap(&self) -> ReapReport {
        let mut report = ReapReport::default();
        let now = Instant::now();

        for (identity, slot) in self.all_slots() {
            let Ok(mut guard) = slot.try_lock() else {
                debug!(identity = %identity.display(), "Worker busy, skipping this reap cycle");
                report.busy += 1;
                continue;
            };

            let reason = match guard.as_mut() {
                None => continue,
                Some(worker) => {
                    if worker.process.has_exited() {
                        RetireReason::Exited
                    } else if worker.idle_expired(now) {
                        info!(
                            identity = %identity.display(),
                            pid = worker.process.pid(),
                            idle_secs = now.saturating_duration_since(worker.last_used).as_secs(),
                            "Worker idle timeout reached"
                        );
                        RetireReason::IdleTimeout
                    } else {
                        continue;
                    }
                }
            };

            if let Some(worker) = guard.take() {
                worker.retire(reason, self.grace_period).await;
                match reason {
                    RetireReason::Exited => report.exited += 1,
                    _ => report.idle += 1,
                }
            }
        }

        report
    }

    /// Retire every registered worker
    pub async fn retire_all(&self, reason: RetireReason) -> usize {
        let mut retired = 0;
        for (_, slot) in self.all_slots() {
            let mut guard = slot.lock().await;
            if let Some(worker) = guard.take() {
                worker.retire(reason, self.grace_period).await;
                retired += 1;
            }
        }
        retired
    }

    /// Snapshot of the worker registered for `identity`
    pub async fn snapshot(&self, identity: &Path) -> Option<WorkerLease> {
        let slot = self.existing_slot(identity)?;
        let guard = slot.lock().await;
        guard.as_ref().map(Worker::lease)
    }

    pub async fn contains(&self, identity: &Path) -> bool {
        self.snapshot(identity).await.is_some()
    }

    /// Number of registered workers
    pub async fn len(&self) -> usize {
        let mut count = 0;
        for (_, slot) in self.all_slots() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn binary_modified(identity: &Path) -> Result<SystemTime, SpawnError> {
    let metadata = match tokio::fs::metadata(identity).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SpawnError::BinaryMissing(identity.to_path_buf()));
        }
        Err(source) => {
            return Err(SpawnError::Inspect {
                path: identity.to_path_buf(),
                source,
            });
        }
    };
    metadata.modified().map_err(|source| SpawnError::Inspect {
        path: identity.to_path_buf(),
        source,
    })
}
