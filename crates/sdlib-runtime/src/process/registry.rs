//! Thread-safe registry of live engine processes.
//!
//! One record per model id, one record per port. The registry owns the
//! child handles; everything handed out is a snapshot. A single mutex
//! guards the map together with the used- and reserved-port sets, so the
//! port invariants hold without extra coordination.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sdlib_core::{ExecMode, ProcessError};

use super::health::pid_alive;
use super::ports;
use super::shutdown::shutdown_child;

/// Engine process lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ProcessStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a tracked engine process.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessRecord {
    pub model_id: String,
    pub pid: u32,
    pub port: u16,
    pub exec_mode: ExecMode,
    pub status: ProcessStatus,
    /// Milliseconds since epoch.
    pub started_at_ms: u64,
    pub last_heartbeat_ms: u64,
}

impl ProcessRecord {
    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }
}

struct TrackedProcess {
    record: ProcessRecord,
    child: Option<Child>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    processes: HashMap<String, TrackedProcess>,
    used_ports: HashSet<u16>,
    reserved_ports: HashSet<u16>,
}

/// Registry of running engine processes with port bookkeeping.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly spawned child as `starting`.
    ///
    /// Replaces an existing record for the same model id; the caller must
    /// have terminated that child already. Fails if another model holds
    /// the port.
    pub fn register(
        &self,
        model_id: &str,
        mut child: Child,
        port: u16,
        exec_mode: ExecMode,
    ) -> Result<ProcessRecord, ProcessError> {
        if model_id.is_empty() {
            return Err(ProcessError::InvalidRecord("empty model id".to_string()));
        }
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::InvalidRecord("child has no pid".to_string()))?;

        let mut inner = self.inner.lock().expect("registry poisoned");

        if let Some(old) = inner.processes.remove(model_id) {
            debug!(model_id, old_port = old.record.port, "replacing stale record");
            inner.used_ports.remove(&old.record.port);
        }

        if inner
            .processes
            .values()
            .any(|p| p.record.port == port || p.record.pid == pid)
        {
            // Reap the orphan we were handed before bailing out
            let _ = child.start_kill();
            return Err(ProcessError::InvalidRecord(format!(
                "port {port} or pid {pid} already tracked"
            )));
        }

        let now = now_ms();
        let record = ProcessRecord {
            model_id: model_id.to_string(),
            pid,
            port,
            exec_mode,
            status: ProcessStatus::Starting,
            started_at_ms: now,
            last_heartbeat_ms: now,
        };

        inner.reserved_ports.remove(&port);
        inner.used_ports.insert(port);
        inner.processes.insert(
            model_id.to_string(),
            TrackedProcess {
                record: record.clone(),
                child: Some(child),
                cancel: CancellationToken::new(),
            },
        );

        Ok(record)
    }

    /// Stop tracking a model and release its port. Idempotent.
    pub fn unregister(&self, model_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("registry poisoned");
        if let Some(tracked) = inner.processes.remove(model_id) {
            inner.used_ports.remove(&tracked.record.port);
            true
        } else {
            false
        }
    }

    pub fn get(&self, model_id: &str) -> Option<ProcessRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.processes.get(model_id).map(|p| p.record.clone())
    }

    pub fn get_by_port(&self, port: u16) -> Option<ProcessRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .processes
            .values()
            .find(|p| p.record.port == port)
            .map(|p| p.record.clone())
    }

    pub fn all(&self) -> Vec<ProcessRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.processes.values().map(|p| p.record.clone()).collect()
    }

    pub fn by_exec_mode(&self, mode: ExecMode) -> Vec<ProcessRecord> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner
            .processes
            .values()
            .filter(|p| p.record.exec_mode == mode)
            .map(|p| p.record.clone())
            .collect()
    }

    /// A record exists and has not terminated.
    pub fn is_running(&self, model_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.processes.get(model_id).is_some_and(|p| {
            !matches!(
                p.record.status,
                ProcessStatus::Stopped | ProcessStatus::Error
            )
        })
    }

    /// Record a liveness signal. A `starting` process becomes `running`.
    pub fn heartbeat(&self, model_id: &str) -> Option<ProcessStatus> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let tracked = inner.processes.get_mut(model_id)?;
        tracked.record.last_heartbeat_ms = now_ms();
        if tracked.record.status == ProcessStatus::Starting {
            tracked.record.status = ProcessStatus::Running;
        }
        Some(tracked.record.status)
    }

    pub fn update_status(&self, model_id: &str, status: ProcessStatus) -> bool {
        let mut inner = self.inner.lock().expect("registry poisoned");
        match inner.processes.get_mut(model_id) {
            Some(tracked) => {
                tracked.record.status = status;
                true
            }
            None => false,
        }
    }

    /// Cancellation token tied to a tracked process.
    pub fn cancel_token(&self, model_id: &str) -> Option<CancellationToken> {
        let inner = self.inner.lock().expect("registry poisoned");
        inner.processes.get(model_id).map(|p| p.cancel.clone())
    }

    /// Terminate a tracked process (SIGTERM, grace, SIGKILL), reap it,
    /// and unregister. Returns whether anything was killed.
    pub async fn kill(&self, model_id: &str) -> Result<bool, ProcessError> {
        let tracked = {
            let mut inner = self.inner.lock().expect("registry poisoned");
            let Some(mut tracked) = inner.processes.remove(model_id) else {
                return Ok(false);
            };
            inner.used_ports.remove(&tracked.record.port);
            tracked.record.status = ProcessStatus::Stopping;
            tracked.cancel.cancel();
            tracked
        };

        if let Some(child) = tracked.child {
            debug!(model_id, pid = tracked.record.pid, "stopping engine process");
            shutdown_child(child).await?;
        }
        Ok(true)
    }

    /// Remove records whose child has exited, whose PID no longer exists,
    /// or whose status is `stopped`. Returns the reclaimed records.
    pub fn cleanup_zombies(&self) -> Vec<ProcessRecord> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let mut dead = Vec::new();

        for (id, tracked) in &mut inner.processes {
            let exited = match tracked.child.as_mut().map(Child::try_wait) {
                Some(Ok(Some(status))) => {
                    debug!(model_id = %id, ?status, "engine exited");
                    true
                }
                Some(Ok(None)) => false,
                Some(Err(e)) => {
                    warn!(model_id = %id, error = %e, "error checking engine process");
                    true
                }
                None => false,
            };

            if exited
                || tracked.record.status == ProcessStatus::Stopped
                || !pid_alive(tracked.record.pid)
            {
                dead.push(id.clone());
            }
        }

        let mut removed = Vec::with_capacity(dead.len());
        for id in dead {
            if let Some(tracked) = inner.processes.remove(&id) {
                inner.used_ports.remove(&tracked.record.port);
                removed.push(tracked.record);
            }
        }
        removed
    }

    /// Reserve a port for a spawn in progress. The reservation converts
    /// to a tracked port on `register` or is dropped via
    /// [`Self::release_reservation`].
    pub fn allocate_port(&self, preferred: Option<u16>) -> Result<u16, ProcessError> {
        let mut inner = self.inner.lock().expect("registry poisoned");
        let unavailable: HashSet<u16> = inner
            .used_ports
            .union(&inner.reserved_ports)
            .copied()
            .collect();
        let port = ports::allocate_port(preferred, &unavailable)?;
        inner.reserved_ports.insert(port);
        Ok(port)
    }

    pub fn release_reservation(&self, port: u16) {
        let mut inner = self.inner.lock().expect("registry poisoned");
        inner.reserved_ports.remove(&port);
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("registry poisoned").processes.len()
    }

    /// Tracked ports, for invariant checks.
    pub fn used_ports(&self) -> HashSet<u16> {
        self.inner
            .lock()
            .expect("registry poisoned")
            .used_ports
            .clone()
    }
}

fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
