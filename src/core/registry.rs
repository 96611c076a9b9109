use crate::domain::model::ProcessRecord;
use crate::utils::error::{Result, StolonError};
use crate::utils::process;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::process::Child;
use tokio::sync::Mutex;

/// Last `capacity` output lines of a tunnel process.
#[derive(Debug)]
pub struct LogBuffer {
    lines: StdMutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: StdMutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }
}

struct ManagedProcess {
    record: ProcessRecord,
    child: Option<Child>,
    logs: Arc<LogBuffer>,
}

impl ManagedProcess {
    fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => !process::is_running(self.record.pid, self.record.process_start),
        }
    }
}

/// A persisted record and whether its PID is still running.
#[derive(Debug, Clone)]
pub struct PersistedProcess {
    pub record: ProcessRecord,
    pub alive: bool,
}

/// Tracks tunnel subprocesses for reuse and cleanup.
///
/// Records are mirrored to a JSON state file, shared by every stolon invocation
/// on the machine, so `stolon ps` and `stolon stop` can see processes started
/// by the server or by another terminal.
pub struct ProcessRegistry {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    state_file: Option<PathBuf>,
}

impl ProcessRegistry {
    pub fn new(state_file: Option<PathBuf>) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            state_file,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub async fn insert(
        &self,
        record: ProcessRecord,
        child: Option<Child>,
        logs: Arc<LogBuffer>,
    ) -> Result<()> {
        tracing::debug!(name = %record.name, pid = record.pid, "registering process");
        if let Some(other) = self.live_persisted(&record.name).await? {
            if other.pid != record.pid {
                return Err(StolonError::InvalidState {
                    message: format!(
                        "'{}' is already running as pid {} in another stolon process",
                        record.name, other.pid
                    ),
                });
            }
        }
        self.persist(Some(&record), None).await?;
        self.processes.lock().await.insert(
            record.name.clone(),
            ManagedProcess {
                record,
                child,
                logs,
            },
        );
        Ok(())
    }

    /// The live record for `name`; entries whose process has exited are dropped.
    pub async fn get(&self, name: &str) -> Option<ProcessRecord> {
        let mut processes = self.processes.lock().await;
        let exited = processes.get_mut(name)?.has_exited();
        if exited {
            tracing::info!(name, "process exited, removing from registry");
            let gone = processes.remove(name);
            drop(processes);
            if let Some(gone) = gone {
                if let Err(e) = self.persist(None, Some(&gone.record)).await {
                    tracing::warn!(name, "failed to update state file: {}", e);
                }
            }
            return None;
        }
        processes.get(name).map(|p| p.record.clone())
    }

    pub async fn list(&self) -> Vec<ProcessRecord> {
        let mut processes = self.processes.lock().await;
        let exited: Vec<String> = processes
            .iter_mut()
            .filter_map(|(name, p)| p.has_exited().then(|| name.clone()))
            .collect();
        let exited: Vec<ProcessRecord> = exited
            .iter()
            .filter_map(|name| processes.remove(name))
            .map(|p| p.record)
            .collect();

        let mut records: Vec<ProcessRecord> =
            processes.values().map(|p| p.record.clone()).collect();
        drop(processes);

        for record in &exited {
            if let Err(e) = self.persist(None, Some(record)).await {
                tracing::warn!(name = %record.name, "failed to update state file: {}", e);
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn logs(&self, name: &str) -> Option<Vec<String>> {
        self.processes
            .lock()
            .await
            .get(name)
            .map(|p| p.logs.snapshot())
    }

    /// Stops a process owned by this registry, or one only known from the state file.
    pub async fn stop(&self, name: &str) -> Result<ProcessRecord> {
        let managed = self.processes.lock().await.remove(name);

        let record = match managed {
            Some(mut managed) => {
                match managed.child.as_mut() {
                    Some(child) => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(name, "kill failed, process likely gone: {}", e);
                        }
                        let _ = child.try_wait();
                    }
                    None => {
                        process::terminate(managed.record.pid, managed.record.process_start);
                    }
                }
                managed.record
            }
            None => {
                let persisted = self
                    .persisted()
                    .await?
                    .into_iter()
                    .find(|p| p.record.name == name)
                    .ok_or_else(|| StolonError::NotFound {
                        what: format!("process '{}'", name),
                    })?;
                if persisted.alive {
                    process::terminate(persisted.record.pid, persisted.record.process_start);
                }
                persisted.record
            }
        };

        tracing::info!(name, pid = record.pid, "stopped process");
        self.persist(None, Some(&record)).await?;
        Ok(record)
    }

    /// Stops every process this registry owns.
    pub async fn stop_all(&self) -> Vec<ProcessRecord> {
        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        let mut stopped = Vec::with_capacity(names.len());
        for name in names {
            match self.stop(&name).await {
                Ok(record) => stopped.push(record),
                Err(e) => tracing::warn!(name = %name, "failed to stop: {}", e),
            }
        }
        stopped
    }

    /// Records from the state file with their liveness.
    pub async fn persisted(&self) -> Result<Vec<PersistedProcess>> {
        let Some(path) = &self.state_file else {
            return Ok(Vec::new());
        };
        let records = read_state(path).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let alive = process::is_running(record.pid, record.process_start);
                PersistedProcess { record, alive }
            })
            .collect())
    }

    /// A running record for `name` in the state file, possibly started by another
    /// stolon process.
    pub async fn live_persisted(&self, name: &str) -> Result<Option<ProcessRecord>> {
        Ok(self
            .persisted()
            .await?
            .into_iter()
            .find(|p| p.alive && p.record.name == name)
            .map(|p| p.record))
    }

    /// Whether `name` was started by this registry.
    pub async fn owns(&self, name: &str) -> bool {
        self.processes.lock().await.contains_key(name)
    }

    /// Rewrites the state file. Removal only drops the entry with the same name
    /// and pid, so a record written by another stolon process survives.
    async fn persist(
        &self,
        upsert: Option<&ProcessRecord>,
        remove: Option<&ProcessRecord>,
    ) -> Result<()> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };

        let mut records: Vec<ProcessRecord> = read_state(path)
            .await?
            .into_iter()
            .filter(|r| process::is_running(r.pid, r.process_start))
            .collect();

        if let Some(gone) = remove {
            records.retain(|r| !(r.name == gone.name && r.pid == gone.pid));
        }
        if let Some(record) = upsert {
            records.retain(|r| r.name != record.name);
            records.push(record.clone());
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));

        write_state(path, &records).await
    }
}

async fn read_state(path: &Path) -> Result<Vec<ProcessRecord>> {
    match tokio::fs::read(path).await {
        Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(records) => Ok(records),
            Err(e) => {
                tracing::warn!(path = %path.display(), "ignoring unreadable state file: {}", e);
                Ok(Vec::new())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

async fn write_state(path: &Path, records: &[ProcessRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(records)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
