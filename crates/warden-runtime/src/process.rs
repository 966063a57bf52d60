//! Host process runtime.
//!
//! Each container is a directory under the runtime root holding a
//! `container.json` record. A task is the container's command spawned as the
//! leader of its own process group, so signalling "all processes" reaches every
//! descendant through the negative group id.

use crate::backend::{
    Container, ContainerInfo, DeleteOpts, ExitStatus, ExitWatch, IoSpec, RuntimeClient, Signal,
    Task,
};
use crate::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use warden_schema::Extension;

const RECORD_FILE: &str = "container.json";

/// Upper bound on waiting for a group to die after `delete(kill = true)`.
const DELETE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ProcessRecord {
    #[serde(flatten)]
    info: ContainerInfo,
    args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cwd: Option<PathBuf>,
}

type TaskTable = Mutex<HashMap<String, Arc<ProcessTask>>>;

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, RuntimeError> {
    mutex
        .lock()
        .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
}

pub struct ProcessRuntime {
    root: PathBuf,
    tasks: Arc<TaskTable>,
    serial: Arc<AtomicU64>,
}

impl ProcessRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            serial: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a new container record. `args[0]` is the program to run.
    pub fn create_container(
        &self,
        id: &str,
        args: Vec<String>,
        extensions: BTreeMap<String, Extension>,
    ) -> Result<Arc<dyn Container>, RuntimeError> {
        if args.is_empty() {
            return Err(RuntimeError::ExecFailed(format!(
                "container '{id}' has no command"
            )));
        }
        if id.is_empty() || id.contains('/') || id == "." || id == ".." {
            return Err(RuntimeError::ExecFailed(format!(
                "invalid container id '{id}'"
            )));
        }

        let dir = self.root.join(id);
        if dir.join(RECORD_FILE).exists() {
            return Err(RuntimeError::ContainerExists(id.to_owned()));
        }
        fs::create_dir_all(&dir)?;

        let record = ProcessRecord {
            info: ContainerInfo {
                id: id.to_owned(),
                labels: BTreeMap::new(),
                extensions,
            },
            args,
            cwd: None,
        };
        let content = serde_json::to_string_pretty(&record)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(dir.join(RECORD_FILE))
            .map_err(|e| RuntimeError::Io(e.error))?;

        Ok(self.handle(id))
    }

    fn handle(&self, id: &str) -> Arc<dyn Container> {
        Arc::new(ProcessContainer {
            id: id.to_owned(),
            dir: self.root.join(id),
            tasks: Arc::clone(&self.tasks),
            serial: Arc::clone(&self.serial),
        })
    }
}

impl RuntimeClient for ProcessRuntime {
    fn name(&self) -> &'static str {
        "process"
    }

    fn load_container(&self, id: &str) -> Result<Arc<dyn Container>, RuntimeError> {
        if !self.root.join(id).join(RECORD_FILE).is_file() {
            return Err(RuntimeError::ContainerNotFound(id.to_owned()));
        }
        Ok(self.handle(id))
    }

    fn containers(&self) -> Result<Vec<Arc<dyn Container>>, RuntimeError> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(RECORD_FILE).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids.iter().map(|id| self.handle(id)).collect())
    }
}

struct ProcessContainer {
    id: String,
    dir: PathBuf,
    tasks: Arc<TaskTable>,
    serial: Arc<AtomicU64>,
}

impl ProcessContainer {
    fn record(&self) -> Result<ProcessRecord, RuntimeError> {
        let path = self.dir.join(RECORD_FILE);
        if !path.is_file() {
            return Err(RuntimeError::ContainerNotFound(self.id.clone()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl Container for ProcessContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> Result<ContainerInfo, RuntimeError> {
        Ok(self.record()?.info)
    }

    fn task(&self) -> Result<Option<Arc<dyn Task>>, RuntimeError> {
        Ok(lock(&self.tasks)?
            .get(&self.id)
            .map(|task| Arc::clone(task) as Arc<dyn Task>))
    }

    fn new_task(&self, io: &IoSpec) -> Result<Arc<dyn Task>, RuntimeError> {
        let record = self.record()?;
        let mut tasks = lock(&self.tasks)?;
        if tasks.contains_key(&self.id) {
            return Err(RuntimeError::TaskExists(self.id.clone()));
        }
        let task = Arc::new(ProcessTask {
            id: self.id.clone(),
            serial: self.serial.fetch_add(1, Ordering::SeqCst),
            args: record.args,
            cwd: record.cwd,
            io: io.clone(),
            state: Arc::new(Mutex::new(ProcState {
                phase: Phase::Created,
                waiters: Vec::new(),
            })),
            table: Arc::downgrade(&self.tasks),
        });
        tasks.insert(self.id.clone(), Arc::clone(&task));
        debug!("created task for container {}", self.id);
        Ok(task)
    }

    fn delete(&self, opts: DeleteOpts) -> Result<(), RuntimeError> {
        if lock(&self.tasks)?.contains_key(&self.id) {
            return Err(RuntimeError::TaskExists(self.id.clone()));
        }
        if !self.dir.join(RECORD_FILE).is_file() {
            return Err(RuntimeError::ContainerNotFound(self.id.clone()));
        }
        if opts.cleanup_snapshot {
            fs::remove_dir_all(&self.dir)?;
        } else {
            fs::remove_file(self.dir.join(RECORD_FILE))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running { pid: u32 },
    Exited(ExitStatus),
}

struct ProcState {
    phase: Phase,
    waiters: Vec<Sender<ExitStatus>>,
}

impl ProcState {
    fn finish(&mut self, status: ExitStatus) {
        self.phase = Phase::Exited(status);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(status);
        }
    }
}

struct ProcessTask {
    id: String,
    serial: u64,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    io: IoSpec,
    state: Arc<Mutex<ProcState>>,
    table: Weak<TaskTable>,
}

impl ProcessTask {
    fn command(&self) -> Result<Command, RuntimeError> {
        let (program, rest) = self
            .args
            .split_first()
            .ok_or_else(|| RuntimeError::ExecFailed(format!("task '{}' has no command", self.id)))?;
        let mut cmd = Command::new(program);
        cmd.args(rest).process_group(0);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        match &self.io {
            IoSpec::Stdio => {}
            IoSpec::Null => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
            }
            IoSpec::Log(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdin(Stdio::null())
                    .stdout(file.try_clone()?)
                    .stderr(file);
            }
        }
        Ok(cmd)
    }

    fn signal_pid(&self, pid: u32, signal: Signal, all: bool) -> Result<(), RuntimeError> {
        let pid_i32 = i32::try_from(pid).map_err(|_| {
            RuntimeError::ExecFailed(format!("invalid pid {pid}: exceeds i32 range"))
        })?;
        let target = if all { -pid_i32 } else { pid_i32 };
        debug!("sending {signal} to {target} (container {})", self.id);
        // SAFETY: kill() with a validated pid/pgid and a valid signal number is safe.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(target, signal.as_raw()) };
        if ret == 0 {
            return Ok(());
        }
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            return Err(RuntimeError::NotRunning(self.id.clone()));
        }
        Err(RuntimeError::SignalFailed {
            id: self.id.clone(),
            signal,
            reason: errno.to_string(),
        })
    }

    fn release(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        if let Ok(mut tasks) = table.lock() {
            if tasks.get(&self.id).is_some_and(|t| t.serial == self.serial) {
                tasks.remove(&self.id);
            }
        };
    }
}

impl Task for ProcessTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        match lock(&self.state).ok()?.phase {
            Phase::Running { pid } => Some(pid),
            Phase::Created | Phase::Exited(_) => None,
        }
    }

    fn start(&self) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        let phase = state.phase;
        match phase {
            Phase::Created => {}
            Phase::Running { .. } => {
                return Err(RuntimeError::ExecFailed(format!(
                    "task '{}' already started",
                    self.id
                )));
            }
            Phase::Exited(_) => return Err(RuntimeError::NotRunning(self.id.clone())),
        }

        let mut child = self.command()?.spawn()?;
        let pid = child.id();
        state.phase = Phase::Running { pid };
        drop(state);

        let reaper_state = Arc::clone(&self.state);
        let id = self.id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("warden-reap-{id}"))
            .spawn(move || {
                let status = match child.wait() {
                    Ok(status) => ExitStatus {
                        code: status.code(),
                        signal: status.signal(),
                    },
                    Err(e) => {
                        warn!("waiting on task {id} failed: {e}");
                        ExitStatus::default()
                    }
                };
                debug!("task {id} exited: {status}");
                if let Ok(mut state) = reaper_state.lock() {
                    state.finish(status);
                }
            });
        if let Err(e) = spawned {
            let _ = self.signal_pid(pid, Signal::Kill, true);
            return Err(RuntimeError::Io(e));
        }
        Ok(())
    }

    fn kill(&self, signal: Signal, all: bool) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        let phase = state.phase;
        match phase {
            Phase::Running { pid } => {
                drop(state);
                self.signal_pid(pid, signal, all)
            }
            // The init process was never spawned; killing it just ends the task.
            Phase::Created => {
                state.finish(ExitStatus::signaled(signal));
                Ok(())
            }
            Phase::Exited(_) => Err(RuntimeError::NotRunning(self.id.clone())),
        }
    }

    fn wait(&self) -> Result<ExitWatch, RuntimeError> {
        let mut state = lock(&self.state)?;
        let (tx, rx) = channel();
        let phase = state.phase;
        match phase {
            Phase::Exited(status) => {
                let _ = tx.send(status);
            }
            Phase::Created | Phase::Running { .. } => state.waiters.push(tx),
        }
        Ok(rx)
    }

    fn delete(&self, kill: bool) -> Result<Option<ExitStatus>, RuntimeError> {
        let phase = lock(&self.state)?.phase;
        let status = match phase {
            Phase::Running { .. } if !kill => {
                return Err(RuntimeError::StillRunning(self.id.clone()));
            }
            Phase::Running { pid } => {
                let exit = self.wait()?;
                match self.signal_pid(pid, Signal::Kill, true) {
                    Ok(()) | Err(RuntimeError::NotRunning(_)) => {}
                    Err(e) => return Err(e),
                }
                let status = exit.recv_timeout(DELETE_KILL_TIMEOUT).map_err(|_| {
                    RuntimeError::ExecFailed(format!(
                        "task '{}' did not exit after SIGKILL",
                        self.id
                    ))
                })?;
                Some(status)
            }
            Phase::Created => None,
            Phase::Exited(status) => Some(status),
        };
        self.release();
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &[&str]) -> Vec<String> {
        cmd.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn record_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        runtime
            .create_container("a", args(&["true"]), BTreeMap::new())
            .unwrap();
        runtime
            .create_container("b", args(&["true"]), BTreeMap::new())
            .unwrap();

        let listed: Vec<String> = runtime
            .containers()
            .unwrap()
            .iter()
            .map(|c| c.id().to_owned())
            .collect();
        assert_eq!(listed, vec!["a".to_owned(), "b".to_owned()]);

        let info = runtime.load_container("a").unwrap().info().unwrap();
        assert_eq!(info.id, "a");
        assert!(matches!(
            runtime.create_container("a", args(&["true"]), BTreeMap::new()),
            Err(RuntimeError::ContainerExists(_))
        ));
    }

    #[test]
    fn load_missing_container_fails() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        assert!(matches!(
            runtime.load_container("ghost"),
            Err(RuntimeError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn exit_code_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        let container = runtime
            .create_container("exit7", args(&["sh", "-c", "exit 7"]), BTreeMap::new())
            .unwrap();

        let task = container.new_task(&IoSpec::Null).unwrap();
        let exit = task.wait().unwrap();
        task.start().unwrap();
        let status = exit.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(status.code, Some(7));

        assert_eq!(task.delete(false).unwrap(), Some(status));
        assert!(container.task().unwrap().is_none());
    }

    #[test]
    fn term_reaches_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        let container = runtime
            .create_container("sleeper", args(&["sleep", "30"]), BTreeMap::new())
            .unwrap();

        let task = container.new_task(&IoSpec::Null).unwrap();
        task.start().unwrap();
        assert!(task.pid().is_some());

        let exit = task.wait().unwrap();
        task.kill(Signal::Term, true).unwrap();
        let status = exit.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(status.signal, Some(libc::SIGTERM));
        task.delete(false).unwrap();
    }

    #[test]
    fn delete_with_kill_stops_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        let container = runtime
            .create_container("sleeper", args(&["sleep", "30"]), BTreeMap::new())
            .unwrap();
        let task = container.new_task(&IoSpec::Null).unwrap();
        task.start().unwrap();

        assert!(matches!(
            task.delete(false),
            Err(RuntimeError::StillRunning(_))
        ));
        let status = task.delete(true).unwrap().unwrap();
        assert_eq!(status.signal, Some(libc::SIGKILL));
        assert!(container.task().unwrap().is_none());
    }

    #[test]
    fn unstarted_task_exits_on_kill() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        let container = runtime
            .create_container("idle", args(&["sleep", "30"]), BTreeMap::new())
            .unwrap();
        let task = container.new_task(&IoSpec::Null).unwrap();
        let exit = task.wait().unwrap();
        task.kill(Signal::Term, true).unwrap();
        assert!(exit.try_recv().is_ok());
        assert!(matches!(
            task.kill(Signal::Term, true),
            Err(RuntimeError::NotRunning(_))
        ));
    }

    #[test]
    fn container_delete_cleans_directory() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ProcessRuntime::new(dir.path());
        let container = runtime
            .create_container("gone", args(&["true"]), BTreeMap::new())
            .unwrap();
        let task = container.new_task(&IoSpec::Null).unwrap();
        assert!(matches!(
            container.delete(DeleteOpts::default()),
            Err(RuntimeError::TaskExists(_))
        ));
        task.delete(false).unwrap();
        container
            .delete(DeleteOpts {
                cleanup_snapshot: true,
            })
            .unwrap();
        assert!(!dir.path().join("gone").exists());
    }
}
