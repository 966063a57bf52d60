//! In-memory runtime with fault injection.
//!
//! Every call made through a `MockRuntime` handle is recorded as a
//! [`MockEvent`], and each container can be given a set of [`MockFaults`] so
//! the lifecycle engine's partial-failure paths can be driven deterministically.

use crate::backend::{
    Container, ContainerInfo, DeleteOpts, ExitStatus, ExitWatch, IoSpec, RuntimeClient, Signal,
    Task,
};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use warden_schema::Extension;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockFaults {
    pub fail_info: bool,
    pub fail_task_lookup: bool,
    pub fail_new_task: bool,
    pub fail_start: bool,
    pub fail_wait: bool,
    pub fail_kill: bool,
    pub fail_task_delete: bool,
    pub fail_container_delete: bool,
    /// Task stays alive after `SIGTERM`.
    pub ignore_term: bool,
    /// Task stays alive after `SIGKILL` too.
    pub ignore_kill: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    NewTask(String),
    Start(String),
    Wait(String),
    Kill(String, Signal),
    DeleteTask { id: String, kill: bool },
    DeleteContainer { id: String, cleanup_snapshot: bool },
}

impl MockEvent {
    pub fn container(&self) -> &str {
        match self {
            MockEvent::NewTask(id)
            | MockEvent::Start(id)
            | MockEvent::Wait(id)
            | MockEvent::Kill(id, _)
            | MockEvent::DeleteTask { id, .. }
            | MockEvent::DeleteContainer { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTaskStatus {
    Created,
    Running,
    Stopped(ExitStatus),
}

struct TaskRecord {
    generation: u64,
    status: MockTaskStatus,
    waiters: Vec<Sender<ExitStatus>>,
}

impl TaskRecord {
    fn finish(&mut self, status: ExitStatus) {
        self.status = MockTaskStatus::Stopped(status);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(status);
        }
    }
}

struct ContainerRecord {
    info: ContainerInfo,
    faults: MockFaults,
    task: Option<TaskRecord>,
    tasks_created: usize,
}

#[derive(Default)]
struct MockState {
    containers: BTreeMap<String, ContainerRecord>,
    events: Vec<MockEvent>,
    next_generation: u64,
}

impl MockState {
    fn container_mut(&mut self, id: &str) -> Result<&mut ContainerRecord, RuntimeError> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_owned()))
    }

    fn task_mut(
        &mut self,
        id: &str,
        generation: u64,
    ) -> Result<(MockFaults, &mut TaskRecord), RuntimeError> {
        let record = self
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::TaskNotFound(id.to_owned()))?;
        let faults = record.faults;
        match record.task.as_mut() {
            Some(task) if task.generation == generation => Ok((faults, task)),
            _ => Err(RuntimeError::TaskNotFound(id.to_owned())),
        }
    }
}

fn lock(state: &Mutex<MockState>) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
    state
        .lock()
        .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_container(
        &self,
        id: &str,
        extensions: BTreeMap<String, Extension>,
    ) -> Result<Arc<dyn Container>, RuntimeError> {
        let mut state = lock(&self.state)?;
        if state.containers.contains_key(id) {
            return Err(RuntimeError::ContainerExists(id.to_owned()));
        }
        state.containers.insert(
            id.to_owned(),
            ContainerRecord {
                info: ContainerInfo {
                    id: id.to_owned(),
                    labels: BTreeMap::new(),
                    extensions,
                },
                faults: MockFaults::default(),
                task: None,
                tasks_created: 0,
            },
        );
        Ok(self.handle(id))
    }

    pub fn set_faults(&self, id: &str, faults: MockFaults) -> Result<(), RuntimeError> {
        lock(&self.state)?.container_mut(id)?.faults = faults;
        Ok(())
    }

    /// Make the current task exit on its own, as if the process crashed.
    pub fn exit_task(&self, id: &str, status: ExitStatus) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        let task = state
            .container_mut(id)?
            .task
            .as_mut()
            .ok_or_else(|| RuntimeError::TaskNotFound(id.to_owned()))?;
        task.finish(status);
        Ok(())
    }

    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.state)
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn events_for(&self, id: &str) -> Vec<MockEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.container() == id)
            .collect()
    }

    /// Signals delivered to `id`, in order.
    pub fn kills(&self, id: &str) -> Vec<Signal> {
        self.events_for(id)
            .into_iter()
            .filter_map(|event| match event {
                MockEvent::Kill(_, signal) => Some(signal),
                _ => None,
            })
            .collect()
    }

    pub fn task_status(&self, id: &str) -> Option<MockTaskStatus> {
        let state = lock(&self.state).ok()?;
        state
            .containers
            .get(id)
            .and_then(|record| record.task.as_ref())
            .map(|task| task.status)
    }

    /// Number of tasks ever created for `id`.
    pub fn tasks_created(&self, id: &str) -> usize {
        lock(&self.state)
            .ok()
            .and_then(|state| state.containers.get(id).map(|record| record.tasks_created))
            .unwrap_or(0)
    }

    pub fn has_container(&self, id: &str) -> bool {
        lock(&self.state)
            .map(|state| state.containers.contains_key(id))
            .unwrap_or(false)
    }

    fn handle(&self, id: &str) -> Arc<dyn Container> {
        Arc::new(MockContainer {
            id: id.to_owned(),
            state: Arc::clone(&self.state),
        })
    }
}

impl RuntimeClient for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn load_container(&self, id: &str) -> Result<Arc<dyn Container>, RuntimeError> {
        if !lock(&self.state)?.containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_owned()));
        }
        Ok(self.handle(id))
    }

    fn containers(&self) -> Result<Vec<Arc<dyn Container>>, RuntimeError> {
        let ids: Vec<String> = lock(&self.state)?.containers.keys().cloned().collect();
        Ok(ids.iter().map(|id| self.handle(id)).collect())
    }
}

struct MockContainer {
    id: String,
    state: Arc<Mutex<MockState>>,
}

impl Container for MockContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> Result<ContainerInfo, RuntimeError> {
        let mut state = lock(&self.state)?;
        let record = state.container_mut(&self.id)?;
        if record.faults.fail_info {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: info for '{}' failed",
                self.id
            )));
        }
        Ok(record.info.clone())
    }

    fn task(&self) -> Result<Option<Arc<dyn Task>>, RuntimeError> {
        let mut state = lock(&self.state)?;
        let record = state.container_mut(&self.id)?;
        if record.faults.fail_task_lookup {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: task lookup for '{}' failed",
                self.id
            )));
        }
        Ok(record.task.as_ref().map(|task| {
            Arc::new(MockTask {
                id: self.id.clone(),
                generation: task.generation,
                state: Arc::clone(&self.state),
            }) as Arc<dyn Task>
        }))
    }

    fn new_task(&self, _io: &IoSpec) -> Result<Arc<dyn Task>, RuntimeError> {
        let mut state = lock(&self.state)?;
        state.events.push(MockEvent::NewTask(self.id.clone()));
        state.next_generation += 1;
        let generation = state.next_generation;

        let record = state.container_mut(&self.id)?;
        if record.faults.fail_new_task {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: task creation for '{}' failed",
                self.id
            )));
        }
        if record.task.is_some() {
            return Err(RuntimeError::TaskExists(self.id.clone()));
        }
        record.task = Some(TaskRecord {
            generation,
            status: MockTaskStatus::Created,
            waiters: Vec::new(),
        });
        record.tasks_created += 1;

        Ok(Arc::new(MockTask {
            id: self.id.clone(),
            generation,
            state: Arc::clone(&self.state),
        }))
    }

    fn delete(&self, opts: DeleteOpts) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        state.events.push(MockEvent::DeleteContainer {
            id: self.id.clone(),
            cleanup_snapshot: opts.cleanup_snapshot,
        });
        let record = state.container_mut(&self.id)?;
        if record.faults.fail_container_delete {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: delete of '{}' failed",
                self.id
            )));
        }
        if record.task.is_some() {
            return Err(RuntimeError::TaskExists(self.id.clone()));
        }
        state.containers.remove(&self.id);
        Ok(())
    }
}

struct MockTask {
    id: String,
    generation: u64,
    state: Arc<Mutex<MockState>>,
}

impl Task for MockTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> Option<u32> {
        u32::try_from(self.generation)
            .ok()
            .map(|g| g.saturating_add(10_000))
    }

    fn start(&self) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        state.events.push(MockEvent::Start(self.id.clone()));
        let (faults, task) = state.task_mut(&self.id, self.generation)?;
        if faults.fail_start {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: start of '{}' failed",
                self.id
            )));
        }
        match task.status {
            MockTaskStatus::Created => {
                task.status = MockTaskStatus::Running;
                Ok(())
            }
            MockTaskStatus::Running => Err(RuntimeError::ExecFailed(format!(
                "task '{}' already started",
                self.id
            ))),
            MockTaskStatus::Stopped(_) => Err(RuntimeError::NotRunning(self.id.clone())),
        }
    }

    fn kill(&self, signal: Signal, _all: bool) -> Result<(), RuntimeError> {
        let mut state = lock(&self.state)?;
        state.events.push(MockEvent::Kill(self.id.clone(), signal));
        let (faults, task) = state.task_mut(&self.id, self.generation)?;
        if faults.fail_kill {
            return Err(RuntimeError::SignalFailed {
                id: self.id.clone(),
                signal,
                reason: "mock: injected failure".to_owned(),
            });
        }
        if let MockTaskStatus::Stopped(_) = task.status {
            return Err(RuntimeError::NotRunning(self.id.clone()));
        }
        let ignored = match signal {
            Signal::Term => faults.ignore_term,
            Signal::Kill => faults.ignore_kill,
        };
        if !ignored {
            task.finish(ExitStatus::signaled(signal));
        }
        Ok(())
    }

    fn wait(&self) -> Result<ExitWatch, RuntimeError> {
        let mut state = lock(&self.state)?;
        state.events.push(MockEvent::Wait(self.id.clone()));
        let (faults, task) = state.task_mut(&self.id, self.generation)?;
        if faults.fail_wait {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: wait on '{}' failed",
                self.id
            )));
        }
        let (tx, rx) = channel();
        match task.status {
            MockTaskStatus::Stopped(status) => {
                let _ = tx.send(status);
            }
            MockTaskStatus::Created | MockTaskStatus::Running => task.waiters.push(tx),
        }
        Ok(rx)
    }

    fn delete(&self, kill: bool) -> Result<Option<ExitStatus>, RuntimeError> {
        let mut state = lock(&self.state)?;
        state.events.push(MockEvent::DeleteTask {
            id: self.id.clone(),
            kill,
        });
        let (faults, task) = state.task_mut(&self.id, self.generation)?;
        if faults.fail_task_delete {
            return Err(RuntimeError::ExecFailed(format!(
                "mock: delete of task '{}' failed",
                self.id
            )));
        }
        let status = match task.status {
            MockTaskStatus::Running if !kill => {
                return Err(RuntimeError::StillRunning(self.id.clone()));
            }
            MockTaskStatus::Created if !kill => None,
            MockTaskStatus::Created | MockTaskStatus::Running => {
                let status = ExitStatus::signaled(Signal::Kill);
                task.finish(status);
                Some(status)
            }
            MockTaskStatus::Stopped(status) => Some(status),
        };
        state.container_mut(&self.id)?.task = None;
        Ok(status)
    }
}
