use crate::context::Context;
use crate::CoreError;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tracing::{debug, info, warn};
use warden_runtime::{Container, ExitStatus, RuntimeError, Signal, Task};

/// How long a task gets to exit after each signal.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of a successful termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The container had no task (or it could not be looked up).
    NoTask,
    /// The task is gone and its resource was released.
    Deleted(Option<ExitStatus>),
}

/// Stops a container's task: `SIGTERM`, wait, escalate once to `SIGKILL`,
/// wait again, then delete the task.
#[derive(Debug, Clone, Copy)]
pub struct GracefulTerminator {
    patience: Duration,
}

impl Default for GracefulTerminator {
    fn default() -> Self {
        Self {
            patience: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl GracefulTerminator {
    pub fn new(patience: Duration) -> Self {
        Self { patience }
    }

    pub fn patience(&self) -> Duration {
        self.patience
    }

    /// Blocks for at most two patience windows, each cut short by the
    /// context deadline. `Context::cancel` is observed between signals, so a
    /// cancel raised mid-wait takes effect once the current window ends.
    pub fn terminate(
        &self,
        ctx: &Context,
        container: &dyn Container,
    ) -> Result<Termination, CoreError> {
        let id = container.id();
        let task = match container.task() {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("container {id} has no task");
                return Ok(Termination::NoTask);
            }
            Err(e) => {
                debug!("task lookup for {id} failed, treating as absent: {e}");
                return Ok(Termination::NoTask);
            }
        };

        // Arm the exit notification before the first signal so the exit cannot be missed.
        let exit = match task.wait() {
            Ok(exit) => exit,
            Err(e) => return delete_or_fail(task.as_ref(), e),
        };

        let mut signal = Signal::Term;
        loop {
            ctx.check()?;
            debug!("sending {signal} to task of {id}");
            if let Err(e) = task.kill(signal, true) {
                return delete_or_fail(task.as_ref(), e);
            }

            match exit.recv_timeout(ctx.bound(self.patience)) {
                Ok(status) => {
                    debug!("task of {id} exited: {status}");
                    let deleted = task.delete(false)?;
                    return Ok(Termination::Deleted(deleted.or(Some(status))));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("exit watch for {id} closed without a status");
                    let deleted = task.delete(false)?;
                    return Ok(Termination::Deleted(deleted));
                }
                Err(RecvTimeoutError::Timeout) => {
                    ctx.check()?;
                    if signal == Signal::Kill {
                        return Err(CoreError::Unkillable {
                            id: id.to_owned(),
                            waited: self.patience,
                        });
                    }
                    info!(
                        "task of {id} did not exit within {:?} after {signal}, escalating",
                        self.patience
                    );
                    signal = Signal::Kill;
                }
            }
        }
    }
}

/// A failed wait or signal usually means the task already went away: if the
/// task can be deleted, the container is stopped and the failure is moot.
fn delete_or_fail(task: &dyn Task, cause: RuntimeError) -> Result<Termination, CoreError> {
    match task.delete(false) {
        Ok(status) => {
            debug!("task of {} deleted after: {cause}", task.id());
            Ok(Termination::Deleted(status))
        }
        Err(derr) => {
            warn!("deleting task of {} failed: {derr}", task.id());
            Err(cause.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use warden_runtime::{IoSpec, MockEvent, MockFaults, MockRuntime, MockTaskStatus};

    const QUICK: Duration = Duration::from_millis(50);

    fn running(id: &str, faults: MockFaults) -> (MockRuntime, Arc<dyn Container>) {
        let runtime = MockRuntime::new();
        let container = runtime.create_container(id, BTreeMap::new()).unwrap();
        let task = container.new_task(&IoSpec::Null).unwrap();
        task.start().unwrap();
        runtime.set_faults(id, faults).unwrap();
        (runtime, container)
    }

    #[test]
    fn no_task_is_a_noop() {
        let runtime = MockRuntime::new();
        let container = runtime.create_container("idle", BTreeMap::new()).unwrap();
        let result = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap();
        assert_eq!(result, Termination::NoTask);
        assert!(runtime.events().is_empty());
    }

    #[test]
    fn failed_lookup_is_a_noop() {
        let (runtime, container) = running(
            "web1",
            MockFaults {
                fail_task_lookup: true,
                ..MockFaults::default()
            },
        );
        let result = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap();
        assert_eq!(result, Termination::NoTask);
        assert_eq!(runtime.task_status("web1"), Some(MockTaskStatus::Running));
    }

    #[test]
    fn graceful_exit_deletes_task() {
        let (runtime, container) = running("web1", MockFaults::default());
        let result = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap();
        assert!(matches!(result, Termination::Deleted(Some(_))));
        assert_eq!(runtime.kills("web1"), vec![Signal::Term]);
        assert!(runtime.task_status("web1").is_none());
    }

    #[test]
    fn ignored_term_escalates_once() {
        let (runtime, container) = running(
            "stubborn",
            MockFaults {
                ignore_term: true,
                ..MockFaults::default()
            },
        );
        GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap();
        assert_eq!(runtime.kills("stubborn"), vec![Signal::Term, Signal::Kill]);
        assert!(runtime.task_status("stubborn").is_none());
    }

    #[test]
    fn unkillable_task_surfaces_error() {
        let (runtime, container) = running(
            "zombie",
            MockFaults {
                ignore_term: true,
                ignore_kill: true,
                ..MockFaults::default()
            },
        );
        let err = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap_err();
        assert!(matches!(err, CoreError::Unkillable { .. }));
        assert_eq!(runtime.kills("zombie"), vec![Signal::Term, Signal::Kill]);
        assert_eq!(runtime.task_status("zombie"), Some(MockTaskStatus::Running));
    }

    #[test]
    fn wait_failure_with_successful_delete_is_success() {
        let (runtime, container) = running("web1", MockFaults::default());
        runtime.exit_task("web1", ExitStatus::code(0)).unwrap();
        runtime
            .set_faults(
                "web1",
                MockFaults {
                    fail_wait: true,
                    ..MockFaults::default()
                },
            )
            .unwrap();
        let result = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap();
        assert!(matches!(result, Termination::Deleted(_)));
        assert!(runtime.kills("web1").is_empty());
    }

    #[test]
    fn wait_failure_with_failed_delete_propagates_wait_error() {
        let (runtime, container) = running(
            "web1",
            MockFaults {
                fail_wait: true,
                ..MockFaults::default()
            },
        );
        let err = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap_err();
        // Running task refuses a non-forceful delete, so the wait error surfaces.
        assert!(err.to_string().contains("wait"));
        assert!(runtime
            .events_for("web1")
            .contains(&MockEvent::DeleteTask {
                id: "web1".to_owned(),
                kill: false
            }));
    }

    #[test]
    fn kill_failure_falls_back_to_delete() {
        let (runtime, container) = running("web1", MockFaults::default());
        runtime.exit_task("web1", ExitStatus::code(1)).unwrap();
        let result = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap();
        // Signalling an exited task fails; the fallback delete releases it.
        assert_eq!(result, Termination::Deleted(Some(ExitStatus::code(1))));
        assert!(runtime.task_status("web1").is_none());
    }

    #[test]
    fn kill_failure_with_failed_delete_propagates() {
        let (_runtime, container) = running(
            "web1",
            MockFaults {
                fail_kill: true,
                ..MockFaults::default()
            },
        );
        let err = GracefulTerminator::new(QUICK)
            .terminate(&Context::new(), container.as_ref())
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Runtime(RuntimeError::SignalFailed { .. })
        ));
    }

    #[test]
    fn cancelled_context_stops_before_signalling() {
        let (runtime, container) = running("web1", MockFaults::default());
        let ctx = Context::new();
        ctx.cancel();
        let err = GracefulTerminator::new(QUICK)
            .terminate(&ctx, container.as_ref())
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        assert!(runtime.kills("web1").is_empty());
    }

    #[test]
    fn deadline_cuts_patience_short() {
        let (_runtime, container) = running(
            "stubborn",
            MockFaults {
                ignore_term: true,
                ..MockFaults::default()
            },
        );
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let err = GracefulTerminator::new(Duration::from_secs(30))
            .terminate(&ctx, container.as_ref())
            .unwrap_err();
        assert!(matches!(err, CoreError::DeadlineExceeded));
    }

    #[test]
    fn default_patience_is_ten_seconds() {
        assert_eq!(
            GracefulTerminator::default().patience(),
            Duration::from_secs(10)
        );
    }
}
