//! The job coordinator: a single named, coarse lock serialising the
//! engine's long-running operations.
//!
//! One job runs at a time, identified by name; callers either block until
//! it frees up or get rejected immediately, and a running job can register
//! extra references (`ping`) so a dependent wait doesn't let a second job
//! sneak in underneath it.

use std::sync::{Condvar, Mutex};

use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Running { name: &'static str, depth: u32 },
    /// Set by `swap` while control is handed from one job to the next,
    /// so a waiter doesn't see a false "idle" window in between.
    Swapping,
}

pub struct JobCoordinator {
    state: Mutex<State>,
    changed: Condvar,
}

impl Default for JobCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl JobCoordinator {
    pub fn new() -> JobCoordinator {
        JobCoordinator {
            state: Mutex::new(State::Idle),
            changed: Condvar::new(),
        }
    }

    pub fn current(&self) -> Option<&'static str> {
        match *self.state.lock().unwrap() {
            State::Running { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Start `name`. If something else is already running and `block` is
    /// false, returns `Err(JobBusy)` immediately. If `block` is true, waits
    /// for the coordinator to go idle first.
    pub fn begin(&self, name: &'static str, block: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                State::Idle => {
                    *state = State::Running { name, depth: 1 };
                    debug!(job = name, "began job");
                    return Ok(());
                }
                State::Running { name: running, .. } => {
                    if !block {
                        return Err(Error::JobBusy { running });
                    }
                }
                State::Swapping => {
                    if !block {
                        return Err(Error::JobBusy {
                            running: "(handing off)",
                        });
                    }
                }
            }
            state = self.changed.wait(state).unwrap();
        }
    }

    /// Complete a [`swap`](Self::swap) handoff: claim the `Swapping`
    /// sentinel as a freshly running job named `name`. Only meaningful as
    /// the first thing the closure passed to `swap` does.
    pub fn take_over(&self, name: &'static str) {
        let mut state = self.state.lock().unwrap();
        assert!(
            matches!(*state, State::Swapping),
            "take_over() called without a pending swap"
        );
        *state = State::Running { name, depth: 1 };
        debug!(job = name, "took over job via swap");
    }

    /// Register an additional reference to whatever job is currently
    /// running (the save-trigger's "the backup itself hasn't started yet,
    /// but don't let anyone else start something else" window).
    pub fn ping(&self) {
        let mut state = self.state.lock().unwrap();
        if let State::Running { depth, .. } = &mut *state {
            *depth += 1;
        } else {
            warn!("ping() called with no job running");
        }
    }

    /// Release one reference; when the count reaches zero, go idle and
    /// wake any waiters.
    pub fn after(&self) {
        let mut state = self.state.lock().unwrap();
        let now_idle = match &mut *state {
            State::Running { depth, .. } => {
                *depth = depth.saturating_sub(1);
                *depth == 0
            }
            _ => false,
        };
        if now_idle {
            *state = State::Idle;
            self.changed.notify_all();
        }
    }

    /// Hand control from the currently running job to `f`, without letting
    /// the coordinator appear idle in between (so a blocked `begin` doesn't
    /// race in and grab it). `f` is expected to call `take_over` as its
    /// first step, to claim the job it starts.
    pub fn swap(&self, f: impl FnOnce()) {
        {
            let mut state = self.state.lock().unwrap();
            assert!(
                matches!(*state, State::Running { .. }),
                "swap() called with no job running"
            );
            *state = State::Swapping;
        }
        f();
    }

    /// Run `body` under `name`, guaranteeing `after()` runs on every exit
    /// path. Mirrors `new_job`'s decorator in the original plugin.
    pub fn run<T>(&self, name: &'static str, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.begin(name, false)?;
        let result = body();
        self.after();
        result
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn second_job_is_refused_while_first_runs() {
        let jobs = JobCoordinator::new();
        jobs.begin("make backup", false).unwrap();
        let err = jobs.begin("restore", false).unwrap_err();
        assert!(matches!(err, Error::JobBusy { running: "make backup" }));
        jobs.after();
        jobs.begin("restore", false).unwrap();
        jobs.after();
    }

    #[test]
    fn ping_keeps_job_alive_until_matching_after() {
        let jobs = JobCoordinator::new();
        jobs.begin("make backup", false).unwrap();
        jobs.ping();
        jobs.after();
        // one ping is still outstanding
        assert_eq!(jobs.current(), Some("make backup"));
        jobs.after();
        assert_eq!(jobs.current(), None);
    }

    #[test]
    fn blocking_begin_wakes_once_the_running_job_finishes() {
        let jobs = Arc::new(JobCoordinator::new());
        jobs.begin("make backup", false).unwrap();

        let waiter_jobs = jobs.clone();
        let waiter = thread::spawn(move || {
            waiter_jobs.begin("restore", true).unwrap();
            waiter_jobs.current()
        });

        thread::sleep(std::time::Duration::from_millis(20));
        jobs.after();
        assert_eq!(waiter.join().unwrap(), Some("restore"));
    }

    #[test]
    fn run_releases_even_on_error() {
        let jobs = JobCoordinator::new();
        let result: Result<()> = jobs.run("remove", || Err(Error::BackupNotFound("0x1".into())));
        assert!(result.is_err());
        assert_eq!(jobs.current(), None);
    }
}
