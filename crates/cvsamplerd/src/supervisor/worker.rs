//! Worker launchers: one isolated execution context per cycle.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, getpid, getppid};
use thiserror::Error;
use tracing::{error, warn};

use super::SUPERVISOR_TARGET;
use super::control::{ControlEvent, restore_default_signals};
use super::cycle::{CycleError, CycleReport};

/// Exit status of a worker whose cycle committed.
pub const EXIT_CYCLE_OK: i32 = 0;
/// Exit status of a worker whose cycle failed to persist.
pub const EXIT_PERSISTENCE_FAILED: i32 = 3;
/// Exit status of a worker whose cycle panicked.
pub const EXIT_CYCLE_PANICKED: i32 = 4;

/// One cycle's work, run inside the worker.
pub type CycleJob = Box<dyn FnOnce() -> Result<CycleReport, CycleError> + Send + 'static>;

/// Why a worker did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Persisting the cycle's rows failed.
    Persistence,
    /// The cycle panicked.
    Panicked,
    /// The worker exited with an unexpected status.
    Exited(i32),
    /// The worker was killed by a signal.
    Signalled(Signal),
    /// The worker could not be started or reaped.
    Lost,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistence => f.write_str("persistence failure"),
            Self::Panicked => f.write_str("panic"),
            Self::Exited(code) => write!(f, "exit status {code}"),
            Self::Signalled(signal) => write!(f, "killed by {signal}"),
            Self::Lost => f.write_str("worker lost"),
        }
    }
}

/// How a worker finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The cycle completed and its rows (possibly none) were committed.
    Succeeded,
    /// The cycle failed.
    Failed(FailureKind),
}

impl WorkerOutcome {
    fn from_exit_code(code: i32) -> Self {
        match code {
            EXIT_CYCLE_OK => Self::Succeeded,
            EXIT_PERSISTENCE_FAILED => Self::Failed(FailureKind::Persistence),
            EXIT_CYCLE_PANICKED => Self::Failed(FailureKind::Panicked),
            other => Self::Failed(FailureKind::Exited(other)),
        }
    }

    fn from_cycle(result: &Result<CycleReport, CycleError>) -> Self {
        match result {
            Ok(_) => Self::Succeeded,
            Err(CycleError::Persistence(_)) => Self::Failed(FailureKind::Persistence),
            Err(CycleError::Panicked { .. }) => Self::Failed(FailureKind::Panicked),
        }
    }

    const fn exit_code(self) -> i32 {
        match self {
            Self::Succeeded => EXIT_CYCLE_OK,
            Self::Failed(FailureKind::Persistence) => EXIT_PERSISTENCE_FAILED,
            Self::Failed(_) => EXIT_CYCLE_PANICKED,
        }
    }
}

/// Failures starting or reaping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `fork(2)` failed.
    #[error("failed to fork worker: {0}")]
    Fork(#[source] Errno),
    /// The worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
    /// Waiting on the worker process failed.
    #[error("failed to wait for worker {pid}: {source}")]
    Wait {
        /// Worker process id.
        pid: Pid,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}

/// Seam for starting one worker per cycle.
pub trait WorkerLauncher {
    /// Starts `job` in a fresh worker.
    fn launch(&self, job: CycleJob) -> Result<WorkerHandle, WorkerError>;
}

/// A running (or finished) worker.
#[derive(Debug)]
pub struct WorkerHandle {
    state: HandleState,
}

#[derive(Debug)]
enum HandleState {
    Process(Pid),
    Thread(Option<JoinHandle<WorkerOutcome>>),
}

impl WorkerHandle {
    /// Reaps the worker if it has finished, without blocking.
    pub fn try_reap(&mut self) -> Result<Option<WorkerOutcome>, WorkerError> {
        match &mut self.state {
            HandleState::Process(pid) => {
                let pid = *pid;
                match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(status) => Ok(outcome_from_status(status)),
                    Err(Errno::EINTR) => Ok(None),
                    Err(source) => Err(WorkerError::Wait { pid, source }),
                }
            }
            HandleState::Thread(slot) => {
                if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
                    return Ok(None);
                }
                Ok(Some(join_thread(slot.take())))
            }
        }
    }

    /// Blocks until the worker finishes.
    pub fn wait(mut self) -> Result<WorkerOutcome, WorkerError> {
        match &mut self.state {
            HandleState::Process(pid) => {
                let pid = *pid;
                loop {
                    match waitpid(pid, None) {
                        Ok(status) => {
                            if let Some(outcome) = outcome_from_status(status) {
                                return Ok(outcome);
                            }
                        }
                        Err(Errno::EINTR) => {}
                        Err(source) => return Err(WorkerError::Wait { pid, source }),
                    }
                }
            }
            HandleState::Thread(slot) => Ok(join_thread(slot.take())),
        }
    }
}

fn outcome_from_status(status: WaitStatus) -> Option<WorkerOutcome> {
    match status {
        WaitStatus::Exited(_, code) => Some(WorkerOutcome::from_exit_code(code)),
        WaitStatus::Signaled(_, signal, _) => {
            Some(WorkerOutcome::Failed(FailureKind::Signalled(signal)))
        }
        _ => None,
    }
}

fn join_thread(handle: Option<JoinHandle<WorkerOutcome>>) -> WorkerOutcome {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or(WorkerOutcome::Failed(FailureKind::Panicked))
}

/// Runs `job` behind a panic boundary.
pub(crate) fn run_job(job: CycleJob) -> Result<CycleReport, CycleError> {
    panic::catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|payload| {
        Err(CycleError::Panicked {
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

fn log_failure(result: &Result<CycleReport, CycleError>) {
    if let Err(failure) = result {
        error!(target: SUPERVISOR_TARGET, error = %failure, "cycle failed");
    }
}

/// Sends SIGUSR2 to `supervisor` while it is still this process's parent.
///
/// An orphaned worker was adopted by another process, which must not
/// receive the report. Returns whether the signal was sent.
fn notify_supervisor(supervisor: Pid) -> bool {
    if getppid() != supervisor {
        warn!(target: SUPERVISOR_TARGET, %supervisor, "supervisor gone; failure not reported");
        return false;
    }
    match kill(supervisor, Signal::SIGUSR2) {
        Ok(()) => true,
        Err(errno) => {
            error!(target: SUPERVISOR_TARGET, %errno, "failed to notify supervisor");
            false
        }
    }
}

/// Production launcher: each cycle runs in a forked child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkLauncher;

impl WorkerLauncher for ForkLauncher {
    fn launch(&self, job: CycleJob) -> Result<WorkerHandle, WorkerError> {
        let supervisor = getpid();
        // SAFETY: the child only runs the cycle job and then exits; it never
        // returns into the scheduling loop.
        // Only this thread survives in the child. A lock the signal forwarder
        // held at fork time stays held there, so the forwarder logs at debug.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(WorkerHandle {
                state: HandleState::Process(child),
            }),
            Ok(ForkResult::Child) => {
                if let Err(error) = restore_default_signals() {
                    warn!(target: SUPERVISOR_TARGET, %error, "worker kept inherited signal dispositions");
                }
                let result = run_job(job);
                log_failure(&result);
                let outcome = WorkerOutcome::from_cycle(&result);
                if outcome != WorkerOutcome::Succeeded {
                    notify_supervisor(supervisor);
                }
                std::process::exit(outcome.exit_code())
            }
            Err(errno) => Err(WorkerError::Fork(errno)),
        }
    }
}

/// Launcher running each cycle on a dedicated thread.
///
/// Failures are reported on the control channel instead of by signal.
#[derive(Debug, Clone)]
pub struct ThreadLauncher {
    events: Sender<ControlEvent>,
}

impl ThreadLauncher {
    /// Builds a launcher reporting failures into `events`.
    #[must_use]
    pub const fn new(events: Sender<ControlEvent>) -> Self {
        Self { events }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, job: CycleJob) -> Result<WorkerHandle, WorkerError> {
        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name("cycle-worker".to_owned())
            .spawn(move || {
                let result = run_job(job);
                log_failure(&result);
                let outcome = WorkerOutcome::from_cycle(&result);
                if outcome != WorkerOutcome::Succeeded {
                    drop(events.send(ControlEvent::WorkerFailed));
                }
                outcome
            })
            .map_err(WorkerError::Spawn)?;
        Ok(WorkerHandle {
            state: HandleState::Thread(Some(handle)),
        })
    }
}
