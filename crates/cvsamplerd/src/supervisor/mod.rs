//! The long-lived sampling supervisor.
//!
//! The supervisor owns the schedule and the control state. Each cycle runs in
//! a worker started through a [`WorkerLauncher`]; at most one worker is in
//! flight at a time. Control events are consumed between deadlines on the
//! supervisor's own thread.

pub mod control;
pub mod cycle;
pub mod worker;

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

pub use self::control::{
    ControlError, ControlEvent, SignalForwarder, restore_default_signals, suppress_signals,
};
pub use self::cycle::{CycleError, CycleId, CycleReport, CycleRunner};
pub use self::worker::{
    CycleJob, FailureKind, ForkLauncher, ThreadLauncher, WorkerError, WorkerHandle,
    WorkerLauncher, WorkerOutcome,
};

use crate::favored::FavoredState;
use crate::health::{HealthReporter, HealthState, StatusSink};
use crate::store::{PersistenceError, Store};

pub(crate) const SUPERVISOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::supervisor");

/// Upper bound on how long a finished worker goes unreaped.
const REAP_INTERVAL: Duration = Duration::from_millis(250);

/// Poll step while a launch waits on the previous worker.
const SETTLE_POLL: Duration = Duration::from_millis(20);

/// Why the supervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// A stop request was honoured.
    Stopped,
    /// The configured number of scheduled cycles ran.
    CapReached {
        /// Scheduled cycles launched.
        cycles: u64,
    },
}

/// Collaborators the supervisor drives.
pub struct SupervisorDeps<L> {
    /// Starts one worker per cycle.
    pub launcher: L,
    /// Work each worker performs.
    pub runner: CycleRunner,
    /// Reloadable whitelist.
    pub favored: FavoredState,
    /// The supervisor's own store handle, closed on exit.
    pub store: Store,
    /// Control events from the signal forwarder or launcher.
    pub events: Receiver<ControlEvent>,
    /// Lifecycle event sink.
    pub reporter: Arc<dyn HealthReporter>,
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Clone, Copy)]
enum CycleKind {
    Scheduled,
    Immediate,
}

/// Schedules cycles until stopped, halted or capped.
pub struct Supervisor<L> {
    launcher: L,
    runner: CycleRunner,
    favored: FavoredState,
    store: Store,
    events: Receiver<ControlEvent>,
    reporter: Arc<dyn HealthReporter>,
    iterations: Option<u64>,
    continue_sampling: bool,
    scheduled: u64,
    immediate: u64,
    in_flight: Option<(CycleId, WorkerHandle)>,
}

impl<L: WorkerLauncher> Supervisor<L> {
    /// Builds a supervisor; `iterations` caps scheduled cycles when set.
    pub fn new(deps: SupervisorDeps<L>, iterations: Option<u64>) -> Self {
        let SupervisorDeps {
            launcher,
            runner,
            favored,
            store,
            events,
            reporter,
        } = deps;
        Self {
            launcher,
            runner,
            favored,
            store,
            events,
            reporter,
            iterations,
            continue_sampling: true,
            scheduled: 0,
            immediate: 0,
            in_flight: None,
        }
    }

    /// Runs the scheduling loop, waiting `intervals` between cycles.
    ///
    /// Returns once stopped or once the cycle cap is reached; the
    /// supervisor's store is closed on both paths.
    pub fn run<I>(
        mut self,
        intervals: I,
        status: &mut dyn StatusSink,
    ) -> Result<SupervisorExit, PersistenceError>
    where
        I: IntoIterator<Item = Duration>,
    {
        let mut intervals = intervals.into_iter();
        status.publish(HealthState::Sampling, 0);
        info!(
            target: SUPERVISOR_TARGET,
            iterations = ?self.iterations,
            database = %self.runner.database().display(),
            "sampling started"
        );
        loop {
            if !self.continue_sampling {
                self.idle(status);
                return self.stop(status);
            }
            if self.cap_reached() {
                return self.finish_capped(status);
            }
            if matches!(self.launch(CycleKind::Scheduled, status), Flow::Stop) {
                return self.stop(status);
            }
            if self.cap_reached() {
                continue;
            }
            let interval = intervals.next().unwrap_or_default();
            debug!(
                target: SUPERVISOR_TARGET,
                wait_secs = interval.as_secs(),
                "waiting for next cycle"
            );
            if matches!(self.wait_for(interval, status), Flow::Stop) {
                return self.stop(status);
            }
        }
    }

    fn cap_reached(&self) -> bool {
        self.iterations.is_some_and(|cap| self.scheduled >= cap)
    }

    /// Starts a cycle once any previous worker has finished.
    fn launch(&mut self, kind: CycleKind, status: &mut dyn StatusSink) -> Flow {
        if matches!(self.settle(status), Flow::Stop) {
            return Flow::Stop;
        }
        if !self.continue_sampling {
            if matches!(kind, CycleKind::Immediate) {
                self.reporter.immediate_sample_refused();
            }
            return Flow::Continue;
        }

        let id = match kind {
            CycleKind::Scheduled => {
                self.scheduled += 1;
                CycleId::Scheduled(self.scheduled)
            }
            CycleKind::Immediate => {
                self.immediate += 1;
                CycleId::Immediate(self.immediate)
            }
        };
        let job = self.runner.job(id, self.favored.snapshot());
        match self.launcher.launch(job) {
            Ok(handle) => {
                self.reporter.cycle_launched(id);
                self.in_flight = Some((id, handle));
                status.publish(HealthState::Sampling, self.scheduled);
            }
            Err(error) => {
                warn!(target: SUPERVISOR_TARGET, cycle = %id, %error, "failed to launch worker");
                self.reporter.worker_failed(Some(id), FailureKind::Lost);
                self.halt(status);
            }
        }
        Flow::Continue
    }

    /// Waits out the in-flight worker while still honouring control events.
    ///
    /// Immediate sample requests seen here coalesce into the pending launch.
    /// A failure report from the reaped worker lands before this returns.
    fn settle(&mut self, status: &mut dyn StatusSink) -> Flow {
        loop {
            self.reap(status);
            if self.in_flight.is_none() {
                break;
            }
            match self.events.recv_timeout(SETTLE_POLL) {
                Ok(event) => {
                    if matches!(self.absorb(event, status), Flow::Stop) {
                        return Flow::Stop;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(target: SUPERVISOR_TARGET, "control channel closed; stopping");
                    return Flow::Stop;
                }
            }
        }
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    if matches!(self.absorb(event, status), Flow::Stop) {
                        return Flow::Stop;
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return Flow::Continue,
            }
        }
    }

    fn absorb(&mut self, event: ControlEvent, status: &mut dyn StatusSink) -> Flow {
        if event == ControlEvent::SampleNow {
            debug!(target: SUPERVISOR_TARGET, "immediate sample coalesced into pending cycle");
            return Flow::Continue;
        }
        self.dispatch(event, status)
    }

    fn dispatch(&mut self, event: ControlEvent, status: &mut dyn StatusSink) -> Flow {
        match event {
            ControlEvent::Reload => {
                match self.favored.reload() {
                    Ok(entries) => self.reporter.whitelist_reloaded(entries),
                    Err(error) => self.reporter.whitelist_reload_failed(&error),
                }
                Flow::Continue
            }
            ControlEvent::SampleNow if !self.continue_sampling => {
                self.reporter.immediate_sample_refused();
                Flow::Continue
            }
            ControlEvent::SampleNow => self.launch(CycleKind::Immediate, status),
            ControlEvent::WorkerFailed => {
                info!(target: SUPERVISOR_TARGET, "worker reported a failed cycle");
                self.halt(status);
                Flow::Continue
            }
            ControlEvent::Stop => Flow::Stop,
        }
    }

    fn wait_for(&mut self, interval: Duration, status: &mut dyn StatusSink) -> Flow {
        let deadline = Instant::now() + interval;
        loop {
            self.reap(status);
            if !self.continue_sampling {
                return Flow::Continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Flow::Continue;
            }
            match self.events.recv_timeout(remaining.min(REAP_INTERVAL)) {
                Ok(event) => {
                    if matches!(self.dispatch(event, status), Flow::Stop) {
                        return Flow::Stop;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(target: SUPERVISOR_TARGET, "control channel closed; stopping");
                    return Flow::Stop;
                }
            }
        }
    }

    /// Halted: honour reloads and stop, refuse samples, schedule nothing.
    fn idle(&mut self, status: &mut dyn StatusSink) {
        info!(target: SUPERVISOR_TARGET, "scheduling halted; waiting for stop");
        loop {
            self.reap(status);
            match self.events.recv_timeout(REAP_INTERVAL) {
                Ok(event) => {
                    if matches!(self.dispatch(event, status), Flow::Stop) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(target: SUPERVISOR_TARGET, "control channel closed; stopping");
                    return;
                }
            }
        }
    }

    fn reap(&mut self, status: &mut dyn StatusSink) {
        let Some((id, handle)) = self.in_flight.as_mut() else {
            return;
        };
        let id = *id;
        let outcome = match handle.try_reap() {
            Ok(None) => return,
            Ok(Some(outcome)) => outcome,
            Err(error) => {
                warn!(target: SUPERVISOR_TARGET, cycle = %id, %error, "failed to reap worker");
                WorkerOutcome::Failed(FailureKind::Lost)
            }
        };
        self.in_flight = None;
        self.record_outcome(id, outcome, status);
    }

    fn record_outcome(&mut self, id: CycleId, outcome: WorkerOutcome, status: &mut dyn StatusSink) {
        match outcome {
            WorkerOutcome::Succeeded => self.reporter.worker_finished(id),
            WorkerOutcome::Failed(failure) => {
                self.reporter.worker_failed(Some(id), failure);
                self.halt(status);
            }
        }
    }

    fn halt(&mut self, status: &mut dyn StatusSink) {
        if self.continue_sampling {
            self.continue_sampling = false;
            self.reporter.scheduling_halted();
            status.publish(HealthState::Halted, self.scheduled);
        }
    }

    fn finish_capped(mut self, status: &mut dyn StatusSink) -> Result<SupervisorExit, PersistenceError> {
        if matches!(self.settle(status), Flow::Stop) {
            return self.stop(status);
        }
        let cycles = self.scheduled;
        info!(target: SUPERVISOR_TARGET, cycles, "cycle limit reached");
        status.publish(HealthState::Stopping, cycles);
        self.store.close()?;
        Ok(SupervisorExit::CapReached { cycles })
    }

    fn stop(self, status: &mut dyn StatusSink) -> Result<SupervisorExit, PersistenceError> {
        self.reporter.stopping();
        status.publish(HealthState::Stopping, self.scheduled);
        if let Some((id, _)) = &self.in_flight {
            info!(target: SUPERVISOR_TARGET, cycle = %id, "leaving in-flight worker to finish");
        }
        self.store.close()?;
        Ok(SupervisorExit::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::iter;
    use std::sync::mpsc::{self, Sender};
    use std::thread;

    use rstest::rstest;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::health::StructuredHealthReporter;
    use crate::pipeline::{Collected, MockStatsSource, StatsSource};

    impl StatusSink for Vec<(HealthState, u64)> {
        fn publish(&mut self, state: HealthState, cycles: u64) {
            self.push((state, cycles));
        }
    }

    struct Rig {
        dir: TempDir,
        events: Sender<ControlEvent>,
        supervisor: Supervisor<ThreadLauncher>,
    }

    fn rig(iterations: Option<u64>) -> Rig {
        rig_collecting_after(Duration::ZERO, iterations)
    }

    /// Rig whose source takes `delay` to answer each collection.
    fn rig_collecting_after(delay: Duration, iterations: Option<u64>) -> Rig {
        let dir = TempDir::new().expect("temp dir");
        let database = dir.path().join("clusterdata.db");
        let filter = dir.path().join("favored.txt");
        fs::write(&filter, "cpu.temp\n").expect("write filter");

        let mut source = MockStatsSource::new();
        source.expect_collect().returning(move || {
            thread::sleep(delay);
            Collected::Sample(json!({"cpu.temp": {"node1": 42}}))
        });
        let source: Arc<dyn StatsSource> = Arc::new(source);

        let (events, receiver) = mpsc::channel();
        let deps = SupervisorDeps {
            launcher: ThreadLauncher::new(events.clone()),
            runner: CycleRunner::new(source, "lookup", &database),
            favored: FavoredState::load(&filter).expect("filter"),
            store: Store::open(&database).expect("store"),
            events: receiver,
            reporter: Arc::new(StructuredHealthReporter::new()),
        };
        Rig {
            dir,
            events,
            supervisor: Supervisor::new(deps, iterations),
        }
    }

    fn fact_count(dir: &TempDir) -> usize {
        Store::open(dir.path().join("clusterdata.db"))
            .expect("store")
            .facts()
            .expect("facts")
            .len()
    }

    #[rstest]
    fn cap_runs_exactly_the_requested_cycles() {
        let Rig {
            dir,
            events: _events,
            supervisor,
        } = rig(Some(3));
        let mut status = Vec::new();
        let exit = supervisor
            .run(iter::repeat(Duration::from_millis(10)), &mut status)
            .expect("run");
        assert_eq!(exit, SupervisorExit::CapReached { cycles: 3 });
        assert_eq!(fact_count(&dir), 3);
        assert_eq!(status.last(), Some(&(HealthState::Stopping, 3)));
    }

    #[rstest]
    fn stop_while_waiting_exits_before_next_cycle() {
        let Rig {
            dir,
            events,
            supervisor,
        } = rig(None);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            events.send(ControlEvent::Stop).expect("send stop");
        });
        let mut status = Vec::new();
        let exit = supervisor
            .run(iter::repeat(Duration::from_secs(3_600)), &mut status)
            .expect("run");
        stopper.join().expect("stopper");
        assert_eq!(exit, SupervisorExit::Stopped);
        assert_eq!(fact_count(&dir), 1);
    }

    #[rstest]
    fn failure_report_halts_and_refuses_immediate_samples() {
        let Rig {
            dir,
            events,
            supervisor,
        } = rig(None);
        let reporter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            events.send(ControlEvent::WorkerFailed).expect("send failure");
            events.send(ControlEvent::SampleNow).expect("send sample");
            events.send(ControlEvent::Stop).expect("send stop");
        });
        let mut status = Vec::new();
        let exit = supervisor
            .run(iter::repeat(Duration::from_secs(3_600)), &mut status)
            .expect("run");
        reporter.join().expect("reporter");
        assert_eq!(exit, SupervisorExit::Stopped);
        // Only the first scheduled cycle ran; the immediate request was refused.
        assert_eq!(fact_count(&dir), 1);
        assert!(status.contains(&(HealthState::Halted, 1)));
    }

    #[rstest]
    fn immediate_samples_do_not_count_towards_the_cap() {
        let Rig {
            dir,
            events,
            supervisor,
        } = rig(Some(2));
        let sampler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            drop(events.send(ControlEvent::SampleNow));
            events
        });
        let mut status = Vec::new();
        let exit = supervisor
            .run(iter::repeat(Duration::from_millis(600)), &mut status)
            .expect("run");
        drop(sampler.join().expect("sampler"));
        assert_eq!(exit, SupervisorExit::CapReached { cycles: 2 });
        assert_eq!(fact_count(&dir), 3);
    }

    #[rstest]
    fn pending_reload_is_applied_before_the_next_launch() {
        let Rig {
            dir,
            events,
            supervisor,
        } = rig(Some(2));
        fs::write(dir.path().join("favored.txt"), "fan.rpm\n").expect("rewrite filter");
        events.send(ControlEvent::Reload).expect("send reload");
        let mut status = Vec::new();
        supervisor
            .run(iter::repeat(Duration::from_millis(50)), &mut status)
            .expect("run");
        assert_eq!(fact_count(&dir), 0);
    }

    #[rstest]
    fn failed_reload_keeps_the_previous_whitelist() {
        let Rig {
            dir,
            events,
            supervisor,
        } = rig(Some(1));
        fs::remove_file(dir.path().join("favored.txt")).expect("remove filter");
        events.send(ControlEvent::Reload).expect("send reload");
        let mut status = Vec::new();
        supervisor
            .run(iter::repeat(Duration::from_millis(50)), &mut status)
            .expect("run");
        assert_eq!(fact_count(&dir), 1);
        assert!(!status.contains(&(HealthState::Halted, 1)));
    }

    #[rstest]
    fn stop_is_honoured_while_a_launch_waits_on_a_busy_worker() {
        let Rig {
            dir,
            events,
            supervisor,
        } = rig_collecting_after(Duration::from_secs(3), None);
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            events.send(ControlEvent::Stop).expect("send stop");
            Instant::now()
        });
        let mut status = Vec::new();
        let exit = supervisor
            .run(iter::repeat(Duration::from_millis(10)), &mut status)
            .expect("run");
        let exited = Instant::now();
        let sent = stopper.join().expect("stopper");
        assert_eq!(exit, SupervisorExit::Stopped);
        assert!(
            exited.saturating_duration_since(sent) < Duration::from_secs(1),
            "stop waited on the in-flight worker"
        );
        // The worker was left to finish; keep its database alive until it does.
        thread::sleep(Duration::from_secs(3));
        drop(dir);
    }
}
