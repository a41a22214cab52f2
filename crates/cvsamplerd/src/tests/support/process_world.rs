//! Daemon test world shared across BDD scenarios.
//!
//! The daemon runs on a background thread with the thread launcher, so
//! scenarios drive it through the same control channel the signal forwarder
//! feeds in production.

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{Flock, FlockArg};
use serde_json::Value;
use tempfile::TempDir;

use cvsampler_config::RuntimePaths;

use crate::health::HealthReporter;
use crate::process::LaunchError;
use crate::process::daemonizer::{DaemonizeError, Daemonizer};
use crate::process::launch::{
    ControlChannel, ControlPlane, LaunchMode, LaunchPlan, ProcessControl, ServiceDeps,
    run_daemon_with,
};
use crate::store::Store;
use crate::supervisor::{ControlError, ControlEvent, SupervisorExit, ThreadLauncher};

use super::{HealthEvent, RecordingHealthReporter, ScriptedSourceProvider, TestConfigLoader};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub type StepResult = Result<(), String>;

type RunResult = Result<SupervisorExit, LaunchError>;

pub struct ProcessTestWorld {
    scratch: Arc<TempDir>,
    iterations: Option<u64>,
    reporter: Arc<RecordingHealthReporter>,
    sources: ScriptedSourceProvider,
    daemonizer: TestDaemonizer,
    events: Option<Sender<ControlEvent>>,
    handle: Option<thread::JoinHandle<RunResult>>,
    result: Option<RunResult>,
    foreign_lock: Option<Flock<fs::File>>,
}

impl Default for ProcessTestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTestWorld {
    pub fn new() -> Self {
        let scratch = TempDir::new().expect("failed to create scratch directory");
        Self {
            scratch: Arc::new(scratch),
            iterations: None,
            reporter: Arc::new(RecordingHealthReporter::default()),
            sources: ScriptedSourceProvider::default(),
            daemonizer: TestDaemonizer::default(),
            events: None,
            handle: None,
            result: None,
            foreign_lock: None,
        }
    }

    pub fn write_filter(&self, contents: &str) -> StepResult {
        fs::write(self.filter_path(), contents).map_err(|error| error.to_string())
    }

    pub fn queue_sample(&self, document: &str) -> StepResult {
        let value: Value = serde_json::from_str(document).map_err(|error| error.to_string())?;
        self.sources.push(value);
        Ok(())
    }

    pub fn set_iterations(&mut self, iterations: Option<u64>) {
        self.iterations = iterations;
    }

    /// Holds the lock the way a running instance would.
    pub fn hold_lock(&mut self, pid: u32) -> StepResult {
        let paths = RuntimePaths::in_directory(self.runtime_dir()).map_err(|error| error.to_string())?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(paths.lock_path())
            .map_err(|error| error.to_string())?;
        writeln!(file, "{pid}").map_err(|error| error.to_string())?;
        let lock = Flock::lock(file, FlockArg::LockExclusiveNonblock)
            .map_err(|(_, errno)| errno.to_string())?;
        self.foreign_lock = Some(lock);
        Ok(())
    }

    pub fn start(&mut self, mode: LaunchMode) -> StepResult {
        self.start_with(mode, TestConfigLoader::new(Arc::clone(&self.scratch)))
    }

    pub fn start_with(&mut self, mode: LaunchMode, loader: TestConfigLoader) -> StepResult {
        if self.handle.is_some() {
            return Err("daemon already running".to_owned());
        }
        let loader = loader.with_iterations(self.iterations);
        let channel = ControlChannel::new();
        self.events = Some(channel.sender.clone());
        let launcher = ThreadLauncher::new(channel.sender.clone());
        let plan = LaunchPlan {
            process: ProcessControl {
                mode: Some(mode),
                daemonizer: self.daemonizer.clone(),
                control: ChannelOnlyControl,
                launcher,
            },
            services: ServiceDeps {
                loader,
                reporter: Arc::clone(&self.reporter) as Arc<dyn HealthReporter>,
                sources: self.sources.clone(),
            },
            channel,
        };
        self.handle = Some(thread::spawn(move || run_daemon_with(plan)));
        Ok(())
    }

    /// Runs a second launch against the same runtime directory and waits for it.
    pub fn start_second_instance(&mut self) -> StepResult {
        let loader = TestConfigLoader::new(Arc::clone(&self.scratch)).with_database("second.db");
        self.start_with(LaunchMode::Foreground, loader)?;
        self.join()
    }

    pub fn send(&self, event: ControlEvent) -> StepResult {
        let sender = self
            .events
            .as_ref()
            .ok_or_else(|| "daemon not started".to_owned())?;
        sender.send(event).map_err(|error| error.to_string())
    }

    pub fn join(&mut self) -> StepResult {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| "daemon not running".to_owned())?;
        let result = handle
            .join()
            .map_err(|_| "daemon thread panicked".to_owned())?;
        self.result = Some(result);
        Ok(())
    }

    pub fn wait_for_event(&self, expected: &HealthEvent) -> StepResult {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while Instant::now() < deadline {
            if self.reporter.count(expected) > 0 {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(format!("daemon never reported {expected:?}"))
    }

    pub fn wait_for_health(&self, expected: &str) -> StepResult {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut last = None;
        while Instant::now() < deadline {
            if let Ok(snapshot) = self.read_health() {
                let status = snapshot.get("status").and_then(Value::as_str).map(str::to_owned);
                if status.as_deref() == Some(expected) {
                    return Ok(());
                }
                last = status;
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(format!("health snapshot never reported {expected}; last saw {last:?}"))
    }

    pub fn reporter(&self) -> &RecordingHealthReporter {
        &self.reporter
    }

    pub fn result(&self) -> Result<&RunResult, String> {
        self.result
            .as_ref()
            .ok_or_else(|| "daemon run has not completed".to_owned())
    }

    pub fn daemonizer_calls(&self) -> usize {
        self.daemonizer.calls()
    }

    pub fn root(&self) -> &Path {
        self.scratch.path()
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root().join("run")
    }

    pub fn filter_path(&self) -> PathBuf {
        self.root().join("favored_indexes.txt")
    }

    pub fn database_path(&self) -> PathBuf {
        self.root().join("clusterdata.db")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.runtime_dir().join("cvsamplerd.pid")
    }

    pub fn health_path(&self) -> PathBuf {
        self.runtime_dir().join("cvsamplerd.health")
    }

    pub fn read_health(&self) -> Result<Value, String> {
        let content = fs::read_to_string(self.health_path()).map_err(|error| error.to_string())?;
        serde_json::from_str(&content).map_err(|error| error.to_string())
    }

    /// Committed facts as `(index, device, value)` in insertion order.
    pub fn facts(&self) -> Result<Vec<(String, String, f64)>, String> {
        let store = Store::open(self.database_path()).map_err(|error| error.to_string())?;
        let facts = store.facts().map_err(|error| error.to_string())?;
        Ok(facts
            .into_iter()
            .map(|fact| (fact.index, fact.device, fact.value))
            .collect())
    }
}

impl Drop for ProcessTestWorld {
    fn drop(&mut self) {
        // Never leave a daemon thread blocked on its schedule.
        if self.handle.is_some() {
            drop(self.send(ControlEvent::Stop));
            drop(self.join());
        }
    }
}

/// Default test world fixture.
#[rstest::fixture]
pub fn world() -> RefCell<ProcessTestWorld> {
    RefCell::new(ProcessTestWorld::new())
}

/// Control plane that installs nothing; scenarios send events directly.
struct ChannelOnlyControl;

impl ControlPlane for ChannelOnlyControl {
    type Guard = ();

    fn install(&self, _sender: Sender<ControlEvent>) -> Result<Self::Guard, ControlError> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct TestDaemonizer {
    calls: Arc<AtomicUsize>,
}

impl TestDaemonizer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Daemonizer for TestDaemonizer {
    fn daemonize(
        &self,
        _paths: &RuntimePaths,
        _log_file: Option<&Path>,
    ) -> Result<(), DaemonizeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
