//! Supervises daemon launch sequencing and runtime orchestration.

use std::path::{self, Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use tracing::info;

use cvsampler_config::{Config, RuntimePaths};

use crate::bootstrap::{
    ConfigLoader, SourceProvider, SystemConfigLoader, SystemSourceProvider, bootstrap_with,
};
use crate::dither::Ditherer;
use crate::favored::FavoredState;
use crate::health::{HealthReporter, HealthState, StructuredHealthReporter};
use crate::store::Store;
use crate::supervisor::{
    ControlError, ControlEvent, CycleRunner, ForkLauncher, SignalForwarder, Supervisor,
    SupervisorDeps, SupervisorExit, WorkerLauncher, suppress_signals,
};

use super::PROCESS_TARGET;
use super::daemonizer::{Daemonizer, SystemDaemonizer};
use super::errors::LaunchError;
use super::guard::ProcessGuard;

/// Launch mode for the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fork into the background and detach from the controlling terminal.
    Background,
    /// Remain attached to the terminal; primarily used for debugging and tests.
    Foreground,
}

impl LaunchMode {
    fn from_config(config: &Config) -> Self {
        if config.foreground() {
            Self::Foreground
        } else {
            Self::Background
        }
    }
}

/// Installs whatever turns external requests into [`ControlEvent`]s.
pub(crate) trait ControlPlane {
    /// Kept alive for as long as the supervisor runs.
    type Guard;

    /// Starts forwarding requests into `sender`.
    fn install(&self, sender: Sender<ControlEvent>) -> Result<Self::Guard, ControlError>;
}

/// Control plane backed by POSIX signals.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SignalControlPlane;

impl ControlPlane for SignalControlPlane {
    type Guard = SignalForwarder;

    fn install(&self, sender: Sender<ControlEvent>) -> Result<Self::Guard, ControlError> {
        suppress_signals()?;
        SignalForwarder::install(sender)
    }
}

/// Channel shared by the control plane, the launcher and the supervisor.
pub(crate) struct ControlChannel {
    pub(crate) sender: Sender<ControlEvent>,
    pub(crate) receiver: Receiver<ControlEvent>,
}

impl ControlChannel {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self { sender, receiver }
    }
}

/// Process-level collaborators needed to control daemon lifecycle.
pub(crate) struct ProcessControl<D, C, W> {
    pub(crate) mode: Option<LaunchMode>,
    pub(crate) daemonizer: D,
    pub(crate) control: C,
    pub(crate) launcher: W,
}

/// Service dependencies required to construct the daemon runtime.
pub(crate) struct ServiceDeps<L, P> {
    pub(crate) loader: L,
    pub(crate) reporter: Arc<dyn HealthReporter>,
    pub(crate) sources: P,
}

/// Collaborators required to launch the daemon runtime.
pub(crate) struct LaunchPlan<L, P, D, C, W> {
    pub(crate) process: ProcessControl<D, C, W>,
    pub(crate) services: ServiceDeps<L, P>,
    pub(crate) channel: ControlChannel,
}

/// Runs the daemon using the production collaborators.
pub fn run_daemon() -> Result<SupervisorExit, LaunchError> {
    let plan = LaunchPlan {
        process: ProcessControl {
            mode: None,
            daemonizer: SystemDaemonizer::new(),
            control: SignalControlPlane,
            launcher: ForkLauncher,
        },
        services: ServiceDeps {
            loader: SystemConfigLoader,
            reporter: Arc::new(StructuredHealthReporter::new()),
            sources: SystemSourceProvider,
        },
        channel: ControlChannel::new(),
    };
    run_daemon_with(plan)
}

/// Runs the daemon with injected collaborators.
///
/// `mode` overrides the configured launch mode when set.
pub(crate) fn run_daemon_with<L, P, D, C, W>(
    plan: LaunchPlan<L, P, D, C, W>,
) -> Result<SupervisorExit, LaunchError>
where
    L: ConfigLoader,
    P: SourceProvider,
    D: Daemonizer,
    C: ControlPlane,
    W: WorkerLauncher,
{
    let LaunchPlan {
        process,
        services,
        channel,
    } = plan;
    let ProcessControl {
        mode,
        daemonizer,
        control,
        launcher,
    } = process;
    let ServiceDeps {
        loader,
        reporter,
        sources,
    } = services;

    let config = bootstrap_with(&loader, reporter.as_ref())?;
    let mode = mode.unwrap_or_else(|| LaunchMode::from_config(&config));
    info!(
        target: PROCESS_TARGET,
        ?mode,
        "starting daemon runtime"
    );

    let prepared = prepare(&config, mode, &daemonizer, &sources, reporter.as_ref());
    let Prepared {
        mut guard,
        favored,
        runner,
        ditherer,
        database,
    } = prepared.inspect_err(|error| reporter.bootstrap_failed(error))?;

    let started = start(&mut guard, &control, channel.sender, &database);
    let (_control_guard, store) = started.inspect_err(|error| reporter.bootstrap_failed(error))?;

    let deps = SupervisorDeps {
        launcher,
        runner,
        favored,
        store,
        events: channel.receiver,
        reporter,
    };
    let exit = Supervisor::new(deps, config.iterations())
        .run(ditherer.intervals(), &mut guard)
        .map_err(|source| LaunchError::Close { source })?;
    info!(
        target: PROCESS_TARGET,
        ?exit,
        "shutdown sequence completed"
    );
    Ok(exit)
}

struct Prepared {
    guard: ProcessGuard,
    favored: FavoredState,
    runner: CycleRunner,
    ditherer: Ditherer,
    database: PathBuf,
}

/// Everything that can fail before the process detaches.
fn prepare<D, P>(
    config: &Config,
    mode: LaunchMode,
    daemonizer: &D,
    sources: &P,
    reporter: &dyn HealthReporter,
) -> Result<Prepared, LaunchError>
where
    D: Daemonizer,
    P: SourceProvider,
{
    // The daemon changes directory when it detaches.
    let database = resolve(config.database().as_std_path())?;
    let filter_file = resolve(config.filter_file().as_std_path())?;
    let log_file = config
        .log_file()
        .map(|path| resolve(path.as_std_path()))
        .transpose()?;

    let paths = RuntimePaths::from_config(config)?;
    let guard = ProcessGuard::acquire(paths)?;

    let favored = FavoredState::load(filter_file)?;
    reporter.whitelist_loaded(favored.snapshot().len());
    let source = sources.stats_source(config)?;
    let runner = CycleRunner::new(source, config.lookup_key(), database.clone());
    let ditherer = Ditherer::new(config.period_secs())?;

    if matches!(mode, LaunchMode::Background) {
        daemonizer.daemonize(guard.paths(), log_file.as_deref())?;
    }
    Ok(Prepared {
        guard,
        favored,
        runner,
        ditherer,
        database,
    })
}

/// Publishes the pid, starts the control plane and opens the store.
fn start<C: ControlPlane>(
    guard: &mut ProcessGuard,
    control: &C,
    sender: Sender<ControlEvent>,
    database: &Path,
) -> Result<(C::Guard, Store), LaunchError> {
    guard.write_pid(std::process::id())?;
    guard.write_health(HealthState::Starting, 0)?;
    let control_guard = control.install(sender)?;
    let store = Store::open(database).map_err(|source| LaunchError::Store { source })?;
    Ok((control_guard, store))
}

fn resolve(path: &Path) -> Result<PathBuf, LaunchError> {
    path::absolute(path).map_err(|source| LaunchError::ResolvePath {
        path: path.to_path_buf(),
        source,
    })
}
