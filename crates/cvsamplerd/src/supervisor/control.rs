//! Signal control plane.
//!
//! Handlers installed by `signal-hook` only flip a flag and poke a self-pipe;
//! the [`SignalForwarder`] thread turns deliveries into [`ControlEvent`]s and
//! the supervisor consumes them from a channel on its own thread.

use std::io;
use std::ops::RangeInclusive;
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::sys::signal::{SigHandler, Signal, signal};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::SUPERVISOR_TARGET;

/// Signals routed to the supervisor.
pub const HANDLED_SIGNALS: [i32; 6] = [SIGHUP, SIGUSR1, SIGINT, SIGQUIT, SIGTERM, SIGUSR2];

/// Signals that keep their default action: child reaping, the uncatchable
/// pair and synchronous faults.
const KEPT_SIGNALS: [Signal; 9] = [
    Signal::SIGCHLD,
    Signal::SIGKILL,
    Signal::SIGSTOP,
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGTRAP,
];

/// Signals with no meaning for the daemon; ignored for its whole lifetime.
///
/// Realtime signals are suppressed as well, see [`suppress_signals`].
#[must_use]
pub fn suppressed_signals() -> Vec<Signal> {
    Signal::iterator()
        .filter(|sig| !KEPT_SIGNALS.contains(sig))
        .filter(|sig| !HANDLED_SIGNALS.contains(&(*sig as libc::c_int)))
        .collect()
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn realtime_signals() -> RangeInclusive<libc::c_int> {
    libc::SIGRTMIN()..=libc::SIGRTMAX()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn realtime_signals() -> RangeInclusive<libc::c_int> {
    1..=0
}

/// What the supervisor is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read the whitelist filter file.
    Reload,
    /// Run one extra cycle now.
    SampleNow,
    /// Close the store and exit.
    Stop,
    /// A worker reported a failed cycle.
    WorkerFailed,
}

impl ControlEvent {
    /// Maps a raw signal number onto its event.
    #[must_use]
    pub const fn from_signal(signal: i32) -> Option<Self> {
        match signal {
            SIGHUP => Some(Self::Reload),
            SIGUSR1 => Some(Self::SampleNow),
            SIGINT | SIGQUIT | SIGTERM => Some(Self::Stop),
            SIGUSR2 => Some(Self::WorkerFailed),
            _ => None,
        }
    }
}

/// Failures while arranging signal dispositions.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Registering the forwarding handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Changing a realtime signal's disposition failed.
    #[error("failed to change disposition of realtime signal {signal}: {source}")]
    RealtimeDisposition {
        /// Raw signal number.
        signal: libc::c_int,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// Changing a signal disposition failed.
    #[error("failed to change disposition of {signal}: {source}")]
    Disposition {
        /// Signal being changed.
        signal: Signal,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// The forwarding thread could not be spawned.
    #[error("failed to spawn signal forwarder: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Sets every suppressed signal, realtime signals included, to `SIG_IGN`.
pub fn suppress_signals() -> Result<(), ControlError> {
    set_disposition(&suppressed_signals(), SigHandler::SigIgn)?;
    set_realtime_disposition(libc::SIG_IGN)
}

/// Puts suppressed and handled signals back to `SIG_DFL`.
///
/// Called in forked workers so they react to signals like any plain process.
pub fn restore_default_signals() -> Result<(), ControlError> {
    set_disposition(&suppressed_signals(), SigHandler::SigDfl)?;
    set_realtime_disposition(libc::SIG_DFL)?;
    let handled: Vec<Signal> = HANDLED_SIGNALS
        .iter()
        .filter_map(|raw| Signal::try_from(*raw).ok())
        .collect();
    set_disposition(&handled, SigHandler::SigDfl)
}

fn set_realtime_disposition(handler: libc::sighandler_t) -> Result<(), ControlError> {
    for raw in realtime_signals() {
        // SAFETY: only SIG_IGN and SIG_DFL are installed.
        if unsafe { libc::signal(raw, handler) } == libc::SIG_ERR {
            return Err(ControlError::RealtimeDisposition {
                signal: raw,
                source: Errno::last(),
            });
        }
    }
    Ok(())
}

fn set_disposition(signals: &[Signal], handler: SigHandler) -> Result<(), ControlError> {
    for &sig in signals {
        // SAFETY: only SIG_IGN and SIG_DFL are installed; no Rust code runs in
        // signal context.
        unsafe { signal(sig, handler) }
            .map(drop)
            .map_err(|source| ControlError::Disposition {
                signal: sig,
                source,
            })?;
    }
    Ok(())
}

/// Thread forwarding delivered signals into the supervisor's channel.
#[derive(Debug)]
pub struct SignalForwarder {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalForwarder {
    /// Registers handlers and starts forwarding into `sender`.
    pub fn install(sender: Sender<ControlEvent>) -> Result<Self, ControlError> {
        let mut signals =
            Signals::new(HANDLED_SIGNALS).map_err(|source| ControlError::Install { source })?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signal-forwarder".to_owned())
            .spawn(move || {
                for raw in signals.forever() {
                    let Some(event) = ControlEvent::from_signal(raw) else {
                        continue;
                    };
                    debug!(target: SUPERVISOR_TARGET, signal = raw, ?event, "signal received");
                    if sender.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| ControlError::Spawn { source })?;
        info!(
            target: SUPERVISOR_TARGET,
            signals = ?HANDLED_SIGNALS,
            "signal forwarding installed"
        );
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!(target: SUPERVISOR_TARGET, "signal forwarder panicked");
        }
    }
}
