//! Collect stage: run the vendor command and parse its JSON output.
//!
//! Every failure is folded into [`Collected::NoData`]. A command that outlives
//! its timeout is killed together with its process group.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::PIPELINE_TARGET;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Reasons a collect stage produced no data.
#[derive(Debug, Error)]
pub enum CollectionError {
    /// The configured command line contained no program.
    #[error("collect command is empty")]
    EmptyCommand,
    /// The command could not be started.
    #[error("failed to start '{command}': {source}")]
    Spawn {
        /// Program that failed to start.
        command: String,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// Waiting on or reading from the command failed.
    #[error("I/O error while running '{command}': {source}")]
    Io {
        /// Program being run.
        command: String,
        /// Underlying IO error.
        #[source]
        source: Arc<io::Error>,
    },
    /// The command exited unsuccessfully.
    #[error("'{command}' exited with {status}: {stderr}")]
    Exit {
        /// Program that failed.
        command: String,
        /// Exit status reported by the OS.
        status: ExitStatus,
        /// Trimmed standard error output.
        stderr: String,
    },
    /// The command did not finish within the configured bound.
    #[error("'{command}' did not finish within {timeout_secs}s and was killed")]
    Timeout {
        /// Program that hung.
        command: String,
        /// Configured bound in seconds.
        timeout_secs: u64,
    },
    /// Standard output was not a JSON document.
    #[error("'{command}' produced invalid JSON: {source}")]
    Json {
        /// Program whose output failed to parse.
        command: String,
        /// Underlying parse error.
        #[source]
        source: Arc<serde_json::Error>,
    },
}

/// Result of the collect stage.
#[derive(Debug)]
pub enum Collected {
    /// Parsed JSON document.
    Sample(Value),
    /// The source could not provide data this cycle.
    NoData(CollectionError),
}

/// Seam over the external data source.
#[cfg_attr(test, mockall::automock)]
pub trait StatsSource: Send + Sync {
    /// Obtains one snapshot.
    fn collect(&self) -> Collected;
}

impl<T> StatsSource for Arc<T>
where
    T: StatsSource + ?Sized,
{
    fn collect(&self) -> Collected {
        (**self).collect()
    }
}

/// Source that runs a fixed command line and parses its standard output.
#[derive(Debug, Clone)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    /// Splits `command_line` on whitespace into program and arguments.
    pub fn from_command_line(command_line: &str, timeout: Duration) -> Result<Self, CollectionError> {
        let mut words = command_line.split_whitespace().map(str::to_owned);
        let program = words.next().ok_or(CollectionError::EmptyCommand)?;
        Ok(Self {
            program,
            args: words.collect(),
            timeout,
        })
    }

    /// Program that will be executed.
    #[must_use]
    pub fn program(&self) -> &str {
        self.program.as_str()
    }

    /// Arguments passed to the program.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn run(&self) -> Result<Value, CollectionError> {
        debug!(
            target: PIPELINE_TARGET,
            program = %self.program,
            args = ?self.args,
            "running collect command"
        );
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group so a timeout can take down helpers such as sudo's child.
            .process_group(0)
            .spawn()
            .map_err(|source| CollectionError::Spawn {
                command: self.program.clone(),
                source: Arc::new(source),
            })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        let status = self.wait_with_timeout(&mut child)?;

        let stdout = self.join_output(stdout)?;
        let stderr = self.join_output(stderr)?;
        if !status.success() {
            return Err(CollectionError::Exit {
                command: self.program.clone(),
                status,
                stderr: String::from_utf8_lossy(&stderr).trim().to_owned(),
            });
        }
        if !stderr.is_empty() {
            debug!(
                target: PIPELINE_TARGET,
                program = %self.program,
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "collect command wrote to stderr"
            );
        }
        serde_json::from_slice(&stdout).map_err(|source| CollectionError::Json {
            command: self.program.clone(),
            source: Arc::new(source),
        })
    }

    fn wait_with_timeout(&self, child: &mut Child) -> Result<ExitStatus, CollectionError> {
        let started = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if started.elapsed() >= self.timeout => {
                    warn!(
                        target: PIPELINE_TARGET,
                        program = %self.program,
                        timeout_secs = self.timeout.as_secs(),
                        "collect command timed out, killing process group"
                    );
                    self.kill(child);
                    return Err(CollectionError::Timeout {
                        command: self.program.clone(),
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    return Err(CollectionError::Io {
                        command: self.program.clone(),
                        source: Arc::new(source),
                    });
                }
            }
        }
    }

    fn kill(&self, child: &mut Child) {
        let group_killed = i32::try_from(child.id())
            .ok()
            .map(|raw| killpg(Pid::from_raw(raw), Signal::SIGKILL));
        if !matches!(group_killed, Some(Ok(()))) {
            debug!(
                target: PIPELINE_TARGET,
                program = %self.program,
                "process group kill failed; killing child directly"
            );
            drop(child.kill());
        }
        // Reader threads are left detached: a surviving grandchild may hold the pipes.
        drop(child.wait());
    }

    fn join_output(
        &self,
        reader: Option<JoinHandle<io::Result<Vec<u8>>>>,
    ) -> Result<Vec<u8>, CollectionError> {
        let Some(handle) = reader else {
            return Ok(Vec::new());
        };
        match handle.join() {
            Ok(result) => result.map_err(|source| CollectionError::Io {
                command: self.program.clone(),
                source: Arc::new(source),
            }),
            Err(_) => Err(CollectionError::Io {
                command: self.program.clone(),
                source: Arc::new(io::Error::other("output reader panicked")),
            }),
        }
    }
}

impl StatsSource for CommandSource {
    fn collect(&self) -> Collected {
        match self.run() {
            Ok(value) => Collected::Sample(value),
            Err(error) => Collected::NoData(error),
        }
    }
}

/// Reads a pipe to the end on its own thread so a chatty child cannot block.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        pipe.read_to_end(&mut buffer)?;
        Ok(buffer)
    })
}
