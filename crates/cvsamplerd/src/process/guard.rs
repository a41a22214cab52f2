use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use tracing::{info, warn};

use cvsampler_config::RuntimePaths;

use crate::health::{HealthState, StatusSink};

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::files::atomic_write;

/// Holds the singleton lock and maintains the pid and health files.
///
/// The kernel drops the `flock` on any exit path, so a crashed daemon never
/// leaves a lock behind. The lock file itself is left in place.
#[derive(Debug)]
pub(crate) struct ProcessGuard {
    paths: RuntimePaths,
    lock: Flock<File>,
    pid: Option<u32>,
}

impl ProcessGuard {
    pub(crate) fn acquire(paths: RuntimePaths) -> Result<Self, LaunchError> {
        let lock = acquire_lock(&paths)?;
        Ok(Self {
            paths,
            lock,
            pid: None,
        })
    }

    pub(crate) fn write_pid(&mut self, pid: u32) -> Result<(), LaunchError> {
        let lock_path = self.paths.lock_path().to_path_buf();
        let lock_error = |source| LaunchError::PidWrite {
            path: lock_path.clone(),
            source,
        };
        self.lock.set_len(0).map_err(lock_error)?;
        self.lock.seek(SeekFrom::Start(0)).map_err(lock_error)?;
        writeln!(*self.lock, "{pid}").map_err(lock_error)?;
        self.lock.sync_all().map_err(lock_error)?;

        let path = self.paths.pid_path();
        atomic_write(path, format!("{pid}\n").as_bytes()).map_err(|source| {
            LaunchError::PidWrite {
                path: path.to_path_buf(),
                source,
            }
        })?;
        self.pid = Some(pid);
        info!(
            target: PROCESS_TARGET,
            pid,
            file = %path.display(),
            "pid file written"
        );
        Ok(())
    }

    pub(crate) fn write_health(&self, status: HealthState, cycles: u64) -> Result<(), LaunchError> {
        let pid = self.pid.ok_or(LaunchError::MissingPid)?;
        let path = self.paths.health_path();
        let snapshot = HealthSnapshot::new(status, pid, cycles)?;
        let mut payload = serde_json::to_vec(&snapshot)?;
        payload.push(b'\n');
        atomic_write(path, &payload).map_err(|source| LaunchError::HealthWrite {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            target: PROCESS_TARGET,
            status = snapshot.status,
            cycles,
            file = %path.display(),
            "health snapshot updated"
        );
        Ok(())
    }

    pub(crate) fn paths(&self) -> &RuntimePaths {
        &self.paths
    }
}

impl StatusSink for ProcessGuard {
    fn publish(&mut self, state: HealthState, cycles: u64) {
        if let Err(error) = self.write_health(state, cycles) {
            warn!(
                target: PROCESS_TARGET,
                error = %error,
                "failed to update health snapshot"
            );
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        // Only the owner cleans up; a forked worker exits without dropping.
        if self.pid != Some(std::process::id()) {
            return;
        }
        for (path, label) in [
            (self.paths.pid_path(), "pid"),
            (self.paths.health_path(), "health"),
        ] {
            match fs::remove_file(path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => {
                    warn!(
                        target: PROCESS_TARGET,
                        file = %path.display(),
                        error = %error,
                        "failed to remove {label} file"
                    );
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthSnapshot<'a> {
    status: &'a str,
    pid: u32,
    timestamp: u64,
    cycles: u64,
}

impl HealthSnapshot<'_> {
    fn new(state: HealthState, pid: u32, cycles: u64) -> Result<Self, LaunchError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|source| LaunchError::Clock { source })?
            .as_secs();
        Ok(Self {
            status: state.as_str(),
            pid,
            timestamp,
            cycles,
        })
    }
}

fn acquire_lock(paths: &RuntimePaths) -> Result<Flock<File>, LaunchError> {
    let path = paths.lock_path();
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true).truncate(false);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options
        .open(path)
        .map_err(|source| LaunchError::LockCreate {
            path: path.to_path_buf(),
            source,
        })?;
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => {
            info!(
                target: PROCESS_TARGET,
                file = %path.display(),
                "acquired daemon lock"
            );
            Ok(lock)
        }
        Err((mut file, Errno::EWOULDBLOCK)) => {
            let pid = read_pid(&mut file);
            info!(
                target: PROCESS_TARGET,
                pid = ?pid,
                file = %path.display(),
                "refusing to start: lock held by another instance"
            );
            Err(LaunchError::AlreadyRunning {
                lock: path.to_path_buf(),
                pid,
            })
        }
        Err((_, source)) => Err(LaunchError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.read_to_string(&mut content).ok()?;
    content.trim().parse::<u32>().ok()
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    fn read_pid_file(path: &std::path::Path) -> Option<u32> {
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    struct Runtime {
        _dir: TempDir,
        paths: RuntimePaths,
    }

    #[fixture]
    fn runtime() -> Runtime {
        let dir = TempDir::new().expect("temp dir");
        let paths = RuntimePaths::in_directory(dir.path().join("run")).expect("runtime paths");
        Runtime { _dir: dir, paths }
    }

    #[rstest]
    fn second_guard_is_refused_with_holder_pid(runtime: Runtime) {
        let mut first = ProcessGuard::acquire(runtime.paths.clone()).expect("first lock");
        first.write_pid(std::process::id()).expect("pid");

        let error = ProcessGuard::acquire(runtime.paths.clone()).expect_err("contention");
        match error {
            LaunchError::AlreadyRunning { lock, pid } => {
                assert_eq!(lock, runtime.paths.lock_path());
                assert_eq!(pid, Some(std::process::id()));
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
    }

    #[rstest]
    fn lock_is_released_when_the_guard_drops(runtime: Runtime) {
        let first = ProcessGuard::acquire(runtime.paths.clone()).expect("first lock");
        drop(first);
        assert!(ProcessGuard::acquire(runtime.paths.clone()).is_ok());
    }

    #[rstest]
    fn health_requires_a_pid(runtime: Runtime) {
        let guard = ProcessGuard::acquire(runtime.paths.clone()).expect("lock");
        assert!(matches!(
            guard.write_health(HealthState::Starting, 0),
            Err(LaunchError::MissingPid)
        ));
    }

    #[rstest]
    fn health_snapshot_and_pid_file_are_cleaned_up(runtime: Runtime) {
        let mut guard = ProcessGuard::acquire(runtime.paths.clone()).expect("lock");
        guard.write_pid(std::process::id()).expect("pid");
        guard.publish(HealthState::Halted, 4);

        let raw = fs::read_to_string(runtime.paths.health_path()).expect("health file");
        let snapshot: serde_json::Value = serde_json::from_str(&raw).expect("json");
        assert_eq!(snapshot["status"], "halted");
        assert_eq!(snapshot["cycles"], 4);
        assert_eq!(
            read_pid_file(runtime.paths.pid_path()),
            Some(std::process::id())
        );

        drop(guard);
        assert!(!runtime.paths.pid_path().exists());
        assert!(!runtime.paths.health_path().exists());
        assert!(runtime.paths.lock_path().exists());
    }
}
