//! One utterance in flight: generation ids, outcomes, and the worker launcher.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

use crate::config::VoiceConfig;
use crate::error::FailureKind;
use crate::paths::RuntimePaths;

/// Exit code a worker uses after cleaning up on SIGTERM (128 + 15).
pub const TERMINATED_EXIT_CODE: i32 = 143;

/// Externally observable session state. There is no Starting/Stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Speaking,
    Stopped,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Speaking => write!(f, "SPEAKING"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Playback ran to completion.
    Finished,
    /// Stopped by the user, superseded, or killed by a signal.
    Stopped,
    /// Classified failure below the orchestrator.
    Failed(FailureKind),
}

impl SessionOutcome {
    pub fn from_exit_status(status: ExitStatus) -> Self {
        if status.success() {
            return Self::Finished;
        }
        match status.code() {
            Some(TERMINATED_EXIT_CODE) => Self::Stopped,
            Some(code) => Self::Failed(FailureKind::from_exit_code(code)),
            // Terminated by a signal.
            None => Self::Stopped,
        }
    }
}

/// Typed completion delivered on the orchestrator's single completion channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionCompletion {
    pub generation: u64,
    pub outcome: SessionOutcome,
}

/// Notifications for whatever drives a visual indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    SpeakingStarted { generation: u64 },
    SpeakingStopped { generation: u64, outcome: SessionOutcome },
}

/// Handle to the running worker process. The owning waiter task reaps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Everything a launcher needs to start one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub generation: u64,
    pub voice: VoiceConfig,
    pub text_file: PathBuf,
    pub status_file: PathBuf,
}

/// Spawns the synthesis+playback process for a session.
pub trait SessionLauncher: Send + Sync {
    fn launch(&self, request: &SessionRequest) -> io::Result<Child>;
}

/// Production launcher: re-executes this binary as a `speak` worker.
pub struct WorkerLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    paths: RuntimePaths,
    verbose: bool,
}

impl WorkerLauncher {
    pub fn new(config_path: Option<PathBuf>, paths: RuntimePaths, verbose: bool) -> io::Result<Self> {
        Ok(Self::with_exe(std::env::current_exe()?, config_path, paths, verbose))
    }

    pub fn with_exe(exe: PathBuf, config_path: Option<PathBuf>, paths: RuntimePaths, verbose: bool) -> Self {
        Self {
            exe,
            config_path,
            paths,
            verbose,
        }
    }
}

impl SessionLauncher for WorkerLauncher {
    fn launch(&self, request: &SessionRequest) -> io::Result<Child> {
        let mut cmd = Command::new(&self.exe);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        if self.verbose {
            cmd.arg("--verbose");
        }
        cmd.arg("speak")
            .arg("--backend")
            .arg(request.voice.backend.to_string())
            .arg("--local-voice")
            .arg(&request.voice.local_voice)
            .arg("--cloud-voice")
            .arg(&request.voice.cloud_voice)
            .arg("--speed")
            .arg(format!("{:.2}", request.voice.speed))
            .arg("--lang")
            .arg(&request.voice.lang)
            .arg("--text-file")
            .arg(&request.text_file)
            .arg("--status-file")
            .arg(&request.status_file)
            .env(crate::paths::DATA_DIR_ENV, &self.paths.data_dir)
            .env(crate::paths::SOCKET_ENV, &self.paths.socket)
            .stdin(Stdio::null())
            // A worker must not outlive the host, even one not yet tracked.
            .kill_on_drop(true);
        cmd.spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outcome_from_exit_status() {
        let ok = Command::new("true").status().await.unwrap();
        assert_eq!(SessionOutcome::from_exit_status(ok), SessionOutcome::Finished);

        let quota = Command::new("sh")
            .arg("-c")
            .arg(format!("exit {}", FailureKind::Quota.exit_code()))
            .status()
            .await
            .unwrap();
        assert_eq!(
            SessionOutcome::from_exit_status(quota),
            SessionOutcome::Failed(FailureKind::Quota)
        );

        let killed = Command::new("sh").arg("-c").arg("kill -TERM $$").status().await.unwrap();
        assert_eq!(SessionOutcome::from_exit_status(killed), SessionOutcome::Stopped);

        let cleaned_up = Command::new("sh").arg("-c").arg("exit 143").status().await.unwrap();
        assert_eq!(SessionOutcome::from_exit_status(cleaned_up), SessionOutcome::Stopped);
    }

    #[tokio::test]
    async fn dropped_worker_is_killed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-worker");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let paths = RuntimePaths::in_dir(dir.path());
        let launcher = WorkerLauncher::with_exe(script, None, paths.clone(), false);
        let child = launcher
            .launch(&SessionRequest {
                generation: 1,
                voice: VoiceConfig::default(),
                text_file: paths.text_snapshot.clone(),
                status_file: paths.playback_status.clone(),
            })
            .unwrap();
        let pid = child.id().unwrap();
        assert!(crate::process::is_alive(pid));

        drop(child);
        for _ in 0..200 {
            if !crate::process::is_alive(pid) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("worker {pid} survived its handle");
    }
}
