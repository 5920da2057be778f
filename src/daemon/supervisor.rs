//! Host-side ownership of a managed daemon process.
//!
//! The host starts `speak-rs daemon --managed` when local synthesis may be
//! needed and starts it again after it idle-exits. On host exit the daemon is
//! asked to stop with SIGTERM, escalating to SIGKILL.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::client::DaemonClient;
use crate::paths::{self, RuntimePaths};
use crate::process::shutdown_child;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct DaemonSupervisor {
    exe: PathBuf,
    config_path: Option<PathBuf>,
    paths: RuntimePaths,
    client: DaemonClient,
    child: Mutex<Option<Child>>,
}

impl DaemonSupervisor {
    pub fn new(config_path: Option<PathBuf>, paths: RuntimePaths, connect_timeout: Duration) -> std::io::Result<Self> {
        Ok(Self::with_exe(std::env::current_exe()?, config_path, paths, connect_timeout))
    }

    pub fn with_exe(exe: PathBuf, config_path: Option<PathBuf>, paths: RuntimePaths, connect_timeout: Duration) -> Self {
        let client = DaemonClient::new(paths.socket.clone(), connect_timeout, Duration::from_secs(2));
        Self {
            exe,
            config_path,
            paths,
            client,
            child: Mutex::new(None),
        }
    }

    /// Make sure a daemon is running or starting. Never waits for warmup.
    pub async fn ensure_running(&self) {
        let mut child = self.child.lock().await;

        if let Some(running) = child.as_mut() {
            match running.try_wait() {
                Ok(None) => return,
                Ok(Some(status)) => {
                    info!("Managed daemon exited ({status})");
                    *child = None;
                }
                Err(e) => {
                    warn!("Failed to poll managed daemon: {e}");
                    return;
                }
            }
        }

        if let Ok((pid, state)) = self.client.ping().await {
            debug!("Daemon {pid} already running ({state})");
            return;
        }

        match self.spawn() {
            Ok(spawned) => {
                info!("Started managed daemon (pid {:?})", spawned.id());
                *child = Some(spawned);
            }
            Err(e) => warn!("Failed to start daemon: {e}"),
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.exe);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("daemon")
            .arg("--managed")
            .arg("--log-file")
            .arg(&self.paths.daemon_log)
            .env(paths::DATA_DIR_ENV, &self.paths.data_dir)
            .env(paths::SOCKET_ENV, &self.paths.socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd.spawn()
    }

    /// Stop the managed daemon, if this host started one.
    pub async fn shutdown(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        match shutdown_child(&mut child, SHUTDOWN_GRACE).await {
            Ok(status) => info!("Managed daemon stopped ({status})"),
            Err(e) => warn!("Failed to stop managed daemon: {e}"),
        }
    }

    pub async fn is_managing(&self) -> bool {
        self.child.lock().await.is_some()
    }
}
