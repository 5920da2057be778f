//! The local synthesis daemon.
//!
//! Cold → Warming → Idle ⇄ Busy → ShuttingDown → Gone
//!
//! Requests are served one connection at a time. The accept loop also races
//! the idle timer, the parent watchdog and SIGTERM/SIGINT; whichever fires
//! first ends the loop and the daemon cleans up after itself.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::unistd::getppid;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::engine::{render_to_wav, SpeechModel};
use super::lock::{remove_pid_file_if_owned, DaemonLock};
use super::protocol::{self, DaemonRequest, DaemonResponse};
use crate::backend::{is_audio_tmp_dir, AudioClip, VoiceParams};
use crate::config::Config;
use crate::error::DaemonError;
use crate::paths::{self, RuntimePaths};

const WARMUP_TEXT: &str = "Hello.";
/// Temp audio dirs older than this are assumed abandoned.
const ORPHAN_AUDIO_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Cold,
    Warming,
    Idle,
    Busy,
    ShuttingDown,
    Gone,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cold => "cold",
            Self::Warming => "warming",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::ShuttingDown => "shutting_down",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub paths: RuntimePaths,
    /// `None` disables the idle shutdown.
    pub idle_timeout: Option<Duration>,
    /// Launched by a host: exit when this process goes away.
    /// Captured before the model loads so a host that dies mid-load is noticed.
    pub parent: Option<u32>,
    pub watchdog_interval: Duration,
    pub read_timeout: Duration,
    pub warmup: Option<VoiceParams>,
}

impl DaemonOptions {
    pub fn from_config(config: &Config, paths: RuntimePaths, managed: bool) -> Self {
        Self {
            paths,
            idle_timeout: config.daemon.idle_timeout(),
            parent: managed.then(|| getppid().as_raw() as u32),
            watchdog_interval: Duration::from_secs(2),
            read_timeout: Duration::from_secs(10),
            warmup: Some(VoiceParams {
                voice: config.voice.local_voice.clone(),
                speed: config.voice.speed,
                lang: config.voice.lang.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShutdownReason {
    Idle,
    Orphaned,
    Signal,
}

/// True once `parent` has exited and the daemon was reparented away from it.
fn parent_gone(parent: u32) -> bool {
    getppid().as_raw() as u32 != parent && !crate::process::is_alive(parent)
}

type SharedModel = Arc<Mutex<Box<dyn SpeechModel>>>;

struct Daemon {
    options: DaemonOptions,
    state: LifecycleState,
    pid: u32,
}

impl Daemon {
    fn set_state(&mut self, next: LifecycleState) {
        if self.state != next {
            debug!("Daemon: {} → {}", self.state, next);
            self.state = next;
        }
    }

    async fn warm_up(&mut self, model: &SharedModel) {
        let Some(params) = self.options.warmup.clone() else {
            return;
        };
        let model = Arc::clone(model);
        let t0 = std::time::Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
            render_to_wav(model.as_mut(), WARMUP_TEXT, &params)
        })
        .await;

        match result {
            Ok(Ok(path)) => {
                AudioClip::new(path).discard();
                info!("Warmup done in {}ms", t0.elapsed().as_millis());
            }
            Ok(Err(e)) => warn!("Warmup failed: {e}"),
            Err(e) => warn!("Warmup panicked: {e}"),
        }
    }

    async fn serve(&mut self, listener: &UnixListener, model: &SharedModel) -> Result<ShutdownReason, DaemonError> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        let idle_timeout = self.options.idle_timeout;
        let parent = self.options.parent;
        let mut watchdog = tokio::time::interval(self.options.watchdog_interval);
        let mut idle_deadline = idle_timeout.map(|d| Instant::now() + d);

        loop {
            let idle = async move {
                match idle_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        if self.handle_connection(stream, model).await {
                            idle_deadline = idle_timeout.map(|d| Instant::now() + d);
                        }
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                },
                _ = idle => {
                    info!("No requests for {:?}, shutting down", idle_timeout.unwrap_or_default());
                    return Ok(ShutdownReason::Idle);
                }
                _ = watchdog.tick(), if parent.is_some() => {
                    if let Some(pid) = parent.filter(|&pid| parent_gone(pid)) {
                        info!("Parent process {pid} exited, shutting down");
                        return Ok(ShutdownReason::Orphaned);
                    }
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    return Ok(ShutdownReason::Signal);
                }
                _ = sigint.recv() => {
                    info!("SIGINT received, shutting down");
                    return Ok(ShutdownReason::Signal);
                }
            }
        }
    }

    /// Serve one request. Returns true when it was a synthesis request.
    async fn handle_connection(&mut self, stream: UnixStream, model: &SharedModel) -> bool {
        let mut framed = protocol::framed(stream);

        let request =
            match tokio::time::timeout(self.options.read_timeout, protocol::recv_message::<_, DaemonRequest>(&mut framed))
                .await
            {
                Err(_) => {
                    warn!("Client sent nothing within {:?}", self.options.read_timeout);
                    return false;
                }
                Ok(Ok(None)) => {
                    debug!("Client closed without a request");
                    return false;
                }
                Ok(Err(e)) => {
                    let response = DaemonResponse::Error {
                        message: e.to_string(),
                    };
                    if let Err(e) = protocol::send_message(&mut framed, &response).await {
                        debug!("Failed to send error response: {e}");
                    }
                    return false;
                }
                Ok(Ok(Some(request))) => request,
            };

        let (response, served) = match request {
            DaemonRequest::Ping => (
                DaemonResponse::Pong {
                    pid: self.pid,
                    state: self.state.to_string(),
                },
                false,
            ),
            DaemonRequest::Synthesize {
                text,
                voice,
                speed,
                lang,
            } => {
                self.set_state(LifecycleState::Busy);
                let params = VoiceParams { voice, speed, lang };
                let response = synthesize(model, text, params).await;
                (response, true)
            }
        };

        if let Err(e) = protocol::send_message(&mut framed, &response).await {
            warn!("Failed to send response: {e}");
        }
        self.set_state(LifecycleState::Idle);
        served
    }
}

async fn synthesize(model: &SharedModel, text: String, params: VoiceParams) -> DaemonResponse {
    let t0 = std::time::Instant::now();
    let model = Arc::clone(model);
    let chars = text.chars().count();

    let result = tokio::task::spawn_blocking(move || {
        let mut model = model.lock().unwrap_or_else(|e| e.into_inner());
        render_to_wav(model.as_mut(), &text, &params)
    })
    .await;

    match result {
        Ok(Ok(path)) => {
            info!("Synthesized {chars} chars in {}ms", t0.elapsed().as_millis());
            DaemonResponse::Ok { audio_file: path }
        }
        Ok(Err(message)) => {
            warn!("Synthesis failed: {message}");
            DaemonResponse::Error { message }
        }
        Err(e) => {
            warn!("Synthesis panicked: {e}");
            DaemonResponse::Error {
                message: format!("synthesis panicked: {e}"),
            }
        }
    }
}

/// Remove `speak-rs-tts-*` dirs left behind by killed workers.
pub fn cleanup_orphan_audio_dirs(max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(std::env::temp_dir()) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_audio_tmp_dir(&path) || !path.is_dir() {
            continue;
        }
        let stale = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .is_some_and(|age| age >= max_age);
        if stale && std::fs::remove_dir_all(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Run the daemon until idle timeout, orphaning or a termination signal.
///
/// A second instance exits immediately with `Ok(())`, leaving the running
/// daemon's socket and PID file alone.
pub async fn run_daemon<F>(options: DaemonOptions, load_model: F) -> Result<(), DaemonError>
where
    F: FnOnce() -> Result<Box<dyn SpeechModel>, DaemonError> + Send + 'static,
{
    options.paths.ensure_data_dir()?;

    let lock = match DaemonLock::acquire(&options.paths.daemon_lock) {
        Ok(lock) => lock,
        Err(DaemonError::AlreadyRunning(path)) => {
            info!("Another daemon holds {path}, exiting");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    if options.parent.is_some_and(|pid| pid == 1 || parent_gone(pid)) {
        warn!("Parent already exited before startup, not starting");
        lock.release();
        return Ok(());
    }

    let mut daemon = Daemon {
        options,
        state: LifecycleState::Cold,
        pid: std::process::id(),
    };
    let paths = daemon.options.paths.clone();

    paths::write_pid(&paths.daemon_pid, daemon.pid)?;
    if paths.socket.exists() {
        info!("Removing stale socket {}", paths.socket.display());
        paths::remove_if_exists(&paths.socket)?;
    }
    let removed = cleanup_orphan_audio_dirs(ORPHAN_AUDIO_AGE);
    if removed > 0 {
        info!("Removed {removed} orphaned audio dir(s)");
    }

    let result = start_and_serve(&mut daemon, load_model).await;

    daemon.set_state(LifecycleState::ShuttingDown);
    if let Err(e) = paths::remove_if_exists(&paths.socket) {
        warn!("Failed to remove socket: {e}");
    }
    remove_pid_file_if_owned(&paths.daemon_pid, daemon.pid);
    lock.release();
    daemon.set_state(LifecycleState::Gone);

    match &result {
        Ok(reason) => info!("Daemon stopped ({reason:?})"),
        Err(e) => warn!("Daemon stopped: {e}"),
    }
    result.map(|_| ())
}

async fn start_and_serve<F>(daemon: &mut Daemon, load_model: F) -> Result<ShutdownReason, DaemonError>
where
    F: FnOnce() -> Result<Box<dyn SpeechModel>, DaemonError> + Send + 'static,
{
    daemon.set_state(LifecycleState::Warming);
    let model = tokio::task::spawn_blocking(load_model)
        .await
        .map_err(|e| DaemonError::ModelLoad(format!("loader panicked: {e}")))??;
    let model: SharedModel = Arc::new(Mutex::new(model));
    daemon.warm_up(&model).await;

    if let Some(pid) = daemon.options.parent.filter(|&pid| parent_gone(pid)) {
        info!("Parent process {pid} exited while loading, shutting down");
        return Ok(ShutdownReason::Orphaned);
    }

    let listener = UnixListener::bind(&daemon.options.paths.socket)?;
    daemon.set_state(LifecycleState::Idle);
    info!("Daemon listening on {}", daemon.options.paths.socket.display());

    daemon.serve(&listener, &model).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_lowercase() {
        assert_eq!(LifecycleState::ShuttingDown.to_string(), "shutting_down");
        assert_eq!(LifecycleState::Idle.to_string(), "idle");
    }

    #[test]
    fn fresh_audio_dirs_survive_cleanup() {
        let dir = crate::backend::create_audio_tmp_dir().unwrap();
        cleanup_orphan_audio_dirs(Duration::from_secs(3600));
        assert!(dir.exists());
        std::fs::remove_dir_all(dir).unwrap();
    }
}
