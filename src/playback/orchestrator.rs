//! Playback orchestration with a generation-guarded state machine.
//!
//! IDLE ⇄ SPEAKING
//!
//! All shared state (generation, process handle, state) sits behind one mutex
//! and is only touched while holding it. Slow work (reading the selection,
//! spawning and waiting on the worker, killing process trees) happens on
//! background tasks. A completion only mutates state when its generation is
//! still current, so a slow-dying old session can never clobber a newer one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::debounce::DebounceTimer;
use super::position::{compute_resume_text, ResumePolicy};
use super::session::{
    PlaybackEvent, ProcessHandle, SessionCompletion, SessionLauncher, SessionOutcome,
    SessionRequest, SessionState,
};
use super::status;
use crate::config::VoiceConfig;
use crate::error::FailureKind;
use crate::process;

/// Voice settings shared with whatever applies settings changes.
pub type SharedVoice = Arc<RwLock<VoiceConfig>>;

/// Supplies the text to speak when a session starts from a toggle.
pub trait TextSource: Send + Sync {
    fn current_text(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub respeak_debounce: Duration,
    pub resume_policy: ResumePolicy,
    pub text_snapshot: PathBuf,
    pub playback_status: PathBuf,
}

struct Shared {
    generation: u64,
    process: Option<ProcessHandle>,
    state: SessionState,
    /// Generation whose text is in the snapshot file.
    snapshot_generation: Option<u64>,
}

struct Inner {
    shared: Mutex<Shared>,
    launcher: Arc<dyn SessionLauncher>,
    text_source: Arc<dyn TextSource>,
    voice: SharedVoice,
    config: OrchestratorConfig,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    completions: mpsc::UnboundedSender<SessionCompletion>,
    runtime: Handle,
    respeak_timer: DebounceTimer,
}

/// Owns the single active speak session.
pub struct PlaybackOrchestrator {
    inner: Arc<Inner>,
}

impl PlaybackOrchestrator {
    /// Build an orchestrator on the current tokio runtime.
    ///
    /// Returns the receiver for "speaking started/stopped" notifications.
    pub fn new(
        launcher: Arc<dyn SessionLauncher>,
        text_source: Arc<dyn TextSource>,
        voice: SharedVoice,
        config: OrchestratorConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let runtime = Handle::current();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                generation: 0,
                process: None,
                state: SessionState::Stopped,
                snapshot_generation: None,
            }),
            launcher,
            text_source,
            voice,
            respeak_timer: DebounceTimer::new(config.respeak_debounce, runtime.clone()),
            config,
            events: events_tx,
            completions: completions_tx,
            runtime: runtime.clone(),
        });

        runtime.spawn(completion_loop(Arc::downgrade(&inner), completions_rx));

        (Self { inner }, events_rx)
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub fn is_speaking(&self) -> bool {
        self.state() == SessionState::Speaking
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Hotkey semantics: start if idle, stop if speaking. Returns immediately.
    pub fn toggle(&self) {
        let mut shared = self.inner.lock();
        match shared.state {
            SessionState::Speaking => {
                let handle = self.inner.stop_locked(&mut shared);
                drop(shared);
                self.inner.respeak_timer.cancel();
                self.inner.spawn_terminate(handle);
            }
            SessionState::Stopped => {
                let generation = self.inner.begin_locked(&mut shared);
                drop(shared);
                let inner = Arc::clone(&self.inner);
                self.inner.runtime.spawn(async move {
                    inner.run_session(generation, None).await;
                });
            }
        }
    }

    /// Stop the active session, if any. Idempotent.
    pub fn stop(&self) {
        self.inner.respeak_timer.cancel();
        let handle = {
            let mut shared = self.inner.lock();
            if shared.state == SessionState::Stopped && shared.process.is_none() {
                return;
            }
            self.inner.stop_locked(&mut shared)
        };
        self.inner.spawn_terminate(handle);
    }

    /// Stop and wait until the session's process tree is gone.
    pub async fn shutdown(&self) {
        self.inner.respeak_timer.cancel();
        let handle = {
            let mut shared = self.inner.lock();
            if shared.state == SessionState::Stopped && shared.process.is_none() {
                return;
            }
            self.inner.stop_locked(&mut shared)
        };
        if let Some(handle) = handle {
            if let Err(e) = process::terminate_tree(handle.pid).await {
                warn!("Failed to terminate session process {}: {e}", handle.pid);
            }
        }
    }

    /// Settings changed while speaking: restart from the resume point.
    ///
    /// No-op when idle. Bursts coalesce into one restart fired after the
    /// debounce window, using the resume text computed by the last call.
    pub fn request_respeak(&self) {
        if self.inner.lock().state != SessionState::Speaking {
            debug!("Respeak requested while idle, ignoring");
            return;
        }

        let resume_text = self.inner.resume_text();
        let inner = Arc::clone(&self.inner);
        self.inner.respeak_timer.schedule(move || async move {
            inner.restart(resume_text).await;
        });
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PlaybackEvent) {
        // Receiver may be gone during shutdown.
        let _ = self.events.send(event);
    }

    /// Idle → Speaking. Returns the new generation.
    fn begin_locked(&self, shared: &mut Shared) -> u64 {
        shared.generation += 1;
        shared.state = SessionState::Speaking;
        info!("State: STOPPED → SPEAKING (generation {})", shared.generation);
        self.emit(PlaybackEvent::SpeakingStarted {
            generation: shared.generation,
        });
        shared.generation
    }

    /// Speaking → Stopped. Invalidates in-flight completions and hands back
    /// the process handle for termination outside the lock.
    fn stop_locked(&self, shared: &mut Shared) -> Option<ProcessHandle> {
        let stopped_generation = shared.generation;
        shared.generation += 1;
        let handle = shared.process.take();
        if shared.state == SessionState::Speaking {
            shared.state = SessionState::Stopped;
            info!("State: SPEAKING → STOPPED (generation {stopped_generation})");
            self.emit(PlaybackEvent::SpeakingStopped {
                generation: stopped_generation,
                outcome: SessionOutcome::Stopped,
            });
        }
        handle
    }

    fn spawn_terminate(&self, handle: Option<ProcessHandle>) {
        let Some(handle) = handle else {
            return;
        };
        self.runtime.spawn(async move {
            if let Err(e) = process::terminate_tree(handle.pid).await {
                warn!("Failed to terminate session process {}: {e}", handle.pid);
            }
        });
    }

    fn complete(&self, generation: u64, outcome: SessionOutcome) {
        let _ = self.completions.send(SessionCompletion {
            generation,
            outcome,
        });
    }

    /// The single place where completions may mutate shared state.
    fn on_completion(&self, completion: SessionCompletion) {
        let mut shared = self.lock();
        if completion.generation != shared.generation {
            debug!(
                "Ignoring stale completion for generation {} (current {})",
                completion.generation, shared.generation
            );
            return;
        }
        shared.process = None;
        if shared.state == SessionState::Speaking {
            shared.state = SessionState::Stopped;
            info!(
                "State: SPEAKING → STOPPED (generation {}, {:?})",
                completion.generation, completion.outcome
            );
            self.emit(PlaybackEvent::SpeakingStopped {
                generation: completion.generation,
                outcome: completion.outcome,
            });
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Resume text from the current snapshot and status record.
    /// `None` until the current session has written its snapshot; the file
    /// may still hold an earlier session's text.
    fn resume_text(&self) -> Option<String> {
        {
            let shared = self.lock();
            if shared.snapshot_generation != Some(shared.generation) {
                debug!("No snapshot for generation {} yet", shared.generation);
                return None;
            }
        }
        let full_text = status::read_snapshot(&self.config.text_snapshot)?;
        let playback = status::read_status(&self.config.playback_status);
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        let text = compute_resume_text(&full_text, playback.as_ref(), now, &self.config.resume_policy);
        debug!(
            "Resume point: {} of {} chars remain",
            text.chars().count(),
            full_text.chars().count()
        );
        Some(text)
    }

    /// Replace the running session with one speaking `text`.
    async fn restart(self: Arc<Self>, text: Option<String>) {
        let (generation, old) = {
            let mut shared = self.lock();
            if shared.state != SessionState::Speaking {
                debug!("Respeak fired after stop, ignoring");
                return;
            }
            let previous = shared.generation;
            shared.generation += 1;
            // Resuming the same utterance: the snapshot on disk still describes it.
            if text.is_some() && shared.snapshot_generation == Some(previous) {
                shared.snapshot_generation = Some(shared.generation);
            }
            (shared.generation, shared.process.take())
        };
        info!("Respeak: restarting as generation {generation}");

        if let Some(handle) = old {
            if let Err(e) = process::terminate_tree(handle.pid).await {
                warn!("Failed to terminate session process {}: {e}", handle.pid);
            }
        }
        self.run_session(generation, text).await;
    }

    /// Acquire text, persist the snapshot, spawn the worker and await it.
    async fn run_session(self: Arc<Self>, generation: u64, text: Option<String>) {
        let text = match text {
            Some(text) => Some(text),
            None => {
                let source = Arc::clone(&self.text_source);
                tokio::task::spawn_blocking(move || source.current_text())
                    .await
                    .unwrap_or_else(|e| {
                        warn!("Selection reader panicked: {e}");
                        None
                    })
            }
        };
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            info!("Nothing to speak");
            self.complete(generation, SessionOutcome::Failed(FailureKind::NoText));
            return;
        };

        // Only the current session writes the shared files.
        if !self.is_current(generation) {
            debug!("Generation {generation} superseded before launch");
            return;
        }
        if let Err(e) = status::write_snapshot(&self.config.text_snapshot, &text)
            .and_then(|()| status::clear_status(&self.config.playback_status))
        {
            warn!("Failed to persist session files: {e}");
            self.complete(generation, SessionOutcome::Failed(FailureKind::Spawn));
            return;
        }
        {
            let mut shared = self.lock();
            if shared.generation == generation {
                shared.snapshot_generation = Some(generation);
            }
        }

        let voice = self.voice.read().unwrap_or_else(|e| e.into_inner()).clone();
        let request = SessionRequest {
            generation,
            voice,
            text_file: self.config.text_snapshot.clone(),
            status_file: self.config.playback_status.clone(),
        };

        let mut child = match self.launcher.launch(&request) {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn speak worker: {e}");
                self.complete(generation, SessionOutcome::Failed(FailureKind::Spawn));
                return;
            }
        };
        let pid = child.id();
        debug!("Generation {generation} worker pid {pid:?}");

        let superseded = {
            let mut shared = self.lock();
            if shared.generation == generation {
                shared.process = pid.map(|pid| ProcessHandle { pid });
                false
            } else {
                true
            }
        };
        if superseded {
            debug!("Generation {generation} superseded during spawn, terminating");
            if let Some(pid) = pid {
                if let Err(e) = process::terminate_tree(pid).await {
                    warn!("Failed to terminate superseded worker {pid}: {e}");
                }
            }
        }

        let outcome = match child.wait().await {
            Ok(status) => SessionOutcome::from_exit_status(status),
            Err(e) => {
                warn!("Failed to wait on speak worker: {e}");
                SessionOutcome::Failed(FailureKind::Spawn)
            }
        };
        self.complete(generation, outcome);
    }
}

async fn completion_loop(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<SessionCompletion>) {
    while let Some(completion) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_completion(completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tokio::process::{Child, Command};

    struct SleepLauncher;

    impl SessionLauncher for SleepLauncher {
        fn launch(&self, _request: &SessionRequest) -> io::Result<Child> {
            Command::new("sleep").arg("30").spawn()
        }
    }

    struct FixedText(&'static str);

    impl TextSource for FixedText {
        fn current_text(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn orchestrator(dir: &std::path::Path) -> (PlaybackOrchestrator, mpsc::UnboundedReceiver<PlaybackEvent>) {
        PlaybackOrchestrator::new(
            Arc::new(SleepLauncher),
            Arc::new(FixedText("hello")),
            Arc::new(RwLock::new(VoiceConfig::default())),
            OrchestratorConfig {
                respeak_debounce: Duration::from_millis(50),
                resume_policy: ResumePolicy::default(),
                text_snapshot: dir.join("current_text.txt"),
                playback_status: dir.join("playback_status"),
            },
        )
    }

    #[tokio::test]
    async fn initial_state_is_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _rx) = orchestrator(dir.path());
        assert_eq!(orch.state(), SessionState::Stopped);
        assert_eq!(orch.generation(), 0);
    }

    #[tokio::test]
    async fn stop_when_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, mut rx) = orchestrator(dir.path());
        orch.stop();
        orch.stop();
        assert_eq!(orch.generation(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn respeak_when_idle_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _rx) = orchestrator(dir.path());
        orch.request_respeak();
        assert!(!orch.inner.respeak_timer.is_pending());
    }

    #[tokio::test]
    async fn stale_completion_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _rx) = orchestrator(dir.path());
        orch.toggle();
        let g1 = orch.generation();
        orch.stop();
        orch.toggle();
        let g2 = orch.generation();
        assert!(g2 > g1);

        orch.inner.on_completion(SessionCompletion {
            generation: g1,
            outcome: SessionOutcome::Finished,
        });
        assert_eq!(orch.state(), SessionState::Speaking);

        orch.shutdown().await;
        assert_eq!(orch.state(), SessionState::Stopped);
    }
}
