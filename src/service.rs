//! The long-running host: triggers in, playback events out.
//!
//! Owns the config, the orchestrator, the daemon supervisor and the
//! notifier. Every trigger source (hotkey, SIGUSR1/SIGUSR2, config edits)
//! feeds one channel, so the orchestrator is only driven from this loop.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{BackendMode, Config};
use crate::daemon::DaemonSupervisor;
use crate::hotkey::HotkeyMonitor;
use crate::notifier::Notifier;
use crate::paths::{self, RuntimePaths};
use crate::playback::{
    OrchestratorConfig, PlaybackEvent, PlaybackOrchestrator, ResumePolicy, SharedVoice, WorkerLauncher,
};
use crate::selection::SelectionReader;
use crate::watcher::ConfigWatcher;

const CONFIG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Inputs that drive the orchestrator.
#[derive(Debug)]
pub enum Trigger {
    Toggle,
    Respeak,
    SettingsChanged(Box<Config>),
}

pub struct AppRuntime {
    config: Config,
    config_path: Option<PathBuf>,
    paths: RuntimePaths,
    voice: SharedVoice,
    orchestrator: PlaybackOrchestrator,
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
    supervisor: Option<Arc<DaemonSupervisor>>,
    notifier: Notifier,
}

impl AppRuntime {
    /// Must be called from within the tokio runtime.
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        paths: RuntimePaths,
        verbose: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        paths.ensure_data_dir()?;

        let voice: SharedVoice = Arc::new(RwLock::new(config.voice.clone()));
        let launcher = WorkerLauncher::new(config_path.clone(), paths.clone(), verbose)?;
        let selection = SelectionReader::new(config.playback.use_primary_selection);

        let (orchestrator, events) = PlaybackOrchestrator::new(
            Arc::new(launcher),
            Arc::new(selection),
            Arc::clone(&voice),
            OrchestratorConfig {
                respeak_debounce: Duration::from_millis(config.playback.respeak_debounce_ms),
                resume_policy: ResumePolicy::default(),
                text_snapshot: paths.text_snapshot.clone(),
                playback_status: paths.playback_status.clone(),
            },
        );

        let supervisor = if config.daemon.autostart {
            Some(Arc::new(DaemonSupervisor::new(
                config_path.clone(),
                paths.clone(),
                config.daemon.connect_timeout(),
            )?))
        } else {
            None
        };

        let notifier = Notifier::new(config.feedback.notifications);

        Ok(Self {
            config,
            config_path,
            paths,
            voice,
            orchestrator,
            events,
            supervisor,
            notifier,
        })
    }

    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error>> {
        paths::write_pid(&self.paths.host_pid, std::process::id())?;

        let (trigger_tx, mut trigger_rx) = mpsc::channel::<Trigger>(32);
        let cancel = CancellationToken::new();

        if self.config.hotkey.enabled {
            let monitor = HotkeyMonitor::new(&self.config.hotkey, trigger_tx.clone());
            tokio::spawn(monitor.run());
        }

        spawn_signal_trigger(SignalKind::user_defined1(), || Trigger::Toggle, trigger_tx.clone())?;
        spawn_signal_trigger(SignalKind::user_defined2(), || Trigger::Respeak, trigger_tx.clone())?;

        if let Some(path) = Config::resolve_path(self.config_path.as_deref()) {
            let watcher = ConfigWatcher::new(path, CONFIG_POLL_INTERVAL, cancel.clone());
            tokio::spawn(watcher.run(trigger_tx.clone()));
        }
        drop(trigger_tx);

        self.prewarm_daemon();

        let mut sigterm = signal(SignalKind::terminate())?;
        info!(
            "speak-rs ready (pid {}), press the hotkey or run `speak-rs toggle`",
            std::process::id()
        );

        loop {
            tokio::select! {
                Some(trigger) = trigger_rx.recv() => self.on_trigger(trigger),
                Some(event) = self.events.recv() => self.on_event(event),
                _ = sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    break;
                }
            }
        }

        cancel.cancel();
        self.orchestrator.shutdown().await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
        crate::daemon::lock::remove_pid_file_if_owned(&self.paths.host_pid, std::process::id());
        Ok(())
    }

    fn on_trigger(&mut self, trigger: Trigger) {
        debug!("Trigger: {trigger:?}");
        match trigger {
            Trigger::Toggle => self.orchestrator.toggle(),
            Trigger::Respeak => self.orchestrator.request_respeak(),
            Trigger::SettingsChanged(config) => {
                if self.apply_settings(*config) {
                    self.orchestrator.request_respeak();
                }
            }
        }
    }

    /// Adopt a reloaded config. Returns true when the voice settings changed.
    fn apply_settings(&mut self, config: Config) -> bool {
        let mut voice = self.voice.write().unwrap_or_else(|e| e.into_inner());
        let voice_changed = *voice != config.voice;
        if voice_changed {
            info!(
                "Voice settings: backend={} local_voice={} cloud_voice={} speed={:.2}",
                config.voice.backend, config.voice.local_voice, config.voice.cloud_voice, config.voice.speed
            );
            *voice = config.voice.clone();
        }
        drop(voice);
        self.notifier = Notifier::new(config.feedback.notifications);
        self.config = config;
        voice_changed
    }

    fn on_event(&mut self, event: PlaybackEvent) {
        match &event {
            PlaybackEvent::SpeakingStarted { generation } => {
                info!("Speaking started (generation {generation})");
                self.prewarm_daemon();
            }
            PlaybackEvent::SpeakingStopped { generation, outcome } => {
                info!("Speaking stopped (generation {generation}, {outcome:?})");
            }
        }
        self.notifier.on_event(&event);
    }

    /// Start the daemon (again) when local synthesis may be needed.
    fn prewarm_daemon(&self) {
        let Some(supervisor) = &self.supervisor else {
            return;
        };
        if self.config.voice.backend == BackendMode::Cloud || !self.config.local.is_installed() {
            return;
        }
        let supervisor = Arc::clone(supervisor);
        tokio::spawn(async move { supervisor.ensure_running().await });
    }
}

fn spawn_signal_trigger(kind: SignalKind, trigger: fn() -> Trigger, tx: mpsc::Sender<Trigger>) -> std::io::Result<()> {
    let mut stream = signal(kind)?;
    tokio::spawn(async move {
        while stream.recv().await.is_some() {
            if tx.send(trigger()).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

/// Send a control signal to the running host. Used by `toggle`/`respeak`.
pub fn signal_host(paths: &RuntimePaths, sig: nix::sys::signal::Signal) -> Result<u32, String> {
    let pid = paths::read_pid(&paths.host_pid)
        .ok_or_else(|| format!("no running host ({} missing)", paths.host_pid.display()))?;
    if !crate::process::is_alive(pid) {
        return Err(format!("host pid {pid} is not running"));
    }
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig)
        .map_err(|e| format!("failed to signal pid {pid}: {e}"))?;
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.daemon.autostart = false;
        config.feedback.notifications = false;
        config.hotkey.enabled = false;
        config
    }

    #[tokio::test]
    async fn only_voice_edits_count_as_voice_changes() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::in_dir(dir.path());
        let mut runtime = AppRuntime::new(quiet_config(), None, paths, false).unwrap();

        let mut unrelated = quiet_config();
        unrelated.daemon.request_timeout_secs = 5;
        unrelated.playback.respeak_debounce_ms = 200;
        assert!(!runtime.apply_settings(unrelated));

        let mut faster = quiet_config();
        faster.voice.speed = 1.4;
        assert!(runtime.apply_settings(faster));
        assert!((runtime.voice.read().unwrap().speed - 1.4).abs() < f32::EPSILON);

        let mut same_voice = quiet_config();
        same_voice.voice.speed = 1.4;
        same_voice.feedback.notifications = true;
        assert!(!runtime.apply_settings(same_voice));
    }

    #[tokio::test]
    async fn unrelated_reload_does_not_restart_speech() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::in_dir(dir.path());
        let mut runtime = AppRuntime::new(quiet_config(), None, paths, false).unwrap();

        let mut unrelated = quiet_config();
        unrelated.daemon.connect_timeout_ms = 900;
        runtime.on_trigger(Trigger::SettingsChanged(Box::new(unrelated)));
        assert_eq!(runtime.config.daemon.connect_timeout_ms, 900);
        assert_eq!(runtime.orchestrator.generation(), 0);
    }

    #[test]
    fn signalling_without_host_fails() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RuntimePaths::in_dir(dir.path());
        let err = signal_host(&paths, nix::sys::signal::Signal::SIGUSR1).unwrap_err();
        assert!(err.contains("no running host"));
    }
}
