//! The `speak` worker: one session's synthesis and playback, in its own process.
//!
//! Reads the text snapshot, routes synthesis, records when playback begins,
//! plays, and cleans up the audio. The exit code carries the failure class
//! back to the orchestrator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::player::{PlayOutcome, Player};
use super::session::TERMINATED_EXIT_CODE;
use super::status::{self, PlaybackStatus};
use crate::backend::cloud::ElevenLabsClient;
use crate::backend::router::Router;
use crate::backend::{CloudSynth, LocalSynth};
use crate::config::{Config, VoiceConfig};
use crate::daemon::{DaemonClient, OneShotSynth};
use crate::error::{FailureKind, SpeakError};
use crate::paths::RuntimePaths;

/// Build the router for the current credential and install state.
pub fn build_router(config: &Config, config_path: Option<PathBuf>, paths: &RuntimePaths, voice: &VoiceConfig) -> Router {
    let cloud: Option<Arc<dyn CloudSynth>> = match ElevenLabsClient::from_config(&config.cloud) {
        Some(Ok(client)) => Some(Arc::new(client)),
        Some(Err(e)) => {
            warn!("Cloud backend unavailable: {e}");
            None
        }
        None => None,
    };

    let local: Option<Arc<dyn LocalSynth>> = config.local.is_installed().then(|| {
        let mut client = DaemonClient::new(
            paths.socket.clone(),
            config.daemon.connect_timeout(),
            config.daemon.request_timeout(),
        );
        match OneShotSynth::new(config_path) {
            Ok(one_shot) => client = client.with_fallback(Arc::new(one_shot)),
            Err(e) => warn!("One-shot synthesis unavailable: {e}"),
        }
        Arc::new(client) as Arc<dyn LocalSynth>
    });

    Router::new(voice.backend, cloud, local)
}

/// Synthesize and play `text`, stopping early when `cancel` fires.
pub async fn speak_text(
    text: &str,
    voice: &VoiceConfig,
    router: &Router,
    player: &Player,
    status_file: &Path,
    cancel: &CancellationToken,
) -> Result<PlayOutcome, SpeakError> {
    if text.trim().is_empty() {
        return Err(SpeakError::new(FailureKind::NoText, "snapshot is empty"));
    }

    let routed = tokio::select! {
        routed = router.synthesize(text, voice) => routed?,
        _ = cancel.cancelled() => return Ok(PlayOutcome::Interrupted),
    };
    info!("Audio ready from {} backend", routed.backend);
    let clip = routed.clip;

    let playback = async {
        let duration = clip.duration_secs()?;
        status::write_status(status_file, &PlaybackStatus::starting_now(duration))
            .map_err(|e| SpeakError::spawn(format!("failed to write playback status: {e}")))?;
        info!("Playing {duration:.1}s of audio");
        player.play(&clip.path).await
    };

    let outcome = tokio::select! {
        outcome = playback => outcome,
        _ = cancel.cancelled() => Ok(PlayOutcome::Interrupted),
    };
    clip.discard();
    outcome
}

/// Entry point of `speak-rs speak`. Returns the process exit code.
pub async fn run_worker(
    config: &Config,
    config_path: Option<PathBuf>,
    paths: &RuntimePaths,
    voice: &VoiceConfig,
    text_file: &Path,
    status_file: &Path,
) -> i32 {
    let cancel = CancellationToken::new();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sigterm.recv().await;
                cancel.cancel();
            });
        }
        Err(e) => warn!("Failed to install SIGTERM handler: {e}"),
    }

    let text = status::read_snapshot(text_file).unwrap_or_default();
    let router = build_router(config, config_path, paths, voice);
    let player = Player::from_config(&config.playback);

    match speak_text(&text, voice, &router, &player, status_file, &cancel).await {
        Ok(PlayOutcome::Completed) => 0,
        Ok(PlayOutcome::Interrupted) => TERMINATED_EXIT_CODE,
        Err(e) => {
            warn!("{}", e.user_message());
            e.kind.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{write_wav, AudioClip, VoiceParams};
    use crate::config::BackendMode;
    use async_trait::async_trait;

    struct WavLocal;

    #[async_trait]
    impl LocalSynth for WavLocal {
        async fn synthesize(&self, _text: &str, _params: &VoiceParams) -> Result<AudioClip, SpeakError> {
            let dir = crate::backend::create_audio_tmp_dir().unwrap();
            let path = dir.join("speech.wav");
            write_wav(&path, &vec![0.0; 48_000], 24_000).unwrap();
            Ok(AudioClip::new(path))
        }
    }

    fn local_voice() -> VoiceConfig {
        VoiceConfig {
            backend: BackendMode::Local,
            ..VoiceConfig::default()
        }
    }

    #[tokio::test]
    async fn completed_session_writes_status() {
        let dir = tempfile::tempdir().unwrap();
        let status_file = dir.path().join("playback_status");
        let router = Router::new(BackendMode::Local, None, Some(Arc::new(WavLocal)));
        let player = Player::External(vec!["true".into()]);

        let outcome = speak_text(
            "Hello.",
            &local_voice(),
            &router,
            &player,
            &status_file,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(outcome, PlayOutcome::Completed);
        let status = status::read_status(&status_file).unwrap();
        assert!((status.estimated_duration_secs - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn empty_text_is_no_text() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new(BackendMode::Local, None, Some(Arc::new(WavLocal)));
        let err = speak_text(
            "  \n",
            &local_voice(),
            &router,
            &Player::InProcess,
            &dir.path().join("s"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, FailureKind::NoText);
    }

    #[tokio::test]
    async fn cancel_interrupts_playback() {
        let dir = tempfile::tempdir().unwrap();
        let router = Router::new(BackendMode::Local, None, Some(Arc::new(WavLocal)));
        let player = Player::External(vec!["sh".into(), "-c".into(), "sleep 30".into()]);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let outcome = speak_text(
            "Hello.",
            &local_voice(),
            &router,
            &player,
            &dir.path().join("playback_status"),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(outcome, PlayOutcome::Interrupted);
    }
}
