//! Audio playback: in-process through rodio, or through an external command.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use rodio::buffer::SamplesBuffer;
use rodio::{OutputStreamBuilder, Sink};
use tokio::process::Command;
use tracing::debug;

use crate::config::PlaybackConfig;
use crate::error::SpeakError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    Completed,
    /// The player was killed before reaching the end.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Player {
    InProcess,
    /// Program and leading args; the WAV path is appended.
    External(Vec<String>),
}

impl Player {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        if config.player.is_empty() {
            Self::InProcess
        } else {
            Self::External(config.player.clone())
        }
    }

    /// Play `path` to the end.
    pub async fn play(&self, path: &Path) -> Result<PlayOutcome, SpeakError> {
        match self {
            Self::InProcess => {
                let path = path.to_path_buf();
                tokio::task::spawn_blocking(move || play_with_rodio(&path))
                    .await
                    .map_err(|e| SpeakError::spawn(format!("playback thread failed: {e}")))??;
                Ok(PlayOutcome::Completed)
            }
            Self::External(command) => play_with_command(command, path).await,
        }
    }
}

fn play_with_rodio(path: &PathBuf) -> Result<(), SpeakError> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| SpeakError::synthesis(format!("unreadable audio {}: {e}", path.display())))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>(),
    }
    .map_err(|e| SpeakError::synthesis(format!("corrupt audio: {e}")))?;

    // rodio 0.21: OutputStream is the handle, Sink::connect_new takes &Mixer
    let stream = OutputStreamBuilder::open_default_stream()
        .map_err(|e| SpeakError::spawn(format!("failed to open audio output: {e}")))?;
    let sink = Sink::connect_new(stream.mixer());
    sink.append(SamplesBuffer::new(spec.channels, spec.sample_rate, samples));

    debug!("Playing {} in-process", path.display());
    sink.sleep_until_end();
    Ok(())
}

async fn play_with_command(command: &[String], path: &Path) -> Result<PlayOutcome, SpeakError> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| SpeakError::configuration("empty player command"))?;

    debug!("Playing {} with {program}", path.display());
    let status = Command::new(program)
        .args(args)
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| SpeakError::spawn(format!("failed to spawn player {program}: {e}")))?;

    if status.success() {
        Ok(PlayOutcome::Completed)
    } else if status.code().is_none() {
        Ok(PlayOutcome::Interrupted)
    } else {
        Err(SpeakError::spawn(format!("player {program} exited with {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    #[test]
    fn empty_player_config_plays_in_process() {
        assert_eq!(Player::from_config(&PlaybackConfig::default()), Player::InProcess);
        let config = PlaybackConfig {
            player: vec!["paplay".into()],
            ..PlaybackConfig::default()
        };
        assert_eq!(Player::from_config(&config), Player::External(vec!["paplay".into()]));
    }

    #[tokio::test]
    async fn external_player_outcomes() {
        let path = Path::new("/tmp/does-not-matter.wav");

        let ok = Player::External(vec!["true".into()]);
        assert_eq!(ok.play(path).await.unwrap(), PlayOutcome::Completed);

        let failing = Player::External(vec!["false".into()]);
        assert_eq!(failing.play(path).await.unwrap_err().kind, FailureKind::Spawn);

        let killed = Player::External(vec!["sh".into(), "-c".into(), "kill -KILL $$".into()]);
        assert_eq!(killed.play(path).await.unwrap(), PlayOutcome::Interrupted);

        let missing = Player::External(vec!["/nonexistent/player".into()]);
        assert_eq!(missing.play(path).await.unwrap_err().kind, FailureKind::Spawn);
    }
}
