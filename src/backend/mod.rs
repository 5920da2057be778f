//! Synthesis backends and the audio they produce.
//!
//! Both backends hand back a WAV file on disk. Cloud audio is written into a
//! fresh per-request temp directory; local audio arrives in one the daemon (or
//! the one-shot `synth` process) created.

pub mod cloud;
pub mod router;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::SpeakError;
use crate::paths::AUDIO_TMP_PREFIX;

/// Per-request voice parameters, already resolved for one backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
    pub lang: String,
}

/// A synthesized WAV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioClip {
    pub path: PathBuf,
}

impl AudioClip {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Duration from the WAV header.
    pub fn duration_secs(&self) -> Result<f64, SpeakError> {
        let reader = hound::WavReader::open(&self.path).map_err(|e| {
            SpeakError::synthesis(format!("unreadable audio {}: {e}", self.path.display()))
        })?;
        let spec = reader.spec();
        if spec.sample_rate == 0 || spec.channels == 0 {
            return Err(SpeakError::synthesis("audio header has zero rate or channels"));
        }
        let frames = reader.duration();
        if frames == 0 {
            return Err(SpeakError::synthesis("synthesized audio is empty"));
        }
        Ok(frames as f64 / spec.sample_rate as f64)
    }

    /// Delete the file, and its directory when it is a per-request temp dir.
    pub fn discard(self) {
        if let Err(e) = crate::paths::remove_if_exists(&self.path) {
            warn!("Failed to remove {}: {e}", self.path.display());
        }
        if let Some(dir) = self.path.parent().filter(|d| is_audio_tmp_dir(d)) {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                debug!("Failed to remove {}: {e}", dir.display());
            }
        }
    }
}

#[async_trait]
pub trait CloudSynth: Send + Sync {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioClip, SpeakError>;
}

#[async_trait]
pub trait LocalSynth: Send + Sync {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioClip, SpeakError>;
}

/// Create a fresh `speak-rs-tts-*` directory under the system temp dir.
pub fn create_audio_tmp_dir() -> std::io::Result<PathBuf> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!(
        "{AUDIO_TMP_PREFIX}{}-{nanos}-{n}",
        std::process::id()
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn is_audio_tmp_dir(dir: &Path) -> bool {
    dir.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(AUDIO_TMP_PREFIX))
}

/// Write mono f32 samples as a 16-bit PCM WAV.
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &sample in samples {
        let s = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
        writer.write_sample(s)?;
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_comes_from_wav_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, &vec![0.1; 24_000 * 2], 24_000).unwrap();
        let secs = AudioClip::new(&path).duration_secs().unwrap();
        assert!((secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_or_corrupt_audio_is_a_synthesis_failure() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.wav");
        write_wav(&empty, &[], 24_000).unwrap();
        let err = AudioClip::new(&empty).duration_secs().unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Synthesis);

        let garbage = dir.path().join("garbage.wav");
        std::fs::write(&garbage, b"not a wav").unwrap();
        assert!(AudioClip::new(&garbage).duration_secs().is_err());
    }

    #[test]
    fn discard_removes_per_request_dir() {
        let dir = create_audio_tmp_dir().unwrap();
        assert!(is_audio_tmp_dir(&dir));
        let path = dir.join("speech.wav");
        write_wav(&path, &[0.0; 10], 24_000).unwrap();

        AudioClip::new(&path).discard();
        assert!(!path.exists());
        assert!(!dir.exists());
    }
}
