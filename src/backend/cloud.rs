//! ElevenLabs-style cloud synthesis over HTTPS.
//!
//! Requests raw 24 kHz PCM and wraps it in a WAV container so the rest of
//! the pipeline only ever deals with WAV files.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use super::{create_audio_tmp_dir, AudioClip, CloudSynth, VoiceParams};
use crate::config::CloudConfig;
use crate::error::SpeakError;

const OUTPUT_FORMAT: &str = "pcm_24000";
const SAMPLE_RATE: u32 = 24_000;

pub struct ElevenLabsClient {
    config: CloudConfig,
    api_key: String,
    client: Client,
}

impl ElevenLabsClient {
    pub fn new(config: CloudConfig, api_key: String) -> Result<Self, SpeakError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SpeakError::configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    /// Build a client when a credential is configured.
    pub fn from_config(config: &CloudConfig) -> Option<Result<Self, SpeakError>> {
        let key = config.api_key()?;
        Some(Self::new(config.clone(), key))
    }
}

#[async_trait]
impl CloudSynth for ElevenLabsClient {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioClip, SpeakError> {
        let url = format!(
            "{}/{}?output_format={OUTPUT_FORMAT}",
            self.config.endpoint.trim_end_matches('/'),
            params.voice
        );
        let body = json!({
            "text": text,
            "model_id": self.config.model_id,
            "voice_settings": {
                "stability": self.config.stability,
                "similarity_boost": self.config.similarity_boost,
                "speed": params.speed,
            }
        });

        debug!("Cloud request: voice={} chars={}", params.voice, text.chars().count());

        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!("Cloud returned status {status}");
            return Err(classify_status(status, &body));
        }

        let pcm = resp.bytes().await.map_err(|e| classify_request_error(&e))?;
        if pcm.len() < 2 {
            return Err(SpeakError::synthesis("cloud returned no audio"));
        }

        let dir = create_audio_tmp_dir()
            .map_err(|e| SpeakError::synthesis(format!("failed to create temp dir: {e}")))?;
        let clip = save_pcm(&dir, &pcm)?;

        debug!("Cloud audio: {} bytes PCM → {}", pcm.len(), clip.path.display());
        Ok(clip)
    }
}

/// Write `pcm` as `speech.wav` in `dir`. The dir is removed if the write fails.
fn save_pcm(dir: &Path, pcm: &[u8]) -> Result<AudioClip, SpeakError> {
    let path = dir.join("speech.wav");
    if let Err(e) = write_pcm16_wav(&path, pcm) {
        if let Err(rm) = std::fs::remove_dir_all(dir) {
            warn!("Failed to remove {}: {rm}", dir.display());
        }
        return Err(SpeakError::synthesis(format!("failed to write audio: {e}")));
    }
    Ok(AudioClip::new(path))
}

/// Map an HTTP error status to a failure class.
pub fn classify_status(status: StatusCode, body: &str) -> SpeakError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    match status.as_u16() {
        401 | 403 if body.contains("quota_exceeded") => SpeakError::quota(message),
        429 => SpeakError::quota(message),
        500..=599 => SpeakError::transport(message),
        _ => SpeakError::configuration(message),
    }
}

fn classify_request_error(e: &reqwest::Error) -> SpeakError {
    if e.is_connect() || e.is_timeout() {
        SpeakError::transport(format!("cloud unreachable: {e}"))
    } else {
        SpeakError::synthesis(format!("cloud request failed: {e}"))
    }
}

/// Wrap signed 16-bit little-endian mono PCM in a WAV file.
fn write_pcm16_wav(path: &Path, pcm: &[u8]) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for chunk in pcm.chunks_exact(2) {
        writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    fn kind(status: u16, body: &str) -> FailureKind {
        classify_status(StatusCode::from_u16(status).unwrap(), body).kind
    }

    #[test]
    fn rate_limit_and_quota_are_quota() {
        assert_eq!(kind(429, ""), FailureKind::Quota);
        assert_eq!(
            kind(401, r#"{"detail":{"status":"quota_exceeded"}}"#),
            FailureKind::Quota
        );
    }

    #[test]
    fn bad_credential_is_configuration() {
        assert_eq!(kind(401, r#"{"detail":{"status":"invalid_api_key"}}"#), FailureKind::Configuration);
        assert_eq!(kind(422, "bad voice"), FailureKind::Configuration);
    }

    #[test]
    fn server_errors_are_transport() {
        assert_eq!(kind(503, ""), FailureKind::TransportUnavailable);
    }

    #[test]
    fn pcm_is_wrapped_as_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.wav");
        let pcm: Vec<u8> = std::iter::repeat([0x10u8, 0x00]).take(24_000).flatten().collect();
        write_pcm16_wav(&path, &pcm).unwrap();
        let secs = AudioClip::new(&path).duration_secs().unwrap();
        assert!((secs - 1.0).abs() < 1e-9);
    }

    #[test]
    fn failed_write_removes_the_audio_dir() {
        let dir = create_audio_tmp_dir().unwrap();
        // A directory where the WAV should go makes the write fail.
        std::fs::create_dir(dir.join("speech.wav")).unwrap();

        let err = save_pcm(&dir, &[0u8; 480]).unwrap_err();
        assert_eq!(err.kind, FailureKind::Synthesis);
        assert!(!dir.exists());
    }

    #[test]
    fn saved_pcm_lands_in_the_audio_dir() {
        let dir = create_audio_tmp_dir().unwrap();
        let clip = save_pcm(&dir, &[0u8; 480]).unwrap();
        assert_eq!(clip.path.parent(), Some(dir.as_path()));
        clip.discard();
        assert!(!dir.exists());
    }

    #[test]
    fn no_credential_means_no_client() {
        let config = CloudConfig {
            api_key_env: "SPEAK_RS_TEST_UNSET_CLOUD_KEY".into(),
            api_key_file: None,
            ..CloudConfig::default()
        };
        assert!(ElevenLabsClient::from_config(&config).is_none());
    }
}
