//! Backend selection and the one silent cloud → local retry.

use std::sync::Arc;

use tracing::{info, warn};

use super::{AudioClip, CloudSynth, LocalSynth, VoiceParams};
use crate::config::{BackendMode, VoiceConfig};
use crate::error::{FailureKind, SpeakError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cloud,
    Local,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// First backend to try for `mode`.
pub fn plan(mode: BackendMode, has_credential: bool, has_local: bool) -> Result<Backend, SpeakError> {
    match mode {
        BackendMode::Cloud if has_credential => Ok(Backend::Cloud),
        BackendMode::Cloud => Err(SpeakError::no_backend("cloud mode needs an API key")),
        BackendMode::Local if has_local => Ok(Backend::Local),
        BackendMode::Local => Err(SpeakError::no_backend("local mode needs the Kokoro model installed")),
        BackendMode::Auto if has_credential => Ok(Backend::Cloud),
        BackendMode::Auto if has_local => Ok(Backend::Local),
        BackendMode::Auto => Err(SpeakError::no_backend(
            "no API key configured and the local model is not installed",
        )),
    }
}

/// Whether a failed cloud attempt may be silently retried locally.
pub fn should_fall_back(mode: BackendMode, kind: FailureKind, has_local: bool) -> bool {
    mode == BackendMode::Auto && kind.is_recoverable() && has_local
}

/// Audio plus the backend that produced it.
#[derive(Debug)]
pub struct Routed {
    pub clip: AudioClip,
    pub backend: Backend,
}

pub struct Router {
    mode: BackendMode,
    cloud: Option<Arc<dyn CloudSynth>>,
    local: Option<Arc<dyn LocalSynth>>,
}

impl Router {
    /// `cloud` is present only with a credential, `local` only when installed.
    pub fn new(
        mode: BackendMode,
        cloud: Option<Arc<dyn CloudSynth>>,
        local: Option<Arc<dyn LocalSynth>>,
    ) -> Self {
        Self { mode, cloud, local }
    }

    pub async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Routed, SpeakError> {
        let first = plan(self.mode, self.cloud.is_some(), self.local.is_some())?;
        info!("Synthesizing {} chars via {first} ({} mode)", text.chars().count(), self.mode);

        match first {
            Backend::Local => self.via_local(text, voice).await,
            Backend::Cloud => match self.via_cloud(text, voice).await {
                Ok(routed) => Ok(routed),
                Err(e) if should_fall_back(self.mode, e.kind, self.local.is_some()) => {
                    warn!("Cloud failed ({e}), retrying locally");
                    self.via_local(text, voice).await
                }
                Err(e) => Err(e),
            },
        }
    }

    async fn via_cloud(&self, text: &str, voice: &VoiceConfig) -> Result<Routed, SpeakError> {
        let cloud = self
            .cloud
            .as_ref()
            .ok_or_else(|| SpeakError::no_backend("cloud backend not configured"))?;
        let params = VoiceParams {
            voice: voice.cloud_voice.clone(),
            speed: voice.speed,
            lang: voice.lang.clone(),
        };
        let clip = cloud.synthesize(text, &params).await?;
        Ok(Routed {
            clip,
            backend: Backend::Cloud,
        })
    }

    async fn via_local(&self, text: &str, voice: &VoiceConfig) -> Result<Routed, SpeakError> {
        let local = self
            .local
            .as_ref()
            .ok_or_else(|| SpeakError::no_backend("local backend not installed"))?;
        let params = VoiceParams {
            voice: voice.local_voice.clone(),
            speed: voice.speed,
            lang: voice.lang.clone(),
        };
        let clip = local.synthesize(text, &params).await?;
        Ok(Routed {
            clip,
            backend: Backend::Local,
        })
    }
}
