//! Configuration management for speak-rs.
//!
//! Loads config from YAML files in standard locations. Every section has
//! defaults, so a missing or partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::paths::IDLE_TIMEOUT_ENV;

/// Which synthesis backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Cloud,
    Local,
    Auto,
}

impl std::fmt::Display for BackendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Local => write!(f, "local"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HotkeyConfig {
    pub enabled: bool,
    pub combo: Vec<String>,
    pub alt_combos: Vec<Vec<String>>,
}

impl Default for HotkeyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            combo: vec!["KEY_LEFTALT".into(), "KEY_F11".into()],
            alt_combos: vec![],
        }
    }
}

/// Voice settings. Changing any of these while speaking triggers a respeak.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub backend: BackendMode,
    /// Kokoro voice used by the local backend.
    pub local_voice: String,
    /// Voice id used by the cloud backend.
    pub cloud_voice: String,
    pub speed: f32,
    /// Kokoro language code (`a` = American English, `b` = British English).
    pub lang: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            backend: BackendMode::Auto,
            local_voice: "bf_lily".into(),
            cloud_voice: "pFZP5JQG7iQjIQuC4Bku".into(),
            speed: 1.0,
            lang: "b".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub endpoint: String,
    pub model_id: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Optional file holding the API key (first line).
    pub api_key_file: Option<PathBuf>,
    pub stability: f32,
    pub similarity_boost: f32,
    pub timeout_secs: u64,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.elevenlabs.io/v1/text-to-speech".into(),
            model_id: "eleven_flash_v2_5".into(),
            api_key_env: "ELEVENLABS_API_KEY".into(),
            api_key_file: None,
            stability: 0.5,
            similarity_boost: 0.75,
            timeout_secs: 30,
        }
    }
}

impl CloudConfig {
    /// Resolve the API key from the environment, then the key file.
    pub fn api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(&self.api_key_env) {
            let key = key.trim().to_string();
            if !key.is_empty() {
                return Some(key);
            }
        }
        let path = self.api_key_file.as_ref()?;
        let contents = std::fs::read_to_string(path).ok()?;
        let key = contents.lines().next()?.trim().to_string();
        (!key.is_empty()).then_some(key)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory containing `kokoro-v1.0.onnx`, `voices-v1.0.bin`, `tokenizer.json`.
    pub model_dir: PathBuf,
    pub intra_threads: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        let model_dir = dirs::data_local_dir()
            .map(|d| d.join("speak-rs/kokoro"))
            .unwrap_or_else(|| PathBuf::from("kokoro"));
        Self {
            model_dir,
            intra_threads: 4,
        }
    }
}

impl LocalConfig {
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join("kokoro-v1.0.onnx")
    }

    pub fn voices_path(&self) -> PathBuf {
        self.model_dir.join("voices-v1.0.bin")
    }

    pub fn tokenizer_path(&self) -> PathBuf {
        self.model_dir.join("tokenizer.json")
    }

    /// The local backend counts as installed when all model files are present.
    pub fn is_installed(&self) -> bool {
        self.model_path().is_file() && self.voices_path().is_file() && self.tokenizer_path().is_file()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Start a managed daemon from the host when local synthesis may be needed.
    pub autostart: bool,
    /// Seconds without a request before the daemon exits. 0 disables.
    pub idle_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            idle_timeout_secs: 300,
            connect_timeout_ms: 500,
            request_timeout_secs: 120,
        }
    }
}

impl DaemonConfig {
    /// Idle timeout, honouring the `SPEAK_RS_IDLE_TIMEOUT` override.
    pub fn idle_timeout(&self) -> Option<Duration> {
        let secs = std::env::var(IDLE_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(self.idle_timeout_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// External player command (audio path is appended). Empty = play in-process.
    pub player: Vec<String>,
    /// Quiet window for coalescing settings changes, in milliseconds.
    pub respeak_debounce_ms: u64,
    /// Read the primary selection instead of the clipboard.
    pub use_primary_selection: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            player: vec![],
            respeak_debounce_ms: 500,
            use_primary_selection: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackConfig {
    pub notifications: bool,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            notifications: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub hotkey: HotkeyConfig,
    pub voice: VoiceConfig,
    pub cloud: CloudConfig,
    pub local: LocalConfig,
    pub daemon: DaemonConfig,
    pub playback: PlaybackConfig,
    pub feedback: FeedbackConfig,
}

impl Config {
    /// Find the config file to use.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./speak-rs.yaml
    /// 2. ~/.config/speak-rs/config.yaml
    /// 3. /etc/speak-rs/config.yaml
    pub fn resolve_path(path: Option<&Path>) -> Option<PathBuf> {
        path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("speak-rs.yaml")),
                dirs::config_dir().map(|c| c.join("speak-rs/config.yaml")),
                Some(PathBuf::from("/etc/speak-rs/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        })
    }

    /// Load configuration from a YAML file, falling back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let Some(config_path) = Self::resolve_path(path) else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match Self::load_file(&config_path) {
            Ok(config) => {
                info!("Loaded config from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::warn!("{e}, using defaults");
                Self::default()
            }
        }
    }

    /// Strict variant used by the settings watcher: a broken edit must not
    /// silently reset voice settings to defaults.
    pub fn load_file(path: &Path) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
        serde_yml::from_str(&contents).map_err(|e| format!("Failed to parse {}: {e}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config: Config = serde_yml::from_str("voice:\n  backend: local\n  speed: 1.25\n").unwrap();
        assert_eq!(config.voice.backend, BackendMode::Local);
        assert!((config.voice.speed - 1.25).abs() < f32::EPSILON);
        assert_eq!(config.voice.local_voice, "bf_lily");
        assert_eq!(config.daemon.idle_timeout_secs, 300);
        assert_eq!(config.playback.respeak_debounce_ms, 500);
    }

    #[test]
    fn load_file_rejects_invalid_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "voice: [unclosed").unwrap();
        assert!(Config::load_file(&path).is_err());
        // The lenient loader falls back instead.
        assert_eq!(Config::load(Some(&path)).voice, VoiceConfig::default());
    }

    #[test]
    fn local_install_requires_all_model_files() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalConfig {
            model_dir: dir.path().to_path_buf(),
            intra_threads: 1,
        };
        assert!(!local.is_installed());

        std::fs::write(local.model_path(), b"onnx").unwrap();
        std::fs::write(local.voices_path(), b"npz").unwrap();
        assert!(!local.is_installed());

        std::fs::write(local.tokenizer_path(), b"{}").unwrap();
        assert!(local.is_installed());
    }

    #[test]
    fn api_key_file_is_read_when_env_missing() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("key");
        std::fs::write(&key_file, "sk-test\n").unwrap();
        let cloud = CloudConfig {
            api_key_env: "SPEAK_RS_TEST_KEY_THAT_IS_NEVER_SET".into(),
            api_key_file: Some(key_file),
            ..CloudConfig::default()
        };
        assert_eq!(cloud.api_key().as_deref(), Some("sk-test"));
    }
}
