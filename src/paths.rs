//! Filesystem locations shared between the host, the worker and the daemon.
//!
//! Everything lives under one data directory so tests can isolate a whole
//! instance by pointing `SPEAK_RS_DATA_DIR` (or [`RuntimePaths::in_dir`]) at a
//! temp dir.

use std::path::{Path, PathBuf};

pub const DATA_DIR_ENV: &str = "SPEAK_RS_DATA_DIR";
pub const SOCKET_ENV: &str = "SPEAK_RS_SOCKET";
pub const IDLE_TIMEOUT_ENV: &str = "SPEAK_RS_IDLE_TIMEOUT";

/// Prefix of per-request temp directories holding synthesized audio.
pub const AUDIO_TMP_PREFIX: &str = "speak-rs-tts-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub data_dir: PathBuf,
    pub socket: PathBuf,
    pub daemon_pid: PathBuf,
    pub daemon_lock: PathBuf,
    pub daemon_log: PathBuf,
    pub host_pid: PathBuf,
    pub text_snapshot: PathBuf,
    pub playback_status: PathBuf,
}

impl RuntimePaths {
    /// Resolve paths from the environment, defaulting to `~/.local/share/speak-rs`.
    pub fn from_env() -> Self {
        let data_dir = std::env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .or_else(|| dirs::data_local_dir().map(|d| d.join("speak-rs")))
            .unwrap_or_else(|| std::env::temp_dir().join("speak-rs"));

        let mut paths = Self::in_dir(&data_dir);
        if let Some(socket) = std::env::var_os(SOCKET_ENV) {
            paths.socket = PathBuf::from(socket);
        }
        paths
    }

    pub fn in_dir(dir: &Path) -> Self {
        Self {
            data_dir: dir.to_path_buf(),
            socket: dir.join("tts.sock"),
            daemon_pid: dir.join("tts_server.pid"),
            daemon_lock: dir.join("tts_server.lock"),
            daemon_log: dir.join("tts.log"),
            host_pid: dir.join("speak-rs.pid"),
            text_snapshot: dir.join("current_text.txt"),
            playback_status: dir.join("playback_status"),
        }
    }

    pub fn ensure_data_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)
    }
}

/// Read a PID file, ignoring anything after the first line.
pub fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()?
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Write a PID file atomically (temp file + rename).
pub fn write_pid(path: &Path, pid: u32) -> std::io::Result<()> {
    let tmp = path.with_extension("pid.tmp");
    std::fs::write(&tmp, format!("{pid}\n"))?;
    std::fs::rename(&tmp, path)
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
