//! On-disk TextSnapshot and PlaybackStatusRecord.
//!
//! Both files are single-writer (the active session) and multi-reader. They
//! are replaced wholesale per session, never patched, and carry no version.
//!
//! Status format: two-line text file
//! ```text
//! <unix epoch seconds>
//! <duration seconds, 6 decimals>
//! ```

use std::fs;
use std::io;
use std::path::Path;

/// When playback began and how long the synthesized audio lasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackStatus {
    pub started_at_epoch_secs: i64,
    pub estimated_duration_secs: f64,
}

impl PlaybackStatus {
    /// Status for playback starting now.
    pub fn starting_now(estimated_duration_secs: f64) -> Self {
        Self {
            started_at_epoch_secs: chrono::Utc::now().timestamp(),
            estimated_duration_secs,
        }
    }

    pub fn to_file_content(&self) -> String {
        format!(
            "{}\n{:.6}\n",
            self.started_at_epoch_secs, self.estimated_duration_secs
        )
    }

    /// Parse the two-line format. Returns `None` for anything malformed.
    pub fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let started_at_epoch_secs = lines.next()?.trim().parse::<i64>().ok()?;
        let estimated_duration_secs = lines.next()?.trim().parse::<f64>().ok()?;
        if !estimated_duration_secs.is_finite() {
            return None;
        }
        Some(Self {
            started_at_epoch_secs,
            estimated_duration_secs,
        })
    }
}

/// Write the status record atomically (temp file + rename) so readers never
/// observe a half-written record.
pub fn write_status(path: &Path, status: &PlaybackStatus) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, status.to_file_content())?;
    fs::rename(&tmp, path)
}

/// Read the status record. Missing or malformed files read as `None`.
pub fn read_status(path: &Path) -> Option<PlaybackStatus> {
    let content = fs::read_to_string(path).ok()?;
    PlaybackStatus::parse(&content)
}

/// Drop the previous session's record before a new session starts synthesis,
/// so a resume computed mid-synthesis sees "nothing played yet".
pub fn clear_status(path: &Path) -> io::Result<()> {
    crate::paths::remove_if_exists(path)
}

/// Overwrite the text snapshot (raw UTF-8, no framing).
pub fn write_snapshot(path: &Path, text: &str) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, text)?;
    fs::rename(&tmp, path)
}

pub fn read_snapshot(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}
