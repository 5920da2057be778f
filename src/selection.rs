//! Reading the text to speak from the X11/Wayland selection.
//!
//! Reads the primary selection (or the clipboard) with arboard.
//! Falls back to `xclip -o` if arboard fails.

use std::process::Command;
use tracing::{debug, warn};

use crate::playback::TextSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    Primary,
    Clipboard,
}

impl Selection {
    fn xclip_name(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Clipboard => "clipboard",
        }
    }
}

pub struct SelectionReader {
    selection: Selection,
}

impl SelectionReader {
    pub fn new(use_primary: bool) -> Self {
        let selection = if use_primary {
            Selection::Primary
        } else {
            Selection::Clipboard
        };
        Self { selection }
    }

    fn read_with_arboard(&self) -> Result<String, String> {
        use arboard::{Clipboard, GetExtLinux, LinuxClipboardKind};

        let mut clipboard = Clipboard::new().map_err(|e| format!("Failed to open clipboard: {e}"))?;
        let kind = match self.selection {
            Selection::Primary => LinuxClipboardKind::Primary,
            Selection::Clipboard => LinuxClipboardKind::Clipboard,
        };
        clipboard
            .get()
            .clipboard(kind)
            .text()
            .map_err(|e| format!("Failed to read selection: {e}"))
    }

    fn read_with_xclip(&self) -> Result<String, String> {
        let output = Command::new("xclip")
            .args(["-o", "-selection", self.selection.xclip_name()])
            .output()
            .map_err(|e| format!("Failed to spawn xclip: {e}"))?;

        if !output.status.success() {
            return Err("xclip exited with non-zero status".to_string());
        }
        String::from_utf8(output.stdout).map_err(|e| format!("Selection is not UTF-8: {e}"))
    }
}

impl TextSource for SelectionReader {
    fn current_text(&self) -> Option<String> {
        let text = match self.read_with_arboard() {
            Ok(text) => text,
            Err(e) => {
                warn!("arboard failed: {e}, falling back to xclip");
                match self.read_with_xclip() {
                    Ok(text) => text,
                    Err(e2) => {
                        warn!("xclip fallback also failed: {e2}");
                        return None;
                    }
                }
            }
        };

        let text = text.trim().to_string();
        debug!("Selection has {} characters", text.chars().count());
        (!text.is_empty()).then_some(text)
    }
}
