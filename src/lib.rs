//! speak-rs: speak the current selection aloud, with cloud and local TTS.

pub mod backend;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hotkey;
pub mod notifier;
pub mod paths;
pub mod playback;
pub mod process;
pub mod selection;
pub mod service;
pub mod watcher;
