//! Persistent local synthesis daemon and its clients.

pub mod client;
pub mod engine;
pub mod lock;
pub mod protocol;
pub mod server;
pub mod supervisor;

pub use client::{DaemonClient, OneShotSynth};
pub use engine::{KokoroEngine, SpeechModel};
pub use server::{run_daemon, DaemonOptions, LifecycleState};
pub use supervisor::DaemonSupervisor;
