//! Playback concurrency core: sessions, resume points and the orchestrator.

pub mod debounce;
pub mod orchestrator;
pub mod player;
pub mod position;
pub mod session;
pub mod status;
pub mod worker;

pub use orchestrator::{OrchestratorConfig, PlaybackOrchestrator, SharedVoice, TextSource};
pub use position::{compute_resume_text, ResumePolicy};
pub use session::{PlaybackEvent, SessionLauncher, SessionOutcome, SessionRequest, SessionState, WorkerLauncher};
pub use status::PlaybackStatus;
