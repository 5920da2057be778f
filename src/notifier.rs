//! Desktop notifications via notify-rust (D-Bus).

use notify_rust::Notification;
use tracing::{debug, warn};

use crate::error::{FailureKind, SpeakError};
use crate::playback::{PlaybackEvent, SessionOutcome};

pub struct Notifier {
    enabled: bool,
}

impl Notifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn notify(&self, summary: &str, body: &str) {
        if !self.enabled {
            return;
        }

        debug!("Notification: {summary}");

        if let Err(e) = Notification::new()
            .summary(summary)
            .body(body)
            .icon("audio-speakers")
            .timeout(3000)
            .show()
        {
            warn!("Failed to show notification: {e}");
        }
    }

    /// Only failures are surfaced; start/stop are visible by ear.
    pub fn on_event(&self, event: &PlaybackEvent) {
        if let Some(body) = failure_message(event) {
            self.notify("speak-rs", &body);
        }
    }
}

/// Notification body for a failed session, if the event is one.
pub fn failure_message(event: &PlaybackEvent) -> Option<String> {
    let PlaybackEvent::SpeakingStopped {
        outcome: SessionOutcome::Failed(kind),
        ..
    } = event
    else {
        return None;
    };

    let message = match kind {
        FailureKind::NoText => "Nothing selected to speak.".to_string(),
        FailureKind::Quota => SpeakError::quota("cloud backend").user_message(),
        FailureKind::NoBackendAvailable => {
            "No speech backend available. Set an API key or install the local Kokoro model.".to_string()
        }
        other => format!("Speech failed: {other}"),
    };
    Some(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_failures_produce_messages() {
        let started = PlaybackEvent::SpeakingStarted { generation: 1 };
        let finished = PlaybackEvent::SpeakingStopped {
            generation: 1,
            outcome: SessionOutcome::Finished,
        };
        assert!(failure_message(&started).is_none());
        assert!(failure_message(&finished).is_none());

        let quota = PlaybackEvent::SpeakingStopped {
            generation: 2,
            outcome: SessionOutcome::Failed(FailureKind::Quota),
        };
        assert!(failure_message(&quota).unwrap().contains("Install the local"));
    }
}
