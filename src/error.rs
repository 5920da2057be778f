//! Error taxonomy shared by the backends, the daemon client and the playback core.
//!
//! Everything below the orchestrator is converted into a [`SpeakError`] carrying a
//! [`FailureKind`]. The kind decides whether the router may fall back and, across the
//! worker-process boundary, which exit code the `speak` worker returns.

use std::fmt;

/// Classified failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Daemon socket missing, connection refused, network unreachable, timeouts.
    TransportUnavailable,
    /// Cloud quota exhausted or rate limited.
    Quota,
    /// Bad credential, malformed request, invalid settings.
    Configuration,
    /// Model error or corrupt/empty audio.
    Synthesis,
    /// The worker or player process could not be spawned.
    Spawn,
    /// Neither backend can serve the request with the current settings.
    NoBackendAvailable,
    /// The selection source had nothing to speak.
    NoText,
}

impl FailureKind {
    /// Transport and quota failures are the only classes eligible for a silent retry.
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::TransportUnavailable | Self::Quota)
    }

    /// Exit code used by the `speak` worker process for this failure.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::TransportUnavailable => 10,
            Self::Quota => 11,
            Self::Configuration => 12,
            Self::Synthesis => 13,
            Self::Spawn => 14,
            Self::NoBackendAvailable => 15,
            Self::NoText => 16,
        }
    }

    /// Inverse of [`FailureKind::exit_code`]. Unknown codes map to `Synthesis`.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            10 => Self::TransportUnavailable,
            11 => Self::Quota,
            12 => Self::Configuration,
            14 => Self::Spawn,
            15 => Self::NoBackendAvailable,
            16 => Self::NoText,
            _ => Self::Synthesis,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TransportUnavailable => "transport unavailable",
            Self::Quota => "quota exceeded",
            Self::Configuration => "configuration error",
            Self::Synthesis => "synthesis failed",
            Self::Spawn => "spawn failed",
            Self::NoBackendAvailable => "no backend available",
            Self::NoText => "nothing to speak",
        };
        f.write_str(s)
    }
}

/// A classified failure with a human-readable message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SpeakError {
    pub kind: FailureKind,
    pub message: String,
}

impl SpeakError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransportUnavailable, message)
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Quota, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Configuration, message)
    }

    pub fn synthesis(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Synthesis, message)
    }

    pub fn spawn(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Spawn, message)
    }

    pub fn no_backend(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NoBackendAvailable, message)
    }

    /// Message shown to the user. Quota failures get a remediation hint so the
    /// caller can offer installing the local model.
    pub fn user_message(&self) -> String {
        match self.kind {
            FailureKind::Quota => format!(
                "Cloud quota exhausted ({}). Install the local Kokoro model to keep speaking offline.",
                self.message
            ),
            _ => self.to_string(),
        }
    }
}

/// Errors raised by the local synthesis daemon process itself.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Another daemon holds the startup lock.
    #[error("another daemon already holds {0}")]
    AlreadyRunning(String),

    #[error("failed to load speech model: {0}")]
    ModelLoad(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_invertible() {
        let kinds = [
            FailureKind::TransportUnavailable,
            FailureKind::Quota,
            FailureKind::Configuration,
            FailureKind::Synthesis,
            FailureKind::Spawn,
            FailureKind::NoBackendAvailable,
            FailureKind::NoText,
        ];
        for kind in kinds {
            assert_eq!(FailureKind::from_exit_code(kind.exit_code()), kind);
            assert_ne!(kind.exit_code(), 0);
        }
    }

    #[test]
    fn only_transport_and_quota_are_recoverable() {
        assert!(FailureKind::TransportUnavailable.is_recoverable());
        assert!(FailureKind::Quota.is_recoverable());
        assert!(!FailureKind::Configuration.is_recoverable());
        assert!(!FailureKind::Synthesis.is_recoverable());
    }

    #[test]
    fn quota_message_is_distinguishable() {
        let quota = SpeakError::quota("429");
        let generic = SpeakError::synthesis("boom");
        assert!(quota.user_message().contains("Install the local"));
        assert!(!generic.user_message().contains("Install the local"));
    }
}
