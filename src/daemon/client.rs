//! Client side of the daemon protocol, with a one-shot fallback.
//!
//! Daemon absence is a performance degradation, not a failure: when the
//! socket can't be reached (or the daemon stalls) the request is served by a
//! fresh `speak-rs synth` process instead. The client never starts a daemon.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info};

use super::protocol::{self, DaemonRequest, DaemonResponse};
use crate::backend::{AudioClip, LocalSynth, VoiceParams};
use crate::error::{DaemonError, FailureKind, SpeakError};

pub struct DaemonClient {
    socket: PathBuf,
    connect_timeout: Duration,
    request_timeout: Duration,
    fallback: Option<Arc<dyn LocalSynth>>,
}

impl DaemonClient {
    pub fn new(socket: PathBuf, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            socket,
            connect_timeout,
            request_timeout,
            fallback: None,
        }
    }

    /// Used when the daemon can't be reached.
    pub fn with_fallback(mut self, fallback: Arc<dyn LocalSynth>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// One request/response exchange. Reachability problems are
    /// `TransportUnavailable`.
    pub async fn request(&self, request: &DaemonRequest) -> Result<DaemonResponse, SpeakError> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket))
            .await
            .map_err(|_| SpeakError::transport(format!("connect to {} timed out", self.socket.display())))?
            .map_err(|e| SpeakError::transport(format!("cannot connect to {}: {e}", self.socket.display())))?;

        let mut framed = protocol::framed(stream);
        let exchange = async {
            protocol::send_message(&mut framed, request).await?;
            protocol::recv_message::<_, DaemonResponse>(&mut framed).await
        };

        match tokio::time::timeout(self.request_timeout, exchange).await {
            Err(_) => Err(SpeakError::transport(format!(
                "daemon did not respond within {:?}",
                self.request_timeout
            ))),
            Ok(Err(DaemonError::Protocol(e))) => Err(SpeakError::synthesis(format!("bad daemon response: {e}"))),
            Ok(Err(e)) => Err(SpeakError::transport(format!("daemon exchange failed: {e}"))),
            Ok(Ok(None)) => Err(SpeakError::transport("daemon closed the connection")),
            Ok(Ok(Some(response))) => Ok(response),
        }
    }

    /// Liveness check: `(pid, state)` of the running daemon.
    pub async fn ping(&self) -> Result<(u32, String), SpeakError> {
        match self.request(&DaemonRequest::Ping).await? {
            DaemonResponse::Pong { pid, state } => Ok((pid, state)),
            other => Err(SpeakError::synthesis(format!("unexpected ping response: {other:?}"))),
        }
    }

    async fn via_daemon(&self, text: &str, params: &VoiceParams) -> Result<AudioClip, SpeakError> {
        let request = DaemonRequest::Synthesize {
            text: text.to_string(),
            voice: params.voice.clone(),
            speed: params.speed,
            lang: params.lang.clone(),
        };
        match self.request(&request).await? {
            DaemonResponse::Ok { audio_file } => Ok(AudioClip::new(audio_file)),
            DaemonResponse::Error { message } => Err(SpeakError::synthesis(message)),
            DaemonResponse::Pong { .. } => Err(SpeakError::synthesis("daemon answered synthesize with pong")),
        }
    }
}

#[async_trait]
impl LocalSynth for DaemonClient {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioClip, SpeakError> {
        match self.via_daemon(text, params).await {
            Err(e) if e.kind == FailureKind::TransportUnavailable => match &self.fallback {
                Some(fallback) => {
                    info!("Daemon unavailable ({}), synthesizing one-shot", e.message);
                    fallback.synthesize(text, params).await
                }
                None => Err(e),
            },
            other => other,
        }
    }
}

/// Runs `speak-rs synth`: text on stdin, WAV path on stdout.
pub struct OneShotSynth {
    exe: PathBuf,
    config_path: Option<PathBuf>,
}

impl OneShotSynth {
    pub fn new(config_path: Option<PathBuf>) -> std::io::Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            config_path,
        })
    }

    pub fn with_exe(exe: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self { exe, config_path }
    }
}

#[async_trait]
impl LocalSynth for OneShotSynth {
    async fn synthesize(&self, text: &str, params: &VoiceParams) -> Result<AudioClip, SpeakError> {
        let mut cmd = Command::new(&self.exe);
        if let Some(config) = &self.config_path {
            cmd.arg("--config").arg(config);
        }
        cmd.arg("synth")
            .arg("--voice")
            .arg(&params.voice)
            .arg("--speed")
            .arg(format!("{:.2}", params.speed))
            .arg("--lang")
            .arg(&params.lang)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpeakError::spawn(format!("failed to spawn {}: {e}", self.exe.display())))?;

        if let Some(mut stdin) = child.stdin.take() {
            // An early exit shows up in the exit status below.
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                debug!("synth closed stdin early: {e}");
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SpeakError::spawn(format!("failed to wait for synth: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or("").trim().to_string();
            return Err(SpeakError::synthesis(format!("synth exited with {}: {tail}", output.status)));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| SpeakError::synthesis("synth printed no audio path"))?;
        debug!("One-shot synth wrote {path}");
        Ok(AudioClip::new(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned;

    #[async_trait]
    impl LocalSynth for Canned {
        async fn synthesize(&self, _text: &str, _params: &VoiceParams) -> Result<AudioClip, SpeakError> {
            Ok(AudioClip::new("/tmp/canned.wav"))
        }
    }

    fn params() -> VoiceParams {
        VoiceParams {
            voice: "bf_lily".into(),
            speed: 1.0,
            lang: "b".into(),
        }
    }

    #[tokio::test]
    async fn missing_socket_is_transport_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(
            dir.path().join("nope.sock"),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        let err = client.ping().await.unwrap_err();
        assert_eq!(err.kind, FailureKind::TransportUnavailable);
        let err = client.synthesize("hi", &params()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::TransportUnavailable);
    }

    #[tokio::test]
    async fn missing_daemon_uses_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let client = DaemonClient::new(
            dir.path().join("nope.sock"),
            Duration::from_millis(500),
            Duration::from_secs(1),
        )
        .with_fallback(Arc::new(Canned));
        let clip = client.synthesize("hi", &params()).await.unwrap();
        assert_eq!(clip.path, PathBuf::from("/tmp/canned.wav"));
    }

    #[tokio::test]
    async fn silent_daemon_times_out_into_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("tts.sock");
        // Accepts but never answers.
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let _server = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = DaemonClient::new(socket, Duration::from_millis(500), Duration::from_millis(200))
            .with_fallback(Arc::new(Canned));
        let clip = client.synthesize("hi", &params()).await.unwrap();
        assert_eq!(clip.path, PathBuf::from("/tmp/canned.wav"));
    }

    #[tokio::test]
    async fn one_shot_reads_path_from_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-synth");
        std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\necho loading >&2\necho /tmp/out.wav\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let synth = OneShotSynth::with_exe(script, None);
        let clip = synth.synthesize("hello", &params()).await.unwrap();
        assert_eq!(clip.path, PathBuf::from("/tmp/out.wav"));
    }

    #[tokio::test]
    async fn one_shot_failure_is_synthesis() {
        let synth = OneShotSynth::with_exe(PathBuf::from("false"), None);
        let err = synth.synthesize("hello", &params()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Synthesis);

        let missing = OneShotSynth::with_exe(PathBuf::from("/nonexistent/speak-rs"), None);
        let err = missing.synthesize("hello", &params()).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Spawn);
    }
}
