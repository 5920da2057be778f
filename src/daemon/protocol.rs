//! Wire protocol between the daemon client and the local synthesis daemon.
//!
//! One JSON request and one JSON response per connection, each framed with a
//! 4-byte big-endian length prefix.

use std::path::PathBuf;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::DaemonError;

pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    Synthesize {
        text: String,
        voice: String,
        speed: f32,
        lang: String,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Ok { audio_file: PathBuf },
    Error { message: String },
    Pong { pid: u32, state: String },
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> Framed<S, LengthDelimitedCodec> {
    Framed::new(stream, codec())
}

pub async fn send_message<S, T>(framed: &mut Framed<S, LengthDelimitedCodec>, message: &T) -> Result<(), DaemonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message).map_err(|e| DaemonError::Protocol(e.to_string()))?;
    framed.send(Bytes::from(payload)).await?;
    Ok(())
}

/// Read one message. `Ok(None)` when the peer closed without sending.
pub async fn recv_message<S, T>(framed: &mut Framed<S, LengthDelimitedCodec>) -> Result<Option<T>, DaemonError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let Some(frame) = framed.next().await else {
        return Ok(None);
    };
    let frame = frame?;
    let message = serde_json::from_slice(&frame).map_err(|e| DaemonError::Protocol(e.to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_json() {
        let ping = serde_json::to_string(&DaemonRequest::Ping).unwrap();
        assert_eq!(ping, r#"{"type":"ping"}"#);

        let resp: DaemonResponse =
            serde_json::from_str(r#"{"type":"error","message":"model exploded"}"#).unwrap();
        assert_eq!(
            resp,
            DaemonResponse::Error {
                message: "model exploded".into()
            }
        );
    }

    #[tokio::test]
    async fn request_crosses_a_socket_pair() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut client = framed(a);
        let mut server = framed(b);

        let request = DaemonRequest::Synthesize {
            text: "Hello there.".into(),
            voice: "bf_lily".into(),
            speed: 1.2,
            lang: "b".into(),
        };
        send_message(&mut client, &request).await.unwrap();
        let got: DaemonRequest = recv_message(&mut server).await.unwrap().unwrap();
        assert_eq!(got, request);

        drop(client);
        let eof: Option<DaemonRequest> = recv_message(&mut server).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn garbage_frame_is_a_protocol_error() {
        let (a, b) = tokio::net::UnixStream::pair().unwrap();
        let mut raw = Framed::new(a, codec());
        raw.send(Bytes::from_static(b"not json")).await.unwrap();

        let mut server = framed(b);
        let err = recv_message::<_, DaemonRequest>(&mut server).await.unwrap_err();
        assert!(matches!(err, DaemonError::Protocol(_)));
    }
}
