//! Length-prefixed wire protocol.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes:
//! a UTF-8 command token and, for `RESULT` and `COMPUTE`, one space and a
//! payload blob. The blob is the serialized work item in the negotiated
//! format (or the handshake document) and may contain arbitrary bytes.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use optforge_core::WireFormat;

/// Frames larger than this are refused outright.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Version negotiated at handshake; both sides must agree.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_BYTES}-byte limit")]
    FrameTooLarge(usize),
    #[error("frame does not start with a UTF-8 command")]
    Malformed,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("unexpected {0} in this session state")]
    Unexpected(&'static str),
    #[error("bad handshake payload: {0}")]
    BadHandshake(String),
}

/// Everything that travels on a session, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Client asks for one raw item.
    GetData,
    /// Server has nothing within its wait budget.
    NoData,
    /// A serialized item: the reply to `GetData` on the way out, the
    /// processed item on the way back.
    Result(Vec<u8>),
    /// Server acknowledges a returned item.
    Ack,
    /// Server refuses a returned item it could not decode.
    Nack,
    Ping,
    Pong,
    /// Handshake carrier: the client announces its preference, the server
    /// answers with the format and version the session will use.
    Compute(Vec<u8>),
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::GetData => "GETDATA",
            Message::NoData => "NODATA",
            Message::Result(_) => "RESULT",
            Message::Ack => "ACK",
            Message::Nack => "NACK",
            Message::Ping => "PING",
            Message::Pong => "PONG",
            Message::Compute(_) => "COMPUTE",
        }
    }

    fn payload(&self) -> Option<&[u8]> {
        match self {
            Message::Result(blob) | Message::Compute(blob) => Some(blob),
            _ => None,
        }
    }

    fn to_frame(&self) -> Vec<u8> {
        let command = self.command().as_bytes();
        match self.payload() {
            Some(payload) => {
                let mut frame = Vec::with_capacity(command.len() + 1 + payload.len());
                frame.extend_from_slice(command);
                frame.push(b' ');
                frame.extend_from_slice(payload);
                frame
            }
            None => command.to_vec(),
        }
    }

    fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let split = frame.iter().position(|byte| *byte == b' ');
        let (command_bytes, payload) = match split {
            Some(pos) => (&frame[..pos], &frame[pos + 1..]),
            None => (frame, &[][..]),
        };
        let command = std::str::from_utf8(command_bytes).map_err(|_| ProtocolError::Malformed)?;
        match command {
            "GETDATA" => Ok(Message::GetData),
            "NODATA" => Ok(Message::NoData),
            "RESULT" => Ok(Message::Result(payload.to_vec())),
            "ACK" => Ok(Message::Ack),
            "NACK" => Ok(Message::Nack),
            "PING" => Ok(Message::Ping),
            "PONG" => Ok(Message::Pong),
            "COMPUTE" => Ok(Message::Compute(payload.to_vec())),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Format-and-version document exchanged inside `COMPUTE` frames. Always
/// JSON, so it can be read before any format has been negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub format: WireFormat,
    pub version: u32,
}

impl Handshake {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            version: PROTOCOL_VERSION,
        }
    }

    pub fn to_bytes(self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(&self).map_err(|err| ProtocolError::BadHandshake(err.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|err| ProtocolError::BadHandshake(err.to_string()))
    }
}

/// Write one frame and flush it.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let frame = message.to_frame();
    if frame.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(frame.len()));
    }
    writer.write_u32(frame.len() as u32).await?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A clean EOF before the length prefix reads as
/// [`ProtocolError::Closed`].
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message, ProtocolError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed);
        }
        Err(err) => return Err(ProtocolError::Io(err)),
    };
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Message::from_frame(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(message: Message) -> Message {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_message(&mut client, &message).await.unwrap();
        read_message(&mut server).await.unwrap()
    }

    #[tokio::test]
    async fn bare_commands_round_trip() {
        for message in [
            Message::GetData,
            Message::NoData,
            Message::Ack,
            Message::Nack,
            Message::Ping,
            Message::Pong,
        ] {
            assert_eq!(round_trip(message.clone()).await, message);
        }
    }

    #[tokio::test]
    async fn payload_commands_round_trip_arbitrary_bytes() {
        let blob = vec![0u8, 1, 255, b' ', 42, 0, 7];
        assert_eq!(
            round_trip(Message::Result(blob.clone())).await,
            Message::Result(blob.clone())
        );
        assert_eq!(
            round_trip(Message::Compute(blob.clone())).await,
            Message::Compute(blob)
        );
    }

    #[tokio::test]
    async fn several_frames_stream_back_to_back() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        write_message(&mut client, &Message::GetData).await.unwrap();
        write_message(&mut client, &Message::Result(b"abc".to_vec()))
            .await
            .unwrap();
        write_message(&mut client, &Message::Ping).await.unwrap();

        assert_eq!(read_message(&mut server).await.unwrap(), Message::GetData);
        assert_eq!(
            read_message(&mut server).await.unwrap(),
            Message::Result(b"abc".to_vec())
        );
        assert_eq!(read_message(&mut server).await.unwrap(), Message::Ping);
    }

    #[tokio::test]
    async fn eof_reads_as_closed() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert!(matches!(
            read_message(&mut server).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_u32(7).await.unwrap();
        client.write_all(b"EVOLVE!").await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_refused() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_u32(u32::MAX).await.unwrap();
        assert!(matches!(
            read_message(&mut server).await,
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn handshake_document_round_trips() {
        let handshake = Handshake::new(WireFormat::Xml);
        let bytes = handshake.to_bytes().unwrap();
        assert_eq!(Handshake::from_bytes(&bytes).unwrap(), handshake);
        assert!(Handshake::from_bytes(b"not json").is_err());
    }
}
