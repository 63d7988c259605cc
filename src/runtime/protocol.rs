//! Wire protocol spoken with world servers
//!
//! Every message is a JSON object terminated by a configurable delimiter
//! string. The first message on a connection must be `Auth`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames larger than this are treated as a protocol violation
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Requests sent to a world server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Auth { pass: String },
    Spawn {
        session: String,
        name: String,
        position: [f64; 3],
    },
    UnfreezeAll { session: String },
    Move { name: String, delta: [f64; 3] },
    GetPosition { name: String },
    Despawn { name: String },
    DestroyAll { session: String },
    ListPlanets,
    ListUnits,
}

/// Planet as reported by a world server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePlanet {
    pub name: String,
    pub position: [f64; 3],
}

/// Replies from a world server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Position { name: String, position: [f64; 3] },
    Destroyed { count: usize },
    Planets { planets: Vec<WirePlanet> },
    Units { names: Vec<String> },
    Error { message: String },
}

/// Serialize a message followed by the delimiter
pub fn encode_frame<T: Serialize>(
    message: &T,
    delimiter: &str,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.extend_from_slice(delimiter.as_bytes());
    Ok(bytes)
}

/// Incremental reader that splits a byte stream on the delimiter
#[derive(Debug)]
pub struct FrameReader {
    delimiter: Vec<u8>,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new(delimiter: &str) -> Self {
        Self {
            delimiter: delimiter.as_bytes().to_vec(),
            buffer: Vec::new(),
        }
    }

    /// Pop one complete frame out of the buffer, if there is one
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        if self.delimiter.is_empty() {
            return None;
        }
        let pos = self
            .buffer
            .windows(self.delimiter.len())
            .position(|w| w == self.delimiter.as_slice())?;
        let frame = self.buffer[..pos].to_vec();
        self.buffer.drain(..pos + self.delimiter.len());
        Some(frame)
    }

    /// Read until a full frame is available. `Ok(None)` means the peer
    /// closed the connection cleanly between frames.
    pub async fn read_frame<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
    ) -> std::io::Result<Option<Vec<u8>>> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = self.take_frame() {
                return Ok(Some(frame));
            }
            if self.buffer.len() > MAX_FRAME_BYTES {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "frame exceeds maximum size",
                ));
            }
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELIM: &str = "<???DONE???---";

    #[test]
    fn test_request_tagging() {
        let json = serde_json::to_string(&Request::UnfreezeAll {
            session: "float32_Standard".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"unfreeze_all","session":"float32_Standard"}"#);
        let list = serde_json::to_string(&Request::ListPlanets).unwrap();
        assert_eq!(list, r#"{"type":"list_planets"}"#);
    }

    #[tokio::test]
    async fn test_reader_splits_concatenated_frames() {
        let mut wire = encode_frame(&Response::Ok, DELIM).unwrap();
        wire.extend(
            encode_frame(
                &Response::Position {
                    name: "u".into(),
                    position: [1.0, 2.0, 3.0],
                },
                DELIM,
            )
            .unwrap(),
        );
        let mut cursor = std::io::Cursor::new(wire);
        let mut reader = FrameReader::new(DELIM);

        let frame = reader.read_frame(&mut cursor).await.unwrap().unwrap();
        let first: Response = serde_json::from_slice(&frame).unwrap();
        assert_eq!(first, Response::Ok);
        let frame = reader.read_frame(&mut cursor).await.unwrap().unwrap();
        let second: Response = serde_json::from_slice(&frame).unwrap();
        assert!(matches!(second, Response::Position { .. }));
        assert!(reader.read_frame(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_rejects_truncated_frame() {
        let mut cursor = std::io::Cursor::new(br#"{"type":"ok""#.to_vec());
        let mut reader = FrameReader::new(DELIM);
        let err = reader.read_frame(&mut cursor).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
