//! DHT wire protocol: length-prefixed JSON frames.
//!
//! `u32-BE length | UTF-8 JSON payload` over a reliable bytestream. The JSON
//! envelope is `{type, id, tx_id?, data?}`; payload shapes per message type
//! live beside the envelope. Unparseable payloads are skipped silently;
//! length-field corruption desynchronizes the stream and closes the
//! connection.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_FRAME_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "PING")]
    Ping,
    #[serde(rename = "PONG")]
    Pong,
    #[serde(rename = "FIND_NODE")]
    FindNode,
    #[serde(rename = "NODES")]
    Nodes,
    #[serde(rename = "STORE")]
    Store,
    #[serde(rename = "STORED")]
    Stored,
    #[serde(rename = "FIND_VALUE")]
    FindValue,
    #[serde(rename = "VALUE")]
    Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Sender's node id, hex.
    pub id: String,
    /// Transaction token pairing requests with responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
    /// Sender's DHT listen port. The remote address only reveals an
    /// ephemeral source port, so routable peers advertise theirs here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// Payload shapes.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeData {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodesData {
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreData {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindValueData {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueData {
    pub values: Vec<serde_json::Value>,
}

impl Frame {
    pub fn request(kind: MessageKind, id: &str, tx_id: &str, data: Option<serde_json::Value>) -> Self {
        Frame {
            kind,
            id: id.to_string(),
            tx_id: Some(tx_id.to_string()),
            port: None,
            data,
        }
    }

    pub fn reply(&self, kind: MessageKind, id: &str, data: Option<serde_json::Value>) -> Self {
        Frame {
            kind,
            id: id.to_string(),
            tx_id: self.tx_id.clone(),
            port: None,
            data,
        }
    }

    pub fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .clone()
            .and_then(|d| serde_json::from_value(d).ok())
    }
}

pub enum FrameRead {
    /// Clean end of stream.
    Eof,
    /// Well-framed but unparseable payload; discard and keep reading.
    Skip,
    Msg(Frame),
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<FrameRead> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(FrameRead::Eof),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME_BYTES {
        // Cannot resynchronize after a bogus length; drop the connection.
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} out of bounds"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    match serde_json::from_slice::<Frame>(&payload) {
        Ok(frame) => Ok(FrameRead::Msg(frame)),
        Err(_) => Ok(FrameRead::Skip),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too large",
        ));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::request(
            MessageKind::FindNode,
            "aa".repeat(32).as_str(),
            "0011223344556677",
            Some(serde_json::json!({"target": "bb"})),
        );
        write_frame(&mut a, &frame).await.unwrap();
        match read_frame(&mut b).await.unwrap() {
            FrameRead::Msg(got) => {
                assert_eq!(got.kind, MessageKind::FindNode);
                assert_eq!(got.tx_id.as_deref(), Some("0011223344556677"));
            }
            _ => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn unparseable_payload_is_skipped() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let garbage = b"{not json";
        a.write_all(&(garbage.len() as u32).to_be_bytes())
            .await
            .unwrap();
        a.write_all(garbage).await.unwrap();
        assert!(matches!(read_frame(&mut b).await.unwrap(), FrameRead::Skip));
    }

    #[tokio::test]
    async fn oversized_length_kills_the_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        assert!(read_frame(&mut b).await.is_err());
    }

    #[tokio::test]
    async fn clean_close_reads_as_eof() {
        let (a, mut b) = tokio::io::duplex(16);
        drop(a);
        assert!(matches!(read_frame(&mut b).await.unwrap(), FrameRead::Eof));
    }

    #[test]
    fn wire_type_names_are_upper_snake() {
        let frame = Frame::request(MessageKind::FindValue, "id", "tx", None);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"FIND_VALUE""#), "{json}");
    }
}
