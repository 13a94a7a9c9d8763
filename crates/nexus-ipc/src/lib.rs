//! Framed wire protocol and RPC envelope for the Nexus kernel.
//!
//! Every connection carries length-prefixed frames with a fixed 12-byte
//! header followed by a JSON payload. The same framing serves both the
//! public RPC surface and the replicated-log transport.

mod envelope;

pub use envelope::{ErrorCode, RpcError, RpcRequest, RpcResponse};

use serde::{de::DeserializeOwned, Serialize};

/// Protocol version, low nibble of the type/version byte.
/// v1: initial framed JSON protocol
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic number for frames: "NX".
pub const IPC_MAGIC: [u8; 2] = *b"NX";

/// Frame types (high nibble of the type/version byte).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Request = 0,
    Response = 1,
    Heartbeat = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0 => Ok(FrameType::Request),
            1 => Ok(FrameType::Response),
            2 => Ok(FrameType::Heartbeat),
            _ => Err(()),
        }
    }
}

/// Frame header (12 bytes on the wire):
///
/// ```text
/// ┌──────────┬────────────┬─────────┬───────────┬───────────┐
/// │Magic (2B)│Type+Ver(1B)│Flags(1B)│Length(4B) │ SeqID(4B) │
/// │  "NX"    │ hi4=type   │reserved │ LE u32    │ LE u32    │
/// │          │ lo4=version│         │           │           │
/// └──────────┴────────────┴─────────┴───────────┴───────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub magic: [u8; 2],
    pub type_ver: u8,
    pub flags: u8,
    pub length: u32,
    pub seq_id: u32,
}

impl FrameHeader {
    pub const SIZE: usize = 12;

    /// Payloads above this are rejected before allocation.
    pub const MAX_LENGTH: usize = 64 * 1024 * 1024;

    pub fn new(frame_type: FrameType, length: u32, seq_id: u32) -> Self {
        Self {
            magic: IPC_MAGIC,
            type_ver: ((frame_type as u8) << 4) | (PROTOCOL_VERSION & 0x0F),
            flags: 0,
            length,
            seq_id,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == IPC_MAGIC && self.length as usize <= Self::MAX_LENGTH
    }

    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::try_from(self.type_ver >> 4).ok()
    }

    pub fn version(&self) -> u8 {
        self.type_ver & 0x0F
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.magic);
        bytes[2] = self.type_ver;
        bytes[3] = self.flags;
        bytes[4..8].copy_from_slice(&self.length.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.seq_id.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: [bytes[0], bytes[1]],
            type_ver: bytes[2],
            flags: bytes[3],
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            seq_id: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        }
    }
}

use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SEQ_ID: AtomicU32 = AtomicU32::new(1);

/// Next sequence id for request/response matching (wraps).
pub fn next_seq_id() -> u32 {
    NEXT_SEQ_ID.fetch_add(1, Ordering::Relaxed)
}

fn encode_payload<T: Serialize>(value: &T) -> std::io::Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if payload.len() > FrameHeader::MAX_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("payload too large: {} > {}", payload.len(), FrameHeader::MAX_LENGTH),
        ));
    }
    Ok(payload)
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> std::io::Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

/// Synchronous frame IO for blocking contexts.
pub mod frame_sync {
    use super::*;
    use std::io::{Read, Write};

    pub fn send_request<W: Write, T: Serialize>(writer: &mut W, body: &T) -> std::io::Result<u32> {
        let payload = encode_payload(body)?;
        let seq_id = next_seq_id();
        let header = FrameHeader::new(FrameType::Request, payload.len() as u32, seq_id);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(seq_id)
    }

    pub fn send_response<W: Write, T: Serialize>(
        writer: &mut W,
        body: &T,
        seq_id: u32,
    ) -> std::io::Result<()> {
        let payload = encode_payload(body)?;
        let header = FrameHeader::new(FrameType::Response, payload.len() as u32, seq_id);
        writer.write_all(&header.to_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_header<R: Read>(reader: &mut R) -> std::io::Result<FrameHeader> {
        let mut buf = [0u8; FrameHeader::SIZE];
        reader.read_exact(&mut buf)?;
        let header = FrameHeader::from_bytes(&buf);
        if !header.is_valid() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid frame header",
            ));
        }
        Ok(header)
    }

    pub fn read_frame<R: Read, T: DeserializeOwned>(
        reader: &mut R,
    ) -> std::io::Result<(FrameHeader, T)> {
        let header = read_header(reader)?;
        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload)?;
        Ok((header, decode_payload(&payload)?))
    }
}

/// Async frame IO for the daemon and clients running on tokio.
#[cfg(feature = "tokio")]
pub mod frame_async {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Default timeout for reads driven by the peer.
    pub const DEFAULT_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    /// Default timeout for writes.
    pub const DEFAULT_WRITE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

    pub async fn send_request<W, T>(writer: &mut W, body: &T) -> std::io::Result<u32>
    where
        W: AsyncWriteExt + Unpin,
        T: Serialize,
    {
        let payload = encode_payload(body)?;
        let seq_id = next_seq_id();
        let header = FrameHeader::new(FrameType::Request, payload.len() as u32, seq_id);
        writer.write_all(&header.to_bytes()).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(seq_id)
    }

    pub async fn send_response<W, T>(writer: &mut W, body: &T, seq_id: u32) -> std::io::Result<()>
    where
        W: AsyncWriteExt + Unpin,
        T: Serialize,
    {
        let payload = encode_payload(body)?;
        let header = FrameHeader::new(FrameType::Response, payload.len() as u32, seq_id);
        writer.write_all(&header.to_bytes()).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_header<R>(reader: &mut R) -> std::io::Result<FrameHeader>
    where
        R: AsyncReadExt + Unpin,
    {
        let mut buf = [0u8; FrameHeader::SIZE];
        reader.read_exact(&mut buf).await?;
        let header = FrameHeader::from_bytes(&buf);
        if !header.is_valid() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "invalid frame header",
            ));
        }
        Ok(header)
    }

    pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<(FrameHeader, T)>
    where
        R: AsyncReadExt + Unpin,
        T: DeserializeOwned,
    {
        let header = read_header(reader).await?;
        let mut payload = vec![0u8; header.length as usize];
        reader.read_exact(&mut payload).await?;
        Ok((header, decode_payload(&payload)?))
    }

    pub async fn read_frame_timeout<R, T>(
        reader: &mut R,
        timeout: std::time::Duration,
    ) -> std::io::Result<(FrameHeader, T)>
    where
        R: AsyncReadExt + Unpin,
        T: DeserializeOwned,
    {
        tokio::time::timeout(timeout, read_frame(reader))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "frame read timeout"))?
    }

    pub async fn send_heartbeat<W>(writer: &mut W) -> std::io::Result<u32>
    where
        W: AsyncWriteExt + Unpin,
    {
        let seq_id = next_seq_id();
        let header = FrameHeader::new(FrameType::Heartbeat, 0, seq_id);
        writer.write_all(&header.to_bytes()).await?;
        writer.flush().await?;
        Ok(seq_id)
    }

    pub fn is_heartbeat(header: &FrameHeader) -> bool {
        header.frame_type() == Some(FrameType::Heartbeat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = FrameHeader::new(FrameType::Request, 1234, 42);
        let parsed = FrameHeader::from_bytes(&header.to_bytes());
        assert!(parsed.is_valid());
        assert_eq!(parsed.frame_type(), Some(FrameType::Request));
        assert_eq!(parsed.version(), PROTOCOL_VERSION);
        assert_eq!(parsed.length, 1234);
        assert_eq!(parsed.seq_id, 42);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = FrameHeader::new(FrameType::Response, 0, 1).to_bytes();
        bytes[0] = b'?';
        assert!(!FrameHeader::from_bytes(&bytes).is_valid());
    }

    #[test]
    fn sync_frame_roundtrip() {
        let req = RpcRequest::new("read", serde_json::json!({ "path": "/a.txt" }));

        let mut buf = Vec::new();
        let seq = frame_sync::send_request(&mut buf, &req).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (header, parsed): (FrameHeader, RpcRequest) =
            frame_sync::read_frame(&mut cursor).unwrap();
        assert_eq!(header.seq_id, seq);
        assert_eq!(parsed.method, "read");
    }

    #[tokio::test]
    async fn async_frame_roundtrip() {
        let resp = RpcResponse::ok(serde_json::json!({ "etag": "abcd" }));

        let mut buf = Vec::new();
        frame_async::send_response(&mut buf, &resp, 7).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (header, parsed): (FrameHeader, RpcResponse) =
            frame_async::read_frame(&mut cursor).await.unwrap();
        assert_eq!(header.seq_id, 7);
        assert!(parsed.error.is_none());
    }
}
