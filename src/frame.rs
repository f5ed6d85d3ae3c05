//! Wire frames shared by the forwarder, NAT'ed servers and clients.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! [kind:1][addr_len:2][content_len:4][address][content]
//! ```
//!
//! The address is an opaque routing identifier: the client id for per-client
//! frames, the server id for `INIT_SERVER`, the forwarder id for status
//! replies. Content is interpreted per kind (see [`Frame`]).

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

/// Address used by the forwarder on the frames it originates.
pub const FORWARDER_ID: &str = "FFFFFFFFFFFF";

/// Addresses starting with this prefix are control-plane streams.
pub const CONTROL_PREFIX: &str = "!rpc:";

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 7;

/// Default upper bound for a frame's content.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Longest identifier accepted from applications.
pub const MAX_ID_LEN: usize = 255;

/// Content is buffered at most this much ahead of what has arrived.
const CONTENT_CHUNK: usize = 64 * 1024;

pub const DATA_FORWARD: u8 = 0;
pub const CONN_TERM: u8 = 1;
pub const CONN_BUF_SIZE: u8 = 2;
pub const INIT_SERVER: u8 = 3;
pub const INIT_CLIENT: u8 = 4;
pub const STATUS_CONFIRMED: u8 = 5;
pub const STATUS_NO_SERVER: u8 = 6;
pub const STATUS_BSY_SERVER: u8 = 7;
pub const STATUS_FAILED: u8 = 8;

/// Forwarder answer to an `INIT_SERVER` / `INIT_CLIENT` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Confirmed,
    NoServer,
    BusyServer,
    Failed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Confirmed => "CONFIRMED",
            Self::NoServer => "NO_SERVER",
            Self::BusyServer => "BSY_SERVER",
            Self::Failed => "FAILED",
        }
    }

    fn kind(self) -> u8 {
        match self {
            Self::Confirmed => STATUS_CONFIRMED,
            Self::NoServer => STATUS_NO_SERVER,
            Self::BusyServer => STATUS_BSY_SERVER,
            Self::Failed => STATUS_FAILED,
        }
    }
}

/// Target of a client connection: which server identity and which of its
/// registered ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInit {
    pub server: String,
    pub port: u16,
}

/// One self-delimiting wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A NAT'ed server announces itself and the credit each new client starts with.
    InitServer { server: String, credit: u32 },
    /// A client asks to be connected to `target`.
    InitClient { client: String, target: ClientInit },
    /// Payload for the logical connection named by `address`.
    Data { address: String, payload: Bytes },
    /// The logical connection named by `address` is closed.
    ConnTerm { address: String },
    /// Replaces the receiver's send budget for `address`.
    BufSize { address: String, size: u32 },
    /// Forwarder reply to an init request, addressed from the forwarder's identity.
    Status { status: Status, forwarder: String },
}

impl Frame {
    pub fn data(address: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self::Data {
            address: address.into(),
            payload: payload.into(),
        }
    }

    pub fn term(address: impl Into<String>) -> Self {
        Self::ConnTerm {
            address: address.into(),
        }
    }

    pub fn buf_size(address: impl Into<String>, size: u32) -> Self {
        Self::BufSize {
            address: address.into(),
            size,
        }
    }

    /// Status reply from a forwarder using the default identity.
    pub fn status(status: Status) -> Self {
        Self::status_from(FORWARDER_ID, status)
    }

    pub fn status_from(forwarder: impl Into<String>, status: Status) -> Self {
        Self::Status {
            status,
            forwarder: forwarder.into(),
        }
    }

    pub fn init_server(server: impl Into<String>, credit: u32) -> Self {
        Self::InitServer {
            server: server.into(),
            credit,
        }
    }

    pub fn init_client(client: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self::InitClient {
            client: client.into(),
            target: ClientInit {
                server: server.into(),
                port,
            },
        }
    }

    /// Numeric kind as written on the wire.
    pub fn kind(&self) -> u8 {
        match self {
            Self::Data { .. } => DATA_FORWARD,
            Self::ConnTerm { .. } => CONN_TERM,
            Self::BufSize { .. } => CONN_BUF_SIZE,
            Self::InitServer { .. } => INIT_SERVER,
            Self::InitClient { .. } => INIT_CLIENT,
            Self::Status { status, .. } => status.kind(),
        }
    }

    /// Routing identifier carried in the header.
    pub fn address(&self) -> &str {
        match self {
            Self::InitServer { server, .. } => server,
            Self::InitClient { client, .. } => client,
            Self::Data { address, .. }
            | Self::ConnTerm { address }
            | Self::BufSize { address, .. } => address,
            Self::Status { forwarder, .. } => forwarder,
        }
    }

    /// Serialize into a single contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let content: Bytes = match self {
            Self::InitServer { credit, .. } => Bytes::copy_from_slice(&credit.to_be_bytes()),
            Self::BufSize { size, .. } => Bytes::copy_from_slice(&size.to_be_bytes()),
            Self::InitClient { target, .. } => {
                // A two-field struct of String/u16 always serializes.
                Bytes::from(serde_json::to_vec(target).unwrap_or_default())
            }
            Self::Data { payload, .. } => payload.clone(),
            Self::ConnTerm { .. } | Self::Status { .. } => Bytes::new(),
        };
        let address = self.address().as_bytes();

        let mut buf = BytesMut::with_capacity(HEADER_LEN + address.len() + content.len());
        buf.put_u8(self.kind());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u16(address.len() as u16);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(content.len() as u32);
        buf.put_slice(address);
        buf.put_slice(&content);
        buf.freeze()
    }
}

/// Whether `id` may be used as a client or server identifier by applications.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_ID_LEN && !is_control_address(id)
}

pub fn is_control_address(address: &str) -> bool {
    address.starts_with(CONTROL_PREFIX)
}

/// Read exactly one frame, waiting for as many socket reads as it takes.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let kind = header[0];
    let addr_len = usize::from(u16::from_be_bytes([header[1], header[2]]));
    let content_len = u32::from_be_bytes([header[3], header[4], header[5], header[6]]) as usize;

    if kind > STATUS_FAILED {
        return Err(FrameError::header(format!("unknown frame kind {kind}")));
    }
    if content_len > max_frame_size {
        return Err(FrameError::header(format!(
            "content length {content_len} exceeds limit {max_frame_size}"
        )));
    }

    let mut address = vec![0u8; addr_len];
    reader.read_exact(&mut address).await?;
    let address = String::from_utf8(address)
        .map_err(|_| FrameError::header("address is not valid UTF-8"))?;

    // Grows with the bytes that actually arrive, not with the header's claim.
    let mut content = BytesMut::with_capacity(content_len.min(CONTENT_CHUNK));
    while content.len() < content_len {
        let want = (content_len - content.len()).min(CONTENT_CHUNK);
        content.reserve(want);
        let n = (&mut *reader).take(want as u64).read_buf(&mut content).await?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame content cut short").into());
        }
    }

    decode_body(kind, address, content.freeze())
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

fn decode_body(kind: u8, address: String, content: Bytes) -> Result<Frame, FrameError> {
    let frame = match kind {
        DATA_FORWARD => Frame::Data {
            address,
            payload: content,
        },
        CONN_TERM => Frame::ConnTerm { address },
        CONN_BUF_SIZE => Frame::BufSize {
            address,
            size: decode_u32(&content, "CONN_BUF_SIZE")?,
        },
        INIT_SERVER => Frame::InitServer {
            server: address,
            credit: decode_u32(&content, "INIT_SERVER")?,
        },
        INIT_CLIENT => {
            let target = serde_json::from_slice(&content)
                .map_err(|e| FrameError::header(format!("INIT_CLIENT content: {e}")))?;
            Frame::InitClient {
                client: address,
                target,
            }
        }
        STATUS_CONFIRMED => Frame::status_from(address, Status::Confirmed),
        STATUS_NO_SERVER => Frame::status_from(address, Status::NoServer),
        STATUS_BSY_SERVER => Frame::status_from(address, Status::BusyServer),
        STATUS_FAILED => Frame::status_from(address, Status::Failed),
        other => return Err(FrameError::header(format!("unknown frame kind {other}"))),
    };
    Ok(frame)
}

fn decode_u32(content: &[u8], what: &str) -> Result<u32, FrameError> {
    let raw: [u8; 4] = content
        .try_into()
        .map_err(|_| FrameError::header(format!("{what} content must be 4 bytes")))?;
    Ok(u32::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn round_trip(frame: Frame) -> Frame {
        // Small pipe so large frames need many reads.
        let (mut tx, mut rx) = duplex(8 * 1024);
        let sent = frame.clone();
        let writer = tokio::spawn(async move { write_frame(&mut tx, &sent).await });
        let got = read_frame(&mut rx, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
        writer.await.unwrap().unwrap();
        got
    }

    #[tokio::test]
    async fn test_data_round_trip_sizes() {
        for size in [0usize, 1, 1500, 3 * 1024 * 1024 + 17] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let frame = Frame::data("cli-1", payload);
            assert_eq!(round_trip(frame.clone()).await, frame, "size {size}");
        }
    }

    #[tokio::test]
    async fn test_control_frames_round_trip() {
        let frames = vec![
            Frame::init_server("srv-A", 4096),
            Frame::init_client("cli-1", "srv-A", 80),
            Frame::term("cli-1"),
            Frame::buf_size("cli-1", 65536),
            Frame::status(Status::Confirmed),
            Frame::status(Status::NoServer),
            Frame::status(Status::BusyServer),
            Frame::status(Status::Failed),
        ];
        for frame in frames {
            assert_eq!(round_trip(frame.clone()).await, frame);
        }
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&Frame::data("a", &b"one"[..]).encode());
        wire.extend_from_slice(&Frame::term("a").encode());
        let mut reader = &wire[..];
        assert_eq!(
            read_frame(&mut reader, 1024).await.unwrap(),
            Frame::data("a", &b"one"[..])
        );
        assert_eq!(read_frame(&mut reader, 1024).await.unwrap(), Frame::term("a"));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_header_error() {
        let mut wire = Frame::term("a").encode().to_vec();
        wire[0] = 42;
        let err = read_frame(&mut &wire[..], 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Header(_)));
    }

    #[tokio::test]
    async fn test_oversized_content_is_header_error() {
        let wire = Frame::data("a", vec![0u8; 100]).encode();
        let err = read_frame(&mut &wire[..], 99).await.unwrap_err();
        assert!(matches!(err, FrameError::Header(_)));
    }

    #[tokio::test]
    async fn test_bad_buf_size_content_is_header_error() {
        let mut wire = Frame::data("a", &b"123"[..]).encode().to_vec();
        wire[0] = CONN_BUF_SIZE;
        let err = read_frame(&mut &wire[..], 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Header(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_connection_error() {
        let wire = Frame::data("cli-1", vec![7u8; 64]).encode();
        let cut = &wire[..wire.len() - 10];
        let err = read_frame(&mut &cut[..], 1024).await.unwrap_err();
        assert!(matches!(err, FrameError::Connection(_)));
    }

    #[test]
    fn test_status_address_is_forwarder() {
        assert_eq!(Frame::status(Status::NoServer).address(), FORWARDER_ID);
        assert_eq!(Frame::status_from("FWD-2", Status::NoServer).address(), "FWD-2");
    }

    #[tokio::test]
    async fn test_status_keeps_forwarder_identity() {
        let frame = Frame::status_from("FWD-2", Status::BusyServer);
        let got = round_trip(frame.clone()).await;
        assert_eq!(got, frame);
        assert_eq!(got.address(), "FWD-2");
    }

    #[tokio::test]
    async fn test_claimed_length_without_content_is_connection_error() {
        // Header claims 32 MiB but the peer sends only a few bytes.
        let mut wire = Vec::new();
        wire.push(DATA_FORWARD);
        wire.extend_from_slice(&1u16.to_be_bytes());
        wire.extend_from_slice(&(32u32 * 1024 * 1024).to_be_bytes());
        wire.extend_from_slice(b"a");
        wire.extend_from_slice(b"tiny");
        let err = read_frame(&mut &wire[..], DEFAULT_MAX_FRAME_SIZE).await.unwrap_err();
        assert!(matches!(err, FrameError::Connection(_)));
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("srv-A"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("!rpc:7"));
        assert!(!is_valid_id(&"x".repeat(MAX_ID_LEN + 1)));
    }
}
