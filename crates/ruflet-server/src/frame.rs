//! WebSocket handshake and framing over a raw byte stream.
//!
//! Each frame is treated as one complete message; continuation frames are not
//! reassembled. Client frames are masked, server frames never are.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use ruflet_core::error::{Result, RufletError};

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

const MAX_HEADER_LINES: usize = 100;
const MAX_HEADER_LINE_LEN: usize = 8 * 1024;
const MAX_PAYLOAD_LEN: u64 = 64 * 1024 * 1024;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// The parsed request line and headers of an upgrade request.
/// Header names are lowercased.
#[derive(Debug, Clone, Default)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl UpgradeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Check that this is a websocket upgrade for `path`; returns the client key.
    pub fn validate(&self, path: &str) -> Result<&str> {
        let reject = |reason: &str| Err(RufletError::HandshakeRejected(reason.to_string()));

        if self.method != "GET" {
            return reject(&format!("unsupported method {}", self.method));
        }
        if self.path != path {
            return reject(&format!("unexpected path {}", self.path));
        }
        if !self
            .header("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
        {
            return reject("missing Upgrade: websocket");
        }
        if !self
            .header("connection")
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"))
        {
            return reject("missing Connection: upgrade");
        }
        match self.header("sec-websocket-key") {
            Some(key) if !key.is_empty() => Ok(key),
            _ => reject("missing Sec-WebSocket-Key"),
        }
    }
}

/// Read the request line and header block, up to the blank line.
pub async fn read_upgrade_request<R>(reader: &mut R) -> Result<UpgradeRequest>
where
    R: AsyncBufRead + Unpin,
{
    let request_line = read_header_line(reader)
        .await?
        .ok_or_else(|| RufletError::HandshakeRejected("empty request".into()))?;

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let mut headers = HashMap::new();
    for _ in 0..MAX_HEADER_LINES {
        let Some(line) = read_header_line(reader).await? else {
            break;
        };
        if line.is_empty() {
            return Ok(UpgradeRequest { method, path, headers });
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Err(RufletError::HandshakeRejected("unterminated header block".into()))
}

async fn read_header_line<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_HEADER_LINE_LEN as u64)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() != Some(&b'\n') {
        return Err(RufletError::HandshakeRejected("header line too long".into()));
    }
    let line = String::from_utf8(buf).map_err(|_| RufletError::InvalidUtf8)?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// `base64(sha1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

pub async fn write_upgrade_response<W>(writer: &mut W, key: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// One decoded frame, payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u8,
    pub payload: Vec<u8>,
}

/// XOR `payload` in place with the 4-byte masking key.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Serialize an unmasked (server → client) frame with FIN set.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(0x80 | (opcode & 0x0f));
    match payload.len() {
        len if len < 126 => out.push(len as u8),
        len if len <= u16::MAX as usize => {
            out.push(126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(payload);
    out
}

pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read one frame. `None` on a clean end of stream before a frame starts;
    /// a stream ending mid-frame is an error.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut first = [0u8; 1];
        if self.inner.read(&mut first).await? == 0 {
            return Ok(None);
        }
        let second = self.inner.read_u8().await?;

        let opcode = first[0] & 0x0f;
        let masked = second & 0x80 != 0;
        let len = match second & 0x7f {
            126 => u64::from(self.inner.read_u16().await?),
            127 => self.inner.read_u64().await?,
            n => u64::from(n),
        };
        if len > MAX_PAYLOAD_LEN {
            return Err(RufletError::Protocol(format!("frame payload too large: {len} bytes")));
        }

        let mask = if masked {
            let mut key = [0u8; 4];
            self.inner.read_exact(&mut key).await?;
            Some(key)
        } else {
            None
        };

        let mut payload = vec![0u8; len as usize];
        self.inner.read_exact(&mut payload).await?;
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame { opcode, payload }))
    }

    /// Read the next application message.
    ///
    /// Pings are answered through `writer` and skipped, pongs are skipped,
    /// and a close frame ends the stream.
    pub async fn read_message(&mut self, writer: &FrameWriter) -> Result<Option<Vec<u8>>> {
        loop {
            let Some(frame) = self.read_frame().await? else {
                return Ok(None);
            };
            match frame.opcode {
                OP_TEXT | OP_BINARY => return Ok(Some(frame.payload)),
                OP_PING => writer.send(OP_PONG, &frame.payload).await?,
                OP_PONG => {}
                OP_CLOSE => {
                    debug!("Close frame received");
                    return Ok(None);
                }
                other => {
                    return Err(RufletError::Protocol(format!("unsupported opcode {other:#x}")));
                }
            }
        }
    }
}

type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Write half of a connection. Each frame is written under one lock so
/// concurrent senders never interleave.
pub struct FrameWriter {
    inner: Mutex<BoxedWrite>,
    closed: AtomicBool,
}

impl FrameWriter {
    pub fn new<W>(inner: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            inner: Mutex::new(Box::new(inner)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "connection closed").into());
        }
        let frame = encode_frame(opcode, payload);
        let mut inner = self.inner.lock().await;
        inner.write_all(&frame).await?;
        inner.flush().await?;
        Ok(())
    }

    pub async fn send_binary(&self, payload: &[u8]) -> Result<()> {
        self.send(OP_BINARY, payload).await
    }

    /// Send a close frame and shut the stream down. Safe to call repeatedly.
    ///
    /// Gives up after a short timeout when the peer has stopped reading; the
    /// stream is then released when the writer is dropped.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let shutdown = async {
            let mut inner = self.inner.lock().await;
            let _ = inner.write_all(&encode_frame(OP_CLOSE, &[])).await;
            let _ = inner.shutdown().await;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
            debug!("Peer not reading, skipped close frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{BufReader, duplex};

    /// Build a masked client frame.
    fn client_frame(opcode: u8, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = vec![0x80 | opcode];
        match payload.len() {
            len if len < 126 => out.push(0x80 | len as u8),
            len if len <= u16::MAX as usize => {
                out.push(0x80 | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(0x80 | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }
        out.extend_from_slice(&key);
        let mut body = payload.to_vec();
        apply_mask(&mut body, key);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_mask_uses_key_index_mod_4() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, key);
        assert_eq!(data, vec![0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        apply_mask(&mut data, key);
        assert_eq!(data, b"Hello");
    }

    #[test]
    fn test_encode_frame_length_forms() {
        assert_eq!(encode_frame(OP_BINARY, &[1, 2, 3]), vec![0x82, 3, 1, 2, 3]);
        let medium = encode_frame(OP_BINARY, &[0u8; 126]);
        assert_eq!(&medium[..4], &[0x82, 126, 0, 126]);
        let large = encode_frame(OP_BINARY, &vec![0u8; 70_000]);
        assert_eq!(large[1], 127);
        assert_eq!(&large[2..10], &70_000u64.to_be_bytes());
    }

    #[tokio::test]
    async fn test_read_upgrade_request_and_validate() {
        let raw = "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: WebSocket\r\n\
                   Connection: keep-alive, Upgrade\r\nSec-WebSocket-Key: abc==\r\n\r\n";
        let mut reader = BufReader::new(raw.as_bytes());
        let req = read_upgrade_request(&mut reader).await.unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.validate("/ws").unwrap(), "abc==");
        assert!(matches!(req.validate("/other"), Err(RufletError::HandshakeRejected(_))));
    }

    #[tokio::test]
    async fn test_handshake_rejections() {
        let cases = [
            "POST /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\n\r\n",
            "GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nSec-WebSocket-Key: k\r\n\r\n",
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: close\r\nSec-WebSocket-Key: k\r\n\r\n",
            "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: \r\n\r\n",
        ];
        for raw in cases {
            let req = read_upgrade_request(&mut BufReader::new(raw.as_bytes()))
                .await
                .unwrap();
            assert!(req.validate("/ws").is_err(), "accepted: {raw:?}");
        }

        let truncated = "GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n";
        assert!(
            read_upgrade_request(&mut BufReader::new(truncated.as_bytes()))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_write_upgrade_response() {
        let mut out = Vec::new();
        write_upgrade_response(&mut out, "dGhlIHNhbXBsZSBub25jZQ==").await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_masked_frames_of_each_length() {
        let key = [1, 2, 3, 4];
        let mut input = Vec::new();
        for len in [5usize, 300, 70_000] {
            input.extend(client_frame(OP_BINARY, &vec![7u8; len], key));
        }
        let mut reader = FrameReader::new(input.as_slice());
        for len in [5usize, 300, 70_000] {
            let frame = reader.read_frame().await.unwrap().unwrap();
            assert_eq!(frame.opcode, OP_BINARY);
            assert_eq!(frame.payload, vec![7u8; len]);
        }
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let mut input = client_frame(OP_BINARY, b"hello", [9, 9, 9, 9]);
        input.pop();
        let mut reader = FrameReader::new(input.as_slice());
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_partial_header_is_error() {
        let mut empty = FrameReader::new(&b""[..]);
        assert!(empty.read_frame().await.unwrap().is_none());

        let mut half = FrameReader::new(&[0x82u8][..]);
        assert!(half.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stalled_peer() {
        let (_client, server) = duplex(16);
        let writer = FrameWriter::new(server);
        let stalled = tokio::time::timeout(Duration::from_millis(100), writer.send_binary(&[0u8; 64])).await;
        assert!(stalled.is_err());

        tokio::time::timeout(Duration::from_secs(3), writer.close())
            .await
            .expect("close blocked on a full buffer");
        assert!(writer.is_closed());
    }

    #[tokio::test]
    async fn test_ping_answered_then_message_delivered() {
        let key = [0xaa, 0xbb, 0xcc, 0xdd];
        let mut input = client_frame(OP_PING, b"are-you-there", key);
        input.extend(client_frame(OP_PONG, b"ignored", key));
        input.extend(client_frame(OP_BINARY, b"payload", key));
        input.extend(client_frame(OP_CLOSE, &[], key));

        let (client, server) = duplex(1024);
        let writer = FrameWriter::new(server);
        let mut reader = FrameReader::new(input.as_slice());

        let msg = reader.read_message(&writer).await.unwrap();
        assert_eq!(msg.as_deref(), Some(&b"payload"[..]));
        assert!(reader.read_message(&writer).await.unwrap().is_none());

        drop(writer);
        let mut written = Vec::new();
        let mut client = client;
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, encode_frame(OP_PONG, b"are-you-there"));
    }

    #[tokio::test]
    async fn test_unsupported_opcode_is_error() {
        let input = client_frame(0x3, b"", [0, 0, 0, 0]);
        let (_client, server) = duplex(64);
        let writer = FrameWriter::new(server);
        let mut reader = FrameReader::new(input.as_slice());
        assert!(matches!(
            reader.read_message(&writer).await,
            Err(RufletError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut client, server) = duplex(64);
        let writer = FrameWriter::new(server);
        writer.close().await;
        writer.close().await;
        assert!(writer.is_closed());
        assert!(writer.send_binary(b"late").await.is_err());

        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, encode_frame(OP_CLOSE, &[]));
    }
}
