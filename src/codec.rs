//! Control-frame codec
//!
//! Frames are decoded once, here, into [`Frame`]; session code never looks at the
//! raw sentinels. The only binary field on the control channel is the 4-byte
//! big-endian data-plane port that answers a `START_TRANSFER`.

use anyhow::Result;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ProtocolError;
use crate::protocol::{frame, FIELD_SEP, FRAME_CLOSE, FRAME_OPEN, MAX_FRAME_LEN, PORT_FIELD_LEN};

/// Path and size carried by the parameterised frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAnnounce {
    pub path: String,
    pub size: u64,
}

impl FileAnnounce {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Last path component, used to name staging and result files.
    /// `None` for empty names and `..`.
    pub fn file_name(&self) -> Option<&str> {
        std::path::Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// worker -> coordinator
    TransferRequest,
    /// coordinator -> worker, answered by the port field
    StartTransfer(FileAnnounce),
    /// coordinator -> worker, pool exhausted
    EndTransfer,
    /// coordinator -> worker, once per session, payload follows inline
    HashFileAnnounce(FileAnnounce),
    /// worker -> coordinator, last frame of a session
    ProcessingComplete,
    /// worker -> coordinator, unsolicited, payload follows inline
    ProcessingOutput(FileAnnounce),
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Frame::TransferRequest => "TRANSFER_REQUEST",
            Frame::StartTransfer(_) => "START_TRANSFER",
            Frame::EndTransfer => "END_TRANSFER",
            Frame::HashFileAnnounce(_) => "START_HASHES_TRANSFER",
            Frame::ProcessingComplete => "PROCESSING_COMPLETE",
            Frame::ProcessingOutput(_) => "PROCESSING_OUTPUT",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let text = match self {
            Frame::TransferRequest => frame::TRANSFER_REQUEST.to_string(),
            Frame::EndTransfer => frame::END_TRANSFER.to_string(),
            Frame::ProcessingComplete => frame::PROCESSING_COMPLETE.to_string(),
            Frame::StartTransfer(a) => encode_announce(frame::START_TRANSFER, a)?,
            Frame::HashFileAnnounce(a) => encode_announce(frame::START_HASHES_TRANSFER, a)?,
            Frame::ProcessingOutput(a) => encode_announce(frame::PROCESSING_OUTPUT, a)?,
        };
        if text.len() > MAX_FRAME_LEN {
            return Err(ProtocolError::TooLong { max: MAX_FRAME_LEN });
        }
        Ok(text.into_bytes())
    }

    /// Decode one complete frame, sentinels included
    pub fn decode(raw: &[u8]) -> Result<Frame, ProtocolError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProtocolError::Malformed(String::from_utf8_lossy(raw).into_owned()))?;
        match text {
            frame::TRANSFER_REQUEST => return Ok(Frame::TransferRequest),
            frame::END_TRANSFER => return Ok(Frame::EndTransfer),
            frame::PROCESSING_COMPLETE => return Ok(Frame::ProcessingComplete),
            _ => {}
        }
        if let Some(body) = strip(text, frame::START_TRANSFER) {
            return decode_announce(body).map(Frame::StartTransfer);
        }
        if let Some(body) = strip(text, frame::START_HASHES_TRANSFER) {
            return decode_announce(body).map(Frame::HashFileAnnounce);
        }
        if let Some(body) = strip(text, frame::PROCESSING_OUTPUT) {
            return decode_announce(body).map(Frame::ProcessingOutput);
        }
        Err(ProtocolError::Malformed(text.to_string()))
    }
}

fn strip<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.strip_prefix(prefix)?.strip_suffix(frame::SUFFIX)
}

fn encode_announce(prefix: &str, a: &FileAnnounce) -> Result<String, ProtocolError> {
    // The decoder splits on the first ':' and stops at the first '>'
    if a.path.is_empty() || a.path.contains([FIELD_SEP, '<', '>']) {
        return Err(ProtocolError::UnencodablePath(a.path.clone()));
    }
    Ok(format!("{prefix}{}{FIELD_SEP}{}{}", a.path, a.size, frame::SUFFIX))
}

fn decode_announce(body: &str) -> Result<FileAnnounce, ProtocolError> {
    let (path, size) = body
        .split_once(FIELD_SEP)
        .ok_or_else(|| ProtocolError::MissingSeparator(body.to_string()))?;
    if path.is_empty() {
        return Err(ProtocolError::Malformed(body.to_string()));
    }
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::InvalidSize(size.to_string()));
    }
    let size = size
        .parse::<u64>()
        .map_err(|_| ProtocolError::InvalidSize(size.to_string()))?;
    Ok(FileAnnounce::new(path, size))
}

pub fn encode_port(port: u16) -> [u8; PORT_FIELD_LEN] {
    i32::from(port).to_be_bytes()
}

pub fn decode_port(raw: [u8; PORT_FIELD_LEN]) -> Result<u16, ProtocolError> {
    let value = i32::from_be_bytes(raw);
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ProtocolError::InvalidPort(value)),
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Read the next frame.
///
/// `idle` bounds the wait for the first byte (`None` waits forever); once a frame
/// has started, the rest of it must arrive within `frame_timeout`.
pub async fn read_frame<R>(reader: &mut R, idle: Option<Duration>, frame_timeout: Duration) -> Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let available = match idle {
        Some(limit) => timeout(limit, reader.fill_buf())
            .await
            .map_err(|_| ProtocolError::Timeout {
                what: "waiting for frame",
                ms: ms(limit),
            })??
            .len(),
        None => reader.fill_buf().await?.len(),
    };
    if available == 0 {
        return Err(ProtocolError::ConnectionClosed.into());
    }

    let mut raw = Vec::with_capacity(64);
    let mut bounded = (&mut *reader).take(MAX_FRAME_LEN as u64);
    timeout(frame_timeout, bounded.read_until(FRAME_CLOSE, &mut raw))
        .await
        .map_err(|_| ProtocolError::Timeout {
            what: "frame read",
            ms: ms(frame_timeout),
        })??;

    if raw.first() != Some(&FRAME_OPEN) {
        return Err(ProtocolError::Malformed(String::from_utf8_lossy(&raw).into_owned()).into());
    }
    if raw.last() != Some(&FRAME_CLOSE) {
        if raw.len() >= MAX_FRAME_LEN {
            return Err(ProtocolError::TooLong { max: MAX_FRAME_LEN }.into());
        }
        return Err(ProtocolError::ConnectionClosed.into());
    }
    Ok(Frame::decode(&raw)?)
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame, frame_timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.encode()?;
    timeout(frame_timeout, async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ProtocolError::Timeout {
        what: "frame write",
        ms: ms(frame_timeout),
    })??;
    Ok(())
}

pub async fn read_port<R>(reader: &mut R, limit: Duration) -> Result<u16>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = [0u8; PORT_FIELD_LEN];
    match timeout(limit, reader.read_exact(&mut raw)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::ConnectionClosed.into())
        }
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ProtocolError::Timeout {
                what: "port field read",
                ms: ms(limit),
            }
            .into())
        }
    }
    Ok(decode_port(raw)?)
}

pub async fn write_port<W>(writer: &mut W, port: u16, limit: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    timeout(limit, async {
        writer.write_all(&encode_port(port)).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| ProtocolError::Timeout {
        what: "port field write",
        ms: ms(limit),
    })??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    const T: Duration = Duration::from_millis(500);

    #[test]
    fn start_transfer_round_trip() {
        let frame = Frame::StartTransfer(FileAnnounce::new("/pool/rockyou-part-03.txt", 10_485_760));
        let wire = frame.encode().unwrap();
        assert_eq!(wire, b"<START_TRANSFER:/pool/rockyou-part-03.txt:10485760>".to_vec());
        assert_eq!(Frame::decode(&wire).unwrap(), frame);

        let zero = Frame::StartTransfer(FileAnnounce::new("empty.txt", 0));
        assert_eq!(Frame::decode(&zero.encode().unwrap()).unwrap(), zero);
    }

    #[test]
    fn bare_frames_are_bit_exact() {
        assert_eq!(Frame::TransferRequest.encode().unwrap(), b"<TRANSFER_REQUEST>");
        assert_eq!(Frame::EndTransfer.encode().unwrap(), b"<END_TRANSFER>");
        assert_eq!(Frame::ProcessingComplete.encode().unwrap(), b"<PROCESSING_COMPLETE>");
        assert_eq!(
            Frame::HashFileAnnounce(FileAnnounce::new("/etc/kraken/hashes.txt", 42))
                .encode()
                .unwrap(),
            b"<START_HASHES_TRANSFER:/etc/kraken/hashes.txt:42>"
        );
    }

    #[test]
    fn decode_rejects_missing_separator() {
        let err = Frame::decode(b"<START_TRANSFER:/pool/a.txt>").unwrap_err();
        assert!(matches!(err, ProtocolError::MissingSeparator(_)));
    }

    #[test]
    fn decode_rejects_non_numeric_size() {
        for raw in [
            &b"<START_TRANSFER:/pool/a.txt:12ab>"[..],
            b"<START_TRANSFER:/pool/a.txt:>",
            b"<START_TRANSFER:/pool/a.txt:-5>",
            b"<START_HASHES_TRANSFER:h.txt:1.5>",
        ] {
            let err = Frame::decode(raw).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidSize(_)), "{raw:?}");
        }
    }

    #[test]
    fn decode_splits_on_first_colon() {
        // a colon inside what would be the path lands in the size field
        let err = Frame::decode(b"<START_TRANSFER:C:/pool/a.txt:10>").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSize(_)));
    }

    #[test]
    fn decode_rejects_unknown_frames() {
        assert!(matches!(
            Frame::decode(b"<HELLO>").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
        assert!(matches!(
            Frame::decode(b"<START_TRANSFER::10>").unwrap_err(),
            ProtocolError::Malformed(_)
        ));
    }

    #[test]
    fn encode_refuses_paths_the_decoder_would_misread() {
        for path in ["", "a:b", "x>y", "<z"] {
            let err = Frame::StartTransfer(FileAnnounce::new(path, 1)).encode().unwrap_err();
            assert!(matches!(err, ProtocolError::UnencodablePath(_)), "{path:?}");
        }
    }

    #[test]
    fn port_field_is_big_endian_i32() {
        assert_eq!(encode_port(0x1F90), [0, 0, 0x1F, 0x90]);
        assert_eq!(decode_port([0, 0, 0xC3, 0x50]).unwrap(), 50_000);
        assert!(matches!(decode_port([0, 0, 0, 0]), Err(ProtocolError::InvalidPort(0))));
        assert!(matches!(
            decode_port((-1i32).to_be_bytes()),
            Err(ProtocolError::InvalidPort(-1))
        ));
        assert!(matches!(
            decode_port(70_000i32.to_be_bytes()),
            Err(ProtocolError::InvalidPort(70_000))
        ));
    }

    #[test]
    fn file_name_strips_directories() {
        assert_eq!(FileAnnounce::new("/pool/w.txt", 1).file_name(), Some("w.txt"));
        assert_eq!(FileAnnounce::new("..", 1).file_name(), None);
    }

    #[tokio::test]
    async fn reads_consecutive_frames_and_port() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"<START_TRANSFER:/p/a:3>");
        wire.extend_from_slice(&encode_port(40_001));
        wire.extend_from_slice(b"<END_TRANSFER>");
        let mut reader = BufReader::new(&wire[..]);

        let first = read_frame(&mut reader, Some(T), T).await.unwrap();
        assert_eq!(first, Frame::StartTransfer(FileAnnounce::new("/p/a", 3)));
        assert_eq!(read_port(&mut reader, T).await.unwrap(), 40_001);
        assert_eq!(read_frame(&mut reader, None, T).await.unwrap(), Frame::EndTransfer);

        let eof = read_frame(&mut reader, None, T).await.unwrap_err();
        assert!(matches!(
            eof.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_is_connection_closed() {
        let mut reader = BufReader::new(&b"<TRANSFER_REQ"[..]);
        let err = read_frame(&mut reader, None, T).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut wire = b"<START_TRANSFER:".to_vec();
        wire.extend(std::iter::repeat(b'a').take(MAX_FRAME_LEN * 2));
        let mut reader = BufReader::new(&wire[..]);
        let err = read_frame(&mut reader, None, T).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::TooLong { .. })
        ));
    }

    #[tokio::test]
    async fn idle_timeout_fires_without_data() {
        let (client, _server) = tokio::io::duplex(64);
        let mut reader = BufReader::new(client);
        let err = read_frame(&mut reader, Some(Duration::from_millis(50)), T)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn write_frame_then_read_back() {
        let (client, server) = tokio::io::duplex(256);
        let mut writer = client;
        let output = Frame::ProcessingOutput(FileAnnounce::new("part-01.txt", 77));
        write_frame(&mut writer, &output, T).await.unwrap();
        write_port(&mut writer, 65_535, T).await.unwrap();

        let mut reader = BufReader::new(server);
        assert_eq!(read_frame(&mut reader, Some(T), T).await.unwrap(), output);
        assert_eq!(read_port(&mut reader, T).await.unwrap(), 65_535);
    }
}
