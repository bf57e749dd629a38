//! Framed readers for request lines, status lines, header blocks and
//! chunked-transfer framing.
//!
//! Every reader pulls from the caller's `BytesMut` first and only then from
//! the socket, so bytes consumed ahead of the current frame are never lost
//! between requests on a keep-alive connection.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Duration, timeout};

use crate::MAX_HEADER_BYTES;
use crate::headers::Headers;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("peer closed before message framing completed")]
    PeerClosed,
    #[error("read timed out")]
    Timeout,
    #[error("malformed header block")]
    MalformedHeader,
    #[error("header block too large")]
    HeaderTooLarge,
    #[error("conflicting Content-Length values")]
    AmbiguousLength,
    #[error("invalid chunk size line")]
    InvalidChunkSize,
    #[error("malformed request line")]
    MalformedRequestLine,
    #[error("malformed status line")]
    MalformedStatusLine,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
    /// Verbatim line including the terminating CRLF.
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StatusLine {
    pub version: String,
    pub status: u16,
    /// Verbatim line including the terminating CRLF.
    pub raw: Vec<u8>,
}

/// One socket read appended to `buf`. Returns the byte count; 0 means EOF.
pub async fn fill_once<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout_dur: Duration,
) -> Result<usize, WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut tmp = [0u8; crate::BUFSIZE];
    let n = match timeout(timeout_dur, stream.read(&mut tmp)).await {
        Ok(res) => res?,
        Err(_) => return Err(WireError::Timeout),
    };
    if n > 0 {
        buf.extend_from_slice(&tmp[..n]);
    }
    Ok(n)
}

/// Read one line up to and including its LF. Bare-LF lines are tolerated.
pub async fn read_line<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout_dur: Duration,
) -> Result<Vec<u8>, WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            return Ok(buf.split_to(pos + 1).to_vec());
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(WireError::HeaderTooLarge);
        }
        if fill_once(stream, buf, timeout_dur).await? == 0 {
            return Err(WireError::PeerClosed);
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn is_empty_line(line: &[u8]) -> bool {
    trim_line_end(line).is_empty()
}

pub async fn read_request_line<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout_dur: Duration,
) -> Result<RequestLine, WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let raw = read_line(stream, buf, timeout_dur).await?;
    parse_request_line(&raw)
}

pub fn parse_request_line(raw: &[u8]) -> Result<RequestLine, WireError> {
    let line =
        std::str::from_utf8(trim_line_end(raw)).map_err(|_| WireError::MalformedRequestLine)?;
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(WireError::MalformedRequestLine)?;
    let target = parts.next().ok_or(WireError::MalformedRequestLine)?;
    let version = parts.next().ok_or(WireError::MalformedRequestLine)?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return Err(WireError::MalformedRequestLine);
    }
    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        raw: raw.to_vec(),
    })
}

pub async fn read_status_line<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout_dur: Duration,
) -> Result<StatusLine, WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let raw = read_line(stream, buf, timeout_dur).await?;
    let line =
        std::str::from_utf8(trim_line_end(&raw)).map_err(|_| WireError::MalformedStatusLine)?;
    let mut parts = line.split_whitespace();
    let version = parts.next().ok_or(WireError::MalformedStatusLine)?;
    if !version.starts_with("HTTP/") {
        return Err(WireError::MalformedStatusLine);
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(WireError::MalformedStatusLine)?;
    Ok(StatusLine {
        version: version.to_string(),
        status,
        raw,
    })
}

/// Read a header block up to and including the empty line. Returns the
/// verbatim bytes (suitable for relay) and the parsed map.
pub async fn read_header_block<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    timeout_dur: Duration,
) -> Result<(Vec<u8>, Headers), WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut raw = Vec::new();
    loop {
        let line = read_line(stream, buf, timeout_dur).await?;
        raw.extend_from_slice(&line);
        if raw.len() > MAX_HEADER_BYTES {
            return Err(WireError::HeaderTooLarge);
        }
        if is_empty_line(&line) {
            break;
        }
    }
    let headers = Headers::parse(&raw)?;
    Ok((raw, headers))
}

/// Parse a chunk-size line: hex digits, optional `;extension`.
pub fn parse_chunk_size(line: &[u8]) -> Result<usize, WireError> {
    let line = std::str::from_utf8(trim_line_end(line)).map_err(|_| WireError::InvalidChunkSize)?;
    let size_str = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(size_str, 16).map_err(|_| WireError::InvalidChunkSize)
}

/// Read up to `max` bytes, draining the buffer before touching the socket.
/// Returns an empty chunk on EOF.
pub async fn read_some<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max: usize,
    timeout_dur: Duration,
) -> Result<Bytes, WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    if !buf.is_empty() {
        let take = max.min(buf.len());
        return Ok(buf.split_to(take).freeze());
    }
    let n = fill_once(stream, buf, timeout_dur).await?;
    if n == 0 {
        return Ok(Bytes::new());
    }
    let take = max.min(buf.len());
    Ok(buf.split_to(take).freeze())
}

/// Read exactly `n` bytes.
pub async fn read_exact<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    n: usize,
    timeout_dur: Duration,
) -> Result<Bytes, WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while buf.len() < n {
        if fill_once(stream, buf, timeout_dur).await? == 0 {
            return Err(WireError::PeerClosed);
        }
    }
    Ok(buf.split_to(n).freeze())
}

/// Discard exactly `n` buffered-or-socket bytes.
pub async fn discard_exact<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    mut remaining: usize,
    timeout_dur: Duration,
) -> Result<(), WireError>
where
    S: AsyncRead + Unpin + ?Sized,
{
    while remaining > 0 {
        if !buf.is_empty() {
            let take = remaining.min(buf.len());
            buf.advance(take);
            remaining -= take;
            continue;
        }
        if fill_once(stream, buf, timeout_dur).await? == 0 {
            return Err(WireError::PeerClosed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn read_header_block_keeps_raw_bytes() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(b"Host: example.test\r\nAccept: */*\r\n\r\nGET")
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let (raw, headers) =
            read_header_block(&mut server, &mut buf, Duration::from_secs(1))
                .await
                .unwrap();
        assert_eq!(raw, b"Host: example.test\r\nAccept: */*\r\n\r\n");
        assert_eq!(headers.get("host"), Some("example.test"));
        // Pipelined bytes stay in the buffer.
        assert_eq!(&buf[..], b"GET");
    }

    #[tokio::test]
    async fn read_line_reports_peer_close() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"partial").await.unwrap();
        drop(client);
        let mut buf = BytesMut::new();
        let err = read_line(&mut server, &mut buf, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::PeerClosed));
    }

    #[test]
    fn parse_request_line_rejects_garbage() {
        assert!(parse_request_line(b"GET / HTTP/1.1\r\n").is_ok());
        assert!(parse_request_line(b"GET /\r\n").is_err());
        assert!(parse_request_line(b"GET / FTP/1.1\r\n").is_err());
    }

    #[test]
    fn parse_chunk_size_handles_extensions() {
        assert_eq!(parse_chunk_size(b"1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size(b"0;name=val\r\n").unwrap(), 0);
        assert!(parse_chunk_size(b"xyz\r\n").is_err());
    }

    #[tokio::test]
    async fn read_status_line_parses_code() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(b"HTTP/1.1 204 No Content\r\n")
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        let line = read_status_line(&mut server, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(line.status, 204);
        assert_eq!(line.version, "HTTP/1.1");
    }
}
