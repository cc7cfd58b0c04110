//! Hand-rolled HTTP/1.x wire codec.
//!
//! Headers keep their original spelling in an ordered list instead of a
//! normalizing map. Everything downstream relies on that: hop-by-hop
//! filtering and the WebSocket rename table match case-insensitively but
//! substitute case-preservingly.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::{CHUNK_LINE_LIMIT, IO_CHUNK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    H2,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::H2 => "HTTP/2.0",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpBodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// Ordered, case-preserving header collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<HttpHeader>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<HttpHeader>) -> Self {
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when any comma-separated value of `name` equals `token`.
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|value| value.trim().eq_ignore_ascii_case(token))
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(HttpHeader {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Removes every occurrence of `name` and appends one entry with the
    /// given spelling.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push(HttpHeader {
            name,
            value: value.into(),
        });
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|header| !header.name.eq_ignore_ascii_case(name));
    }

    /// Rewrites the spelling of every header matching `name` to `spelling`,
    /// leaving values untouched.
    pub fn rename(&mut self, name: &str, spelling: &str) {
        for header in &mut self.entries {
            if header.name.eq_ignore_ascii_case(name) {
                header.name = spelling.to_string();
            }
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, HttpHeader> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a HttpHeader;
    type IntoIter = std::slice::Iter<'a, HttpHeader>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: HeaderList,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderList,
    pub body_mode: HttpBodyMode,
    pub connection_close: bool,
}

/// Byte stream suitable for serving: connections are type-erased at
/// tunnel boundaries so that tunnels can nest without the serving
/// machinery nesting its types alongside.
pub(crate) trait ConnStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ConnStream for T {}

pub(crate) type BoxConn = Box<dyn ConnStream>;

/// A stream plus the bytes read past the current message boundary.
pub struct BufferedConn<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedConn<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Re-assembles the connection into a plain byte stream that first
    /// replays the buffered bytes.
    pub fn into_prefixed(self) -> Prefixed<S> {
        Prefixed {
            prefix: self.read_buf,
            pos: 0,
            inner: self.stream,
        }
    }
}

impl<S: AsyncRead + Unpin> BufferedConn<S> {
    /// Fills the buffer until it holds at least one byte, returning the
    /// first byte without consuming it. `None` means clean EOF.
    pub async fn peek_one(&mut self) -> io::Result<Option<u8>> {
        if let Some(byte) = self.read_buf.first() {
            return Ok(Some(*byte));
        }
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(None);
        }
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(Some(self.read_buf[0]))
    }
}

/// Byte stream that serves a prefix before delegating to the inner stream.
pub struct Prefixed<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let take = (this.prefix.len() - this.pos).min(buf.remaining());
            buf.put_slice(&this.prefix[this.pos..this.pos + take]);
            this.pos += take;
            if this.pos == this.prefix.len() {
                this.prefix.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Reads until `pattern` is seen, returning everything up to and including
/// it. `None` means the peer closed cleanly before sending anything.
pub async fn read_until_pattern<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    pattern: &[u8],
    max_bytes: usize,
) -> io::Result<Option<Vec<u8>>> {
    loop {
        if let Some(start) = find_subsequence(&conn.read_buf, pattern) {
            let end = start + pattern.len();
            let bytes = conn.read_buf.drain(..end).collect::<Vec<_>>();
            return Ok(Some(bytes));
        }

        if conn.read_buf.len() > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "HTTP header exceeded configured limit",
            ));
        }

        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            if conn.read_buf.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message boundary was reached",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
}

pub async fn read_exact_from_source<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    exact_len: usize,
) -> io::Result<Vec<u8>> {
    while conn.read_buf.len() < exact_len {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = conn.stream.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before fixed-length body completed",
            ));
        }
        conn.read_buf.extend_from_slice(&chunk[..read]);
    }
    Ok(conn.read_buf.drain(..exact_len).collect::<Vec<_>>())
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "request headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request line is missing"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request method is missing"))?;
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "request target is missing"))?;
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "HTTP version is missing"))?;
    if parts.next().is_some() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line had too many fields",
        ));
    }
    let version = parse_version(version_text)?;
    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "response headers were not valid UTF-8",
        )
    })?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "response status line is missing")
    })?;
    let mut parts = status_line.split_whitespace();
    let version_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response version is missing"))?;
    let status_text = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "response status is missing"))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let version = parse_version(version_text)?;
    let status = status_text
        .parse::<u16>()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid response status code"))?;

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut connection_close = is_connection_close(version, &headers);
    if body_mode == HttpBodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body_mode,
        connection_close,
    })
}

/// Splits a full HTTP/1.1 message into its head (without the blank line)
/// and whatever follows it.
pub fn split_head(raw: &[u8]) -> Option<(&[u8], &[u8])> {
    let boundary = find_subsequence(raw, b"\r\n\r\n")?;
    Some((&raw[..boundary + 4], &raw[boundary + 4..]))
}

/// Parses the authority-form target of a CONNECT request into host and
/// port. IPv6 literals are bracketed on the wire.
pub fn parse_connect_target(target: &str) -> io::Result<(String, u16)> {
    let (host, port_text) = if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unterminated IPv6 literal")
        })?;
        let port = rest.strip_prefix(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "CONNECT target is missing a port")
        })?;
        (host.to_string(), port)
    } else {
        let (host, port) = target.rsplit_once(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "CONNECT target is missing a port")
        })?;
        (host.to_string(), port)
    };

    if host.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "CONNECT target is missing a host",
        ));
    }
    let port = port_text
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "invalid CONNECT port"))?;
    Ok((host, port))
}

/// Strips the port from a `host:port` pair, leaving bare hosts untouched.
pub fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some((host, _)) = rest.split_once(']') {
            return host;
        }
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

fn parse_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "only HTTP/1.0 and HTTP/1.1 are supported on this connection",
        )),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderList> {
    let mut headers = HeaderList::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed header line"))?;
        headers.push(name.trim(), value.trim());
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderList) -> io::Result<HttpBodyMode> {
    if headers.contains_token("transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(length) = content_length(headers)? {
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }
    Ok(HttpBodyMode::None)
}

fn response_body_mode(
    headers: &HeaderList,
    request_method: &str,
    status: u16,
) -> io::Result<HttpBodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(HttpBodyMode::None);
    }
    if headers.contains_token("transfer-encoding", "chunked") {
        return Ok(HttpBodyMode::Chunked);
    }
    if let Some(length) = content_length(headers)? {
        return Ok(if length == 0 {
            HttpBodyMode::None
        } else {
            HttpBodyMode::ContentLength(length)
        });
    }
    Ok(HttpBodyMode::CloseDelimited)
}

fn content_length(headers: &HeaderList) -> io::Result<Option<u64>> {
    let mut value = None;
    for candidate in headers.get_all("content-length") {
        let parsed = candidate.parse::<u64>().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "invalid Content-Length value")
        })?;
        value = Some(parsed);
    }
    Ok(value)
}

fn is_connection_close(version: HttpVersion, headers: &HeaderList) -> bool {
    if headers.contains_token("connection", "close") {
        return true;
    }
    version == HttpVersion::Http10 && !headers.contains_token("connection", "keep-alive")
}

/// Reads a complete message body into memory. For chunked bodies the
/// trailer section is parsed and returned alongside the payload.
pub async fn read_buffered_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    mode: HttpBodyMode,
    limit: usize,
) -> io::Result<(Bytes, HeaderList)> {
    match mode {
        HttpBodyMode::None => Ok((Bytes::new(), HeaderList::new())),
        HttpBodyMode::ContentLength(length) => {
            if length > limit as u64 {
                return Err(body_too_large());
            }
            let bytes = read_exact_from_source(conn, length as usize).await?;
            Ok((Bytes::from(bytes), HeaderList::new()))
        }
        HttpBodyMode::Chunked => read_chunked_body(conn, limit).await,
        HttpBodyMode::CloseDelimited => {
            let mut body = std::mem::take(&mut conn.read_buf);
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            loop {
                if body.len() > limit {
                    return Err(body_too_large());
                }
                let read = conn.stream.read(&mut chunk).await?;
                if read == 0 {
                    break;
                }
                body.extend_from_slice(&chunk[..read]);
            }
            Ok((Bytes::from(body), HeaderList::new()))
        }
    }
}

async fn read_chunked_body<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
    limit: usize,
) -> io::Result<(Bytes, HeaderList)> {
    let mut body = Vec::new();
    loop {
        let line = read_chunk_line(conn).await?;
        let chunk_len = parse_chunk_len(&line)?;
        if chunk_len == 0 {
            let trailer_block = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT).await?;
            let trailers = match trailer_block {
                Some(block) if block == b"\r\n" => HeaderList::new(),
                Some(mut block) => {
                    // The first trailer line is already consumed up to its
                    // CRLF; keep reading until the blank line.
                    loop {
                        let next = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
                            .await?
                            .ok_or_else(unexpected_eof_in_trailers)?;
                        let done = next == b"\r\n";
                        block.extend_from_slice(&next);
                        if done {
                            break;
                        }
                    }
                    parse_trailer_block(&block)?
                }
                None => return Err(unexpected_eof_in_trailers()),
            };
            return Ok((Bytes::from(body), trailers));
        }

        if body.len() + chunk_len as usize > limit {
            return Err(body_too_large());
        }
        let data = read_exact_from_source(conn, chunk_len as usize).await?;
        body.extend_from_slice(&data);

        let terminator = read_exact_from_source(conn, 2).await?;
        if terminator.as_slice() != b"\r\n" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "invalid chunk terminator",
            ));
        }
    }
}

pub async fn read_chunk_line<S: AsyncRead + Unpin>(
    conn: &mut BufferedConn<S>,
) -> io::Result<Vec<u8>> {
    read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
        .await?
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before chunk size line was read",
            )
        })
}

pub fn parse_chunk_len(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "chunk size line had invalid UTF-8")
    })?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk size line had invalid hex length",
        )
    })
}

pub fn parse_trailer_block(block: &[u8]) -> io::Result<HeaderList> {
    let text = std::str::from_utf8(block).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "trailers were not valid UTF-8")
    })?;
    parse_header_lines(text.split("\r\n"))
}

fn unexpected_eof_in_trailers() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed before chunked trailers completed",
    )
}

fn body_too_large() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        "message body exceeded the configured buffer limit",
    )
}

pub fn write_request_head(
    buf: &mut Vec<u8>,
    method: &str,
    target: &str,
    headers: &HeaderList,
) {
    buf.extend_from_slice(method.as_bytes());
    buf.push(b' ');
    buf.extend_from_slice(target.as_bytes());
    buf.extend_from_slice(b" HTTP/1.1\r\n");
    write_header_lines(buf, headers);
    buf.extend_from_slice(b"\r\n");
}

pub fn write_response_head(
    buf: &mut Vec<u8>,
    version: HttpVersion,
    status: u16,
    reason: &str,
    headers: &HeaderList,
) {
    let version = match version {
        HttpVersion::Http10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    buf.extend_from_slice(version.as_bytes());
    buf.extend_from_slice(format!(" {status}").as_bytes());
    if !reason.is_empty() {
        buf.push(b' ');
        buf.extend_from_slice(reason.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    write_header_lines(buf, headers);
    buf.extend_from_slice(b"\r\n");
}

fn write_header_lines(buf: &mut Vec<u8>, headers: &HeaderList) {
    for header in headers {
        buf.extend_from_slice(header.name.as_bytes());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(header.value.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }
}

pub fn default_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_chunk_len, parse_connect_target, parse_request_head, parse_response_head,
        strip_port, HttpBodyMode, HttpVersion,
    };

    #[test]
    fn parses_absolute_form_request() {
        let head = parse_request_head(
            b"GET http://echo.test/x HTTP/1.1\r\nHost: echo.test\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .expect("parse request");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "http://echo.test/x");
        assert_eq!(head.version, HttpVersion::Http11);
        assert_eq!(head.headers.get("host"), Some("echo.test"));
        assert_eq!(head.body_mode, HttpBodyMode::None);
        assert!(!head.connection_close);
    }

    #[test]
    fn header_spelling_is_preserved() {
        let head = parse_request_head(
            b"GET / HTTP/1.1\r\nSec-WebSocket-Key: abc\r\nHost: a\r\n\r\n",
        )
        .expect("parse request");
        let spelled = head
            .headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case("sec-websocket-key"))
            .expect("header present");
        assert_eq!(spelled.name, "Sec-WebSocket-Key");
    }

    #[test]
    fn chunked_transfer_encoding_wins_over_content_length() {
        let head = parse_request_head(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 4\r\n\r\n",
        )
        .expect("parse request");
        assert_eq!(head.body_mode, HttpBodyMode::Chunked);
    }

    #[test]
    fn response_to_head_has_no_body() {
        let head = parse_response_head(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\n\r\n",
            "HEAD",
        )
        .expect("parse response");
        assert_eq!(head.body_mode, HttpBodyMode::None);
    }

    #[test]
    fn response_without_framing_is_close_delimited() {
        let head =
            parse_response_head(b"HTTP/1.1 200 OK\r\n\r\n", "GET").expect("parse response");
        assert_eq!(head.body_mode, HttpBodyMode::CloseDelimited);
        assert!(head.connection_close);
    }

    #[test]
    fn connect_targets() {
        assert_eq!(
            parse_connect_target("echo.test:443").expect("parse"),
            ("echo.test".to_string(), 443)
        );
        assert_eq!(
            parse_connect_target("[::1]:8443").expect("parse"),
            ("::1".to_string(), 8443)
        );
        parse_connect_target("echo.test").expect_err("missing port");
        parse_connect_target(":443").expect_err("missing host");
        parse_connect_target("echo.test:0").expect_err("port zero");
    }

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("echo.test:443"), "echo.test");
        assert_eq!(strip_port("echo.test"), "echo.test");
        assert_eq!(strip_port("[::1]:443"), "::1");
    }

    #[test]
    fn chunk_length_parsing() {
        assert_eq!(parse_chunk_len(b"1a\r\n").expect("parse"), 0x1a);
        assert_eq!(parse_chunk_len(b"0;ext=1\r\n").expect("parse"), 0);
        parse_chunk_len(b"zz\r\n").expect_err("invalid hex");
    }
}
