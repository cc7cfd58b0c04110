//! Response bodies and upstream connection reuse.
//!
//! Response bodies are relayed in a single pass. When a hook asks for the
//! raw bytes the stream is drained into memory once and replaced with a
//! replayable view, so the network is never read twice.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::errors::{h2_error, ProxyError, ProxyResult};
use crate::event::Scheme;
use crate::http1::{
    parse_chunk_len, parse_trailer_block, read_chunk_line, read_exact_from_source,
    read_until_pattern, BufferedConn, HeaderList, HttpBodyMode,
};
use crate::{CHUNK_LINE_LIMIT, IO_CHUNK_SIZE};

/// An upstream connection, plain or TLS.
pub(crate) enum UpstreamStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PoolKey {
    pub scheme: Scheme,
    pub authority: String,
    pub via_proxy: Option<String>,
}

struct IdleConn {
    conn: BufferedConn<UpstreamStream>,
    parked_at: Instant,
}

/// Idle HTTP/1.1 connections keyed by destination. Stale entries are
/// dropped at checkout time rather than by a background sweeper.
pub(crate) struct Http1Pool {
    idle: Mutex<HashMap<PoolKey, Vec<IdleConn>>>,
    idle_timeout: Duration,
}

impl Http1Pool {
    pub(crate) fn new(idle_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub(crate) fn checkout(&self, key: &PoolKey) -> Option<BufferedConn<UpstreamStream>> {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        let entries = idle.get_mut(key)?;
        while let Some(entry) = entries.pop() {
            if entry.parked_at.elapsed() <= self.idle_timeout {
                return Some(entry.conn);
            }
        }
        None
    }

    pub(crate) fn check_in(&self, key: PoolKey, conn: BufferedConn<UpstreamStream>) {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        idle.entry(key).or_default().push(IdleConn {
            conn,
            parked_at: Instant::now(),
        });
    }
}

enum BodyKind {
    Empty,
    Full(Bytes),
    Http1(Box<Http1Body>),
    H2(H2Body),
}

/// Streaming response body with lazily-materialized raw views.
pub struct ResponseBody {
    kind: BodyKind,
    trailers: HeaderList,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            trailers: HeaderList::new(),
        }
    }

    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes: Bytes = bytes.into();
        let kind = if bytes.is_empty() {
            BodyKind::Empty
        } else {
            BodyKind::Full(bytes)
        };
        Self {
            kind,
            trailers: HeaderList::new(),
        }
    }

    pub(crate) fn http1(body: Http1Body) -> Self {
        Self {
            kind: BodyKind::Http1(Box::new(body)),
            trailers: HeaderList::new(),
        }
    }

    pub(crate) fn h2(stream: h2::RecvStream) -> Self {
        Self {
            kind: BodyKind::H2(H2Body {
                stream,
                done: false,
            }),
            trailers: HeaderList::new(),
        }
    }

    /// A replayable view, if the body has been materialized.
    pub fn as_full(&self) -> Option<&Bytes> {
        match &self.kind {
            BodyKind::Full(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.kind, BodyKind::Empty)
    }

    /// Replaces the body with the given bytes.
    pub fn set(&mut self, bytes: impl Into<Bytes>) {
        let bytes: Bytes = bytes.into();
        self.kind = if bytes.is_empty() {
            BodyKind::Empty
        } else {
            BodyKind::Full(bytes)
        };
    }

    /// Drains the remaining stream into memory and returns the complete
    /// body. Afterwards the body is a replayable byte view; calling this
    /// again returns the same bytes without touching the network.
    pub async fn buffer(&mut self) -> ProxyResult<Bytes> {
        match &self.kind {
            BodyKind::Empty => return Ok(Bytes::new()),
            BodyKind::Full(bytes) => return Ok(bytes.clone()),
            _ => {}
        }

        let mut collected = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            collected.extend_from_slice(&chunk);
        }
        let bytes = Bytes::from(collected);
        self.kind = if bytes.is_empty() {
            BodyKind::Empty
        } else {
            BodyKind::Full(bytes.clone())
        };
        Ok(bytes)
    }

    /// Next chunk of the single network pass. A materialized body is
    /// yielded once and then reads as finished.
    pub async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        match &mut self.kind {
            BodyKind::Empty => Ok(None),
            BodyKind::Full(_) => {
                let BodyKind::Full(bytes) = std::mem::replace(&mut self.kind, BodyKind::Empty)
                else {
                    unreachable!()
                };
                Ok(Some(bytes))
            }
            BodyKind::Http1(body) => match body.next_chunk().await? {
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    let BodyKind::Http1(mut body) =
                        std::mem::replace(&mut self.kind, BodyKind::Empty)
                    else {
                        unreachable!()
                    };
                    self.trailers = body.take_trailers();
                    body.finish();
                    Ok(None)
                }
            },
            BodyKind::H2(body) => match body.next_chunk().await? {
                Some(chunk) => Ok(Some(chunk)),
                None => {
                    let BodyKind::H2(body) = std::mem::replace(&mut self.kind, BodyKind::Empty)
                    else {
                        unreachable!()
                    };
                    self.trailers = body.into_trailers().await?;
                    Ok(None)
                }
            },
        }
    }

    /// Trailers observed after the body completed.
    pub fn trailers(&self) -> &HeaderList {
        &self.trailers
    }

    pub fn take_trailers(&mut self) -> HeaderList {
        std::mem::take(&mut self.trailers)
    }
}

enum Http1BodyState {
    Length { remaining: u64 },
    ChunkHeader,
    ChunkData { remaining: u64 },
    UntilEof,
    Done,
}

/// Body read off a pooled HTTP/1.1 upstream connection. When the body ends
/// cleanly and keep-alive is allowed, the connection goes back to the pool.
pub(crate) struct Http1Body {
    conn: Option<BufferedConn<UpstreamStream>>,
    key: PoolKey,
    pool: Option<Arc<Http1Pool>>,
    state: Http1BodyState,
    reusable: bool,
    trailers: HeaderList,
}

impl Http1Body {
    pub(crate) fn new(
        conn: BufferedConn<UpstreamStream>,
        key: PoolKey,
        pool: Option<Arc<Http1Pool>>,
        mode: HttpBodyMode,
        reusable: bool,
    ) -> Self {
        let state = match mode {
            HttpBodyMode::None => Http1BodyState::Done,
            HttpBodyMode::ContentLength(length) => Http1BodyState::Length { remaining: length },
            HttpBodyMode::Chunked => Http1BodyState::ChunkHeader,
            HttpBodyMode::CloseDelimited => Http1BodyState::UntilEof,
        };
        let mut body = Self {
            conn: Some(conn),
            key,
            pool,
            state,
            reusable,
            trailers: HeaderList::new(),
        };
        if matches!(body.state, Http1BodyState::Done) {
            body.finish();
        }
        body
    }

    async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return Ok(None);
            };
            match &mut self.state {
                Http1BodyState::Done => return Ok(None),
                Http1BodyState::Length { remaining } => {
                    if *remaining == 0 {
                        self.state = Http1BodyState::Done;
                        self.finish();
                        return Ok(None);
                    }
                    let chunk = read_capped(conn, *remaining).await?;
                    match chunk {
                        Some(bytes) => {
                            *remaining -= bytes.len() as u64;
                            if *remaining == 0 {
                                self.state = Http1BodyState::Done;
                                let bytes_out = bytes;
                                self.finish();
                                return Ok(Some(bytes_out));
                            }
                            return Ok(Some(bytes));
                        }
                        None => {
                            return Err(ProxyError::Transport(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "upstream closed before body completed",
                            )))
                        }
                    }
                }
                Http1BodyState::ChunkHeader => {
                    let line = read_chunk_line(conn).await?;
                    let chunk_len = parse_chunk_len(&line)?;
                    if chunk_len == 0 {
                        self.trailers = read_trailer_section(conn).await?;
                        self.state = Http1BodyState::Done;
                        self.finish();
                        return Ok(None);
                    }
                    self.state = Http1BodyState::ChunkData {
                        remaining: chunk_len,
                    };
                }
                Http1BodyState::ChunkData { remaining } => {
                    if *remaining == 0 {
                        let terminator = read_exact_from_source(conn, 2).await?;
                        if terminator.as_slice() != b"\r\n" {
                            return Err(ProxyError::Transport(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "invalid chunk terminator",
                            )));
                        }
                        self.state = Http1BodyState::ChunkHeader;
                        continue;
                    }
                    let chunk = read_capped(conn, *remaining).await?;
                    match chunk {
                        Some(bytes) => {
                            *remaining -= bytes.len() as u64;
                            return Ok(Some(bytes));
                        }
                        None => {
                            return Err(ProxyError::Transport(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "upstream closed inside a chunk",
                            )))
                        }
                    }
                }
                Http1BodyState::UntilEof => {
                    if !conn.read_buf.is_empty() {
                        let bytes = Bytes::from(std::mem::take(&mut conn.read_buf));
                        return Ok(Some(bytes));
                    }
                    let mut chunk = [0_u8; IO_CHUNK_SIZE];
                    let read = conn.stream.read(&mut chunk).await?;
                    if read == 0 {
                        self.state = Http1BodyState::Done;
                        self.reusable = false;
                        self.finish();
                        return Ok(None);
                    }
                    return Ok(Some(Bytes::copy_from_slice(&chunk[..read])));
                }
            }
        }
    }

    fn take_trailers(&mut self) -> HeaderList {
        std::mem::take(&mut self.trailers)
    }

    /// Returns the connection to the pool once the body is fully consumed.
    fn finish(&mut self) {
        if !matches!(self.state, Http1BodyState::Done) {
            return;
        }
        if let Some(conn) = self.conn.take() {
            if self.reusable {
                if let Some(pool) = &self.pool {
                    pool.check_in(self.key.clone(), conn);
                }
            }
        }
    }
}

async fn read_capped(
    conn: &mut BufferedConn<UpstreamStream>,
    cap: u64,
) -> ProxyResult<Option<Bytes>> {
    if !conn.read_buf.is_empty() {
        let take = (cap as usize).min(conn.read_buf.len());
        let bytes: Vec<u8> = conn.read_buf.drain(..take).collect();
        return Ok(Some(Bytes::from(bytes)));
    }
    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    let cap = (cap as usize).min(IO_CHUNK_SIZE);
    let read = conn.stream.read(&mut chunk[..cap]).await?;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(Bytes::copy_from_slice(&chunk[..read])))
}

async fn read_trailer_section(
    conn: &mut BufferedConn<UpstreamStream>,
) -> ProxyResult<HeaderList> {
    let mut block = Vec::new();
    loop {
        let line = read_until_pattern(conn, b"\r\n", CHUNK_LINE_LIMIT)
            .await?
            .ok_or_else(|| {
                ProxyError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upstream closed before chunked trailers completed",
                ))
            })?;
        let done = line == b"\r\n";
        if done && block.is_empty() {
            return Ok(HeaderList::new());
        }
        block.extend_from_slice(&line);
        if done {
            return Ok(parse_trailer_block(&block)?);
        }
    }
}

struct H2Body {
    stream: h2::RecvStream,
    done: bool,
}

impl H2Body {
    async fn next_chunk(&mut self) -> ProxyResult<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.stream.data().await {
            Some(Ok(bytes)) => {
                let len = bytes.len();
                if len > 0 {
                    self.stream
                        .flow_control()
                        .release_capacity(len)
                        .map_err(|error| h2_error("releasing receive capacity", error))?;
                }
                Ok(Some(bytes))
            }
            Some(Err(error)) => Err(h2_error("reading response body frame", error)),
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    async fn into_trailers(mut self) -> ProxyResult<HeaderList> {
        let trailers = self
            .stream
            .trailers()
            .await
            .map_err(|error| h2_error("reading response trailers", error))?;
        Ok(match trailers {
            Some(map) => crate::event::header_list_from_map(&map),
            None => HeaderList::new(),
        })
    }
}
