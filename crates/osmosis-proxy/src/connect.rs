//! CONNECT interception.
//!
//! The tunnel's first byte decides everything: `0x16` is a TLS
//! client-hello, so the proxy terminates TLS with a leaf chosen per SNI at
//! handshake time; anything else is cleartext HTTP served straight off the
//! tunnel. Either way the byte stream is handed to an embedded server
//! through a one-shot listener, and every sub-request is pinned to the
//! original CONNECT target.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::LazyConfigAcceptor;

use crate::errors::{h2_error, ProxyError, ProxyResult};
use crate::event::{header_map_from_list, Event, ProxyRequest, ProxyResponse, Scheme};
use crate::forward::send_h2_data;
use crate::http1::{parse_connect_target, strip_port, BoxConn, BufferedConn};
use crate::server::{serve_http1_connection, IdMode, ServerShared};

const TLS_CLIENT_HELLO: u8 = 0x16;

/// Yields exactly one connection, then reports that no more will come.
/// The embedded server treats the end of the stream as clean termination.
pub(crate) struct OneShotListener<S> {
    conn: Option<S>,
}

impl<S> OneShotListener<S> {
    pub(crate) fn new(conn: S) -> Self {
        Self { conn: Some(conn) }
    }

    pub(crate) async fn accept(&mut self) -> Option<S> {
        self.conn.take()
    }
}

/// Handles `CONNECT host:port`: acknowledges the tunnel, sniffs the first
/// byte, and serves the tunneled connection as HTTPS or cleartext HTTP.
pub(crate) async fn handle_connect(
    ctx: Arc<ServerShared>,
    event: Event,
    target: String,
    mut conn: BufferedConn<BoxConn>,
) {
    event.log(format!("CONNECT {target}"));

    if let Err(error) = parse_connect_target(&target) {
        event.log(format!("invalid CONNECT target {target:?}: {error}"));
        let _ = conn
            .stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
            .await;
        return;
    }

    if let Err(error) = conn.stream.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await {
        event.log(format!("unable to write proxy response: {error}"));
        return;
    }

    let first_byte = match conn.peek_one().await {
        Ok(Some(byte)) => byte,
        Ok(None) => {
            event.log("client closed tunnel before sending data");
            return;
        }
        Err(error) => {
            event.log(format!("peek(1) failed: {error}"));
            return;
        }
    };

    let peer = event.peer.clone();
    let connect_id = event.id;

    if first_byte == TLS_CLIENT_HELLO {
        serve_tls_tunnel(ctx, event, target, conn).await;
    } else {
        // Cleartext over the tunnel; the buffered byte stays in the
        // connection and is replayed by the serving loop.
        let mut listener = OneShotListener::new(conn);
        while let Some(tunnel) = listener.accept().await {
            let result = serve_http1_connection(
                Arc::clone(&ctx),
                tunnel,
                peer.clone(),
                IdMode::Inherit(connect_id),
                Some((target.clone(), Scheme::Http)),
            )
            .await;
            if let Err(error) = result {
                event.log(format!("error serving tunneled connection: {error}"));
            }
        }
    }
}

async fn serve_tls_tunnel(
    ctx: Arc<ServerShared>,
    event: Event,
    target: String,
    conn: BufferedConn<BoxConn>,
) {
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), conn.into_prefixed());
    let start = match acceptor.await {
        Ok(start) => start,
        Err(error) => {
            event.log(format!("TLS client hello for {target} failed: {error}"));
            return;
        }
    };

    let sni = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_default();
    if sni.is_empty() {
        event.log(format!(
            "client did not include SNI, using {}",
            strip_port(&target)
        ));
    }

    let leaf = match ctx
        .cert_cache
        .get(&target, &sni, &event.cancel_token())
        .await
    {
        Ok(leaf) => leaf,
        Err(error) => {
            event.log(format!("certificate for {target} ({sni}) failed: {error}"));
            return;
        }
    };

    let tls = match start.into_stream(Arc::clone(&leaf.server_config)).await {
        Ok(tls) => tls,
        Err(error) => {
            event.log(format!("TLS handshake for {target} failed: {error}"));
            return;
        }
    };

    let negotiated_h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2");
    let peer = event.peer.clone();
    let connect_id = event.id;

    if negotiated_h2 {
        // Each HTTP/2 stream is an independent request and draws a fresh
        // id from the server counter.
        if let Err(error) = serve_h2_tunnel(ctx, tls, target, peer).await {
            event.log(format!("error serving HTTP/2 tunnel: {error}"));
        }
        return;
    }

    let mut listener = OneShotListener::new(BufferedConn::new(Box::new(tls) as BoxConn));
    while let Some(tunnel) = listener.accept().await {
        let result = serve_http1_connection(
            Arc::clone(&ctx),
            tunnel,
            peer.clone(),
            IdMode::Inherit(connect_id),
            Some((target.clone(), Scheme::Https)),
        )
        .await;
        if let Err(error) = result {
            event.log(format!("error serving tunneled connection: {error}"));
        }
    }
}

async fn serve_h2_tunnel<S>(
    ctx: Arc<ServerShared>,
    tls: S,
    target: String,
    peer: String,
) -> ProxyResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut builder = h2::server::Builder::new();
    builder.max_concurrent_streams(128);
    builder.initial_window_size(1024 * 1024);
    builder.initial_connection_window_size(4 * 1024 * 1024);
    let mut connection = builder
        .handshake(tls)
        .await
        .map_err(|error| h2_error("tunnel HTTP/2 handshake", error))?;

    let mut shutdown = ctx.shutdown.clone();
    loop {
        tokio::select! {
            accepted = connection.accept() => {
                let Some(next) = accepted else { break };
                let (request, respond) = match next {
                    Ok(parts) => parts,
                    Err(error) => {
                        if error.is_go_away() {
                            break;
                        }
                        return Err(h2_error("accepting HTTP/2 stream", error));
                    }
                };
                let ctx = Arc::clone(&ctx);
                let target = target.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_h2_stream(ctx, request, respond, target, peer).await {
                        tracing::debug!(target: "osmosis::connect", "HTTP/2 stream ended: {error}");
                    }
                });
            }
            _ = shutdown.wait_for(|fired| *fired) => {
                // Tunneled connections close immediately on shutdown.
                break;
            }
        }
    }
    Ok(())
}

async fn serve_h2_stream(
    ctx: Arc<ServerShared>,
    request: http::Request<h2::RecvStream>,
    mut respond: h2::server::SendResponse<Bytes>,
    target: String,
    peer: String,
) -> ProxyResult<()> {
    let (parts, mut recv_body) = request.into_parts();
    let body = match capture_h2_request_body(&mut recv_body, ctx.config.max_buffered_body_bytes)
        .await
    {
        Ok(body) => body,
        Err(error) => {
            let response = ProxyResponse::plaintext(413, "Payload Too Large", error.to_string());
            return write_h2_response(&mut respond, response).await;
        }
    };

    let proxy_request = ProxyRequest::from_h2_parts(parts, body);
    let mut event = Event::new(ctx.next_id(), peer, proxy_request, ctx.shutdown.clone());
    event.force_host = Some(target);
    event.force_scheme = Some(Scheme::Https);
    event.log(format!(
        "{} https {} {}",
        event.request.method,
        event.force_host.as_deref().unwrap_or(""),
        event.request.uri
    ));

    let result = ctx.pipeline.run(&mut event).await;
    let outcome = match result {
        Ok(response) => write_h2_response(&mut respond, response).await,
        Err(ProxyError::Cancelled) => {
            respond.send_reset(h2::Reason::CANCEL);
            Ok(())
        }
        Err(error) => {
            let response = event.send_error(format!("error forwarding request: {error}"));
            write_h2_response(&mut respond, response).await
        }
    };
    event.log("done");
    outcome
}

async fn capture_h2_request_body(
    stream: &mut h2::RecvStream,
    limit: usize,
) -> ProxyResult<Bytes> {
    if stream.is_end_stream() {
        return Ok(Bytes::new());
    }
    let mut body = Vec::new();
    while let Some(next) = stream.data().await {
        let data = next.map_err(|error| h2_error("reading request body frame", error))?;
        if body.len() + data.len() > limit {
            return Err(ProxyError::protocol(
                "request body exceeded the configured buffer limit",
            ));
        }
        body.extend_from_slice(&data);
        if !data.is_empty() {
            stream
                .flow_control()
                .release_capacity(data.len())
                .map_err(|error| h2_error("releasing receive capacity", error))?;
        }
        if stream.is_end_stream() {
            break;
        }
    }
    let _ = stream
        .trailers()
        .await
        .map_err(|error| h2_error("reading request trailers", error))?;
    Ok(Bytes::from(body))
}

/// Writes a pipeline response onto an HTTP/2 stream: headers first, then
/// the single-pass body, then any trailers as a real trailer frame.
async fn write_h2_response(
    respond: &mut h2::server::SendResponse<Bytes>,
    mut response: ProxyResponse,
) -> ProxyResult<()> {
    let mut headers = response.headers.clone();
    for name in ["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"] {
        headers.remove(name);
    }
    let announced = response.announced_trailer_names();
    for name in &announced {
        headers.remove(name);
    }
    if let Some(full) = response.body.as_full() {
        headers.set("Content-Length", full.len().to_string());
    }

    let mut builder = http::Response::builder().status(response.status);
    if let Some(map) = builder.headers_mut() {
        *map = header_map_from_list(&headers);
    }
    let head = builder
        .body(())
        .map_err(|error| ProxyError::protocol(format!("response head: {error}")))?;

    let body_done = response.body.is_done();
    let mut stream = respond
        .send_response(head, body_done)
        .map_err(|error| h2_error("sending response headers", error))?;
    if body_done {
        return Ok(());
    }

    while let Some(chunk) = response.body.next_chunk().await? {
        send_h2_data(&mut stream, chunk, false).await?;
    }

    let trailers = response.body.take_trailers();
    if trailers.is_empty() {
        stream
            .send_data(Bytes::new(), true)
            .map_err(|error| h2_error("finishing response body", error))?;
    } else {
        stream
            .send_trailers(header_map_from_list(&trailers))
            .map_err(|error| h2_error("sending response trailers", error))?;
    }
    Ok(())
}
