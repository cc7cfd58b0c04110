//! The proxy server: accept loop, request dispatch, and the response
//! relay back to the client.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use osmosis_certauth::CertificateAuthority;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::cert_cache::CertCache;
use crate::config::ProxyConfig;
use crate::connect;
use crate::errors::{ProxyError, ProxyResult};
use crate::event::{Event, ProxyRequest, ProxyResponse, Scheme};
use crate::forward::UpstreamClient;
use crate::http1::{
    default_reason, parse_request_head, read_buffered_body, read_until_pattern,
    write_response_head, BoxConn, BufferedConn, HeaderList, HttpVersion, RequestHead,
};
use crate::pipeline::{ForwardAction, Hook, Pipeline};
use crate::upgrade;
use crate::BUILTIN_HOST;

/// State shared by every connection task.
pub(crate) struct ServerShared {
    pub(crate) config: ProxyConfig,
    pub(crate) ca: Arc<CertificateAuthority>,
    pub(crate) cert_cache: Arc<CertCache>,
    pub(crate) client: Arc<UpstreamClient>,
    pub(crate) pipeline: Pipeline,
    pub(crate) shutdown: watch::Receiver<bool>,
    request_ids: AtomicU64,
}

impl ServerShared {
    /// Issues the next request id. Ids are process-unique, monotonically
    /// increasing, and never zero.
    pub(crate) fn next_id(&self) -> u64 {
        self.request_ids.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// How sub-requests of a connection draw their ids. HTTP/1.1 tunnels
/// inherit the CONNECT id; everything else draws fresh ids.
#[derive(Debug, Clone, Copy)]
pub(crate) enum IdMode {
    Fresh,
    Inherit(u64),
}

/// An intercepting forward proxy. Configure hooks before starting; the
/// running server takes the pipeline by value.
pub struct Proxy {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    cert_cache: Arc<CertCache>,
    client: Arc<UpstreamClient>,
    pipeline: Pipeline,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Proxy {
    pub fn new(config: ProxyConfig, ca: CertificateAuthority) -> ProxyResult<Self> {
        config.validate()?;
        let ca = Arc::new(ca);
        let client = Arc::new(UpstreamClient::new(config.upstream.clone()));
        let cert_cache = Arc::new(CertCache::new(
            Arc::clone(&ca),
            client.probe_tls_config(),
            config.upstream.clone(),
            config.cert_cache_cleanup_interval,
            config.cert_cache_duration,
        ));
        let terminal: Arc<dyn ForwardAction> = Arc::clone(&client) as Arc<dyn ForwardAction>;
        let pipeline = Pipeline::new(Some(terminal));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            ca,
            cert_cache,
            client,
            pipeline,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Registers a hook; hooks registered later wrap hooks registered
    /// earlier.
    pub fn register(&mut self, hook: impl Hook) {
        self.pipeline.register(hook);
    }

    /// Drops all registered hooks.
    pub fn reset_hooks(&mut self) {
        self.pipeline.reset();
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn cert_cache(&self) -> &Arc<CertCache> {
        &self.cert_cache
    }

    pub async fn bind(&self) -> io::Result<TcpListener> {
        TcpListener::bind(self.config.bind).await
    }

    pub async fn run(self) -> io::Result<()> {
        let listener = self.bind().await?;
        self.run_with_listener(listener).await
    }

    /// Binds and spawns the server, returning a handle for shutdown.
    pub async fn start(self) -> io::Result<ProxyHandle> {
        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        let shutdown_tx = self.shutdown_tx.clone();
        let join = tokio::spawn(self.run_with_listener(listener));
        Ok(ProxyHandle {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> io::Result<()> {
        let shared = Arc::new(ServerShared {
            config: self.config,
            ca: self.ca,
            cert_cache: self.cert_cache,
            client: self.client,
            pipeline: self.pipeline,
            shutdown: self.shutdown_rx.clone(),
            request_ids: AtomicU64::new(0),
        });

        let mut shutdown = self.shutdown_rx;
        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let shared = Arc::clone(&shared);
                    tasks.spawn(async move {
                        let peer = peer.to_string();
                        let conn = BufferedConn::new(Box::new(stream) as BoxConn);
                        if let Err(error) =
                            serve_http1_connection(shared, conn, peer, IdMode::Fresh, None).await
                        {
                            tracing::debug!(
                                target: "osmosis::server",
                                "connection handling failed: {error}"
                            );
                        }
                    });
                }
                _ = shutdown.wait_for(|fired| *fired) => break,
            }
        }

        // Drain active connections. Tunneled and upgraded connections
        // observe the shutdown signal and close immediately; plain
        // requests finish their in-flight exchange.
        drop(listener);
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// Handle to a running proxy.
pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<io::Result<()>>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Initiates a graceful drain bounded by `timeout`; connections still
    /// alive at the deadline are aborted.
    pub async fn shutdown(mut self, timeout: Duration) -> ProxyResult<()> {
        let _ = self.shutdown_tx.send(true);
        match tokio::time::timeout(timeout, &mut self.join).await {
            Ok(Ok(result)) => result.map_err(ProxyError::from),
            Ok(Err(join_error)) if join_error.is_cancelled() => Ok(()),
            Ok(Err(join_error)) => Err(ProxyError::Transport(io::Error::other(format!(
                "proxy task failed: {join_error}"
            )))),
            Err(_) => {
                self.join.abort();
                Ok(())
            }
        }
    }
}

/// Serves one client connection: reads requests in a keep-alive loop and
/// dispatches CONNECT, built-in endpoints, WebSocket upgrades, and the
/// hook pipeline.
pub(crate) async fn serve_http1_connection(
    ctx: Arc<ServerShared>,
    mut conn: BufferedConn<BoxConn>,
    peer: String,
    ids: IdMode,
    force: Option<(String, Scheme)>,
) -> io::Result<()> {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let head_raw = tokio::select! {
            result = read_until_pattern(&mut conn, b"\r\n\r\n", ctx.config.max_head_bytes) => result?,
            _ = shutdown.wait_for(|fired| *fired) => return Ok(()),
        };
        let Some(head_raw) = head_raw else {
            // Clean end of the connection, including the one-shot
            // listener's no-more-connections condition.
            return Ok(());
        };

        let head = match parse_request_head(&head_raw) {
            Ok(head) => head,
            Err(error) => {
                write_simple_response(&mut conn, 400, &format!("invalid request: {error}")).await?;
                return Ok(());
            }
        };

        let id = match ids {
            IdMode::Fresh => ctx.next_id(),
            IdMode::Inherit(id) => id,
        };

        if head.method == "CONNECT" {
            let target = head.target.clone();
            let event = Event::new(
                id,
                peer.clone(),
                connect_placeholder_request(&head),
                ctx.shutdown.clone(),
            );
            Box::pin(connect::handle_connect(ctx, event, target, conn)).await;
            return Ok(());
        }

        let (body, _request_trailers) = match read_buffered_body(
            &mut conn,
            head.body_mode,
            ctx.config.max_buffered_body_bytes,
        )
        .await
        {
            Ok(parts) => parts,
            Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                write_simple_response(&mut conn, 413, &error.to_string()).await?;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let uri = match head.target.parse::<http::Uri>() {
            Ok(uri) => uri,
            Err(error) => {
                write_simple_response(&mut conn, 400, &format!("invalid request target: {error}"))
                    .await?;
                return Ok(());
            }
        };

        let request = ProxyRequest {
            method: head.method.clone(),
            uri,
            version: head.version,
            headers: head.headers.clone(),
            body,
        };
        let mut event = Event::new(id, peer.clone(), request, ctx.shutdown.clone());
        if let Some((host, scheme)) = &force {
            event.force_host = Some(host.clone());
            event.force_scheme = Some(*scheme);
        }
        event.log(format!(
            "{} {} {} {}",
            event.request.method,
            event.force_scheme.map(Scheme::as_str).unwrap_or("-"),
            event.force_host.as_deref().unwrap_or("-"),
            event.request.uri
        ));

        if event.request.uri.host() == Some(BUILTIN_HOST) {
            let response = builtin_response(&ctx, &event);
            let keep_alive = write_response(&mut conn, &event, response).await?;
            event.log("done");
            if !keep_alive || head.connection_close {
                return Ok(());
            }
            continue;
        }

        if upgrade::is_websocket_upgrade(&event.request.headers) {
            upgrade::handle_upgrade(ctx, event, conn).await;
            return Ok(());
        }

        let result = ctx.pipeline.run(&mut event).await;
        let keep_alive = match result {
            Ok(response) => {
                event.log(format!("   -> {}", response.status));
                match write_response(&mut conn, &event, response).await {
                    Ok(keep_alive) => keep_alive,
                    Err(error) => {
                        // The status line is already on the wire; there is
                        // nothing left to report to the client.
                        event.log(format!("error copying body: {error}"));
                        return Ok(());
                    }
                }
            }
            Err(ProxyError::Cancelled) => return Ok(()),
            Err(error) => {
                let response = event.send_error(format!("error forwarding request: {error}"));
                let _ = write_response(&mut conn, &event, response).await;
                false
            }
        };
        event.log("done");

        if !keep_alive || head.connection_close {
            return Ok(());
        }
    }
}

fn connect_placeholder_request(head: &RequestHead) -> ProxyRequest {
    let uri = head
        .target
        .parse::<http::Uri>()
        .unwrap_or_else(|_| http::Uri::from_static("/"));
    ProxyRequest {
        method: head.method.clone(),
        uri,
        version: head.version,
        headers: head.headers.clone(),
        body: Bytes::new(),
    }
}

/// The reserved-host endpoints: `/ca` serves the root certificate for
/// out-of-band installation, everything else is 404.
fn builtin_response(ctx: &ServerShared, event: &Event) -> ProxyResponse {
    if event.request.uri.path() != "/ca" {
        return ProxyResponse::plaintext(404, "Not Found", "not found\n");
    }
    let pem = ctx.ca.certificate_pem().as_bytes().to_vec();
    let mut response = ProxyResponse::new(200, "OK");
    response
        .headers
        .set("Content-Type", "application/x-x509-ca-cert");
    response
        .headers
        .set("Cache-Control", "no-cache, no-store, must-revalidate");
    response.headers.set("Pragma", "no-cache");
    response.headers.set("Expires", "0");
    response.headers.set("Content-Length", pem.len().to_string());
    response.body = crate::body::ResponseBody::full(pem);
    response
}

/// Relays a pipeline response to the client: headers first (minus any
/// header named in the announced trailer set), then the trailer
/// announcement, then the status and the single-pass body, and finally
/// the trailer section itself.
async fn write_response<S>(
    conn: &mut BufferedConn<S>,
    event: &Event,
    mut response: ProxyResponse,
) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_version = match event.request.version {
        HttpVersion::Http10 => HttpVersion::Http10,
        _ => HttpVersion::Http11,
    };
    let announced = response.announced_trailer_names();
    let announced_display: Vec<String> = response
        .headers
        .get_all("trailer")
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();

    let mut headers = HeaderList::new();
    for header in &response.headers {
        let lower = header.name.to_ascii_lowercase();
        if announced.contains(&lower) {
            continue;
        }
        if matches!(
            lower.as_str(),
            "transfer-encoding" | "connection" | "keep-alive" | "proxy-connection" | "trailer"
        ) {
            continue;
        }
        headers.push(header.name.clone(), header.value.clone());
    }
    if !announced_display.is_empty() {
        headers.set("Trailer", announced_display.join(", "));
    }

    let reason = if response.reason.is_empty() {
        default_reason(response.status).to_string()
    } else {
        response.reason.clone()
    };

    let bodiless_status = (100..200).contains(&response.status)
        || response.status == 204
        || response.status == 304
        || event.request.method.eq_ignore_ascii_case("HEAD");

    // Framing: materialized bodies get an exact Content-Length, streams
    // keep the upstream length when one was announced, and everything
    // else is chunked so trailers can follow the body.
    enum Framing {
        None,
        Exact(Bytes),
        Passthrough,
        Chunked,
        UntilClose,
    }

    let framing = if bodiless_status || response.body.is_done() {
        Framing::None
    } else if let Some(full) = response.body.as_full() {
        if announced.is_empty() {
            Framing::Exact(full.clone())
        } else {
            Framing::Chunked
        }
    } else if headers.contains("content-length") && announced.is_empty() {
        Framing::Passthrough
    } else if client_version == HttpVersion::Http10 {
        Framing::UntilClose
    } else {
        Framing::Chunked
    };

    let mut keep_alive = !event.request.headers.contains_token("connection", "close");
    let mut head = Vec::with_capacity(512);
    match &framing {
        Framing::None => {
            if !headers.contains("content-length") && !bodiless_status {
                headers.set("Content-Length", "0");
            }
        }
        Framing::Exact(bytes) => {
            headers.set("Content-Length", bytes.len().to_string());
        }
        Framing::Passthrough => {}
        Framing::Chunked => {
            headers.set("Transfer-Encoding", "chunked");
        }
        Framing::UntilClose => {
            headers.remove("content-length");
            keep_alive = false;
        }
    }

    write_response_head(&mut head, client_version, response.status, &reason, &headers);
    conn.stream.write_all(&head).await?;

    match framing {
        Framing::None => {}
        Framing::Exact(bytes) => {
            conn.stream.write_all(&bytes).await?;
        }
        Framing::Passthrough => {
            while let Some(chunk) = next_chunk_io(&mut response).await? {
                conn.stream.write_all(&chunk).await?;
            }
        }
        Framing::UntilClose => {
            while let Some(chunk) = next_chunk_io(&mut response).await? {
                conn.stream.write_all(&chunk).await?;
            }
        }
        Framing::Chunked => {
            while let Some(chunk) = next_chunk_io(&mut response).await? {
                if chunk.is_empty() {
                    continue;
                }
                let size_line = format!("{:x}\r\n", chunk.len());
                conn.stream.write_all(size_line.as_bytes()).await?;
                conn.stream.write_all(&chunk).await?;
                conn.stream.write_all(b"\r\n").await?;
            }
            conn.stream.write_all(b"0\r\n").await?;
            let trailers = response.body.take_trailers();
            let mut trailer_block = Vec::new();
            for trailer in &trailers {
                trailer_block.extend_from_slice(trailer.name.as_bytes());
                trailer_block.extend_from_slice(b": ");
                trailer_block.extend_from_slice(trailer.value.as_bytes());
                trailer_block.extend_from_slice(b"\r\n");
            }
            trailer_block.extend_from_slice(b"\r\n");
            conn.stream.write_all(&trailer_block).await?;
        }
    }
    conn.stream.flush().await?;

    Ok(keep_alive && client_version == HttpVersion::Http11)
}

async fn next_chunk_io(response: &mut ProxyResponse) -> io::Result<Option<Bytes>> {
    response.body.next_chunk().await.map_err(|error| match error {
        ProxyError::Transport(io_error) => io_error,
        other => io::Error::other(other.to_string()),
    })
}

async fn write_simple_response<S>(
    conn: &mut BufferedConn<S>,
    status: u16,
    body: &str,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = default_reason(status);
    let message = format!(
        "HTTP/1.1 {status} {reason}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    conn.stream.write_all(message.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use super::ServerShared;
    use crate::cert_cache::CertCache;
    use crate::config::ProxyConfig;
    use crate::forward::UpstreamClient;
    use crate::pipeline::Pipeline;

    fn test_shared() -> Arc<ServerShared> {
        let config = ProxyConfig::default();
        let ca = Arc::new(
            osmosis_certauth::CertificateAuthority::generate().expect("generate ca"),
        );
        let client = Arc::new(UpstreamClient::new(config.upstream.clone()));
        let cert_cache = Arc::new(CertCache::new(
            Arc::clone(&ca),
            client.probe_tls_config(),
            config.upstream.clone(),
            config.cert_cache_cleanup_interval,
            config.cert_cache_duration,
        ));
        let (_tx, shutdown) = tokio::sync::watch::channel(false);
        std::mem::forget(_tx);
        Arc::new(ServerShared {
            config,
            ca,
            cert_cache,
            client,
            pipeline: Pipeline::new(None),
            shutdown,
            request_ids: AtomicU64::new(0),
        })
    }

    #[test]
    fn request_ids_are_positive_and_unique_across_threads() {
        let shared = test_shared();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let shared = Arc::clone(&shared);
            handles.push(std::thread::spawn(move || {
                (0..500).map(|_| shared.next_id()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("join id thread") {
                assert!(id > 0);
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 8 * 500);
    }
}
